// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{mem, sync::Mutex};

use confab_protocol::{keys, Message, Value};

use crate::{runtime::TextSink, server::conn::Responder};

/// The stand-in for one of the evaluator's standard streams. Writes
/// accumulate in a buffer; a flush atomically swaps the buffer for a
/// fresh one and, when it captured anything, emits it as a single
/// `out` or `err` response chunk.
pub(crate) struct OutputSink {
    stream_key: &'static str,
    buf: Mutex<String>,
    responder: Responder,
}

impl OutputSink {
    pub fn stdout(responder: Responder) -> OutputSink {
        OutputSink { stream_key: keys::OUT, buf: Mutex::new(String::new()), responder }
    }

    pub fn stderr(responder: Responder) -> OutputSink {
        OutputSink { stream_key: keys::ERR, buf: Mutex::new(String::new()), responder }
    }

    /// Swap the buffer out and emit the captured text, if any. The
    /// swap holds the buffer lock so concurrent writes land entirely
    /// in either this chunk or the next, never torn across both.
    pub fn flush(&self) {
        let chunk = mem::take(&mut *self.buf.lock().unwrap());
        if chunk.is_empty() {
            return;
        }
        self.responder.emit(Message::new().with(self.stream_key, Value::str(chunk)));
    }

    pub fn close(&self) {
        self.flush();
    }
}

impl TextSink for OutputSink {
    fn append(&self, text: &str) {
        self.buf.lock().unwrap().push_str(text);
    }
}

#[cfg(test)]
mod test {
    use std::sync::{atomic::AtomicBool, Arc, Mutex};

    use super::*;
    use crate::server::conn::{
        testutil::{decode_all, SharedBuf},
        Outbound,
    };

    fn fixture() -> (OutputSink, Arc<Mutex<Vec<u8>>>) {
        let (writer, buf) = SharedBuf::pair();
        let outbound = Outbound::new(writer);
        let responder =
            Responder::new(outbound, String::from("r1"), Arc::new(AtomicBool::new(false)));
        (OutputSink::stdout(responder), buf)
    }

    #[test]
    fn flush_emits_one_chunk_with_the_request_id() {
        let (sink, buf) = fixture();
        sink.append("hello ");
        sink.append("world");
        sink.flush();

        let msgs = decode_all(&buf);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].id(), Some("r1"));
        assert_eq!(msgs[0].str_field(keys::OUT), Some("hello world"));
    }

    #[test]
    fn empty_flushes_emit_nothing() {
        let (sink, buf) = fixture();
        sink.flush();
        sink.append("x");
        sink.flush();
        sink.flush();

        let msgs = decode_all(&buf);
        assert_eq!(msgs.len(), 1);
    }

    #[test]
    fn flush_resets_the_buffer() {
        let (sink, buf) = fixture();
        sink.append("first");
        sink.flush();
        sink.append("second");
        sink.close();

        let msgs = decode_all(&buf);
        let chunks: Vec<&str> = msgs.iter().filter_map(|m| m.str_field(keys::OUT)).collect();
        assert_eq!(chunks, vec!["first", "second"]);
    }
}
