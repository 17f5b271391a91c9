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

use std::{
    io,
    io::Write,
    net,
    net::TcpStream,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use anyhow::Context;
use confab_protocol::{keys, read_message, status, Message, PushbackReader, Value};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::server::{dispatch, sessions, ServerShared};

/// The write half of a connection. Every response goes out under the
/// stream mutex so one message is always atomic on the wire, no matter
/// how many request workers are emitting.
pub(crate) struct Outbound {
    writer: Mutex<Box<dyn Write + Send>>,
    dead: AtomicBool,
}

impl Outbound {
    pub fn new<W: Write + Send + 'static>(writer: W) -> Arc<Outbound> {
        Arc::new(Outbound { writer: Mutex::new(Box::new(writer)), dead: AtomicBool::new(false) })
    }

    /// Write one message and flush it. After the first write error the
    /// stream is considered dead and later sends fail fast.
    pub fn send(&self, msg: &Message) -> io::Result<()> {
        if self.dead.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "connection already failed"));
        }
        let mut writer = self.writer.lock().unwrap();
        let res = confab_protocol::write_message(&mut *writer, msg).and_then(|()| writer.flush());
        if res.is_err() {
            self.dead.store(true, Ordering::Release);
        }
        res
    }
}

/// One request's response emitter. It stamps the request id on every
/// message, and once the request's interrupt flag is set it drops
/// emissions on the floor so `done` (or anything else) can never
/// escape a cancelled request.
#[derive(Clone)]
pub(crate) struct Responder {
    outbound: Arc<Outbound>,
    id: String,
    interrupt: Arc<AtomicBool>,
}

impl Responder {
    pub fn new(outbound: Arc<Outbound>, id: String, interrupt: Arc<AtomicBool>) -> Responder {
        Responder { outbound, id, interrupt }
    }

    pub fn emit(&self, mut msg: Message) {
        if self.interrupt.load(Ordering::Acquire) {
            debug!("suppressing response for cancelled request {}", self.id);
            return;
        }
        msg.set(keys::ID, Value::str(self.id.clone()));
        if let Err(e) = self.outbound.send(&msg) {
            if self.interrupt.load(Ordering::Acquire) {
                debug!("write to closed peer for cancelled request {}: {e}", self.id);
            } else {
                warn!("writing response for request {}: {e}", self.id);
            }
        }
    }
}

/// The per-connection inbound loop: decode one message, dispatch it,
/// and go right back to decoding. Workers answer on their own threads,
/// the loop never waits for them.
#[instrument(skip_all, fields(cid = conn_id))]
pub(crate) fn handle_conn(
    shared: Arc<ServerShared>,
    stream: TcpStream,
    conn_id: usize,
) -> anyhow::Result<()> {
    let peer = stream.peer_addr().context("resolving peer address")?;
    let ctl = stream.try_clone().context("cloning stream control handle")?;
    let write_half = stream.try_clone().context("cloning stream for writes")?;
    let outbound = Outbound::new(io::BufWriter::new(write_half));
    let mut reader = PushbackReader::new(io::BufReader::new(stream));

    // a fresh unretained session, until a request rebinds one by id
    let mut session = sessions::new_session(shared.printer_defaults.clone());

    info!("serving connection from {peer}");
    loop {
        let msg = match read_message(&mut reader) {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                info!("client closed the connection");
                return Ok(());
            }
            Err(e) => {
                warn!("framing error, closing connection: {e}");
                let _ = ctl.shutdown(net::Shutdown::Both);
                return Ok(());
            }
        };

        if let Some(sid) = msg.session_id() {
            match shared.sessions.lookup(sid) {
                Some(handle) => session = handle,
                None => debug!("request named unknown session {sid}, keeping current session"),
            }
        }

        if msg.code().is_none() {
            let id = msg.id().map(String::from).unwrap_or_else(|| Uuid::new_v4().to_string());
            let reply = Message::new()
                .with(keys::ID, Value::str(id))
                .with(keys::STATUS, Value::str(status::ERROR))
                .with(keys::ERROR, Value::str("Received message with no code."));
            if let Err(e) = outbound.send(&reply) {
                warn!("replying to codeless message: {e}");
                return Ok(());
            }
            continue;
        }

        dispatch::dispatch(&shared, &session, &outbound, msg);
    }
}
