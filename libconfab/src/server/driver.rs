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

//! The evaluator driver: runs one request's read-eval-print loop
//! against a session and streams values, output chunks, and error
//! statuses back through the request's responder. The worker that
//! invoked it owns the terminal status.

use std::sync::atomic::{AtomicBool, Ordering};

use confab_protocol::{keys, status, Message, Value};

use crate::{
    runtime::{ControlOps, EvalContext, EvalError, Runtime, StdinText, TextSink},
    server::{conn::Responder, sessions::SessionHandle, sink::OutputSink},
};

/// How the driver came to return. Timeouts and internal failures are
/// the worker's business, not the driver's.
pub(crate) enum DriverStatus {
    Completed,
    Interrupted,
}

pub(crate) fn run_request(
    runtime: &dyn Runtime,
    session: &SessionHandle,
    control: &dyn ControlOps,
    req: &Message,
    out: &OutputSink,
    err: &OutputSink,
    responder: &Responder,
    interrupt: &AtomicBool,
) -> DriverStatus {
    let code = String::from(req.code().unwrap_or_default());

    // Seed the evaluation context from the session, preferring the
    // request's namespace when it names one.
    let mut ctx = {
        let state = session.lock().unwrap();
        EvalContext {
            ns: req.ns().map(String::from).unwrap_or_else(|| state.ns.clone()),
            v1: state.v1.clone(),
            v2: state.v2.clone(),
            v3: state.v3.clone(),
            last_exception: state.last_exception.clone(),
            printer: state.printer.clone(),
            stdin: StdinText::new(req.str_field(keys::IN).unwrap_or("")),
            out,
            err,
            interrupt,
            control: Some(control),
        }
    };

    let mut rest: &str = &code;
    let outcome = loop {
        if interrupt.load(Ordering::Acquire) {
            break DriverStatus::Interrupted;
        }

        let (form, after) = match runtime.read_form(rest) {
            Ok(Some(pair)) => pair,
            Ok(None) => break DriverStatus::Completed,
            Err(e) => {
                // With no way to find the next form boundary, a read
                // error ends the request instead of recovering.
                record_exception(session, &mut ctx, &e);
                err.append(&format!("{}\n", runtime.format_trace(&e, ctx.printer.detail_on_error)));
                responder.emit(Message::new().with(keys::STATUS, Value::str(status::ERROR)));
                break DriverStatus::Completed;
            }
        };
        rest = after;

        match runtime.eval(&mut ctx, &form) {
            Ok(value) => {
                let printed = if ctx.printer.pretty {
                    runtime
                        .pretty_print(&ctx.printer, &value)
                        .unwrap_or_else(|| runtime.print(&ctx.printer, &value))
                } else {
                    runtime.print(&ctx.printer, &value)
                };
                responder.emit(
                    Message::new()
                        .with(keys::VALUE, Value::str(printed))
                        .with(keys::NS, Value::str(ctx.ns.clone())),
                );

                ctx.v3 = ctx.v2.take();
                ctx.v2 = ctx.v1.take();
                ctx.v1 = Some(value);
                {
                    let mut state = session.lock().unwrap();
                    state.v1 = ctx.v1.clone();
                    state.v2 = ctx.v2.clone();
                    state.v3 = ctx.v3.clone();
                    state.ns = ctx.ns.clone();
                }

                // side-effect output lands before the next value
                out.flush();
                err.flush();
            }
            Err(e) if e.interrupted => break DriverStatus::Interrupted,
            Err(e) => {
                record_exception(session, &mut ctx, &e);
                err.append(&format!("{}\n", runtime.format_trace(&e, ctx.printer.detail_on_error)));
                responder.emit(Message::new().with(keys::STATUS, Value::str(status::ERROR)));
                if interrupt.load(Ordering::Acquire) {
                    break DriverStatus::Interrupted;
                }
                // the loop recovers form by form
            }
        }
    };

    out.flush();
    err.flush();
    outcome
}

fn record_exception(session: &SessionHandle, ctx: &mut EvalContext<'_>, e: &EvalError) {
    ctx.last_exception = Some(e.clone());
    session.lock().unwrap().last_exception = Some(e.clone());
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};

    use confab_protocol::{read_message, PushbackReader};

    use super::*;
    use crate::{
        runtime::{lisp::LispRuntime, PrinterPrefs},
        server::{
            conn::{testutil::SharedBuf, Outbound},
            sessions,
        },
    };

    struct NoopControl;

    impl ControlOps for NoopControl {
        fn interrupt_eval(&self, _id: &str) -> bool {
            false
        }

        fn deliver_server_port(&self, _port: u16) {}

        fn retain_session(&self) -> String {
            String::new()
        }

        fn release_session(&self) -> bool {
            false
        }
    }

    fn drive(code: &str, session: &sessions::SessionHandle) -> Vec<Message> {
        let runtime = LispRuntime::new();
        let buf: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let outbound = Outbound::new(SharedBuf(Arc::clone(&buf)));
        let interrupt = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let responder = Responder::new(outbound, String::from("req"), Arc::clone(&interrupt));
        let out = OutputSink::stdout(responder.clone());
        let err = OutputSink::stderr(responder.clone());
        let req = Message::new().with(keys::CODE, Value::str(code));

        let status = run_request(
            &runtime,
            session,
            &NoopControl,
            &req,
            &out,
            &err,
            &responder,
            &interrupt,
        );
        assert!(matches!(status, DriverStatus::Completed));

        let bytes = buf.lock().unwrap().clone();
        let mut r = PushbackReader::new(bytes.as_slice());
        let mut msgs = Vec::new();
        while let Some(msg) = read_message(&mut r).expect("well-formed frames") {
            msgs.push(msg);
        }
        msgs
    }

    #[test]
    fn values_stream_in_form_order() {
        let session = sessions::new_session(PrinterPrefs::default());
        let msgs = drive("1 2 3", &session);
        let values: Vec<&str> =
            msgs.iter().filter_map(|m| m.str_field(keys::VALUE)).collect();
        assert_eq!(values, vec!["1", "2", "3"]);
        for msg in &msgs {
            assert_eq!(msg.id(), Some("req"));
        }
    }

    #[test]
    fn session_history_rotates() {
        let session = sessions::new_session(PrinterPrefs::default());
        drive("1 2 3", &session);
        let state = session.lock().unwrap();
        assert_eq!(state.v1, Some(Value::Int(3)));
        assert_eq!(state.v2, Some(Value::Int(2)));
        assert_eq!(state.v3, Some(Value::Int(1)));
        assert_eq!(state.ns, "user");
    }

    #[test]
    fn output_flushes_before_the_next_value() {
        let session = sessions::new_session(PrinterPrefs::default());
        let msgs = drive("(print \"hi\") 42", &session);

        let out_at = msgs
            .iter()
            .position(|m| m.str_field(keys::OUT) == Some("hi"))
            .expect("an out chunk");
        let answer_at = msgs
            .iter()
            .position(|m| m.str_field(keys::VALUE) == Some("42"))
            .expect("the final value");
        assert!(out_at < answer_at, "out chunk arrives before the 42 value");
    }

    #[test]
    fn errors_recover_with_the_next_form() {
        let session = sessions::new_session(PrinterPrefs::default());
        let msgs = drive("(/ 1 0) 7", &session);

        let err_chunk = msgs
            .iter()
            .find_map(|m| m.str_field(keys::ERR))
            .expect("a trace on the err stream");
        assert!(err_chunk.contains("divide by zero"));
        assert!(msgs.iter().any(|m| m.status() == Some(status::ERROR)));
        assert!(msgs.iter().any(|m| m.str_field(keys::VALUE) == Some("7")));

        let state = session.lock().unwrap();
        assert!(state.last_exception.is_some());
        assert_eq!(state.v1, Some(Value::Int(7)));
    }

    #[test]
    fn request_ns_overrides_the_session() {
        let session = sessions::new_session(PrinterPrefs::default());
        // current namespace reported on each value response
        let runtime = LispRuntime::new();
        let buf: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let outbound = Outbound::new(SharedBuf(Arc::clone(&buf)));
        let interrupt = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let responder = Responder::new(outbound, String::from("req"), Arc::clone(&interrupt));
        let out = OutputSink::stdout(responder.clone());
        let err = OutputSink::stderr(responder.clone());
        let req = Message::new()
            .with(keys::CODE, Value::str("*ns*"))
            .with(keys::NS, Value::str("scratch"));
        run_request(
            &runtime,
            &session,
            &NoopControl,
            &req,
            &out,
            &err,
            &responder,
            &interrupt,
        );

        let bytes = buf.lock().unwrap().clone();
        let mut r = PushbackReader::new(bytes.as_slice());
        let msg = read_message(&mut r).unwrap().expect("a value response");
        assert_eq!(msg.str_field(keys::VALUE), Some("scratch"));
        assert_eq!(msg.ns(), Some("scratch"));
        assert_eq!(session.lock().unwrap().ns, "scratch");
    }

    #[test]
    fn unreadable_code_ends_the_request_with_an_error() {
        let session = sessions::new_session(PrinterPrefs::default());
        let msgs = drive("(+ 1", &session);
        assert!(msgs.iter().any(|m| m.status() == Some(status::ERROR)));
        assert!(msgs.iter().all(|m| m.str_field(keys::VALUE).is_none()));
        assert!(session.lock().unwrap().last_exception.is_some());
    }
}
