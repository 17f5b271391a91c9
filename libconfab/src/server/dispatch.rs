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

//! Per-request scheduling: every dispatched request gets an
//! evaluation worker and an awaiter that enforces the deadline and
//! emits exactly one terminal status. The pending table is what the
//! evaluated `interrupt-eval` one-liner reaches to cancel a request.

use std::{
    panic,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use confab_protocol::{keys, status, Message, Value};
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use crate::{
    runtime::ControlOps,
    server::{
        conn::{Outbound, Responder},
        driver,
        driver::DriverStatus,
        pool::Completion,
        sessions::SessionHandle,
        sink::OutputSink,
        ServerShared,
    },
};

pub(crate) struct PendingRequest {
    interrupt: Arc<AtomicBool>,
    deadline: Instant,
}

impl PendingRequest {
    /// Best-effort cancellation: set the flag and let the evaluator
    /// notice at its next poll. Code that never polls keeps running,
    /// but its responses are suppressed from here on.
    pub fn cancel(&self) {
        self.interrupt.store(true, Ordering::Release);
        debug!(
            "cancelled request with {:?} left to its deadline",
            self.deadline.saturating_duration_since(Instant::now()),
        );
    }
}

#[derive(Clone)]
enum WorkerOutcome {
    Completed,
    Interrupted,
    Failed(String),
}

/// Schedule one decoded request. Returns as soon as both tasks are
/// submitted; the connection loop goes straight back to decoding.
#[instrument(skip_all, fields(id = req.id().unwrap_or("")))]
pub(crate) fn dispatch(
    shared: &Arc<ServerShared>,
    session: &SessionHandle,
    outbound: &Arc<Outbound>,
    req: Message,
) {
    let id = req.id().map(String::from).unwrap_or_else(|| Uuid::new_v4().to_string());
    let timeout = req
        .timeout_ms()
        .filter(|ms| *ms > 0)
        .map(|ms| Duration::from_millis(ms as u64))
        .unwrap_or(shared.default_timeout);
    let interrupt = Arc::new(AtomicBool::new(false));
    let completion: Arc<Completion<WorkerOutcome>> = Arc::new(Completion::new());

    shared.pending.lock().unwrap().insert(
        id.clone(),
        PendingRequest { interrupt: Arc::clone(&interrupt), deadline: Instant::now() + timeout },
    );

    let responder = Responder::new(Arc::clone(outbound), id.clone(), Arc::clone(&interrupt));

    // the evaluation worker
    {
        let worker_shared = Arc::clone(shared);
        let session = Arc::clone(session);
        let responder = responder.clone();
        let interrupt = Arc::clone(&interrupt);
        let completion = Arc::clone(&completion);
        shared.pool.submit(move || {
            let out = OutputSink::stdout(responder.clone());
            let err = OutputSink::stderr(responder.clone());
            let control = RequestControl {
                shared: Arc::clone(&worker_shared),
                session: Arc::clone(&session),
            };
            let result = panic::catch_unwind(panic::AssertUnwindSafe(|| {
                driver::run_request(
                    worker_shared.runtime.as_ref(),
                    &session,
                    &control,
                    &req,
                    &out,
                    &err,
                    &responder,
                    &interrupt,
                )
            }));
            out.close();
            err.close();
            let outcome = match result {
                Ok(DriverStatus::Completed) => WorkerOutcome::Completed,
                Ok(DriverStatus::Interrupted) => WorkerOutcome::Interrupted,
                Err(panic_err) => WorkerOutcome::Failed(panic_message(panic_err)),
            };
            completion.fill(outcome);
        });
    }

    // the awaiter: enforce the deadline and emit the one terminal status
    {
        let awaiter_shared = Arc::clone(shared);
        let outbound = Arc::clone(outbound);
        shared.pool.submit(move || {
            let outcome = completion.wait(Some(timeout));
            let (terminal, error_text) = match outcome {
                None => {
                    // deadline expired with the worker still going
                    interrupt.store(true, Ordering::Release);
                    (status::TIMEOUT, None)
                }
                // a cancelled request must never see `done`, even if
                // the evaluation won the race and finished
                Some(WorkerOutcome::Completed) if interrupt.load(Ordering::Acquire) => {
                    (status::INTERRUPTED, None)
                }
                Some(WorkerOutcome::Completed) => (status::DONE, None),
                Some(WorkerOutcome::Interrupted) => (status::INTERRUPTED, None),
                Some(WorkerOutcome::Failed(e)) => {
                    error!("request {id} failed inside the server: {e}");
                    (status::SERVER_FAILURE, Some(e))
                }
            };

            awaiter_shared.pending.lock().unwrap().remove(&id);

            let mut msg = Message::new()
                .with(keys::ID, Value::str(id.clone()))
                .with(keys::STATUS, Value::str(terminal));
            if let Some(text) = error_text {
                msg.set(keys::ERROR, Value::str(text));
            }
            if let Err(e) = outbound.send(&msg) {
                if terminal == status::TIMEOUT || terminal == status::INTERRUPTED {
                    debug!("peer gone before terminal status for cancelled request {id}: {e}");
                } else {
                    warn!("writing terminal status for request {id}: {e}");
                }
            }
        });
    }
}

fn panic_message(panic_err: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic_err.downcast_ref::<&str>() {
        format!("evaluation worker panicked: {s}")
    } else if let Some(s) = panic_err.downcast_ref::<String>() {
        format!("evaluation worker panicked: {s}")
    } else {
        String::from("evaluation worker panicked")
    }
}

/// The control surface handed to evaluated code, scoped to the request
/// it is evaluating on behalf of.
struct RequestControl {
    shared: Arc<ServerShared>,
    session: SessionHandle,
}

impl ControlOps for RequestControl {
    fn interrupt_eval(&self, id: &str) -> bool {
        let pending = self.shared.pending.lock().unwrap();
        match pending.get(id) {
            Some(req) => {
                req.cancel();
                true
            }
            None => false,
        }
    }

    fn deliver_server_port(&self, port: u16) {
        self.shared.port_slot.fill(port);
    }

    fn retain_session(&self) -> String {
        self.shared.sessions.retain(&self.session)
    }

    fn release_session(&self) -> bool {
        self.shared.sessions.release(&self.session)
    }
}
