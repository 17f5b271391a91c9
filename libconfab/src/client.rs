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

//! The client library: connect, send evaluation requests, and read
//! each request's responses off its own queue.
//!
//! A dedicated reader thread demultiplexes inbound messages by id.
//! The outstanding-request table holds only weak references, so a
//! caller that drops its [`Response`] handle stops pinning anything
//! and later responses for that id are quietly discarded.

use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    fmt, io,
    io::{BufReader, BufWriter, Write},
    net::{Shutdown, TcpStream},
    sync::{Arc, Condvar, Mutex, Weak},
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use confab_protocol::{
    keys, read_message, status, write_message, Message, PushbackReader, ReadError, Value,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::consts;

/// Options for one evaluation request.
#[derive(Debug, Clone, Default)]
pub struct SendOpts {
    /// Evaluate inside this namespace instead of the session's.
    pub ns: Option<String>,
    /// Rebind the connection to this retained session first.
    pub session_id: Option<String>,
    /// Per-request timeout in milliseconds.
    pub timeout_ms: Option<i64>,
    /// Text exposed to the evaluator as its stdin.
    pub stdin: Option<String>,
}

pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Connect and start the reader thread. The host defaults to
    /// localhost.
    pub fn connect(host: Option<&str>, port: u16) -> anyhow::Result<Client> {
        let host = host.unwrap_or(consts::DEFAULT_HOST);
        let stream = TcpStream::connect((host, port))
            .with_context(|| format!("connecting to {host}:{port}"))?;
        let write_half = stream.try_clone().context("cloning stream for writes")?;
        let read_half = stream.try_clone().context("cloning stream for reads")?;

        let inner = Arc::new(ClientInner {
            stream,
            writer: Mutex::new(BufWriter::new(write_half)),
            outstanding: Mutex::new(HashMap::new()),
        });

        // The reader holds only a weak reference back so a dropped
        // client tears the connection down instead of the reader
        // keeping it alive forever.
        let weak = Arc::downgrade(&inner);
        thread::spawn(move || run_reader(read_half, weak));

        info!("connected to {host}:{port}");
        Ok(Client { inner })
    }

    /// Send `code` for evaluation and return the handle that yields
    /// this request's responses.
    pub fn send(&self, code: &str, opts: SendOpts) -> anyhow::Result<Response> {
        send_request(&self.inner, code, opts)
    }

    /// Shut the connection down. Outstanding response handles see
    /// their streams end.
    pub fn close(self) -> anyhow::Result<()> {
        match self.inner.stream.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e).context("shutting down the connection"),
        }
    }
}

struct ClientInner {
    stream: TcpStream,
    writer: Mutex<BufWriter<TcpStream>>,
    outstanding: Mutex<HashMap<String, Weak<ResponseState>>>,
}

impl ClientInner {
    fn route(&self, msg: Message) {
        let Some(id) = msg.id().map(String::from) else {
            debug!("dropping response with no id");
            return;
        };
        let mut outstanding = self.outstanding.lock().unwrap();
        match outstanding.get(&id).and_then(Weak::upgrade) {
            Some(state) => state.push(msg),
            None => {
                // the caller dropped its handle (or never had one),
                // reclaim the entry and discard the response
                outstanding.remove(&id);
                debug!("discarding response for abandoned request {id}");
            }
        }
    }

    fn close_all(&self) {
        let mut outstanding = self.outstanding.lock().unwrap();
        for (_, weak) in outstanding.drain() {
            if let Some(state) = weak.upgrade() {
                state.close();
            }
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

fn run_reader(read_half: TcpStream, inner: Weak<ClientInner>) {
    let mut reader = PushbackReader::new(BufReader::new(read_half));
    loop {
        match read_message(&mut reader) {
            Ok(Some(msg)) => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.route(msg);
            }
            Ok(None) => {
                debug!("server closed the connection");
                break;
            }
            Err(e) => {
                debug!("reader stopping: {e}");
                break;
            }
        }
    }
    if let Some(inner) = inner.upgrade() {
        inner.close_all();
    }
}

fn send_request(inner: &Arc<ClientInner>, code: &str, opts: SendOpts) -> anyhow::Result<Response> {
    let id = Uuid::new_v4().to_string();
    let mut msg = Message::new()
        .with(keys::ID, Value::str(id.clone()))
        .with(keys::CODE, Value::str(code));
    if let Some(ns) = opts.ns {
        msg.set(keys::NS, Value::str(ns));
    }
    if let Some(sid) = opts.session_id {
        msg.set(keys::SESSION_ID, Value::str(sid));
    }
    if let Some(ms) = opts.timeout_ms {
        msg.set(keys::TIMEOUT, Value::Int(ms));
    }
    if let Some(text) = opts.stdin {
        msg.set(keys::IN, Value::str(text));
    }

    let state = ResponseState::new();
    inner.outstanding.lock().unwrap().insert(id.clone(), Arc::downgrade(&state));

    let write_res = {
        let mut writer = inner.writer.lock().unwrap();
        write_message(&mut *writer, &msg).and_then(|()| writer.flush())
    };
    if let Err(e) = write_res {
        inner.outstanding.lock().unwrap().remove(&id);
        return Err(e).context("writing request");
    }

    Ok(Response { id, state, client: Arc::clone(inner) })
}

/// The handle for one request's response stream. Dropping it makes
/// the request's demultiplexer entry reclaimable; the server may keep
/// sending, the responses just get discarded.
pub struct Response {
    id: String,
    state: Arc<ResponseState>,
    client: Arc<ClientInner>,
}

impl Response {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Block until the next response for this request, or `None` once
    /// the connection is gone with nothing queued.
    pub fn recv(&self) -> Option<Message> {
        self.state.recv(None)
    }

    /// Like [`Response::recv`] with a deadline; `None` on timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Message> {
        self.state.recv(Some(timeout))
    }

    /// Ask the server to cancel this request. The interrupt travels
    /// as its own evaluation, a one-liner invoking the server-side
    /// interrupt operation for this request's id; this blocks until
    /// that request completes and returns its combined responses.
    pub fn interrupt(&self) -> anyhow::Result<Message> {
        let code = format!("(interrupt-eval {})", Value::str(self.id.clone()));
        let resp = send_request(&self.client, &code, SendOpts::default())?;
        Ok(combine_responses(resp.responses()))
    }

    /// Iterate this request's responses, ending after the first
    /// `done`, `timeout`, or `interrupted` status.
    pub fn responses(&self) -> Responses<'_> {
        Responses { state: &self.state, finished: false }
    }

    /// Fold the whole response stream into one combined message.
    pub fn wait(&self) -> Message {
        combine_responses(self.responses())
    }
}

pub struct Responses<'a> {
    state: &'a ResponseState,
    finished: bool,
}

impl Iterator for Responses<'_> {
    type Item = Message;

    fn next(&mut self) -> Option<Message> {
        if self.finished {
            return None;
        }
        let msg = self.state.recv(None)?;
        if matches!(
            msg.status(),
            Some(status::DONE) | Some(status::TIMEOUT) | Some(status::INTERRUPTED)
        ) {
            self.finished = true;
        }
        Some(msg)
    }
}

/// One request's response queue plus the flag the reader uses to wake
/// waiters when the connection ends.
pub struct ResponseState {
    inner: Mutex<ResponseQueue>,
    cond: Condvar,
}

struct ResponseQueue {
    queue: VecDeque<Message>,
    closed: bool,
}

impl ResponseState {
    fn new() -> Arc<ResponseState> {
        Arc::new(ResponseState {
            inner: Mutex::new(ResponseQueue { queue: VecDeque::new(), closed: false }),
            cond: Condvar::new(),
        })
    }

    fn push(&self, msg: Message) {
        let mut q = self.inner.lock().unwrap();
        q.queue.push_back(msg);
        self.cond.notify_all();
    }

    fn close(&self) {
        let mut q = self.inner.lock().unwrap();
        q.closed = true;
        self.cond.notify_all();
    }

    fn recv(&self, timeout: Option<Duration>) -> Option<Message> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut q = self.inner.lock().unwrap();
        loop {
            if let Some(msg) = q.queue.pop_front() {
                return Some(msg);
            }
            if q.closed {
                return None;
            }
            match deadline {
                None => q = self.cond.wait(q).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    let (guard, _) = self.cond.wait_timeout(q, deadline - now).unwrap();
                    q = guard;
                }
            }
        }
    }
}

/// Fold a response stream into a single message: `value` collects in
/// order, `status` collects as a set, `ns` and `id` take the last,
/// other string-valued keys concatenate in order, and anything else
/// is last-wins. A lone `value` still comes back wrapped in a
/// length-one list.
pub fn combine_responses<I>(responses: I) -> Message
where
    I: IntoIterator<Item = Message>,
{
    let mut combined = Message::new();
    let mut values: Vec<Value> = Vec::new();
    let mut statuses: BTreeSet<String> = BTreeSet::new();

    for msg in responses {
        for (key, val) in msg.iter() {
            match key {
                keys::VALUE => match val {
                    Value::List(items) => values.extend(items.iter().cloned()),
                    other => values.push(other.clone()),
                },
                keys::STATUS => match val {
                    Value::List(items) => {
                        statuses.extend(items.iter().filter_map(|v| v.as_str().map(String::from)));
                    }
                    Value::Str(s) => {
                        statuses.insert(s.clone());
                    }
                    _ => {}
                },
                keys::NS | keys::ID => combined.set(key, val.clone()),
                _ => {
                    let joined = match (combined.get(key), val) {
                        (Some(Value::Str(existing)), Value::Str(incoming)) => {
                            Some(Value::str(format!("{existing}{incoming}")))
                        }
                        _ => None,
                    };
                    combined.set(key, joined.unwrap_or_else(|| val.clone()));
                }
            }
        }
    }

    if !values.is_empty() {
        combined.set(keys::VALUE, Value::List(values));
    }
    if !statuses.is_empty() {
        combined.set(keys::STATUS, Value::List(statuses.into_iter().map(Value::Str).collect()));
    }
    combined
}

/// The `value` field of a response failing to read back as data.
#[derive(Debug)]
pub struct ValueParseError {
    printed: String,
    source: ReadError,
}

impl ValueParseError {
    pub fn printed(&self) -> &str {
        &self.printed
    }
}

impl fmt::Display for ValueParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "response value {:?} does not read back: {}", self.printed, self.source)
    }
}

impl std::error::Error for ValueParseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Parse a response's printed `value` back into data, if it has one.
pub fn read_response_value(msg: &Message) -> Result<Option<Value>, ValueParseError> {
    match msg.str_field(keys::VALUE) {
        None => Ok(None),
        Some(printed) => Value::parse(printed)
            .map(Some)
            .map_err(|source| ValueParseError { printed: String::from(printed), source }),
    }
}
