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

//! The server: a TCP accept loop handing each connection its own
//! decode thread, a pending-request table, a session store, and a
//! worker pool, all scoped to one [`Server`] value so a process can
//! host several servers at once.

use std::{
    collections::HashMap,
    fs, io,
    net::{SocketAddr, TcpListener, TcpStream},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use confab_protocol::status;
use tracing::{error, info, instrument};

use crate::{
    client::{Client, SendOpts},
    config, consts,
    runtime::{lisp::LispRuntime, PrinterPrefs, Runtime},
};

pub(crate) mod conn;
pub(crate) mod dispatch;
pub(crate) mod driver;
pub(crate) mod pool;
pub mod sessions;
pub(crate) mod sink;

/// The state shared by every connection and request of one server:
/// the two process-wide tables of the original design, made fields so
/// their lifetime spans start to stop.
pub(crate) struct ServerShared {
    pub runtime: Arc<dyn Runtime>,
    pub sessions: sessions::SessionStore,
    pub pending: Mutex<HashMap<String, dispatch::PendingRequest>>,
    pub pool: pool::Pool,
    pub default_timeout: Duration,
    pub printer_defaults: PrinterPrefs,
    pub port_slot: pool::Completion<u16>,
}

impl ServerShared {
    pub fn new(
        runtime: Arc<dyn Runtime>,
        default_timeout: Duration,
        printer_defaults: PrinterPrefs,
    ) -> Arc<ServerShared> {
        Arc::new(ServerShared {
            runtime,
            sessions: sessions::SessionStore::new(),
            pending: Mutex::new(HashMap::new()),
            pool: pool::Pool::new(consts::WORKER_KEEP_ALIVE),
            default_timeout,
            printer_defaults,
            port_slot: pool::Completion::new(),
        })
    }
}

pub struct StartOpts {
    /// Host to bind. Defaults to localhost.
    pub host: Option<String>,
    /// Port to bind, 0 for an ephemeral one.
    pub port: u16,
    /// When nonzero, dial `localhost:ack_port` after binding and
    /// deliver our bound port there by evaluating a one-liner.
    pub ack_port: u16,
    /// Timeout applied to requests that don't carry their own.
    pub default_timeout: Duration,
    /// Printer toggles fresh sessions start with.
    pub printer_defaults: PrinterPrefs,
    /// The language runtime to serve. Defaults to the built-in one.
    pub runtime: Option<Arc<dyn Runtime>>,
}

impl Default for StartOpts {
    fn default() -> Self {
        StartOpts {
            host: None,
            port: 0,
            ack_port: 0,
            default_timeout: consts::DEFAULT_REQUEST_TIMEOUT,
            printer_defaults: PrinterPrefs::default(),
            runtime: None,
        }
    }
}

pub struct Server {
    shared: Arc<ServerShared>,
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    accept_join: Option<thread::JoinHandle<()>>,
}

impl Server {
    #[instrument(skip_all)]
    pub fn start(opts: StartOpts) -> anyhow::Result<Server> {
        let host = opts.host.clone().unwrap_or_else(|| String::from(consts::DEFAULT_HOST));
        let listener = TcpListener::bind((host.as_str(), opts.port))
            .with_context(|| format!("binding to {}:{}", host, opts.port))?;
        let local_addr = listener.local_addr().context("resolving bound address")?;
        info!("listening on {local_addr}");

        let runtime = opts
            .runtime
            .unwrap_or_else(|| Arc::new(LispRuntime::new()) as Arc<dyn Runtime>);
        let shared = ServerShared::new(runtime, opts.default_timeout, opts.printer_defaults);

        let shutdown = Arc::new(AtomicBool::new(false));
        let accept_join = {
            let shared = Arc::clone(&shared);
            let shutdown = Arc::clone(&shutdown);
            thread::spawn(move || accept_loop(shared, listener, shutdown))
        };

        if opts.ack_port > 0 {
            deliver_ack(local_addr.port(), opts.ack_port).context("delivering ack")?;
        }

        Ok(Server { shared, local_addr, shutdown, accept_join: Some(accept_join) })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Wait for some other server to deliver its bound port here via
    /// the `deliver-server-port` one-liner, as a parent bootstrapping
    /// a child server does.
    pub fn wait_for_ack(&self, timeout: Duration) -> Option<u16> {
        self.shared.port_slot.wait(Some(timeout))
    }

    /// Block until the accept loop exits.
    pub fn join(&mut self) -> anyhow::Result<()> {
        if let Some(handle) = self.accept_join.take() {
            handle.join().map_err(|e| anyhow!("accept loop panicked: {e:?}"))?;
        }
        Ok(())
    }

    /// Stop accepting connections. In-flight requests keep their
    /// worker threads; they just stop mattering once their
    /// connections go away.
    pub fn stop(&mut self) -> anyhow::Result<()> {
        self.shutdown.store(true, Ordering::Release);
        // nudge the listener awake so it notices the flag
        let _ = TcpStream::connect(self.local_addr);
        self.join()
    }
}

fn accept_loop(shared: Arc<ServerShared>, listener: TcpListener, shutdown: Arc<AtomicBool>) {
    let mut conn_counter: usize = 0;
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                if shutdown.load(Ordering::Acquire) {
                    info!("accept loop shutting down");
                    break;
                }
                conn_counter += 1;
                let conn_id = conn_counter;
                let shared = Arc::clone(&shared);
                thread::spawn(move || {
                    if let Err(err) = conn::handle_conn(shared, stream, conn_id) {
                        error!("handling connection: {err:?}");
                    }
                });
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                if shutdown.load(Ordering::Acquire) {
                    break;
                }
                // transient accept failures (fd pressure and the
                // like) should not take the server down
                error!("accepting connection: {e}");
                thread::sleep(consts::ACCEPT_RETRY_DELAY);
            }
        }
    }
}

/// Hand our bound port to a bootstrapping parent server by evaluating
/// `(deliver-server-port <port>)` against it, and wait for that
/// request to finish.
#[instrument(skip_all)]
fn deliver_ack(bound_port: u16, ack_port: u16) -> anyhow::Result<()> {
    info!("delivering bound port {bound_port} to ack server on port {ack_port}");
    let client = Client::connect(None, ack_port).context("connecting to ack server")?;
    let resp = client
        .send(&format!("(deliver-server-port {bound_port})"), SendOpts::default())
        .context("sending ack evaluation")?;

    let deadline = Instant::now() + consts::ACK_TIMEOUT;
    loop {
        let now = Instant::now();
        if now >= deadline {
            return Err(anyhow!("ack server did not finish our delivery request in time"));
        }
        match resp.recv_timeout(deadline - now) {
            None => {
                return Err(anyhow!("ack server did not finish our delivery request in time"));
            }
            Some(msg) => match msg.status() {
                None => continue,
                Some(status::DONE) => break,
                Some(other) => {
                    return Err(anyhow!("ack delivery ended with status '{other}'"));
                }
            },
        }
    }
    client.close().context("closing ack connection")?;
    Ok(())
}

/// The `confab serve` entry point: start a server in the foreground
/// and stay on the accept loop until the process dies.
#[instrument(skip_all)]
pub(crate) fn run(
    config: config::Config,
    host: Option<String>,
    port: u16,
    ack_port: Option<u16>,
    port_file: Option<String>,
) -> anyhow::Result<()> {
    let printer_defaults = PrinterPrefs {
        pretty: config.pretty_print.unwrap_or(false),
        detail_on_error: config.detail_on_error.unwrap_or(false),
        ..PrinterPrefs::default()
    };
    let opts = StartOpts {
        host: host.or(config.host),
        port,
        ack_port: ack_port.unwrap_or(0),
        default_timeout: config
            .default_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(consts::DEFAULT_REQUEST_TIMEOUT),
        printer_defaults,
        runtime: None,
    };
    let mut server = Server::start(opts)?;

    if let Some(path) = port_file {
        fs::write(&path, format!("{}", server.port()))
            .with_context(|| format!("writing port file {path}"))?;
        info!("wrote bound port to {path}");
    }

    info!("serving on {}", server.local_addr());
    server.join()
}
