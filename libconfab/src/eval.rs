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

//! The `confab eval` subcommand: a one-shot client that evaluates a
//! snippet against a running server, mirroring the response stream
//! onto the local stdout/stderr.

use std::{io, io::Write as _};

use anyhow::{anyhow, Context};
use confab_protocol::{keys, status};
use tracing::instrument;

use crate::{
    client::{Client, SendOpts},
    config,
};

#[allow(clippy::too_many_arguments)]
#[instrument(skip_all)]
pub(crate) fn run(
    config: config::Config,
    host: Option<String>,
    port: u16,
    session_id: Option<String>,
    ns: Option<String>,
    timeout_ms: Option<i64>,
    stdin: Option<String>,
    code: String,
) -> anyhow::Result<()> {
    let host = host.or(config.host);
    let client = Client::connect(host.as_deref(), port).context("connecting to server")?;
    let resp = client
        .send(&code, SendOpts { ns, session_id, timeout_ms, stdin })
        .context("sending evaluation")?;

    let terminal = loop {
        let Some(msg) = resp.recv() else {
            return Err(anyhow!("connection closed before a terminal status"));
        };
        if let Some(chunk) = msg.str_field(keys::OUT) {
            print!("{chunk}");
            io::stdout().flush().context("flushing stdout")?;
        }
        if let Some(chunk) = msg.str_field(keys::ERR) {
            eprint!("{chunk}");
        }
        if let Some(value) = msg.str_field(keys::VALUE) {
            println!("{value}");
        }
        if let Some(error) = msg.str_field(keys::ERROR) {
            eprintln!("error: {error}");
        }
        match msg.status() {
            Some(s)
                if s == status::DONE
                    || s == status::TIMEOUT
                    || s == status::INTERRUPTED
                    || s == status::SERVER_FAILURE =>
            {
                break String::from(s);
            }
            _ => {}
        }
    };
    client.close()?;

    if terminal != status::DONE {
        return Err(anyhow!("evaluation ended with status '{terminal}'"));
    }
    Ok(())
}
