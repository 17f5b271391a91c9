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

use std::{fs, io, sync::Mutex};

use anyhow::anyhow;
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::fmt::format::FmtSpan;

pub mod client;
pub mod config;
pub mod consts;
mod eval;
pub mod runtime;
pub mod server;

pub use server::{Server, StartOpts};

/// The command line arguments that confab expects.
/// These can be directly parsed with clap or manually
/// constructed in order to present some other user
/// interface.
///
/// NOTE: You must check `version()` and handle it yourself
/// if it is set. Clap won't do a good job with its
/// automatic version support for a library.
#[derive(Parser, Debug)]
#[clap(author, about)]
pub struct Args {
    #[clap(
        short,
        long,
        action,
        long_help = "The file to write logs to

In most modes logs are discarded by default, but if confab is
running in serve mode, the logs will go to stderr by default."
    )]
    pub log_file: Option<String>,

    #[clap(
        short,
        long,
        action = clap::ArgAction::Count,
        help = "Show more in logs, may be provided multiple times",
    )]
    pub verbose: u8,

    #[clap(short, long, action, help = "a toml file containing configuration")]
    pub config_file: Option<String>,

    #[clap(subcommand)]
    pub command: Commands,
}

/// The subcommands that confab supports.
#[derive(Subcommand, Debug)]
pub enum Commands {
    #[clap(about = "Print version")]
    Version,

    #[clap(about = "Runs a REPL server in the foreground")]
    Serve {
        #[clap(
            short,
            long,
            default_value_t = 0,
            help = "The port to listen on, 0 picks an ephemeral one"
        )]
        port: u16,

        #[clap(long, help = "The host to bind instead of localhost")]
        host: Option<String>,

        #[clap(
            long,
            long_help = "Acknowledge startup to a parent server on this port

Once our listener is bound, a short-lived client connection delivers
the bound port to the server listening on localhost:<ack-port>, which
is how a bootstrapping parent learns where we ended up."
        )]
        ack_port: Option<u16>,

        #[clap(long, help = "Write the bound port to this file once we are listening")]
        port_file: Option<String>,
    },

    #[clap(about = "Evaluates code against a running server and prints the results")]
    Eval {
        #[clap(long, help = "The host to dial instead of localhost")]
        host: Option<String>,

        #[clap(short, long, help = "The port the server is listening on")]
        port: u16,

        #[clap(long, help = "Evaluate inside this retained session")]
        session_id: Option<String>,

        #[clap(long, help = "Evaluate inside this namespace")]
        ns: Option<String>,

        #[clap(long, help = "Per-request timeout in milliseconds")]
        timeout: Option<i64>,

        #[clap(long = "in", help = "Text to expose as the evaluation's stdin")]
        stdin: Option<String>,

        #[clap(help = "The code to evaluate")]
        code: String,
    },
}

impl Args {
    /// Version indicates if the wrapping binary must display the
    /// version then exit.
    pub fn version(&self) -> bool {
        matches!(self.command, Commands::Version)
    }
}

/// Run the confab tool with the given arguments.
pub fn run(args: Args) -> anyhow::Result<()> {
    let trace_level = if args.verbose == 0 {
        tracing::Level::INFO
    } else if args.verbose == 1 {
        tracing::Level::DEBUG
    } else {
        tracing::Level::TRACE
    };
    if let Some(log_file) = args.log_file.clone() {
        let file = fs::File::create(log_file)?;
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(Mutex::new(file))
            .init();
    } else if let Commands::Serve { .. } = args.command {
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(io::stderr)
            .init();
    }

    let config = config::read_config(&args.config_file)?;

    let res: anyhow::Result<()> = match args.command {
        Commands::Version => return Err(anyhow!("wrapper binary must handle version")),
        Commands::Serve { port, host, ack_port, port_file } => {
            server::run(config, host, port, ack_port, port_file)
        }
        Commands::Eval { host, port, session_id, ns, timeout, stdin, code } => {
            eval::run(config, host, port, session_id, ns, timeout, stdin, code)
        }
    };

    if let Err(err) = res {
        error!("{:?}", err);
        std::process::exit(1);
    }

    Ok(())
}
