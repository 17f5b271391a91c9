// This module is used from multiple different test files, each of which
// gets compiled into its own binary. Not all the binaries use all the
// stuff here.
#![allow(dead_code)]

use std::{
    fs,
    path::PathBuf,
    process,
    process::{Command, Stdio},
    time,
};

use anyhow::{anyhow, Context};
use tempfile::TempDir;

/// Serve is a helper handle for a `confab serve` subprocess.
/// It kills the subprocess when it goes out of scope.
pub struct Serve {
    pub proc: process::Child,
    pub port: u16,
    pub log_file: PathBuf,
    tmp_dir: TempDir,
}

impl Serve {
    pub fn spawn() -> anyhow::Result<Serve> {
        let tmp_dir = tempfile::Builder::new()
            .prefix("confab-test")
            .rand_bytes(20)
            .tempdir()
            .context("creating tmp dir")?;
        let port_file = tmp_dir.path().join("confab.port");
        let log_file = tmp_dir.path().join("serve.log");

        eprintln!("spawning serve proc with log {:?}", &log_file);
        let proc = Command::new(confab_bin())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .arg("-vv")
            .arg("--log-file")
            .arg(&log_file)
            .arg("serve")
            .arg("--port")
            .arg("0")
            .arg("--port-file")
            .arg(&port_file)
            .spawn()
            .context("spawning serve process")?;

        // spin until the server writes its bound port
        let mut sleep_dur = time::Duration::from_millis(5);
        let mut port = None;
        for _ in 0..13 {
            match fs::read_to_string(&port_file) {
                Ok(s) if !s.trim().is_empty() => {
                    port = Some(s.trim().parse().context("parsing port file")?);
                    break;
                }
                _ => {
                    std::thread::sleep(sleep_dur);
                    sleep_dur *= 2;
                }
            }
        }
        let port = port.ok_or_else(|| anyhow!("server never wrote its port file"))?;

        Ok(Serve { proc, port, log_file, tmp_dir })
    }

    pub fn log_contents(&self) -> anyhow::Result<String> {
        fs::read_to_string(&self.log_file).context("slurping server log")
    }

    pub fn tmp_path(&self) -> PathBuf {
        self.tmp_dir.path().to_path_buf()
    }
}

impl Drop for Serve {
    fn drop(&mut self) {
        let _ = self.proc.kill();
        let _ = self.proc.wait();
    }
}

pub fn confab_bin() -> &'static str {
    env!("CARGO_BIN_EXE_confab")
}
