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

use std::{env, fs, path::PathBuf};

use anyhow::Context;
use serde_derive::Deserialize;
use tracing::{info, instrument};

#[instrument(skip_all)]
pub fn read_config(config_file: &Option<String>) -> anyhow::Result<Config> {
    let mut config = Config::default();
    if let Some(config_path) = config_file {
        info!("parsing explicitly passed in config ({})", config_path);
        let config_str = fs::read_to_string(config_path).context("reading config toml (1)")?;
        config = toml::from_str(&config_str).context("parsing config file (1)")?;
    } else if let Ok(home) = env::var("HOME") {
        let mut config_path = PathBuf::from(home);
        config_path.push(".config");
        config_path.push("confab");
        config_path.push("config.toml");
        if config_path.exists() {
            let config_str = fs::read_to_string(&config_path).context("reading config toml (2)")?;
            config = toml::from_str(&config_str).context("parsing config file (2)")?;
        }
    }

    Ok(config)
}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct Config {
    /// The host the server binds and the client dials when no flag
    /// says otherwise. localhost when unset.
    pub host: Option<String>,

    /// The timeout applied to requests that don't carry their own,
    /// in milliseconds. 60000 when unset.
    pub default_timeout_ms: Option<u64>,

    /// Start sessions with the pretty printer enabled.
    pub pretty_print: Option<bool>,

    /// Start sessions writing full cause traces to the err stream
    /// instead of the one-line form.
    pub detail_on_error: Option<bool>,
}
