// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Configuration loading.

use crate::error::{Error, Result};
use serde::Deserialize;

fn default_listen_port() -> u16 {
    8080
}

fn default_log_path() -> String {
    "captures.jsonl".to_string()
}

fn default_cert_dir() -> String {
    ".roo-sniffer".to_string()
}

/// Proxy configuration, immutable after startup.
///
/// The watch-domain list is the one exception: the running proxy reads it
/// through [`crate::watch::WatchList`], which supports atomic replacement.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Port to listen on (all interfaces).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Path to the append-only JSONL record file.
    #[serde(default = "default_log_path")]
    pub log_path: String,

    /// Case-insensitive substrings; a host matching any of them is
    /// TLS-intercepted instead of tunneled.
    #[serde(default)]
    pub watch_domains: Vec<String>,

    /// Record request headers and response previews.
    #[serde(default)]
    pub verbose: bool,

    /// Directory holding the CA certificate and key.
    #[serde(default = "default_cert_dir")]
    pub cert_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            log_path: default_log_path(),
            watch_domains: Vec::new(),
            verbose: false,
            cert_dir: default_cert_dir(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub async fn load_from_path<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let s = tokio::fs::read_to_string(path.as_ref())
            .await
            .map_err(|e| Error::Config(format!("cannot read config file: {e}")))?;
        let cfg: Self =
            toml::from_str(&s).map_err(|e| Error::Config(format!("invalid config file: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.log_path.trim().is_empty() {
            return Err(Error::Config("log_path must not be empty".into()));
        }
        if self.cert_dir.trim().is_empty() {
            return Err(Error::Config("cert_dir must not be empty".into()));
        }
        Ok(())
    }
}
