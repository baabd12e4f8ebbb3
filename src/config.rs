use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::http::connection::ConnectionSettings;
use crate::http::parser::{DEFAULT_MAX_BODY_BYTES, DEFAULT_MAX_HEADER_BYTES, Http1Processor};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// Seconds a connection may wait for a new request; 0 disables.
    pub idle_timeout_secs: u64,
    pub read_buffer_size: usize,
    pub max_header_bytes: usize,
    pub max_body_bytes: usize,
    /// 0 means unlimited.
    pub max_requests_per_connection: usize,
    /// Responses queued at once per connection; 1 turns off early routing
    /// of pipelined requests.
    pub max_pipelined_responses: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            idle_timeout_secs: 5,
            read_buffer_size: 4096,
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            max_requests_per_connection: 1000,
            max_pipelined_responses: 16,
        }
    }
}

impl Config {
    /// Defaults, overridden by `LISTEN` and `IDLE_TIMEOUT_SECS`.
    pub fn load() -> Self {
        let mut cfg = Self::default();
        cfg.apply_env();
        cfg
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(yaml).context("Invalid YAML configuration")
    }

    /// Reads a YAML file, then applies environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut cfg = Self::from_yaml_str(&raw)?;
        cfg.apply_env();
        Ok(cfg)
    }

    fn apply_env(&mut self) {
        if let Ok(addr) = std::env::var("LISTEN") {
            self.server.listen_addr = addr;
        }
        if let Ok(raw) = std::env::var("IDLE_TIMEOUT_SECS") {
            match raw.parse() {
                Ok(secs) => self.server.idle_timeout_secs = secs,
                Err(_) => tracing::warn!(value = %raw, "Ignoring invalid IDLE_TIMEOUT_SECS"),
            }
        }
    }
}

impl ServerConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            idle_timeout: self.idle_timeout(),
            read_buffer_size: self.read_buffer_size.max(1),
            max_requests: self.max_requests_per_connection,
            max_buffered_bytes: self.max_header_bytes.saturating_add(self.max_body_bytes),
            max_pipelined: self.max_pipelined_responses,
        }
    }

    pub fn processor(&self) -> Http1Processor {
        Http1Processor::new(self.max_header_bytes, self.max_body_bytes)
    }
}
