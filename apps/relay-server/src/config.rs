//! Configuration management for the relay server

use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub relay: RelayConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Root holding `chunks/`, `files/` and the code map
    pub storage_dir: PathBuf,
    /// Seconds between background sweeps; 0 disables the task
    pub sweep_interval_secs: u64,
    /// Request body limit for chunk uploads
    pub max_chunk_bytes: usize,
}

impl RelayConfig {
    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }
}

pub const DEFAULT_MAX_CHUNK_BYTES: usize = 64 * 1024 * 1024;

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3000,
            },
            relay: RelayConfig {
                storage_dir: PathBuf::from("./uploads"),
                sweep_interval_secs: 300,
                max_chunk_bytes: DEFAULT_MAX_CHUNK_BYTES,
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from any key lookup, falling back to defaults for
    /// missing or unparseable values
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Config::default();

        Config {
            server: ServerConfig {
                host: lookup("SERVER_HOST").unwrap_or(defaults.server.host),
                port: parse_or(&lookup, "SERVER_PORT", defaults.server.port),
            },
            relay: RelayConfig {
                storage_dir: lookup("RELAY_STORAGE_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.relay.storage_dir),
                sweep_interval_secs: parse_or(
                    &lookup,
                    "RELAY_SWEEP_INTERVAL_SECS",
                    defaults.relay.sweep_interval_secs,
                ),
                max_chunk_bytes: parse_or(
                    &lookup,
                    "RELAY_MAX_CHUNK_BYTES",
                    defaults.relay.max_chunk_bytes,
                ),
            },
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key = %key, value = %raw, "Ignoring unparseable config value");
            default
        }),
        None => default,
    }
}
