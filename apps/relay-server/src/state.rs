//! Application state management

use std::sync::Arc;

use crate::config::Config;
use crate::relay::Relay;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    relay: Relay,
}

impl AppState {
    pub fn new(config: Config, relay: Relay) -> Self {
        Self {
            inner: Arc::new(AppStateInner { config, relay }),
        }
    }

    /// State backed by the local filesystem at the configured storage dir
    pub fn from_config(config: Config) -> Self {
        let relay = Relay::open_local(config.relay.storage_dir.clone());
        Self::new(config, relay)
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn relay(&self) -> &Relay {
        &self.inner.relay
    }
}
