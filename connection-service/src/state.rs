//! Application state for connection service.

use std::sync::Arc;

use common::config::AppConfig;

use crate::driver::NativeDriver;
use crate::events::EventHub;
use crate::pool_manager::PoolManager;
use crate::service::{ConnectionService, ConnectionServiceTrait};
use crate::ssh::RusshConnector;
use crate::tunnel_manager::TunnelManager;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub service: Arc<dyn ConnectionServiceTrait>,
    pub events: EventHub,
}

impl AppState {
    /// Wires the russh connector and the native drivers into a fresh core.
    pub fn new(config: AppConfig) -> Self {
        let connector = Arc::new(RusshConnector::new(config.connect_timeout(), config.ssh_keepalive()));
        let tunnels = Arc::new(TunnelManager::new(connector));
        let driver = Arc::new(NativeDriver::new(config.connect_timeout(), config.max_connections));
        let pool = Arc::new(PoolManager::new(
            tunnels,
            driver,
            config.connect_timeout(),
            config.probe_timeout(),
        ));
        Self::with_pool(config, pool)
    }

    /// Builds the state around an existing pool.
    pub fn with_pool(config: AppConfig, pool: Arc<PoolManager>) -> Self {
        let events = EventHub::new(config.event_buffer);
        Self {
            service: Arc::new(ConnectionService::new(pool, events.clone())),
            events,
            config,
        }
    }
}
