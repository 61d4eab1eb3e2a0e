//! Shared service state handed to every operation and HTTP handler.

use std::sync::Arc;

use sqlx::SqlitePool;

use crate::config::Config;
use crate::gateway::ChainGateway;

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub config: Arc<Config>,
    /// Injected per deployment; tests swap in a scripted fake.
    pub gateway: Arc<dyn ChainGateway>,
}

impl AppState {
    pub fn new(pool: SqlitePool, config: Config, gateway: Arc<dyn ChainGateway>) -> Self {
        Self {
            pool,
            config: Arc::new(config),
            gateway,
        }
    }
}
