//! Shared server state handed to every axum handler.

use std::sync::Arc;

use crate::catalog::Catalog;
use crate::clock::Clock;
use crate::config::Config;
use crate::gateway::Gateway;

pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub config: Config,
}

impl AppState {
    pub fn new(catalog: Arc<dyn Catalog>, clock: Arc<dyn Clock>, config: Config) -> Arc<Self> {
        Arc::new(Self {
            gateway: Arc::new(Gateway::new(catalog, clock)),
            config,
        })
    }
}
