/// Shared application state for the webserver
///
/// Route handlers reach the oracle and chain client through this; the
/// heavy state (positions, settings, budget) lives in the domain modules.
use std::sync::Arc;

use crate::apis::ChainApi;
use crate::oracle::PriceOracle;

#[derive(Clone)]
pub struct AppState {
    pub oracle: Arc<PriceOracle>,
    pub chain: Arc<dyn ChainApi>,
    pub startup_time: chrono::DateTime<chrono::Utc>,
}

impl AppState {
    pub fn new(oracle: Arc<PriceOracle>, chain: Arc<dyn ChainApi>) -> Self {
        Self {
            oracle,
            chain,
            startup_time: chrono::Utc::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        (chrono::Utc::now() - self.startup_time).num_seconds().max(0) as u64
    }
}
