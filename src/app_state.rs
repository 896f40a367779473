// =============================================================================
// Application State — shared across the API layer
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::runtime_config::RuntimeConfig;
use crate::stream::MarketStreamClient;

/// Everything an API handler needs: the live stream client and the config it
/// was built from.
pub struct AppState {
    pub config: RuntimeConfig,
    pub client: Arc<MarketStreamClient>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: RuntimeConfig, client: Arc<MarketStreamClient>) -> Self {
        Self {
            config,
            client,
            started_at: Utc::now(),
        }
    }
}
