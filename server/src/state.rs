use chrono::{DateTime, Utc};

use crate::config::SessionConfig;
use crate::ws::HubHandle;

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// Mailbox of the single Hub that owns room membership
    pub hub: HubHandle,
    /// Name assigned when a client connects without one
    pub default_username: String,
    /// Queue and liveness settings applied to every new session
    pub session: SessionConfig,
    /// Process start, for the uptime statistic
    pub started_at: DateTime<Utc>,
}
