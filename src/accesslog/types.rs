use chrono::{DateTime, Utc};
use serde::Deserialize;

/// One badge scan. Ephemeral: fetched for a bounded window and consumed once
/// per reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanEvent {
    pub actor_id: String,
    pub actor_name: String,
    pub timestamp: DateTime<Utc>,
}

/// One page of the log search endpoint. `total` counts all matches across
/// pages, which is how the gateway learns how many pages remain.
#[derive(Debug, Deserialize)]
pub struct SearchPage {
    pub total: u64,
    pub events: Vec<EventRow>,
}

#[derive(Debug, Deserialize)]
pub struct EventRow {
    pub actor_id: String,
    pub actor_name: String,
    /// Epoch seconds.
    pub timestamp: i64,
}
