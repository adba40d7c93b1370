//! Gateway to the access log service: windowed, paginated search over
//! door-opening events.

use std::future::Future;

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use tracing::{debug, warn};

use crate::http::{ApiError, ResilientClient, RetryPolicy, StaticToken};

use super::types::{EventRow, ScanEvent, SearchPage};

/// Events the engine cares about: a badge opening a door.
const DOOR_TOPIC: &str = "door.open";

/// Seam between the reconciliation engine and the live access log.
pub trait ScanSource: Send + Sync {
    /// All door-opening events in `[start, end]`.
    fn scan_events(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<ScanEvent>, ApiError>> + Send;
}

pub struct AccessLogGateway {
    api: ResilientClient<StaticToken>,
    base_url: String,
    page_size: u64,
    fan_out: usize,
}

impl AccessLogGateway {
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        page_size: u64,
        fan_out_limit: usize,
    ) -> Self {
        let base_url = base_url.into();
        Self {
            api: ResilientClient::new(
                StaticToken(token.into()),
                RetryPolicy::default(),
                "access-log",
            ),
            base_url: base_url.trim_end_matches('/').to_string(),
            page_size: page_size.max(1),
            fan_out: fan_out_limit.max(1),
        }
    }

    /// Fetch every event in the window. The first page learns the total;
    /// remaining pages are fetched concurrently and appended after the first
    /// page, which stays a stable prefix. Order among the later pages is not
    /// guaranteed; callers only need the set of distinct actors.
    pub async fn scan_events(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ScanEvent>, ApiError> {
        let first = self.fetch_page(start, end, 1).await?;
        let total = first.total;
        let mut events = convert(first.events);

        let pages = total.div_ceil(self.page_size).max(1);
        if pages > 1 {
            let rest: Vec<Result<SearchPage, ApiError>> = stream::iter(2..=pages)
                .map(|page| self.fetch_page(start, end, page))
                .buffer_unordered(self.fan_out)
                .collect()
                .await;
            for page in rest {
                events.extend(convert(page?.events));
            }
        }
        debug!(total, fetched = events.len(), pages, "scan events fetched");
        Ok(events)
    }

    async fn fetch_page(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        page: u64,
    ) -> Result<SearchPage, ApiError> {
        let url = format!("{}/api/v1/logs/search", self.base_url);
        self.api
            .get(
                &url,
                &[
                    ("topic", DOOR_TOPIC.to_string()),
                    ("since", start.timestamp().to_string()),
                    ("until", end.timestamp().to_string()),
                    ("page", page.to_string()),
                    ("page_size", self.page_size.to_string()),
                ],
            )
            .await
    }
}

fn convert(rows: Vec<EventRow>) -> Vec<ScanEvent> {
    rows.into_iter()
        .filter_map(|row| match DateTime::from_timestamp(row.timestamp, 0) {
            Some(timestamp) => Some(ScanEvent {
                actor_id: row.actor_id,
                actor_name: row.actor_name,
                timestamp,
            }),
            None => {
                warn!(actor = %row.actor_id, raw = row.timestamp, "event with unusable timestamp dropped");
                None
            }
        })
        .collect()
}

impl ScanSource for AccessLogGateway {
    async fn scan_events(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ScanEvent>, ApiError> {
        AccessLogGateway::scan_events(self, start, end).await
    }
}
