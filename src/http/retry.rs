//! Retry rules shared by both API clients.
//!
//! The policy is a pure decision function over the response status and the
//! attempt history, so the timing contract can be tested without sleeping.
//! The send loop in [`client`](super::client) owns the actual waits.

use std::ops::RangeInclusive;
use std::time::Duration;

use rand::Rng;

/// What the client should do after a non-success response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Refresh credentials and replay the request.
    RefreshToken,
    /// Sleep for the given duration, then replay the request.
    Wait(Duration),
    /// Give up and surface the response as an error.
    Fail,
}

/// Per-status retry behavior.
///
/// - 401: exactly one credential refresh-and-retry per logical request.
/// - 429: wait `retry-after + rate_limit_padding`, retry with no cap.
/// - 500: wait a uniform random backoff, at most `max_server_error_retries`
///   replays.
/// - anything else: fail immediately.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum replays of a request that keeps returning 500.
    pub max_server_error_retries: u32,
    /// Uniform backoff range for 500 responses, in milliseconds.
    pub server_error_backoff_ms: RangeInclusive<u64>,
    /// Fixed padding added on top of the upstream `retry-after` for 429.
    pub rate_limit_padding: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_server_error_retries: 3,
            server_error_backoff_ms: 1_000..=3_000,
            rate_limit_padding: Duration::from_secs(3),
        }
    }
}

impl RetryPolicy {
    /// Decide what to do about a non-success `status`.
    ///
    /// `retry_after_secs` is the parsed `retry-after` header, when present.
    /// `refreshed` records whether this logical request already spent its one
    /// credential refresh; `server_error_retries` counts 500 replays so far.
    pub fn decide(
        &self,
        status: u16,
        retry_after_secs: Option<u64>,
        refreshed: bool,
        server_error_retries: u32,
    ) -> RetryDecision {
        match status {
            401 if !refreshed => RetryDecision::RefreshToken,
            401 => RetryDecision::Fail,
            429 => {
                // A 429 without the header is treated as retry-after: 1.
                let upstream = Duration::from_secs(retry_after_secs.unwrap_or(1));
                RetryDecision::Wait(upstream + self.rate_limit_padding)
            }
            500 if server_error_retries < self.max_server_error_retries => {
                let ms = rand::rng().random_range(self.server_error_backoff_ms.clone());
                RetryDecision::Wait(Duration::from_millis(ms))
            }
            _ => RetryDecision::Fail,
        }
    }
}
