//! Configuration for the sync engine.

use chrono::{DateTime, Utc};
use fieldsync_core::{EntityType, MutationRecord};
use std::time::Duration;

/// Similarity threshold above which two supply labels are the same item.
pub const DEFAULT_FUZZY_MATCH_THRESHOLD: f64 = 0.7;

/// Collections pulled by default, in dependency order.
pub const DEFAULT_PULL_COLLECTIONS: [EntityType; 8] = [
    EntityType::User,
    EntityType::Location,
    EntityType::Supply,
    EntityType::Task,
    EntityType::Registration,
    EntityType::TaskAssignment,
    EntityType::Alert,
    EntityType::Notification,
];

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Server URL.
    pub server_url: String,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Minimum time between two automatic pull phases.
    pub min_pull_interval: Duration,
    /// Backoff applied to failed outbox entries.
    pub retry: RetryPolicy,
    /// Label similarity at or above which rows are treated as duplicates.
    pub fuzzy_match_threshold: f64,
    /// Collections fetched by the pull phase, in order.
    pub pull_collections: Vec<EntityType>,
    /// Fetch every collection in one bulk request.
    pub bulk_pull: bool,
}

impl SyncConfig {
    /// Creates a new sync configuration.
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            request_timeout: Duration::from_secs(30),
            min_pull_interval: Duration::from_secs(60 * 60),
            retry: RetryPolicy::default(),
            fuzzy_match_threshold: DEFAULT_FUZZY_MATCH_THRESHOLD,
            pull_collections: DEFAULT_PULL_COLLECTIONS.to_vec(),
            bulk_pull: false,
        }
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the minimum pull interval.
    pub fn with_min_pull_interval(mut self, interval: Duration) -> Self {
        self.min_pull_interval = interval;
        self
    }

    /// Sets the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the fuzzy duplicate threshold (clamped to `0.0..=1.0`).
    pub fn with_fuzzy_match_threshold(mut self, threshold: f64) -> Self {
        self.fuzzy_match_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    /// Sets the pulled collections.
    pub fn with_pull_collections(mut self, collections: Vec<EntityType>) -> Self {
        self.pull_collections = collections;
        self
    }

    /// Uses the bulk pull endpoint instead of one request per collection.
    pub fn with_bulk_pull(mut self, bulk: bool) -> Self {
        self.bulk_pull = bulk;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("")
    }
}

/// Exponential backoff for outbox entries.
///
/// Retries are unbounded: a failed entry is never abandoned, only
/// deferred until [`RetryPolicy::is_due`] says so.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Upper bound on the delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    /// Creates a policy with the given initial delay.
    pub fn new(initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay: Duration::from_secs(15 * 60),
            backoff_multiplier: 2.0,
        }
    }

    /// A policy that retries on every pass.
    pub fn immediate() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Delay to wait after `retry_count` failures.
    pub fn delay_for_attempt(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(retry_count.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            Duration::ZERO
        }
    }

    /// Earliest time the next attempt may run, or `None` if any time will do.
    pub fn next_attempt_at(
        &self,
        retry_count: u32,
        last_attempt_at: Option<DateTime<Utc>>,
    ) -> Option<DateTime<Utc>> {
        let last = last_attempt_at?;
        let delay = chrono::Duration::from_std(self.delay_for_attempt(retry_count)).ok()?;
        last.checked_add_signed(delay)
    }

    /// Returns true when `record` may be pushed at `now`.
    pub fn is_due(&self, record: &MutationRecord, now: DateTime<Utc>) -> bool {
        self.next_attempt_at(record.retry_count, record.last_attempt_at)
            .map_or(true, |at| at <= now)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}
