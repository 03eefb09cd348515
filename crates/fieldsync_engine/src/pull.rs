//! Pull phase: fetch authoritative collections and merge them.

use crate::clock::Clock;
use crate::error::SyncResult;
use crate::merge::{MergeContext, MergeTally, SmartMergeResolver};
use crate::remap::IdRemapper;
use crate::transport::SyncTransport;
use fieldsync_core::{parse_timestamp, EntityRow, EntityType, Store, LAST_PULL_AT_KEY};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Merge results for one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionReport {
    /// Collection merged.
    pub entity_type: EntityType,
    /// Rows received.
    pub received: usize,
    /// Merge counters.
    pub tally: MergeTally,
}

/// A collection whose fetch or merge failed and was rolled back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionError {
    /// Collection that failed.
    pub entity_type: EntityType,
    /// Error message.
    pub message: String,
}

/// Result of one pull phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PullReport {
    /// True when the phase was skipped by the minimum interval.
    pub skipped: bool,
    /// Per-collection results, in pull order.
    pub collections: Vec<CollectionReport>,
    /// Sum over collections.
    pub totals: MergeTally,
    /// Failed collections.
    pub errors: Vec<CollectionError>,
}

impl PullReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    /// Rows inserted across collections.
    pub fn inserted(&self) -> usize {
        self.totals.inserted
    }

    /// Rows updated across collections.
    pub fn updated(&self) -> usize {
        self.totals.updated
    }

    /// Rows protected by unsynced local edits.
    pub fn conflicts(&self) -> usize {
        self.totals.conflicts
    }

    /// Duplicates folded into existing rows.
    pub fn duplicates_resolved(&self) -> usize {
        self.totals.duplicates_resolved
    }

    /// True when every collection merged.
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Fetches server state per collection and merges it atomically per
/// collection.
pub struct PullSyncManager {
    store: Arc<Store>,
    transport: Arc<dyn SyncTransport>,
    resolver: SmartMergeResolver,
    remapper: Arc<IdRemapper>,
    clock: Arc<dyn Clock>,
    collections: Vec<EntityType>,
    min_interval: Duration,
    bulk: bool,
}

impl PullSyncManager {
    /// Creates a pull manager.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        transport: Arc<dyn SyncTransport>,
        resolver: SmartMergeResolver,
        remapper: Arc<IdRemapper>,
        clock: Arc<dyn Clock>,
        collections: Vec<EntityType>,
        min_interval: Duration,
    ) -> Self {
        Self {
            store,
            transport,
            resolver,
            remapper,
            clock,
            collections,
            min_interval,
            bulk: false,
        }
    }

    /// Fetches every collection in one bulk request instead of one
    /// request per collection. A failed bulk request fails every
    /// collection.
    pub fn with_bulk_pull(mut self, bulk: bool) -> Self {
        self.bulk = bulk;
        self
    }

    /// Time of the last complete pull.
    pub fn last_pull_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        let stored = self.store.meta(LAST_PULL_AT_KEY)?;
        parse_timestamp(&Value::String(stored))
    }

    /// Returns true when the minimum interval has elapsed.
    pub fn is_pull_due(&self) -> bool {
        let Some(last) = self.last_pull_at() else {
            return true;
        };
        let Ok(interval) = chrono::Duration::from_std(self.min_interval) else {
            return true;
        };
        self.clock.now() - last >= interval
    }

    /// Pulls every configured collection unless the last complete pull is
    /// more recent than the minimum interval.
    pub async fn pull_all(&self, actor_id: &str) -> SyncResult<PullReport> {
        if !self.is_pull_due() {
            tracing::debug!(actor_id, "pull skipped; minimum interval not elapsed");
            return Ok(PullReport::skipped());
        }
        self.pull_forced(actor_id).await
    }

    /// Pulls every configured collection regardless of the interval.
    pub async fn pull_forced(&self, actor_id: &str) -> SyncResult<PullReport> {
        let mut report = PullReport::default();

        for (entity_type, fetched) in self.fetch(actor_id).await {
            let rows = match fetched {
                Ok(rows) => rows,
                Err(err) => {
                    tracing::warn!(%entity_type, error = %err, "pull fetch failed");
                    report.errors.push(CollectionError {
                        entity_type,
                        message: err.to_string(),
                    });
                    continue;
                }
            };

            match self.merge_collection(entity_type, actor_id, rows) {
                Ok(collection) => {
                    report.totals.absorb(&collection.tally);
                    report.collections.push(collection);
                }
                Err(err) => {
                    tracing::warn!(%entity_type, error = %err, "collection merge rolled back");
                    report.errors.push(CollectionError {
                        entity_type,
                        message: err.to_string(),
                    });
                }
            }
        }

        if report.is_complete() {
            let now = self.clock.now();
            self.store.transaction(|txn| {
                txn.set_meta(LAST_PULL_AT_KEY, now.to_rfc3339());
                Ok(())
            })?;
        }

        tracing::info!(
            actor_id,
            inserted = report.inserted(),
            updated = report.updated(),
            conflicts = report.conflicts(),
            duplicates = report.duplicates_resolved(),
            errors = report.errors.len(),
            "pull finished"
        );
        Ok(report)
    }

    async fn fetch(&self, actor_id: &str) -> Vec<(EntityType, SyncResult<Vec<Value>>)> {
        if self.bulk {
            return match self.transport.pull_batch(&self.collections, actor_id).await {
                Ok(mut batch) => self
                    .collections
                    .iter()
                    .map(|&entity_type| (entity_type, Ok(batch.take(entity_type))))
                    .collect(),
                Err(err) => self
                    .collections
                    .iter()
                    .map(|&entity_type| (entity_type, Err(err.clone())))
                    .collect(),
            };
        }

        let mut fetched = Vec::with_capacity(self.collections.len());
        for &entity_type in &self.collections {
            fetched.push((entity_type, self.transport.pull(entity_type, actor_id).await));
        }
        fetched
    }

    fn merge_collection(
        &self,
        entity_type: EntityType,
        actor_id: &str,
        rows: Vec<Value>,
    ) -> SyncResult<CollectionReport> {
        let received = rows.len();
        let mut tally = MergeTally::default();
        let mut parsed = Vec::with_capacity(received);
        for value in rows {
            match EntityRow::from_value(value) {
                Ok(row) => parsed.push(row),
                Err(err) => {
                    tracing::debug!(%entity_type, error = %err, "skipping malformed server row");
                    tally.skipped += 1;
                }
            }
        }
        let incoming_ids: HashSet<String> = parsed.iter().filter_map(EntityRow::id).collect();
        let ctx = MergeContext {
            actor_id,
            incoming_ids: &incoming_ids,
            now: self.clock.now(),
        };

        let (tally, identity_remaps) = self.store.transaction(|txn| {
            let mut remaps = Vec::new();
            for row in parsed {
                let decision = self.resolver.resolve_row(txn, entity_type, row, &ctx)?;
                tally.record(&decision);
                if let Some(remap) = decision.identity_remap {
                    remaps.push(remap);
                }
            }
            Ok((tally, remaps))
        })?;

        for (old_id, new_id) in identity_remaps {
            self.remapper.notify_identity(&old_id, &new_id);
        }

        Ok(CollectionReport {
            entity_type,
            received,
            tally,
        })
    }
}
