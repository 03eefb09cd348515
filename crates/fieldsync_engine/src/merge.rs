//! Smart merge of authoritative server rows into the local store.
//!
//! Per incoming row:
//!
//! 1. No local row with that id: insert it as synced.
//! 2. Local row unsynced: never overwrite; raise a conflict notification.
//! 3. Local row synced and equal (ignoring bookkeeping columns): no-op.
//! 4. Local row synced and different: the strictly newer side wins, ties
//!    and missing timestamps go to the server.
//! 5. Duplicates under a different id: the identity natural key and the
//!    fuzzy label of inventory items route the row into case 4 against the
//!    duplicate instead of inserting a second copy.

use crate::remap::IdRemapper;
use chrono::{DateTime, Utc};
use fieldsync_core::{EntityRow, EntityType, StoreError, StoreResult, Transaction};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

/// String similarity in `0.0..=1.0`.
pub trait Similarity: Send + Sync {
    /// Returns how alike `a` and `b` are; 1.0 means identical.
    fn similarity(&self, a: &str, b: &str) -> f64;
}

/// Levenshtein distance normalized by the longer string, computed over
/// lowercased, whitespace-collapsed text.
#[derive(Debug, Clone, Copy, Default)]
pub struct NormalizedLevenshtein;

impl Similarity for NormalizedLevenshtein {
    fn similarity(&self, a: &str, b: &str) -> f64 {
        let a: Vec<char> = normalize(a).chars().collect();
        let b: Vec<char> = normalize(b).chars().collect();
        let longest = a.len().max(b.len());
        if longest == 0 {
            return 1.0;
        }
        1.0 - levenshtein(&a, &b) as f64 / longest as f64
    }
}

fn normalize(s: &str) -> String {
    s.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

fn levenshtein(a: &[char], b: &[char]) -> usize {
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            curr[j + 1] = substitution.min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// What happened to one incoming row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeOutcome {
    /// New row inserted.
    Inserted,
    /// Existing row overwritten with server data.
    Updated,
    /// Local row already matched.
    Unchanged,
    /// Local row is newer and was kept.
    KeptLocal,
    /// Local row has unsynced edits; a conflict notification was raised.
    ConflictFlagged,
}

/// Outcome plus side effects of resolving one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeDecision {
    /// Row-level outcome.
    pub outcome: MergeOutcome,
    /// Whether a duplicate under another id was detected and handled.
    pub duplicate_resolved: bool,
    /// Set when the active identity was remapped `(old, new)`.
    pub identity_remap: Option<(String, String)>,
}

impl MergeDecision {
    fn plain(outcome: MergeOutcome) -> Self {
        Self {
            outcome,
            duplicate_resolved: false,
            identity_remap: None,
        }
    }

    fn duplicate(outcome: MergeOutcome) -> Self {
        Self {
            outcome,
            duplicate_resolved: true,
            identity_remap: None,
        }
    }
}

/// Per-collection counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeTally {
    /// Rows inserted.
    pub inserted: usize,
    /// Rows overwritten.
    pub updated: usize,
    /// Rows already up to date.
    pub unchanged: usize,
    /// Rows where the newer local version was kept.
    pub kept_local: usize,
    /// Rows protected because of unsynced local edits.
    pub conflicts: usize,
    /// Duplicates under a different id.
    pub duplicates_resolved: usize,
    /// Malformed server rows ignored.
    pub skipped: usize,
}

impl MergeTally {
    /// Counts one decision.
    pub fn record(&mut self, decision: &MergeDecision) {
        match decision.outcome {
            MergeOutcome::Inserted => self.inserted += 1,
            MergeOutcome::Updated => self.updated += 1,
            MergeOutcome::Unchanged => self.unchanged += 1,
            MergeOutcome::KeptLocal => self.kept_local += 1,
            MergeOutcome::ConflictFlagged => self.conflicts += 1,
        }
        if decision.duplicate_resolved {
            self.duplicates_resolved += 1;
        }
    }

    /// Adds another tally.
    pub fn absorb(&mut self, other: &MergeTally) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.kept_local += other.kept_local;
        self.conflicts += other.conflicts;
        self.duplicates_resolved += other.duplicates_resolved;
        self.skipped += other.skipped;
    }

    /// Rows that changed the local store.
    pub fn applied(&self) -> usize {
        self.inserted + self.updated
    }
}

/// Inputs shared by every row of one pulled collection.
#[derive(Debug, Clone, Copy)]
pub struct MergeContext<'a> {
    /// Actor the pull runs for.
    pub actor_id: &'a str,
    /// Ids present in the incoming collection. Local rows with one of these
    /// ids are server rows in their own right and never duplicates.
    pub incoming_ids: &'a HashSet<String>,
    /// Current time.
    pub now: DateTime<Utc>,
}

/// Decides how each server row lands locally.
#[derive(Clone)]
pub struct SmartMergeResolver {
    threshold: f64,
    similarity: Arc<dyn Similarity>,
}

impl SmartMergeResolver {
    /// Creates a resolver with the default similarity.
    pub fn new(threshold: f64) -> Self {
        Self::with_similarity(threshold, Arc::new(NormalizedLevenshtein))
    }

    /// Creates a resolver with a custom similarity.
    pub fn with_similarity(threshold: f64, similarity: Arc<dyn Similarity>) -> Self {
        Self {
            threshold,
            similarity,
        }
    }

    /// Returns the fuzzy duplicate threshold.
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Merges one server row.
    pub fn resolve_row(
        &self,
        txn: &mut Transaction<'_>,
        entity_type: EntityType,
        server_row: EntityRow,
        ctx: &MergeContext<'_>,
    ) -> StoreResult<MergeDecision> {
        let server_id = server_row
            .id()
            .ok_or_else(|| StoreError::InvalidRow("server row has no id".into()))?;

        if let Some(local) = txn.get_row(entity_type, &server_id).cloned() {
            let outcome = self.merge_existing(txn, entity_type, &local, &server_row, ctx)?;
            return Ok(MergeDecision::plain(outcome));
        }

        if let Some(decision) = self.identity_duplicate(txn, entity_type, &server_id, &server_row, ctx)? {
            return Ok(decision);
        }

        if let Some(decision) = self.fuzzy_duplicate(txn, entity_type, &server_id, &server_row, ctx)? {
            return Ok(decision);
        }

        let mut row = server_row;
        row.set_synced(true);
        txn.insert_row(entity_type, row)?;
        Ok(MergeDecision::plain(MergeOutcome::Inserted))
    }

    /// Cases 2-4 against an existing local row. The local row keeps its id.
    fn merge_existing(
        &self,
        txn: &mut Transaction<'_>,
        entity_type: EntityType,
        local: &EntityRow,
        server: &EntityRow,
        ctx: &MergeContext<'_>,
    ) -> StoreResult<MergeOutcome> {
        let local_id = local
            .id()
            .ok_or_else(|| StoreError::InvalidRow("local row has no id".into()))?;
        let mut comparable = server.clone();
        comparable.set_id(&local_id);

        if local.is_refresh_required() {
            txn.update_row(entity_type, &local_id, |row| {
                row.overwrite_from(server);
                row.set_synced(true);
            })?;
            tracing::debug!(%entity_type, id = %local_id, "stale row refreshed from server");
            return Ok(MergeOutcome::Updated);
        }

        if !local.is_synced() {
            if !local.differs_from(&comparable) {
                return Ok(MergeOutcome::KeptLocal);
            }
            if entity_type != EntityType::Notification {
                let user_id = txn
                    .session()
                    .map(|s| s.user_id.clone())
                    .unwrap_or_else(|| ctx.actor_id.to_string());
                let message = format!(
                    "The server changed {entity_type} {local_id} while you had unsynced edits; your version was kept"
                );
                txn.insert_notification(&user_id, entity_type, &local_id, &message, ctx.now)?;
            }
            tracing::debug!(%entity_type, id = %local_id, "unsynced local row protected");
            return Ok(MergeOutcome::ConflictFlagged);
        }

        if !local.differs_from(&comparable) {
            return Ok(MergeOutcome::Unchanged);
        }

        if local_is_newer(entity_type, local, server) {
            tracing::debug!(%entity_type, id = %local_id, "local row newer; kept");
            return Ok(MergeOutcome::KeptLocal);
        }

        txn.update_row(entity_type, &local_id, |row| {
            row.overwrite_from(server);
            row.set_synced(true);
        })?;
        Ok(MergeOutcome::Updated)
    }

    fn identity_duplicate(
        &self,
        txn: &mut Transaction<'_>,
        entity_type: EntityType,
        server_id: &str,
        server: &EntityRow,
        ctx: &MergeContext<'_>,
    ) -> StoreResult<Option<MergeDecision>> {
        let Some(key) = entity_type.natural_key() else {
            return Ok(None);
        };
        let Some(value) = server.get_str(key).map(str::trim).filter(|v| !v.is_empty()) else {
            return Ok(None);
        };
        let duplicate = txn
            .rows(entity_type)
            .filter(|row| {
                row.get_str(key)
                    .is_some_and(|v| v.trim().eq_ignore_ascii_case(value))
            })
            .find(|row| is_candidate(row, server_id, ctx))
            .cloned();
        let Some(duplicate) = duplicate else {
            return Ok(None);
        };
        let Some(duplicate_id) = duplicate.id() else {
            return Ok(None);
        };

        let is_own = txn
            .session()
            .is_some_and(|session| session.user_id == duplicate_id);
        if !is_own {
            tracing::debug!(%entity_type, local = %duplicate_id, server = server_id, "refreshing duplicate identity");
            let outcome = self.merge_existing(txn, entity_type, &duplicate, server, ctx)?;
            return Ok(Some(MergeDecision::duplicate(outcome)));
        }

        tracing::info!(old_id = %duplicate_id, new_id = server_id, "adopting server id for active identity");
        let summary = IdRemapper::apply(txn, entity_type, &duplicate_id, server_id);
        let protected = !duplicate.is_synced();
        if !protected {
            txn.update_row(entity_type, server_id, |row| {
                row.overwrite_from(server);
                row.set_synced(true);
            })?;
        }
        Ok(Some(MergeDecision {
            outcome: if protected {
                MergeOutcome::KeptLocal
            } else {
                MergeOutcome::Updated
            },
            duplicate_resolved: true,
            identity_remap: summary
                .session_updated
                .then(|| (duplicate_id, server_id.to_string())),
        }))
    }

    fn fuzzy_duplicate(
        &self,
        txn: &mut Transaction<'_>,
        entity_type: EntityType,
        server_id: &str,
        server: &EntityRow,
        ctx: &MergeContext<'_>,
    ) -> StoreResult<Option<MergeDecision>> {
        let Some(label) = entity_type.fuzzy_label() else {
            return Ok(None);
        };
        let Some(server_label) = server.get_str(label).filter(|v| !v.trim().is_empty()) else {
            return Ok(None);
        };

        let best = txn
            .rows(entity_type)
            .filter(|row| is_candidate(row, server_id, ctx) && same_location(row, server))
            .filter_map(|row| {
                let score = self.similarity.similarity(row.get_str(label)?, server_label);
                (score >= self.threshold).then(|| (score, row.clone()))
            })
            .max_by(|a, b| a.0.total_cmp(&b.0));
        let Some((score, duplicate)) = best else {
            return Ok(None);
        };
        let Some(duplicate_id) = duplicate.id() else {
            return Ok(None);
        };
        tracing::debug!(%entity_type, local = %duplicate_id, server = server_id, score, "fuzzy duplicate");

        let mut comparable = server.clone();
        comparable.set_id(&duplicate_id);
        if !duplicate.is_synced() || local_is_newer(entity_type, &duplicate, server) {
            let outcome = self.merge_existing(txn, entity_type, &duplicate, server, ctx)?;
            return Ok(Some(MergeDecision::duplicate(outcome)));
        }

        // Server wins: adopt its id so references follow, then its fields.
        IdRemapper::apply(txn, entity_type, &duplicate_id, server_id);
        txn.update_row(entity_type, server_id, |row| {
            row.overwrite_from(server);
            row.set_synced(true);
        })?;
        let outcome = if duplicate.differs_from(&comparable) {
            MergeOutcome::Updated
        } else {
            MergeOutcome::Unchanged
        };
        Ok(Some(MergeDecision::duplicate(outcome)))
    }
}

impl std::fmt::Debug for SmartMergeResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmartMergeResolver")
            .field("threshold", &self.threshold)
            .finish_non_exhaustive()
    }
}

fn is_candidate(row: &EntityRow, server_id: &str, ctx: &MergeContext<'_>) -> bool {
    row.id()
        .is_some_and(|id| id != server_id && !ctx.incoming_ids.contains(&id))
}

/// Rows at different known locations are never duplicates.
fn same_location(local: &EntityRow, server: &EntityRow) -> bool {
    match (location_of(local), location_of(server)) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    }
}

fn location_of(row: &EntityRow) -> Option<String> {
    match row.get("location_id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Local wins only when both sides carry a timestamp and local is strictly
/// newer.
fn local_is_newer(entity_type: EntityType, local: &EntityRow, server: &EntityRow) -> bool {
    match (local.last_modified(entity_type), server.last_modified(entity_type)) {
        (Some(local_at), Some(server_at)) => local_at > server_at,
        _ => false,
    }
}
