//! The local store: entity tables, outbox, session and metadata.
//!
//! All writes go through [`Store::transaction`]. The closure operates on a
//! copy-on-write view of the state; the new state replaces the live one
//! only when the closure returns `Ok`, so multi-row writes (entity row plus
//! outbox entry, a whole pulled collection, an id remap) are atomic.
//!
//! Collections are shared between versions and copied on first write, so a
//! transaction only pays for the tables it touches. File-backed stores append
//! those tables to a journal before the swap and fold the journal into the
//! JSON snapshot at checkpoints.

use crate::entity::{
    EntityRow, EntityType, ForeignKey, CREATED_AT_COLUMN, SYNC_STATUS_COLUMN, UPDATED_AT_COLUMN,
};
use crate::error::{StoreError, StoreResult};
use crate::journal::Journal;
use crate::outbox::{ConflictDetails, MutationRecord, OutboxStatus};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Version of the on-disk snapshot format.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Metadata key holding the last successful pull time.
pub const LAST_PULL_AT_KEY: &str = "last_pull_at";

/// Notification `type` used for merge conflicts.
pub const CONFLICT_NOTIFICATION_TYPE: &str = "sync_conflict";

/// The active identity on this device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Id of the signed-in user row.
    pub user_id: String,
    /// Email of the signed-in user.
    pub email: Option<String>,
    /// Display name.
    pub display_name: Option<String>,
    /// When the session started.
    pub started_at: DateTime<Utc>,
}

impl Session {
    /// Creates a session for the given user id.
    pub fn new(user_id: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            email: None,
            display_name: None,
            started_at,
        }
    }

    /// Sets the email.
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
}

/// Outbox entry counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutboxCounts {
    /// Entries waiting to be pushed.
    pub pending: usize,
    /// Entries waiting for conflict resolution.
    pub conflict: usize,
    /// Confirmed entries not yet purged.
    pub success: usize,
}

type Table = BTreeMap<String, EntityRow>;
type Outbox = BTreeMap<String, MutationRecord>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreState {
    version: u32,
    tables: BTreeMap<String, Arc<Table>>,
    outbox: Arc<Outbox>,
    session: Option<Session>,
    meta: BTreeMap<String, String>,
    next_seq: u64,
    /// Number of committed write transactions.
    #[serde(default)]
    commit: u64,
}

impl StoreState {
    fn new() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            next_seq: 1,
            ..Self::default()
        }
    }
}

/// Collections written by a transaction.
#[derive(Debug, Default)]
struct Dirty {
    tables: BTreeSet<EntityType>,
    outbox: bool,
}

/// One committed transaction as recorded in the journal.
///
/// Session, metadata and the sequence counter are small and always carried;
/// tables and the outbox only when they changed.
#[derive(Debug, Serialize, Deserialize)]
struct JournalEntry {
    commit: u64,
    next_seq: u64,
    session: Option<Session>,
    meta: BTreeMap<String, String>,
    #[serde(default)]
    tables: BTreeMap<String, Arc<Table>>,
    #[serde(default)]
    outbox: Option<Arc<Outbox>>,
}

impl JournalEntry {
    fn capture(state: &StoreState, dirty: &Dirty) -> Self {
        Self {
            commit: state.commit,
            next_seq: state.next_seq,
            session: state.session.clone(),
            meta: state.meta.clone(),
            tables: dirty
                .tables
                .iter()
                .filter_map(|entity_type| {
                    let name = entity_type.table();
                    state
                        .tables
                        .get(name)
                        .map(|table| (name.to_string(), Arc::clone(table)))
                })
                .collect(),
            outbox: dirty.outbox.then(|| Arc::clone(&state.outbox)),
        }
    }

    /// Replays the entry; entries already folded into the snapshot are skipped.
    fn apply(self, state: &mut StoreState) -> bool {
        if self.commit <= state.commit {
            return false;
        }
        state.commit = self.commit;
        state.next_seq = self.next_seq;
        state.session = self.session;
        state.meta = self.meta;
        state.tables.extend(self.tables);
        if let Some(outbox) = self.outbox {
            state.outbox = outbox;
        }
        true
    }
}

/// A unit of work against the store.
///
/// Reads borrow the live state; the first write takes a shallow copy and
/// each collection is copied when first written.
pub struct Transaction<'a> {
    state: Cow<'a, StoreState>,
    dirty: Dirty,
}

impl<'a> Transaction<'a> {
    fn new(state: &'a StoreState) -> Self {
        Self {
            state: Cow::Borrowed(state),
            dirty: Dirty::default(),
        }
    }

    fn state_mut(&mut self) -> &mut StoreState {
        self.state.to_mut()
    }

    fn table_mut(&mut self, entity_type: EntityType) -> &mut Table {
        self.dirty.tables.insert(entity_type);
        let table = self
            .state_mut()
            .tables
            .entry(entity_type.table().to_string())
            .or_default();
        Arc::make_mut(table)
    }

    fn outbox_mut(&mut self) -> &mut Outbox {
        self.dirty.outbox = true;
        Arc::make_mut(&mut self.state_mut().outbox)
    }

    fn take_seq(&mut self) -> u64 {
        let state = self.state_mut();
        let seq = state.next_seq;
        state.next_seq += 1;
        seq
    }

    // ------------------------------------------------------------------
    // Entity rows
    // ------------------------------------------------------------------

    /// Gets a row by id.
    pub fn get_row(&self, entity_type: EntityType, id: &str) -> Option<&EntityRow> {
        self.state.tables.get(entity_type.table())?.get(id)
    }

    /// Iterates all rows of a table in id order.
    pub fn rows(&self, entity_type: EntityType) -> impl Iterator<Item = &EntityRow> {
        self.state
            .tables
            .get(entity_type.table())
            .into_iter()
            .flat_map(|table| table.values())
    }

    /// Returns rows whose `field` equals `value` (string comparison).
    pub fn find_rows(&self, entity_type: EntityType, field: &str, value: &str) -> Vec<EntityRow> {
        self.rows(entity_type)
            .filter(|row| field_matches(row.get(field), value))
            .cloned()
            .collect()
    }

    /// Inserts a new row; fails if the id is taken.
    pub fn insert_row(&mut self, entity_type: EntityType, row: EntityRow) -> StoreResult<()> {
        let id = row_id(&row)?;
        if self.get_row(entity_type, &id).is_some() {
            return Err(StoreError::DuplicateRow { entity_type, id });
        }
        self.table_mut(entity_type).insert(id, row);
        Ok(())
    }

    /// Inserts or replaces a row, returning the previous version.
    pub fn put_row(&mut self, entity_type: EntityType, row: EntityRow) -> StoreResult<Option<EntityRow>> {
        let id = row_id(&row)?;
        Ok(self.table_mut(entity_type).insert(id, row))
    }

    /// Applies `f` to an existing row.
    pub fn update_row<F>(&mut self, entity_type: EntityType, id: &str, f: F) -> StoreResult<()>
    where
        F: FnOnce(&mut EntityRow),
    {
        let row = self
            .table_mut(entity_type)
            .get_mut(id)
            .ok_or_else(|| StoreError::RowNotFound {
                entity_type,
                id: id.to_string(),
            })?;
        f(row);
        row.set_id(id);
        Ok(())
    }

    /// Deletes a row, returning it.
    pub fn delete_row(&mut self, entity_type: EntityType, id: &str) -> Option<EntityRow> {
        self.table_mut(entity_type).remove(id)
    }

    /// Marks a row as synced.
    pub fn mark_entity_synced(&mut self, entity_type: EntityType, id: &str) -> StoreResult<()> {
        self.update_row(entity_type, id, |row| row.set_synced(true))
    }

    /// Records a user-visible sync error on a row.
    pub fn set_sync_status(
        &mut self,
        entity_type: EntityType,
        id: &str,
        message: Option<&str>,
    ) -> StoreResult<()> {
        self.update_row(entity_type, id, |row| row.set_status_message(message))
    }

    /// Moves a row from `old_id` to `new_id`.
    ///
    /// Returns false when no row has `old_id`. When a row with `new_id`
    /// already exists it is replaced by the moved row.
    pub fn rename_row(&mut self, entity_type: EntityType, old_id: &str, new_id: &str) -> bool {
        if self.get_row(entity_type, old_id).is_none() {
            return false;
        }
        if old_id == new_id {
            return true;
        }
        let table = self.table_mut(entity_type);
        let Some(mut row) = table.remove(old_id) else {
            return false;
        };
        row.set_id(new_id);
        table.insert(new_id.to_string(), row);
        true
    }

    /// Rewrites every `fk.column == old_id` to `new_id`. Returns the number
    /// of rows changed.
    pub fn replace_references(&mut self, fk: ForeignKey, old_id: &str, new_id: &str) -> usize {
        let has_match = self
            .rows(fk.table)
            .any(|row| field_matches(row.get(fk.column), old_id));
        if !has_match {
            return 0;
        }
        let mut changed = 0;
        for row in self.table_mut(fk.table).values_mut() {
            if field_matches(row.get(fk.column), old_id) {
                row.set(fk.column, Value::String(new_id.to_string()));
                changed += 1;
            }
        }
        changed
    }

    /// Points notifications about `entity_type` `old_id` at `new_id`.
    pub fn retarget_notifications(
        &mut self,
        entity_type: EntityType,
        old_id: &str,
        new_id: &str,
    ) -> usize {
        let targets = |row: &EntityRow| {
            row.get_str("entity_type") == Some(entity_type.as_str())
                && field_matches(row.get("entity_id"), old_id)
        };
        if !self.rows(EntityType::Notification).any(targets) {
            return 0;
        }
        let mut changed = 0;
        for row in self.table_mut(EntityType::Notification).values_mut() {
            if targets(row) {
                row.set("entity_id", Value::String(new_id.to_string()));
                changed += 1;
            }
        }
        changed
    }

    // ------------------------------------------------------------------
    // Outbox
    // ------------------------------------------------------------------

    /// Enqueues a mutation for an existing entity row.
    ///
    /// Returns the existing live entry when the entity already has one, so
    /// there is never more than one outstanding record per entity instance.
    pub fn insert_outbox_entry(
        &mut self,
        entity_type: EntityType,
        entity_id: &str,
        actor_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<MutationRecord> {
        if self.get_row(entity_type, entity_id).is_none() {
            return Err(StoreError::RowNotFound {
                entity_type,
                id: entity_id.to_string(),
            });
        }

        if let Some(existing) = self.live_entry(entity_type, entity_id).map(|r| r.sync_id.clone()) {
            let revision = self.take_seq();
            let record = self.outbox_entry_mut(&existing)?;
            record.revision = revision;
            record.updated_at = now;
            return Ok(record.clone());
        }

        let seq = self.take_seq();
        let record = MutationRecord::new(entity_type, entity_id, actor_id, now, seq);
        self.outbox_mut().insert(record.sync_id.clone(), record.clone());
        Ok(record)
    }

    /// Gets an outbox entry by sync id.
    pub fn outbox_entry(&self, sync_id: &str) -> Option<&MutationRecord> {
        self.state.outbox.get(sync_id)
    }

    /// Gets the live (non-terminal) entry for an entity, if any.
    pub fn live_entry(&self, entity_type: EntityType, entity_id: &str) -> Option<&MutationRecord> {
        self.state
            .outbox
            .values()
            .filter(|r| r.is_live() && r.targets(entity_type, entity_id))
            .min_by_key(|r| r.seq)
    }

    /// Returns every outbox entry in push order.
    pub fn outbox_entries(&self) -> Vec<MutationRecord> {
        let mut records: Vec<_> = self.state.outbox.values().cloned().collect();
        records.sort_by_key(MutationRecord::push_order);
        records
    }

    /// Returns the actor's entries awaiting push, in push order.
    pub fn pending_outbox_entries(&self, actor_id: &str) -> Vec<MutationRecord> {
        self.entries_with_status(actor_id, OutboxStatus::Pending)
    }

    /// Returns the actor's entries awaiting conflict resolution.
    pub fn conflicted_entries(&self, actor_id: &str) -> Vec<MutationRecord> {
        self.entries_with_status(actor_id, OutboxStatus::Conflict)
    }

    fn entries_with_status(&self, actor_id: &str, status: OutboxStatus) -> Vec<MutationRecord> {
        let mut records: Vec<_> = self
            .state
            .outbox
            .values()
            .filter(|r| r.status == status && r.created_by == actor_id)
            .cloned()
            .collect();
        records.sort_by_key(MutationRecord::push_order);
        records
    }

    /// Counts outbox entries by status.
    pub fn outbox_counts(&self) -> OutboxCounts {
        let mut counts = OutboxCounts::default();
        for record in self.state.outbox.values() {
            match record.status {
                OutboxStatus::Pending => counts.pending += 1,
                OutboxStatus::Conflict => counts.conflict += 1,
                OutboxStatus::Success => counts.success += 1,
            }
        }
        counts
    }

    fn outbox_entry_mut(&mut self, sync_id: &str) -> StoreResult<&mut MutationRecord> {
        if !self.state.outbox.contains_key(sync_id) {
            return Err(StoreError::OutboxEntryNotFound(sync_id.to_string()));
        }
        self.outbox_mut()
            .get_mut(sync_id)
            .ok_or_else(|| StoreError::OutboxEntryNotFound(sync_id.to_string()))
    }

    /// Marks an entry as confirmed by the server.
    pub fn mark_outbox_success(&mut self, sync_id: &str, now: DateTime<Utc>) -> StoreResult<()> {
        let record = self.outbox_entry_mut(sync_id)?;
        record.status = OutboxStatus::Success;
        record.conflict_field = None;
        record.latest_data = None;
        record.allowed_strategies.clear();
        record.updated_at = now;
        Ok(())
    }

    /// Records a failed attempt; the entry stays pending.
    pub fn mark_outbox_failed(&mut self, sync_id: &str, now: DateTime<Utc>) -> StoreResult<u32> {
        let record = self.outbox_entry_mut(sync_id)?;
        record.retry_count = record.retry_count.saturating_add(1);
        record.last_attempt_at = Some(now);
        record.updated_at = now;
        Ok(record.retry_count)
    }

    /// Moves an entry into the conflict state.
    ///
    /// If another live entry for the same entity is already conflicted, that
    /// entry absorbs the new details and this one is removed, so an entity
    /// never has two unresolved conflicts.
    pub fn mark_outbox_conflict(
        &mut self,
        sync_id: &str,
        details: ConflictDetails,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let (entity_type, entity_id) = {
            let record = self
                .outbox_entry(sync_id)
                .ok_or_else(|| StoreError::OutboxEntryNotFound(sync_id.to_string()))?;
            (record.entity_type, record.entity_id.clone())
        };

        let sibling = self
            .state
            .outbox
            .values()
            .find(|r| r.sync_id != sync_id && r.is_conflicted() && r.targets(entity_type, &entity_id))
            .map(|r| r.sync_id.clone());

        let target = match sibling {
            Some(sibling) => {
                tracing::debug!(
                    duplicate = sync_id,
                    kept = %sibling,
                    "collapsing duplicate conflict entry"
                );
                self.outbox_mut().remove(sync_id);
                sibling
            }
            None => sync_id.to_string(),
        };

        let record = self.outbox_entry_mut(&target)?;
        record.status = OutboxStatus::Conflict;
        record.conflict_field = Some(details.conflict_field);
        record.latest_data = Some(details.latest_data);
        record.allowed_strategies = details.allowed_strategies;
        record.last_attempt_at = Some(now);
        record.updated_at = now;
        Ok(())
    }

    /// Rewrites `entity_id` on entries of `entity_type`.
    pub fn rewrite_outbox_entity_id(
        &mut self,
        entity_type: EntityType,
        old_id: &str,
        new_id: &str,
    ) -> usize {
        self.rewrite_outbox(|record| {
            if record.targets(entity_type, old_id) {
                record.entity_id = new_id.to_string();
                true
            } else {
                false
            }
        })
    }

    /// Rewrites `created_by` references to a remapped identity.
    pub fn rewrite_outbox_created_by(&mut self, old_id: &str, new_id: &str) -> usize {
        self.rewrite_outbox(|record| {
            if record.created_by == old_id {
                record.created_by = new_id.to_string();
                true
            } else {
                false
            }
        })
    }

    /// Replaces occurrences of `old_id` inside stored conflict snapshots of
    /// `entity_type` entries.
    pub fn rewrite_latest_data(&mut self, entity_type: EntityType, old_id: &str, new_id: &str) -> usize {
        if old_id.is_empty() {
            return 0;
        }
        self.rewrite_outbox(|record| {
            if record.entity_type != entity_type {
                return false;
            }
            match record.latest_data.as_mut() {
                Some(data) if data.contains(old_id) => {
                    *data = data.replace(old_id, new_id);
                    true
                }
                _ => false,
            }
        })
    }

    fn rewrite_outbox<F>(&mut self, mut f: F) -> usize
    where
        F: FnMut(&mut MutationRecord) -> bool,
    {
        let touches = self.state.outbox.values().any(|r| {
            let mut candidate = r.clone();
            f(&mut candidate)
        });
        if !touches {
            return 0;
        }
        self.outbox_mut()
            .values_mut()
            .map(|record| usize::from(f(record)))
            .sum()
    }

    /// Removes successful entries last touched before `cutoff`.
    pub fn purge_completed_outbox(&mut self, cutoff: DateTime<Utc>) -> usize {
        let doomed: Vec<String> = self
            .state
            .outbox
            .values()
            .filter(|r| r.status == OutboxStatus::Success && r.updated_at < cutoff)
            .map(|r| r.sync_id.clone())
            .collect();
        if doomed.is_empty() {
            return 0;
        }
        let outbox = self.outbox_mut();
        for sync_id in &doomed {
            outbox.remove(sync_id);
        }
        doomed.len()
    }

    // ------------------------------------------------------------------
    // Local edits
    // ------------------------------------------------------------------

    /// Inserts a locally created row (unsynced) and enqueues it.
    pub fn record_local_insert(
        &mut self,
        entity_type: EntityType,
        mut row: EntityRow,
        actor_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<MutationRecord> {
        let id = row_id(&row)?;
        let stamp = Value::String(now.to_rfc3339());
        if row.get(CREATED_AT_COLUMN).is_none() {
            row.set(CREATED_AT_COLUMN, stamp.clone());
        }
        row.set(UPDATED_AT_COLUMN, stamp);
        row.set_synced(false);
        row.set(SYNC_STATUS_COLUMN, Value::Null);
        self.insert_row(entity_type, row)?;
        self.insert_outbox_entry(entity_type, &id, actor_id, now)
    }

    /// Applies a local edit (unsynced) and enqueues it.
    pub fn record_local_update(
        &mut self,
        entity_type: EntityType,
        id: &str,
        fields: Map<String, Value>,
        actor_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<MutationRecord> {
        let patch = EntityRow::from_map(fields);
        self.update_row(entity_type, id, |row| {
            row.overwrite_from(&patch);
            row.set(UPDATED_AT_COLUMN, Value::String(now.to_rfc3339()));
            row.set_synced(false);
            row.set_status_message(None);
        })?;
        self.insert_outbox_entry(entity_type, id, actor_id, now)
    }

    /// Inserts a local conflict notification for `user_id`.
    ///
    /// An unread notification for the same entity is reused.
    pub fn insert_notification(
        &mut self,
        user_id: &str,
        entity_type: EntityType,
        entity_id: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<String> {
        let existing = self.rows(EntityType::Notification).find(|row| {
            row.get_str("type") == Some(CONFLICT_NOTIFICATION_TYPE)
                && row.get_str("user_id") == Some(user_id)
                && row.get_str("entity_type") == Some(entity_type.as_str())
                && row.get_str("entity_id") == Some(entity_id)
                && !row.get("is_read").is_some_and(is_truthy)
        });
        if let Some(id) = existing.and_then(EntityRow::id) {
            return Ok(id);
        }

        let id = uuid::Uuid::new_v4().to_string();
        let stamp = Value::String(now.to_rfc3339());
        let mut row = EntityRow::new();
        row.set_id(&id);
        row.set("user_id", Value::String(user_id.to_string()));
        row.set("type", Value::String(CONFLICT_NOTIFICATION_TYPE.to_string()));
        row.set("title", Value::String("Sync conflict".to_string()));
        row.set("message", Value::String(message.to_string()));
        row.set("entity_type", Value::String(entity_type.as_str().to_string()));
        row.set("entity_id", Value::String(entity_id.to_string()));
        row.set("is_read", Value::from(0));
        row.set(CREATED_AT_COLUMN, stamp.clone());
        row.set(UPDATED_AT_COLUMN, stamp);
        row.set_synced(true);
        self.insert_row(EntityType::Notification, row)?;
        Ok(id)
    }

    // ------------------------------------------------------------------
    // Session and metadata
    // ------------------------------------------------------------------

    /// Returns the active session.
    pub fn session(&self) -> Option<&Session> {
        self.state.session.as_ref()
    }

    /// Replaces the active session.
    pub fn set_session(&mut self, session: Option<Session>) {
        self.state_mut().session = session;
    }

    /// Gets a metadata value.
    pub fn meta(&self, key: &str) -> Option<&str> {
        self.state.meta.get(key).map(String::as_str)
    }

    /// Sets a metadata value.
    pub fn set_meta(&mut self, key: &str, value: impl Into<String>) {
        self.state_mut().meta.insert(key.to_string(), value.into());
    }
}

fn write_snapshot(path: &Path, state: &StoreState) -> StoreResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let bytes = serde_json::to_vec(state)?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn row_id(row: &EntityRow) -> StoreResult<String> {
    row.id()
        .ok_or_else(|| StoreError::InvalidRow("row has no id".into()))
}

fn field_matches(value: Option<&Value>, expected: &str) -> bool {
    match value {
        Some(Value::String(s)) => s == expected,
        Some(Value::Number(n)) => n.to_string() == expected,
        _ => false,
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64().is_some_and(|n| n != 0),
        _ => false,
    }
}

/// The device-local store.
///
/// # Example
///
/// ```rust
/// use chrono::Utc;
/// use fieldsync_core::{EntityRow, EntityType, Store};
/// use serde_json::json;
///
/// let store = Store::open_in_memory();
/// let row = EntityRow::from_value(json!({"id": "local-1", "name": "Gauze"})).unwrap();
/// let record = store
///     .record_local_insert(EntityType::Supply, row, "user-1", Utc::now())
///     .unwrap();
/// assert_eq!(record.entity_id, "local-1");
/// assert_eq!(store.pending_outbox_entries("user-1").len(), 1);
/// ```
pub struct Store {
    state: RwLock<StoreState>,
    path: Option<PathBuf>,
    journal: Option<Mutex<Journal>>,
}

impl Store {
    /// Opens an ephemeral in-memory store.
    pub fn open_in_memory() -> Self {
        Self {
            state: RwLock::new(StoreState::new()),
            path: None,
            journal: None,
        }
    }

    /// Opens a file-backed store, loading the snapshot if it exists and
    /// replaying the journal on top of it.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut state = if path.exists() {
            let bytes = fs::read(&path)?;
            let state: StoreState = serde_json::from_slice(&bytes)?;
            if state.version != SNAPSHOT_VERSION {
                return Err(StoreError::UnsupportedVersion {
                    found: state.version,
                    expected: SNAPSHOT_VERSION,
                });
            }
            tracing::debug!(path = %path.display(), outbox = state.outbox.len(), "loaded store snapshot");
            state
        } else {
            StoreState::new()
        };

        let mut journal = Journal::for_snapshot(&path);
        let entries: Vec<JournalEntry> = journal.read()?;
        if journal.path().exists() {
            let replayed = entries
                .into_iter()
                .map(|entry| usize::from(entry.apply(&mut state)))
                .sum::<usize>();
            tracing::debug!(path = %path.display(), replayed, "replayed store journal");
            // Start every session with an empty journal so a torn tail is
            // never followed by new entries.
            write_snapshot(&path, &state)?;
            journal.reset()?;
        }

        Ok(Self {
            state: RwLock::new(state),
            path: Some(path),
            journal: Some(Mutex::new(journal)),
        })
    }

    /// Returns the snapshot path for file-backed stores.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Runs `f` atomically.
    ///
    /// Writers are serialized. If `f` returns an error nothing it wrote is
    /// kept.
    pub fn transaction<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> StoreResult<T>,
    {
        let mut guard = self.state.write();
        let (result, changed) = {
            let mut txn = Transaction::new(&guard);
            let result = f(&mut txn)?;
            let Transaction { state, dirty } = txn;
            let changed = match state {
                Cow::Owned(state) => Some((state, dirty)),
                Cow::Borrowed(_) => None,
            };
            (result, changed)
        };
        if let Some((mut state, dirty)) = changed {
            state.commit += 1;
            self.persist(&state, &dirty)?;
            *guard = state;
        }
        Ok(result)
    }

    /// Runs a read-only closure against a consistent view.
    pub fn read<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&Transaction<'_>) -> T,
    {
        let guard = self.state.read();
        let txn = Transaction::new(&guard);
        f(&txn)
    }

    fn persist(&self, state: &StoreState, dirty: &Dirty) -> StoreResult<()> {
        let (Some(path), Some(journal)) = (&self.path, &self.journal) else {
            return Ok(());
        };
        let mut journal = journal.lock();
        if !path.exists() || journal.wants_checkpoint() {
            write_snapshot(path, state)?;
            if let Err(err) = journal.reset() {
                // Entries left behind are at or below the snapshot's commit
                // and are skipped on replay.
                tracing::warn!(path = %path.display(), error = %err, "failed to reset journal");
            }
            tracing::debug!(path = %path.display(), commit = state.commit, "store checkpoint");
            return Ok(());
        }
        journal.append(&JournalEntry::capture(state, dirty))
    }

    // ------------------------------------------------------------------
    // Single-operation conveniences
    // ------------------------------------------------------------------

    /// Enqueues a mutation for an existing entity row.
    pub fn insert_outbox_entry(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        actor_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<MutationRecord> {
        self.transaction(|txn| txn.insert_outbox_entry(entity_type, entity_id, actor_id, now))
    }

    /// Returns the actor's entries awaiting push, in push order.
    pub fn pending_outbox_entries(&self, actor_id: &str) -> Vec<MutationRecord> {
        self.read(|txn| txn.pending_outbox_entries(actor_id))
    }

    /// Returns the actor's entries awaiting conflict resolution.
    pub fn conflicted_entries(&self, actor_id: &str) -> Vec<MutationRecord> {
        self.read(|txn| txn.conflicted_entries(actor_id))
    }

    /// Returns every outbox entry in push order.
    pub fn outbox_entries(&self) -> Vec<MutationRecord> {
        self.read(|txn| txn.outbox_entries())
    }

    /// Gets an outbox entry by sync id.
    pub fn outbox_entry(&self, sync_id: &str) -> Option<MutationRecord> {
        self.read(|txn| txn.outbox_entry(sync_id).cloned())
    }

    /// Counts outbox entries by status.
    pub fn outbox_counts(&self) -> OutboxCounts {
        self.read(|txn| txn.outbox_counts())
    }

    /// Marks an entry as confirmed by the server.
    pub fn mark_outbox_success(&self, sync_id: &str, now: DateTime<Utc>) -> StoreResult<()> {
        self.transaction(|txn| txn.mark_outbox_success(sync_id, now))
    }

    /// Records a failed attempt.
    pub fn mark_outbox_failed(&self, sync_id: &str, now: DateTime<Utc>) -> StoreResult<u32> {
        self.transaction(|txn| txn.mark_outbox_failed(sync_id, now))
    }

    /// Moves an entry into the conflict state.
    pub fn mark_outbox_conflict(
        &self,
        sync_id: &str,
        details: ConflictDetails,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.transaction(|txn| txn.mark_outbox_conflict(sync_id, details, now))
    }

    /// Gets a row by id.
    pub fn get_entity_row(&self, entity_type: EntityType, id: &str) -> Option<EntityRow> {
        self.read(|txn| txn.get_row(entity_type, id).cloned())
    }

    /// Returns all rows of a table.
    pub fn rows(&self, entity_type: EntityType) -> Vec<EntityRow> {
        self.read(|txn| txn.rows(entity_type).cloned().collect())
    }

    /// Marks a row as synced.
    pub fn mark_entity_synced(&self, entity_type: EntityType, id: &str) -> StoreResult<()> {
        self.transaction(|txn| txn.mark_entity_synced(entity_type, id))
    }

    /// Inserts a locally created row and enqueues it.
    pub fn record_local_insert(
        &self,
        entity_type: EntityType,
        row: EntityRow,
        actor_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<MutationRecord> {
        self.transaction(|txn| txn.record_local_insert(entity_type, row, actor_id, now))
    }

    /// Applies a local edit and enqueues it.
    pub fn record_local_update(
        &self,
        entity_type: EntityType,
        id: &str,
        fields: Map<String, Value>,
        actor_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<MutationRecord> {
        self.transaction(|txn| txn.record_local_update(entity_type, id, fields, actor_id, now))
    }

    /// Returns the active session.
    pub fn session(&self) -> Option<Session> {
        self.read(|txn| txn.session().cloned())
    }

    /// Replaces the active session.
    pub fn set_session(&self, session: Option<Session>) -> StoreResult<()> {
        self.transaction(|txn| {
            txn.set_session(session);
            Ok(())
        })
    }

    /// Gets a metadata value.
    pub fn meta(&self, key: &str) -> Option<String> {
        self.read(|txn| txn.meta(key).map(str::to_string))
    }

    /// Removes successful entries last touched before `cutoff`.
    pub fn purge_completed_outbox(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        self.transaction(|txn| Ok(txn.purge_completed_outbox(cutoff)))
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.path)
            .field("outbox", &self.outbox_counts())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::ResolutionStrategy;
    use serde_json::json;
    use tempfile::tempdir;

    fn row(value: Value) -> EntityRow {
        EntityRow::from_value(value).unwrap()
    }

    fn supply(id: &str) -> EntityRow {
        row(json!({"id": id, "name": "Gauze", "location_id": "loc-1"}))
    }

    fn conflict(field: &str) -> ConflictDetails {
        ConflictDetails {
            conflict_field: field.into(),
            latest_data: json!({"id": "r1", "person_name": "Server"}).to_string(),
            allowed_strategies: vec![ResolutionStrategy::ServerWins],
        }
    }

    #[test]
    fn local_insert_writes_row_and_outbox_atomically() {
        let store = Store::open_in_memory();
        let now = Utc::now();
        let record = store
            .record_local_insert(EntityType::Supply, supply("local-1"), "u1", now)
            .unwrap();

        let stored = store.get_entity_row(EntityType::Supply, "local-1").unwrap();
        assert!(!stored.is_synced());
        assert!(stored.get("updated_at").is_some());
        assert_eq!(record.status, OutboxStatus::Pending);
        assert_eq!(store.pending_outbox_entries("u1").len(), 1);
        assert!(store.pending_outbox_entries("someone-else").is_empty());
    }

    #[test]
    fn duplicate_insert_rolls_back_everything() {
        let store = Store::open_in_memory();
        let now = Utc::now();
        store
            .record_local_insert(EntityType::Supply, supply("local-1"), "u1", now)
            .unwrap();

        let result = store.transaction(|txn| {
            txn.record_local_insert(EntityType::Supply, supply("local-2"), "u1", now)?;
            txn.record_local_insert(EntityType::Supply, supply("local-1"), "u1", now)
        });
        assert!(matches!(result, Err(StoreError::DuplicateRow { .. })));
        assert!(store.get_entity_row(EntityType::Supply, "local-2").is_none());
        assert_eq!(store.outbox_entries().len(), 1);
    }

    #[test]
    fn outbox_entry_requires_entity_row() {
        let store = Store::open_in_memory();
        let result = store.insert_outbox_entry(EntityType::Task, "ghost", "u1", Utc::now());
        assert!(matches!(result, Err(StoreError::RowNotFound { .. })));
        assert!(store.outbox_entries().is_empty());
    }

    #[test]
    fn repeated_edits_share_one_live_entry() {
        let store = Store::open_in_memory();
        let now = Utc::now();
        let first = store
            .record_local_insert(EntityType::Supply, supply("local-1"), "u1", now)
            .unwrap();
        let mut patch = Map::new();
        patch.insert("name".into(), json!("Gauze pads"));
        let second = store
            .record_local_update(EntityType::Supply, "local-1", patch, "u1", now)
            .unwrap();

        assert_eq!(first.sync_id, second.sync_id);
        assert_eq!(store.outbox_entries().len(), 1);
        // Same timestamp, but the revision still moves.
        assert_eq!(first.updated_at, second.updated_at);
        assert!(second.revision > first.revision);
        let stored = store.get_entity_row(EntityType::Supply, "local-1").unwrap();
        assert_eq!(stored.get_str("name"), Some("Gauze pads"));
    }

    #[test]
    fn edit_after_success_creates_new_entry() {
        let store = Store::open_in_memory();
        let now = Utc::now();
        let first = store
            .record_local_insert(EntityType::Supply, supply("s1"), "u1", now)
            .unwrap();
        store.mark_outbox_success(&first.sync_id, now).unwrap();
        store.mark_entity_synced(EntityType::Supply, "s1").unwrap();

        let second = store
            .record_local_update(EntityType::Supply, "s1", Map::new(), "u1", now)
            .unwrap();
        assert_ne!(first.sync_id, second.sync_id);
        assert!(!store.get_entity_row(EntityType::Supply, "s1").unwrap().is_synced());
    }

    #[test]
    fn failed_attempts_increment_retry_count() {
        let store = Store::open_in_memory();
        let now = Utc::now();
        let record = store
            .record_local_insert(EntityType::Supply, supply("s1"), "u1", now)
            .unwrap();
        assert_eq!(store.mark_outbox_failed(&record.sync_id, now).unwrap(), 1);
        assert_eq!(store.mark_outbox_failed(&record.sync_id, now).unwrap(), 2);
        let stored = store.outbox_entry(&record.sync_id).unwrap();
        assert_eq!(stored.status, OutboxStatus::Pending);
        assert_eq!(stored.last_attempt_at, Some(now));
    }

    #[test]
    fn conflict_excludes_entry_from_pending() {
        let store = Store::open_in_memory();
        let now = Utc::now();
        let record = store
            .record_local_insert(EntityType::Registration, row(json!({"id": "r1"})), "u1", now)
            .unwrap();
        store
            .mark_outbox_conflict(&record.sync_id, conflict("person_name"), now)
            .unwrap();

        assert!(store.pending_outbox_entries("u1").is_empty());
        let conflicted = store.conflicted_entries("u1");
        assert_eq!(conflicted.len(), 1);
        assert_eq!(conflicted[0].conflict_field.as_deref(), Some("person_name"));
        assert_eq!(
            conflicted[0].allowed_strategies,
            vec![ResolutionStrategy::ServerWins]
        );
    }

    #[test]
    fn duplicate_conflicts_collapse() {
        let store = Store::open_in_memory();
        let now = Utc::now();
        let first = store
            .record_local_insert(EntityType::Registration, row(json!({"id": "r1"})), "u1", now)
            .unwrap();
        store
            .mark_outbox_conflict(&first.sync_id, conflict("person_name"), now)
            .unwrap();

        // A second live entry for the same entity can only come from an
        // older snapshot; force one in to exercise the collapse path.
        let second_id = store
            .transaction(|txn| {
                let mut dup = MutationRecord::new(EntityType::Registration, "r1", "u1", now, 99);
                dup.sync_id = "dup".into();
                txn.outbox_mut().insert(dup.sync_id.clone(), dup);
                Ok("dup".to_string())
            })
            .unwrap();
        store
            .mark_outbox_conflict(&second_id, conflict("person_name"), now)
            .unwrap();

        assert_eq!(store.conflicted_entries("u1").len(), 1);
        assert!(store.outbox_entry("dup").is_none());
    }

    #[test]
    fn rename_and_reference_rewrite() {
        let store = Store::open_in_memory();
        store
            .transaction(|txn| {
                txn.insert_row(EntityType::Supply, supply("local-1"))?;
                txn.insert_row(
                    EntityType::Task,
                    row(json!({"id": "t1", "supply_id": "local-1"})),
                )?;
                txn.insert_row(
                    EntityType::Task,
                    row(json!({"id": "t2", "supply_id": "other"})),
                )?;
                assert!(txn.rename_row(EntityType::Supply, "local-1", "srv-9"));
                assert!(!txn.rename_row(EntityType::Supply, "local-1", "srv-9"));
                let fk = EntityType::Supply.referencing_columns()[0];
                assert_eq!(txn.replace_references(fk, "local-1", "srv-9"), 1);
                Ok(())
            })
            .unwrap();

        assert!(store.get_entity_row(EntityType::Supply, "local-1").is_none());
        let renamed = store.get_entity_row(EntityType::Supply, "srv-9").unwrap();
        assert_eq!(renamed.id().as_deref(), Some("srv-9"));
        let task = store.get_entity_row(EntityType::Task, "t1").unwrap();
        assert_eq!(task.get_str("supply_id"), Some("srv-9"));
    }

    #[test]
    fn latest_data_rewrite_is_scoped_to_entity_type() {
        let store = Store::open_in_memory();
        let now = Utc::now();
        let record = store
            .record_local_insert(EntityType::Registration, row(json!({"id": "r1"})), "u1", now)
            .unwrap();
        store
            .mark_outbox_conflict(
                &record.sync_id,
                ConflictDetails {
                    conflict_field: "person_name".into(),
                    latest_data: json!({"id": "r1", "registered_by": "local-u"}).to_string(),
                    allowed_strategies: vec![],
                },
                now,
            )
            .unwrap();

        let changed = store
            .transaction(|txn| {
                Ok((
                    txn.rewrite_latest_data(EntityType::Supply, "local-u", "srv-u"),
                    txn.rewrite_latest_data(EntityType::Registration, "local-u", "srv-u"),
                ))
            })
            .unwrap();
        assert_eq!(changed, (0, 1));
        let stored = store.outbox_entry(&record.sync_id).unwrap();
        assert!(stored.latest_data.unwrap().contains("srv-u"));
    }

    #[test]
    fn notifications_are_deduplicated_while_unread() {
        let store = Store::open_in_memory();
        let now = Utc::now();
        let (first, second) = store
            .transaction(|txn| {
                let a = txn.insert_notification("u1", EntityType::Task, "t1", "conflict", now)?;
                let b = txn.insert_notification("u1", EntityType::Task, "t1", "conflict", now)?;
                Ok((a, b))
            })
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(store.rows(EntityType::Notification).len(), 1);
        assert!(store.rows(EntityType::Notification)[0].is_synced());
    }

    #[test]
    fn read_only_transaction_does_not_persist() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");
        let store = Store::open(&path).unwrap();
        store.transaction(|txn| Ok(txn.outbox_counts())).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn snapshot_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("store.json");
        let now = Utc::now();
        {
            let store = Store::open(&path).unwrap();
            store
                .record_local_insert(EntityType::Supply, supply("local-1"), "u1", now)
                .unwrap();
            store
                .set_session(Some(Session::new("u1", now).with_email("a@b.org")))
                .unwrap();
        }

        let reopened = Store::open(&path).unwrap();
        assert_eq!(reopened.pending_outbox_entries("u1").len(), 1);
        assert_eq!(reopened.session().unwrap().email.as_deref(), Some("a@b.org"));
        assert!(reopened.get_entity_row(EntityType::Supply, "local-1").is_some());

        // Sequence numbers continue after reopen.
        let next = reopened
            .record_local_insert(EntityType::Supply, supply("local-2"), "u1", now)
            .unwrap();
        assert_eq!(next.seq, 2);
    }

    #[test]
    fn writes_share_untouched_collections() {
        let store = Store::open_in_memory();
        let now = Utc::now();
        store
            .transaction(|txn| {
                txn.insert_row(EntityType::Location, row(json!({"id": "l1"})))?;
                txn.insert_row(EntityType::Supply, supply("s1"))
            })
            .unwrap();
        let locations = Arc::clone(&store.state.read().tables["locations"]);
        let supplies = Arc::clone(&store.state.read().tables["supplies"]);

        store
            .record_local_insert(EntityType::Supply, supply("s2"), "u1", now)
            .unwrap();

        let state = store.state.read();
        assert!(Arc::ptr_eq(&locations, &state.tables["locations"]));
        assert!(!Arc::ptr_eq(&supplies, &state.tables["supplies"]));
        assert_eq!(supplies.len(), 1);
    }

    #[test]
    fn journal_records_only_changed_collections() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");
        let journal_path = path.with_extension("journal");
        let now = Utc::now();
        let store = Store::open(&path).unwrap();
        store
            .record_local_insert(EntityType::Supply, supply("s1"), "u1", now)
            .unwrap();
        // The first write creates the snapshot.
        assert!(path.exists());
        assert!(!journal_path.exists());

        store
            .record_local_insert(EntityType::Location, row(json!({"id": "l1"})), "u1", now)
            .unwrap();
        store.set_session(Some(Session::new("u1", now))).unwrap();

        let text = fs::read_to_string(&journal_path).unwrap();
        let lines: Vec<Value> = text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        let tables: Vec<&String> = lines[0]["tables"].as_object().unwrap().keys().collect();
        assert_eq!(tables, vec!["locations"]);
        assert!(lines[0]["outbox"].is_object());
        assert!(lines[1]["tables"].as_object().unwrap().is_empty());
        assert!(lines[1]["outbox"].is_null());
        drop(store);

        let reopened = Store::open(&path).unwrap();
        assert!(reopened.get_entity_row(EntityType::Location, "l1").is_some());
        assert!(reopened.get_entity_row(EntityType::Supply, "s1").is_some());
        assert_eq!(reopened.pending_outbox_entries("u1").len(), 2);
        assert_eq!(reopened.session().unwrap().user_id, "u1");
        // Reopening folds the journal into the snapshot.
        assert!(!journal_path.exists());
    }

    #[test]
    fn journal_entries_older_than_snapshot_are_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");
        let journal_path = path.with_extension("journal");
        let now = Utc::now();
        let rename = |store: &Store, name: &str| {
            let mut patch = Map::new();
            patch.insert("name".into(), json!(name));
            store
                .record_local_update(EntityType::Supply, "s1", patch, "u1", now)
                .unwrap();
        };

        let stale = {
            let store = Store::open(&path).unwrap();
            store
                .record_local_insert(EntityType::Supply, supply("s1"), "u1", now)
                .unwrap();
            rename(&store, "Bandage");
            fs::read_to_string(&journal_path).unwrap()
        };
        {
            let store = Store::open(&path).unwrap();
            rename(&store, "Splint");
        }
        drop(Store::open(&path).unwrap());

        // A journal left over from before the last checkpoint.
        fs::write(&journal_path, stale).unwrap();
        let reopened = Store::open(&path).unwrap();
        let stored = reopened.get_entity_row(EntityType::Supply, "s1").unwrap();
        assert_eq!(stored.get_str("name"), Some("Splint"));
    }

    #[test]
    fn journal_is_checkpointed_into_snapshot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");
        let journal_path = path.with_extension("journal");
        let store = Store::open(&path).unwrap();
        let set = |value: usize| {
            store
                .transaction(|txn| {
                    txn.set_meta(LAST_PULL_AT_KEY, value.to_string());
                    Ok(())
                })
                .unwrap();
        };

        set(0);
        for value in 1..=crate::journal::CHECKPOINT_INTERVAL {
            set(value);
        }
        assert!(journal_path.exists());
        set(usize::MAX);
        assert!(!journal_path.exists());

        let snapshot: Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(snapshot["meta"][LAST_PULL_AT_KEY], usize::MAX.to_string());
        drop(store);
        let reopened = Store::open(&path).unwrap();
        assert_eq!(reopened.meta(LAST_PULL_AT_KEY), Some(usize::MAX.to_string()));
    }

    #[test]
    fn purge_removes_only_old_successes() {
        let store = Store::open_in_memory();
        let now = Utc::now();
        let a = store
            .record_local_insert(EntityType::Supply, supply("a"), "u1", now)
            .unwrap();
        store
            .record_local_insert(EntityType::Supply, supply("b"), "u1", now)
            .unwrap();
        store.mark_outbox_success(&a.sync_id, now).unwrap();

        let purged = store
            .purge_completed_outbox(now + chrono::Duration::seconds(1))
            .unwrap();
        assert_eq!(purged, 1);
        assert_eq!(
            store.outbox_counts(),
            OutboxCounts {
                pending: 1,
                conflict: 0,
                success: 0
            }
        );
    }
}
