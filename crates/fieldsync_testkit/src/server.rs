//! An in-memory authoritative sync server.
//!
//! [`FakeServer`] honors the push/pull/resolve wire contract the way the
//! real backend does: ids with the local prefix are replaced by `srv-N`
//! ids, accepted rows become visible to pulls, and conflicts persist until
//! resolved. Failures and "already resolved" replies can be scripted.

use crate::fixtures::LOCAL_ID_PREFIX;
use async_trait::async_trait;
use fieldsync_core::{EntityType, ResolutionStrategy};
use fieldsync_engine::{PushHook, PushReply, SyncError, SyncResult, SyncTransport};
use fieldsync_protocol::{ConflictBody, PullBatch, PushAck, ResolveReply, ResolveRequest};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

type Key = (EntityType, String);

#[derive(Default)]
struct ServerState {
    tables: BTreeMap<EntityType, BTreeMap<String, Value>>,
    next_id: u64,
    offline: bool,
    failing_pushes: usize,
    failing_pulls: HashSet<EntityType>,
    conflicts: HashMap<Key, String>,
    already_resolved: HashSet<Key>,
    accepted: Vec<(EntityType, String, String)>,
}

/// Authoritative in-memory server.
#[derive(Default)]
pub struct FakeServer {
    state: Mutex<ServerState>,
    pushes: AtomicUsize,
    pulls: AtomicUsize,
    bulk_pulls: AtomicUsize,
    resolves: AtomicUsize,
    push_hook: Mutex<Option<PushHook>>,
}

impl FakeServer {
    /// Creates an empty server.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a row as if another device had synced it.
    pub fn seed(&self, entity_type: EntityType, row: Value) {
        let id = row
            .get("id")
            .and_then(Value::as_str)
            .expect("seeded rows need a string id")
            .to_string();
        self.state
            .lock()
            .tables
            .entry(entity_type)
            .or_default()
            .insert(id, row);
    }

    /// Returns the server's copy of a row.
    pub fn row(&self, entity_type: EntityType, id: &str) -> Option<Value> {
        self.state.lock().tables.get(&entity_type)?.get(id).cloned()
    }

    /// Returns every row of a collection in id order.
    pub fn rows(&self, entity_type: EntityType) -> Vec<Value> {
        self.state
            .lock()
            .tables
            .get(&entity_type)
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Makes every push of this entity answer 409 on `field` until resolved.
    pub fn conflict_on(&self, entity_type: EntityType, id: &str, field: &str) {
        self.state
            .lock()
            .conflicts
            .insert((entity_type, id.to_string()), field.to_string());
    }

    /// Makes the next resolve of this entity report it was resolved elsewhere.
    pub fn resolve_elsewhere(&self, entity_type: EntityType, id: &str) {
        self.state
            .lock()
            .already_resolved
            .insert((entity_type, id.to_string()));
    }

    /// Fails the next `count` pushes with a retryable transport error.
    pub fn fail_next_pushes(&self, count: usize) {
        self.state.lock().failing_pushes = count;
    }

    /// Fails every pull of `entity_type` with a 500.
    pub fn fail_pulls(&self, entity_type: EntityType) {
        self.state.lock().failing_pulls.insert(entity_type);
    }

    /// Runs `hook` once the next push has been stored, before its reply
    /// reaches the client.
    pub fn on_next_push(&self, hook: impl FnOnce() + Send + 'static) {
        *self.push_hook.lock() = Some(PushHook::new(hook));
    }

    /// Simulates connectivity loss or recovery.
    pub fn set_online(&self, online: bool) {
        self.state.lock().offline = !online;
    }

    /// Push requests received, including failed ones.
    pub fn push_count(&self) -> usize {
        self.pushes.load(Ordering::SeqCst)
    }

    /// Pull requests received, bulk requests included.
    pub fn pull_count(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    /// Bulk pull requests received.
    pub fn bulk_pull_count(&self) -> usize {
        self.bulk_pulls.load(Ordering::SeqCst)
    }

    /// Resolve requests received.
    pub fn resolve_count(&self) -> usize {
        self.resolves.load(Ordering::SeqCst)
    }

    /// Accepted pushes as `(entity_type, client_id, server_id)`.
    pub fn accepted(&self) -> Vec<(EntityType, String, String)> {
        self.state.lock().accepted.clone()
    }

    fn check_online(state: &ServerState) -> SyncResult<()> {
        if state.offline {
            Err(SyncError::NotConnected)
        } else {
            Ok(())
        }
    }

    fn load(state: &ServerState, entity_type: EntityType) -> SyncResult<Vec<Value>> {
        if state.failing_pulls.contains(&entity_type) {
            return Err(SyncError::ServerError {
                status: 500,
                message: format!("failed to load {}", entity_type.table()),
            });
        }
        Ok(state
            .tables
            .get(&entity_type)
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default())
    }

    fn store_push(&self, entity_type: EntityType, row: &Value) -> SyncResult<PushReply> {
        let mut state = self.state.lock();
        Self::check_online(&state)?;
        if state.failing_pushes > 0 {
            state.failing_pushes -= 1;
            return Err(SyncError::transport_retryable("connection reset by peer"));
        }

        let Some(fields) = row.as_object() else {
            return Ok(PushReply::Rejected {
                status: 400,
                message: "body must be a JSON object".into(),
            });
        };
        let Some(client_id) = fields.get("id").and_then(Value::as_str) else {
            return Ok(PushReply::Rejected {
                status: 422,
                message: "id is required".into(),
            });
        };
        let key = (entity_type, client_id.to_string());

        if let Some(field) = state.conflicts.get(&key).cloned() {
            let latest_data = state
                .tables
                .get(&entity_type)
                .and_then(|table| table.get(client_id))
                .cloned()
                .unwrap_or_else(|| row.clone());
            return Ok(PushReply::Conflict(ConflictBody {
                conflict_field: field,
                latest_data,
                allowed_strategies: ResolutionStrategy::ALL.to_vec(),
                message: Some("Conflict detected".into()),
            }));
        }

        let server_id = if client_id.starts_with(LOCAL_ID_PREFIX) {
            state.next_id += 1;
            format!("srv-{}", state.next_id)
        } else {
            client_id.to_string()
        };
        let mut stored = fields.clone();
        stored.insert("id".into(), Value::String(server_id.clone()));
        state
            .tables
            .entry(entity_type)
            .or_default()
            .insert(server_id.clone(), Value::Object(stored));
        state
            .accepted
            .push((entity_type, client_id.to_string(), server_id.clone()));

        Ok(PushReply::Accepted(PushAck::new(
            format!("{entity_type} saved successfully"),
            Some(server_id),
        )))
    }
}

#[async_trait]
impl SyncTransport for FakeServer {
    async fn push(&self, entity_type: EntityType, row: &Value) -> SyncResult<PushReply> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        let reply = self.store_push(entity_type, row);
        let hook = self.push_hook.lock().take();
        if let Some(hook) = hook {
            hook.run();
        }
        reply
    }

    async fn pull(&self, entity_type: EntityType, _actor_id: &str) -> SyncResult<Vec<Value>> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock();
        Self::check_online(&state)?;
        Self::load(&state, entity_type)
    }

    async fn pull_batch(
        &self,
        collections: &[EntityType],
        _actor_id: &str,
    ) -> SyncResult<PullBatch> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        self.bulk_pulls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock();
        Self::check_online(&state)?;
        let mut batch = PullBatch::new();
        for &entity_type in collections {
            batch.insert(entity_type, Self::load(&state, entity_type)?);
        }
        Ok(batch)
    }

    async fn resolve(&self, request: &ResolveRequest) -> SyncResult<ResolveReply> {
        self.resolves.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        Self::check_online(&state)?;
        let key = (request.entity_type, request.entity_id.clone());

        if state.already_resolved.remove(&key) || state.conflicts.remove(&key).is_none() {
            state.conflicts.remove(&key);
            return Ok(ResolveReply::AlreadyResolved {
                message: "conflict already resolved".into(),
            });
        }

        let table = state.tables.entry(request.entity_type).or_default();
        let current = table.get(&request.entity_id).cloned();
        let final_row = match (request.strategy, &request.payload) {
            (ResolutionStrategy::ServerWins, _) | (_, None) => current,
            (_, Some(Value::Object(payload))) => {
                let mut merged = match current {
                    Some(Value::Object(existing)) => existing,
                    _ => Map::new(),
                };
                merged.extend(payload.clone());
                merged.insert("id".into(), Value::String(request.entity_id.clone()));
                Some(Value::Object(merged))
            }
            (_, Some(_)) => current,
        };
        if let Some(row) = &final_row {
            table.insert(request.entity_id.clone(), row.clone());
        }
        Ok(ResolveReply::Resolved { data: final_row })
    }
}

impl std::fmt::Debug for FakeServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeServer")
            .field("pushes", &self.push_count())
            .field("pulls", &self.pull_count())
            .field("resolves", &self.resolve_count())
            .finish_non_exhaustive()
    }
}
