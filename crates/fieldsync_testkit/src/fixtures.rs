//! Test fixtures and store helpers.
//!
//! Provides stores with automatic cleanup and a fully wired engine
//! talking to a [`FakeServer`].

use crate::server::FakeServer;
use chrono::{DateTime, TimeZone, Utc};
use fieldsync_core::{EntityRow, EntityType, MutationRecord, Session, Store};
use fieldsync_engine::{Clock, ManualClock, RetryPolicy, SyncConfig, SyncEngine};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

/// Prefix of client-generated ids; the fake server replaces these.
pub const LOCAL_ID_PREFIX: &str = "local-";

/// Builds a client-generated id.
pub fn local_id(n: usize) -> String {
    format!("{LOCAL_ID_PREFIX}{n}")
}

/// Builds a row from a JSON object with an `id`.
pub fn row(value: Value) -> EntityRow {
    EntityRow::from_value(value).expect("fixture rows need an id")
}

/// A fixed instant for deterministic tests.
pub fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0)
        .single()
        .expect("valid fixture time")
}

/// A test store with automatic cleanup.
pub struct TestStore {
    /// The store instance.
    pub store: Arc<Store>,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: Option<TempDir>,
}

impl TestStore {
    /// Creates a new in-memory test store.
    pub fn memory() -> Self {
        Self {
            store: Arc::new(Store::open_in_memory()),
            _temp_dir: None,
        }
    }

    /// Creates a new file-backed test store.
    pub fn file() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let store = Store::open(temp_dir.path().join("fieldsync.json"))
            .expect("Failed to open file store");
        Self {
            store: Arc::new(store),
            _temp_dir: Some(temp_dir),
        }
    }

    /// Returns the snapshot path if file-backed.
    pub fn path(&self) -> Option<PathBuf> {
        self.store.path().map(PathBuf::from)
    }

    /// Opens a second store over the same snapshot file.
    pub fn reopen(&self) -> Store {
        let path = self.path().expect("reopen needs a file-backed store");
        Store::open(path).expect("Failed to reopen file store")
    }
}

impl std::ops::Deref for TestStore {
    type Target = Store;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}

/// Configuration used by [`TestRig`]: no backoff, all collections.
pub fn test_config() -> SyncConfig {
    SyncConfig::new("http://fake.invalid").with_retry(RetryPolicy::immediate())
}

/// A store, a fake server, a manual clock and an engine wired together
/// for one signed-in actor.
pub struct TestRig {
    /// Signed-in actor.
    pub actor: String,
    /// Local store.
    pub store: Arc<Store>,
    /// Authoritative server.
    pub server: Arc<FakeServer>,
    /// Engine clock.
    pub clock: Arc<ManualClock>,
    /// The engine under test.
    pub engine: SyncEngine,
}

impl TestRig {
    /// Creates a rig with [`test_config`].
    pub fn new(actor: &str) -> Self {
        Self::with_config(actor, test_config())
    }

    /// Creates a rig with a custom configuration.
    pub fn with_config(actor: &str, config: SyncConfig) -> Self {
        let store = Arc::new(Store::open_in_memory());
        let server = Arc::new(FakeServer::new());
        let clock = Arc::new(ManualClock::new(fixed_now()));
        store
            .set_session(Some(Session::new(actor, fixed_now())))
            .expect("Failed to set session");
        let engine = SyncEngine::builder(config, store.clone(), server.clone())
            .with_clock(clock.clone())
            .build();
        Self {
            actor: actor.to_string(),
            store,
            server,
            clock,
            engine,
        }
    }

    /// Records an offline insert by the signed-in actor.
    pub fn create(&self, entity_type: EntityType, value: Value) -> MutationRecord {
        self.store
            .record_local_insert(entity_type, row(value), &self.actor, self.clock.now())
            .expect("Failed to record local insert")
    }

    /// Records an offline edit by the signed-in actor.
    pub fn edit(&self, entity_type: EntityType, id: &str, fields: Value) -> MutationRecord {
        let Value::Object(fields) = fields else {
            panic!("edits must be JSON objects");
        };
        self.store
            .record_local_update(entity_type, id, fields, &self.actor, self.clock.now())
            .expect("Failed to record local update")
    }

    /// Moves the engine clock forward.
    pub fn advance(&self, by: chrono::Duration) {
        self.clock.advance(by);
    }

    /// Returns true when every row is synced and every outbox entry succeeded.
    pub fn is_converged(&self) -> bool {
        let rows_synced = EntityType::ALL
            .into_iter()
            .flat_map(|et| self.store.rows(et))
            .all(|row| row.is_synced());
        let counts = self.store.outbox_counts();
        rows_synced && counts.pending == 0 && counts.conflict == 0
    }
}
