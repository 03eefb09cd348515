//! # Fieldsync Engine
//!
//! Offline-first reconciliation engine for Fieldsync.
//!
//! This crate provides:
//! - Outbox push in dependency order (queue processor)
//! - Per-entity adapters and the push dispatcher
//! - Server id remapping across rows, foreign keys, session and outbox
//! - Pull sync with smart merge and duplicate detection
//! - The sync orchestrator state machine
//! - Conflict listing and resolution
//! - HTTP and mock transports
//!
//! ## Architecture
//!
//! The engine implements a **push-then-pull** model:
//! 1. Push local mutations in entity dependency order
//! 2. Stop if the server reported conflicts
//! 3. Pull server collections and merge them
//!
//! ## Key Invariants
//!
//! - A remap runs before its mutation is marked successful
//! - Unresolved conflicts halt both push and pull
//! - Unsynced local rows are never overwritten by a pull
//! - Each pulled collection is merged atomically
//! - No mutation is dropped: it ends successful or stays queryable

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(not(test), warn(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

mod adapter;
mod clock;
mod config;
mod conflicts;
mod dispatch;
mod error;
mod flight;
mod http;
mod merge;
mod pull;
mod queue;
mod remap;
mod state;
mod transport;

pub use adapter::{AdapterRegistry, EntityAdapter, TableAdapter};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{RetryPolicy, SyncConfig, DEFAULT_FUZZY_MATCH_THRESHOLD, DEFAULT_PULL_COLLECTIONS};
pub use conflicts::{ConflictItem, ConflictService, ResolveConflict, ResolveOutcome};
pub use dispatch::{DispatchOutcome, IdRemap, SyncDispatcher};
pub use error::{SyncError, SyncResult};
pub use http::HttpTransport;
pub use merge::{
    MergeContext, MergeDecision, MergeOutcome, MergeTally, NormalizedLevenshtein, Similarity,
    SmartMergeResolver,
};
pub use pull::{CollectionError, CollectionReport, PullReport, PullSyncManager};
pub use queue::{QueueProcessor, QueueReport};
pub use remap::{IdRemapper, IdentityListener, RemapSummary};
pub use state::{RunOutcome, SyncEngine, SyncEngineBuilder, SyncRunReport, SyncState, SyncStats};
pub use transport::{MockTransport, PushHook, PushReply, SyncTransport};
