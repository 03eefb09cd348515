//! # Fieldsync Core
//!
//! Device-local storage for Fieldsync.
//!
//! This crate provides:
//! - The entity catalogue (tables, push order, foreign-key graph)
//! - Schemaless entity rows with sync bookkeeping
//! - The durable outbox of pending mutations
//! - A transactional store, persisted as a JSON snapshot plus a commit journal
//!
//! ## Key Invariants
//!
//! - An outbox entry always refers to an existing entity row
//! - Each entity has at most one live outbox entry
//! - A transaction commits all of its writes or none of them

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(not(test), warn(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

mod entity;
mod error;
mod journal;
mod outbox;
mod store;

pub use entity::{
    parse_timestamp, EntityRow, EntityType, ForeignKey, BOOKKEEPING_COLUMNS, CREATED_AT_COLUMN,
    ID_COLUMN, LOCAL_ONLY_COLUMNS, REFRESH_REQUIRED_STATUS, SYNCED_COLUMN, SYNC_STATUS_COLUMN,
    UPDATED_AT_COLUMN,
};
pub use error::{StoreError, StoreResult};
pub use outbox::{ConflictDetails, MutationRecord, OutboxStatus, ResolutionStrategy};
pub use store::{
    OutboxCounts, Session, Store, Transaction, CONFLICT_NOTIFICATION_TYPE, LAST_PULL_AT_KEY,
    SNAPSHOT_VERSION,
};
