//! # Fieldsync Protocol
//!
//! Wire contract between devices and the Fieldsync server.
//!
//! This crate provides:
//! - `PushAck` and `ConflictBody` for push responses
//! - `PullBatch` for authoritative pull snapshots
//! - `ResolveRequest` / `ResolveReply` for conflict resolution
//! - `Endpoint` path helpers
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(not(test), warn(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

mod endpoint;
mod error;
mod messages;

pub use endpoint::{Endpoint, CONFLICT_STATUS, GONE_STATUS};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{ConflictBody, PullBatch, PushAck, ResolveReply, ResolveRequest, SUCCESS_MARKER};
