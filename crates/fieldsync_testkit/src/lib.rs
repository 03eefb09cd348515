//! # Fieldsync Testkit
//!
//! Test utilities for Fieldsync.
//!
//! This crate provides:
//! - An in-memory authoritative server implementing the sync transport
//! - Store fixtures and a ready-wired engine rig
//! - Property-based generators of offline mutation sessions
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fieldsync_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn pushes_offline_work() {
//!     let rig = TestRig::new("user-1");
//!     rig.create(EntityType::Supply, json!({"id": "local-1", "name": "Gauze"}));
//!     let report = rig.engine.run_sync("user-1").await.unwrap();
//!     assert!(report.is_fully_successful());
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod server;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::server::*;
}

pub use fixtures::*;
pub use generators::*;
pub use server::*;
