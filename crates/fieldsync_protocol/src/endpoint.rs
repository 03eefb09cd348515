//! Server endpoint paths.

use fieldsync_core::EntityType;

/// HTTP status the server uses for push and resolve conflicts.
pub const CONFLICT_STATUS: u16 = 409;

/// HTTP status used for "already resolved elsewhere".
pub const GONE_STATUS: u16 = 410;

/// A server endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// Push one entity row.
    Push(EntityType),
    /// Bulk pull of every collection.
    PullAll,
    /// Pull one collection.
    Pull(EntityType),
    /// Submit a conflict resolution.
    Resolve,
}

impl Endpoint {
    /// Returns the path relative to the server root.
    pub fn path(&self) -> String {
        match self {
            Endpoint::Push(entity_type) => format!("/api/sync/{}", entity_type.table()),
            Endpoint::PullAll => "/api/sync/pull".to_string(),
            Endpoint::Pull(entity_type) => format!("/api/sync/pull/{}", entity_type.table()),
            Endpoint::Resolve => "/api/sync/resolve".to_string(),
        }
    }

    /// Joins the path onto `base`, tolerating a trailing slash.
    pub fn url(&self, base: &str) -> String {
        format!("{}{}", base.trim_end_matches('/'), self.path())
    }
}
