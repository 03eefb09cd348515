//! Durable outbox model.

use crate::entity::EntityType;
use crate::error::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of an outbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Waiting to be pushed (or retried).
    Pending,
    /// Rejected by the server; waiting for a human decision.
    Conflict,
    /// Confirmed by the server. Terminal.
    Success,
}

impl OutboxStatus {
    /// Returns true for terminal states.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxStatus::Success)
    }

    /// Returns the storage name.
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Conflict => "conflict",
            OutboxStatus::Success => "success",
        }
    }
}

/// Strategy chosen by a human to settle a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Keep the local version and overwrite the server.
    ClientWins,
    /// Accept the server's latest data.
    ServerWins,
    /// Combine both versions into an edited payload.
    Merge,
    /// Replace the record with an edited payload.
    UpdateData,
}

impl ResolutionStrategy {
    /// All strategies.
    pub const ALL: [ResolutionStrategy; 4] = [
        ResolutionStrategy::ClientWins,
        ResolutionStrategy::ServerWins,
        ResolutionStrategy::Merge,
        ResolutionStrategy::UpdateData,
    ];

    /// Returns the wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategy::ClientWins => "client_wins",
            ResolutionStrategy::ServerWins => "server_wins",
            ResolutionStrategy::Merge => "merge",
            ResolutionStrategy::UpdateData => "update_data",
        }
    }

    /// Returns true when the strategy carries a user-edited payload.
    pub fn requires_payload(&self) -> bool {
        matches!(
            self,
            ResolutionStrategy::Merge | ResolutionStrategy::UpdateData
        )
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolutionStrategy {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == s.trim())
            .ok_or_else(|| StoreError::UnknownStrategy(s.to_string()))
    }
}

/// Conflict details recorded on an outbox entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictDetails {
    /// Field the server flagged.
    pub conflict_field: String,
    /// Server snapshot of the entity, as JSON text.
    pub latest_data: String,
    /// Strategies the server accepts for this conflict.
    pub allowed_strategies: Vec<ResolutionStrategy>,
}

/// A durable outbox row describing one outstanding local mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRecord {
    /// Unique outbox id.
    pub sync_id: String,
    /// Type of the mutated entity.
    pub entity_type: EntityType,
    /// Id of the mutated entity row.
    pub entity_id: String,
    /// Lifecycle status.
    pub status: OutboxStatus,
    /// Number of failed push attempts.
    pub retry_count: u32,
    /// Time of the last failed attempt.
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Actor (identity id) that made the change.
    pub created_by: String,
    /// Field flagged by the server on conflict.
    pub conflict_field: Option<String>,
    /// Server snapshot JSON captured on conflict.
    pub latest_data: Option<String>,
    /// Strategies the server accepts for the conflict.
    #[serde(default)]
    pub allowed_strategies: Vec<ResolutionStrategy>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
    /// Insertion sequence, used as a stable tiebreaker.
    pub seq: u64,
    /// Changes whenever the entity is edited again while this entry is live.
    #[serde(default)]
    pub revision: u64,
}

impl MutationRecord {
    /// Creates a new pending record.
    pub fn new(
        entity_type: EntityType,
        entity_id: impl Into<String>,
        created_by: impl Into<String>,
        now: DateTime<Utc>,
        seq: u64,
    ) -> Self {
        Self {
            sync_id: uuid::Uuid::new_v4().to_string(),
            entity_type,
            entity_id: entity_id.into(),
            status: OutboxStatus::Pending,
            retry_count: 0,
            last_attempt_at: None,
            created_by: created_by.into(),
            conflict_field: None,
            latest_data: None,
            allowed_strategies: Vec::new(),
            created_at: now,
            updated_at: now,
            seq,
            revision: seq,
        }
    }

    /// Returns true while the mutation is still outstanding.
    pub fn is_live(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Returns true while the record waits for conflict resolution.
    pub fn is_conflicted(&self) -> bool {
        self.status == OutboxStatus::Conflict
    }

    /// Returns true when the record refers to the given entity.
    pub fn targets(&self, entity_type: EntityType, entity_id: &str) -> bool {
        self.entity_type == entity_type && self.entity_id == entity_id
    }

    /// Returns true when `strategy` may be used to resolve this record.
    ///
    /// An empty allow-list means the server did not restrict strategies.
    pub fn allows(&self, strategy: ResolutionStrategy) -> bool {
        self.allowed_strategies.is_empty() || self.allowed_strategies.contains(&strategy)
    }

    /// Sort key used by the queue processor.
    pub fn push_order(&self) -> (u8, u64) {
        (self.entity_type.push_priority().unwrap_or(u8::MAX), self.seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(entity_type: EntityType, seq: u64) -> MutationRecord {
        MutationRecord::new(entity_type, "e1", "u1", Utc::now(), seq)
    }

    #[test]
    fn new_record_is_pending() {
        let r = record(EntityType::Supply, 1);
        assert_eq!(r.status, OutboxStatus::Pending);
        assert!(r.is_live());
        assert!(!r.is_conflicted());
        assert_eq!(r.retry_count, 0);
        assert!(r.targets(EntityType::Supply, "e1"));
        assert!(!r.targets(EntityType::Task, "e1"));
    }

    #[test]
    fn strategy_parse_and_display() {
        for strategy in ResolutionStrategy::ALL {
            assert_eq!(
                strategy.as_str().parse::<ResolutionStrategy>().unwrap(),
                strategy
            );
        }
        assert!("coin_flip".parse::<ResolutionStrategy>().is_err());
        assert!(ResolutionStrategy::Merge.requires_payload());
        assert!(!ResolutionStrategy::ServerWins.requires_payload());
    }

    #[test]
    fn empty_allow_list_allows_everything() {
        let mut r = record(EntityType::Task, 1);
        assert!(r.allows(ResolutionStrategy::ClientWins));
        r.allowed_strategies = vec![ResolutionStrategy::ServerWins];
        assert!(!r.allows(ResolutionStrategy::ClientWins));
        assert!(r.allows(ResolutionStrategy::ServerWins));
    }

    #[test]
    fn push_order_uses_priority_then_sequence() {
        let alert = record(EntityType::Alert, 1);
        let user = record(EntityType::User, 5);
        let user_later = record(EntityType::User, 9);
        let mut records = vec![alert.clone(), user_later.clone(), user.clone()];
        records.sort_by_key(MutationRecord::push_order);
        assert_eq!(records[0].seq, 5);
        assert_eq!(records[1].seq, 9);
        assert_eq!(records[2].entity_type, EntityType::Alert);
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&OutboxStatus::Conflict).unwrap();
        assert_eq!(json, "\"conflict\"");
        assert!(OutboxStatus::Success.is_terminal());
    }
}
