//! Listing and resolving conflicted outbox entries.

use crate::clock::Clock;
use crate::error::{SyncError, SyncResult};
use crate::transport::SyncTransport;
use fieldsync_core::{EntityRow, EntityType, MutationRecord, ResolutionStrategy, Store};
use fieldsync_protocol::{ResolveReply, ResolveRequest};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// A conflicted mutation together with both sides of the disagreement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConflictItem {
    /// The conflicted outbox entry.
    pub record: MutationRecord,
    /// The local row, if it still exists.
    pub local: Option<EntityRow>,
    /// The server's snapshot, parsed.
    pub server: Option<Value>,
}

impl ConflictItem {
    /// Entity type of the conflicted row.
    pub fn entity_type(&self) -> EntityType {
        self.record.entity_type
    }

    /// Id of the conflicted row.
    pub fn entity_id(&self) -> &str {
        &self.record.entity_id
    }

    /// Field the server flagged.
    pub fn conflict_field(&self) -> Option<&str> {
        self.record.conflict_field.as_deref()
    }

    /// Strategies the server accepts.
    pub fn allowed_strategies(&self) -> &[ResolutionStrategy] {
        &self.record.allowed_strategies
    }
}

/// A user's choice for one conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolveConflict {
    /// Entity type of the conflicted row.
    pub entity_type: EntityType,
    /// Id of the conflicted row.
    pub entity_id: String,
    /// Chosen strategy.
    pub strategy: ResolutionStrategy,
    /// Edited row for `merge` and `update_data`.
    pub edited_payload: Option<Value>,
}

impl ResolveConflict {
    /// Creates a resolution without an edited payload.
    pub fn new(
        entity_type: EntityType,
        entity_id: impl Into<String>,
        strategy: ResolutionStrategy,
    ) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
            strategy,
            edited_payload: None,
        }
    }

    /// Attaches the edited payload.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.edited_payload = Some(payload);
        self
    }
}

/// What the caller should do after a resolve call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ResolveOutcome {
    /// The resolution was applied on both sides.
    Resolved,
    /// Another device resolved it first; reload instead of retrying.
    RefreshRequired {
        /// Server message.
        message: String,
    },
}

/// Conflict listing and resolution.
pub struct ConflictService {
    store: Arc<Store>,
    transport: Arc<dyn SyncTransport>,
    clock: Arc<dyn Clock>,
}

impl ConflictService {
    /// Creates a conflict service.
    pub fn new(store: Arc<Store>, transport: Arc<dyn SyncTransport>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            transport,
            clock,
        }
    }

    /// Lists every unresolved conflict owned by `actor_id`.
    pub fn list_conflicts(&self, actor_id: &str) -> Vec<ConflictItem> {
        self.store.read(|txn| {
            txn.conflicted_entries(actor_id)
                .into_iter()
                .map(|record| {
                    let local = txn.get_row(record.entity_type, &record.entity_id).cloned();
                    let server = record
                        .latest_data
                        .as_deref()
                        .and_then(|text| serde_json::from_str(text).ok());
                    ConflictItem {
                        record,
                        local,
                        server,
                    }
                })
                .collect()
        })
    }

    /// Number of unresolved conflicts owned by `actor_id`.
    pub fn conflict_count(&self, actor_id: &str) -> usize {
        self.store.conflicted_entries(actor_id).len()
    }

    /// Number of unresolved conflicts across every actor.
    pub fn total_conflict_count(&self) -> usize {
        self.store.outbox_counts().conflict
    }

    /// Sends the chosen resolution to the server and applies it locally.
    pub async fn resolve_conflict(
        &self,
        actor_id: &str,
        resolution: ResolveConflict,
    ) -> SyncResult<ResolveOutcome> {
        let ResolveConflict {
            entity_type,
            entity_id,
            strategy,
            edited_payload,
        } = resolution;

        let record = self
            .store
            .conflicted_entries(actor_id)
            .into_iter()
            .find(|record| record.targets(entity_type, &entity_id))
            .ok_or_else(|| SyncError::ConflictNotFound {
                entity_type,
                entity_id: entity_id.clone(),
            })?;

        if !record.allows(strategy) {
            return Err(SyncError::StrategyNotAllowed { strategy });
        }

        let payload = match strategy {
            ResolutionStrategy::ClientWins => self
                .store
                .get_entity_row(entity_type, &entity_id)
                .map(|row| row.to_wire()),
            ResolutionStrategy::ServerWins => None,
            ResolutionStrategy::Merge | ResolutionStrategy::UpdateData => {
                let Some(Value::Object(mut fields)) = edited_payload else {
                    return Err(SyncError::MissingPayload(strategy));
                };
                fields.insert("id".into(), Value::String(entity_id.clone()));
                Some(Value::Object(fields))
            }
        };

        let request = ResolveRequest {
            sync_id: record.sync_id.clone(),
            entity_type,
            entity_id: entity_id.clone(),
            strategy,
            payload,
        };
        let reply = self.transport.resolve(&request).await?;
        let now = self.clock.now();

        match reply {
            ResolveReply::Resolved { data } => {
                let final_row = match strategy {
                    ResolutionStrategy::ServerWins => data.or_else(|| {
                        record
                            .latest_data
                            .as_deref()
                            .and_then(|text| serde_json::from_str(text).ok())
                    }),
                    ResolutionStrategy::ClientWins => data,
                    ResolutionStrategy::Merge | ResolutionStrategy::UpdateData => {
                        data.or(request.payload)
                    }
                };
                self.store.transaction(|txn| {
                    if let Some(value) = final_row {
                        apply_final_row(txn, entity_type, &entity_id, value)?;
                    }
                    txn.mark_outbox_success(&record.sync_id, now)?;
                    if txn.get_row(entity_type, &entity_id).is_some() {
                        txn.mark_entity_synced(entity_type, &entity_id)?;
                    }
                    Ok(())
                })?;
                tracing::info!(%entity_type, entity_id = %entity_id, %strategy, "conflict resolved");
                Ok(ResolveOutcome::Resolved)
            }
            ResolveReply::AlreadyResolved { message } => {
                self.store.transaction(|txn| {
                    txn.mark_outbox_success(&record.sync_id, now)?;
                    // The local copy is stale until the next pull replaces it.
                    if txn.get_row(entity_type, &entity_id).is_some() {
                        txn.update_row(entity_type, &entity_id, EntityRow::mark_refresh_required)?;
                    }
                    Ok(())
                })?;
                tracing::warn!(%entity_type, entity_id = %entity_id, %message, "conflict already resolved elsewhere");
                Ok(ResolveOutcome::RefreshRequired { message })
            }
        }
    }
}

/// Writes the agreed row, creating it when the local copy is gone.
fn apply_final_row(
    txn: &mut fieldsync_core::Transaction<'_>,
    entity_type: EntityType,
    entity_id: &str,
    value: Value,
) -> fieldsync_core::StoreResult<()> {
    let Value::Object(mut fields) = value else {
        tracing::warn!(%entity_type, entity_id, "ignoring non-object resolved row");
        return Ok(());
    };
    fields.insert("id".into(), Value::String(entity_id.to_string()));
    let incoming = EntityRow::from_map(fields);
    match txn.get_row(entity_type, entity_id).cloned() {
        Some(mut local) => {
            local.overwrite_from(&incoming);
            txn.put_row(entity_type, local)?;
        }
        None => {
            txn.put_row(entity_type, incoming)?;
        }
    }
    Ok(())
}
