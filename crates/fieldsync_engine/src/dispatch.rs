//! Routes outbox entries to adapters and classifies the server's answer.

use crate::adapter::AdapterRegistry;
use crate::error::SyncError;
use crate::transport::{PushReply, SyncTransport};
use fieldsync_core::{ConflictDetails, EntityType, ResolutionStrategy, Store, StoreError};
use std::sync::Arc;

/// A server-issued id replacing a client-generated one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdRemap {
    /// Entity type of the remapped row.
    pub entity_type: EntityType,
    /// Id the row was created with on this device.
    pub client_id: String,
    /// Id assigned by the server.
    pub server_id: String,
}

/// Result of pushing one entity.
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    /// The server accepted the row.
    Success {
        /// Set when the server assigned a different id.
        remap: Option<IdRemap>,
    },
    /// The server rejected the row as conflicting.
    Conflict {
        /// Field the server flagged.
        conflict_field: String,
        /// Server snapshot as JSON text.
        latest_data: String,
        /// Strategies the server accepts.
        allowed_strategies: Vec<ResolutionStrategy>,
    },
    /// Anything else.
    Failure {
        /// What went wrong.
        cause: SyncError,
    },
}

impl DispatchOutcome {
    /// Conflict details to persist on the outbox entry, if any.
    pub fn conflict_details(&self) -> Option<ConflictDetails> {
        match self {
            DispatchOutcome::Conflict {
                conflict_field,
                latest_data,
                allowed_strategies,
            } => Some(ConflictDetails {
                conflict_field: conflict_field.clone(),
                latest_data: latest_data.clone(),
                allowed_strategies: allowed_strategies.clone(),
            }),
            _ => None,
        }
    }

    fn failure(cause: impl Into<SyncError>) -> Self {
        DispatchOutcome::Failure {
            cause: cause.into(),
        }
    }
}

/// Pushes single entities through their adapters.
pub struct SyncDispatcher {
    store: Arc<Store>,
    transport: Arc<dyn SyncTransport>,
    registry: AdapterRegistry,
}

impl SyncDispatcher {
    /// Creates a dispatcher.
    pub fn new(
        store: Arc<Store>,
        transport: Arc<dyn SyncTransport>,
        registry: AdapterRegistry,
    ) -> Self {
        Self {
            store,
            transport,
            registry,
        }
    }

    /// Returns the adapter registry.
    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    /// Pushes the current state of one entity row.
    pub async fn dispatch(&self, entity_type: EntityType, entity_id: &str) -> DispatchOutcome {
        let Some(adapter) = self.registry.get(entity_type) else {
            tracing::error!(%entity_type, entity_id, "no adapter registered");
            return DispatchOutcome::failure(SyncError::UnknownEntityType(
                entity_type.as_str().to_string(),
            ));
        };

        let Some(row) = adapter.fetch(&self.store, entity_id) else {
            return DispatchOutcome::failure(StoreError::RowNotFound {
                entity_type,
                id: entity_id.to_string(),
            });
        };

        let payload = adapter.serialize(&row);
        let reply = match adapter.push(self.transport.as_ref(), &payload).await {
            Ok(reply) => reply,
            Err(cause) => return DispatchOutcome::Failure { cause },
        };

        match reply {
            PushReply::Accepted(ack) if ack.is_success() => {
                let remap = ack.remap_for(entity_id).map(|server_id| IdRemap {
                    entity_type,
                    client_id: entity_id.to_string(),
                    server_id: server_id.to_string(),
                });
                tracing::debug!(%entity_type, entity_id, remap = remap.is_some(), "push accepted");
                DispatchOutcome::Success { remap }
            }
            PushReply::Accepted(ack) => DispatchOutcome::failure(SyncError::Protocol(format!(
                "push not acknowledged: {}",
                ack.message
            ))),
            PushReply::Conflict(body) => {
                tracing::debug!(%entity_type, entity_id, field = %body.conflict_field, "push conflict");
                DispatchOutcome::Conflict {
                    latest_data: body.latest_data_text(),
                    conflict_field: body.conflict_field,
                    allowed_strategies: body.allowed_strategies,
                }
            }
            PushReply::Rejected { status, message } => {
                DispatchOutcome::failure(SyncError::ServerError { status, message })
            }
        }
    }
}
