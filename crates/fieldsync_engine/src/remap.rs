//! Propagates server-issued ids through the local store.

use crate::error::SyncResult;
use fieldsync_core::{EntityType, Store, Transaction};
use parking_lot::RwLock;
use std::sync::Arc;

/// Notified after the active identity's id changes.
pub trait IdentityListener: Send + Sync {
    /// Called once the remap has been committed.
    fn identity_remapped(&self, old_id: &str, new_id: &str);
}

/// What a remap touched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemapSummary {
    /// Whether the owning row was found and renamed.
    pub row_renamed: bool,
    /// Foreign-key cells rewritten.
    pub references: usize,
    /// Outbox fields rewritten (entity ids, actors, snapshots).
    pub outbox_entries: usize,
    /// Whether the active session pointed at the old id.
    pub session_updated: bool,
}

/// Rewrites a client id to a server id everywhere it is referenced.
pub struct IdRemapper {
    store: Arc<Store>,
    listeners: RwLock<Vec<Arc<dyn IdentityListener>>>,
}

impl IdRemapper {
    /// Creates a remapper over `store`.
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Registers an identity listener.
    pub fn add_listener(&self, listener: Arc<dyn IdentityListener>) {
        self.listeners.write().push(listener);
    }

    /// Remaps `client_id` to `server_id` in one transaction.
    ///
    /// Returns false when no row of `entity_type` had `client_id`. The
    /// remaining steps still run, so references left behind by an earlier
    /// partial remap are repaired.
    pub fn remap(
        &self,
        entity_type: EntityType,
        client_id: &str,
        server_id: &str,
    ) -> SyncResult<bool> {
        let summary = self
            .store
            .transaction(|txn| Ok(Self::apply(txn, entity_type, client_id, server_id)))?;

        if summary.session_updated {
            self.notify_identity(client_id, server_id);
        }

        if summary.row_renamed {
            tracing::debug!(
                %entity_type,
                client_id,
                server_id,
                references = summary.references,
                outbox = summary.outbox_entries,
                "remapped id"
            );
        } else {
            tracing::warn!(%entity_type, client_id, server_id, "remap matched no row");
        }
        Ok(summary.row_renamed)
    }

    /// Applies a remap inside an open transaction.
    ///
    /// Every step is idempotent.
    pub fn apply(
        txn: &mut Transaction<'_>,
        entity_type: EntityType,
        client_id: &str,
        server_id: &str,
    ) -> RemapSummary {
        let mut summary = RemapSummary {
            row_renamed: txn.rename_row(entity_type, client_id, server_id),
            ..RemapSummary::default()
        };
        if client_id == server_id {
            return summary;
        }

        for fk in entity_type.referencing_columns() {
            summary.references += txn.replace_references(*fk, client_id, server_id);
        }
        summary.references += txn.retarget_notifications(entity_type, client_id, server_id);

        if entity_type.is_identity() {
            if let Some(mut session) = txn.session().cloned() {
                if session.user_id == client_id {
                    session.user_id = server_id.to_string();
                    txn.set_session(Some(session));
                    summary.session_updated = true;
                }
            }
            summary.outbox_entries += txn.rewrite_outbox_created_by(client_id, server_id);
        }

        summary.outbox_entries += txn.rewrite_outbox_entity_id(entity_type, client_id, server_id);
        summary.outbox_entries += txn.rewrite_latest_data(entity_type, client_id, server_id);
        summary
    }

    /// Tells listeners the active identity moved.
    pub fn notify_identity(&self, old_id: &str, new_id: &str) {
        tracing::info!(old_id, new_id, "active identity remapped");
        for listener in self.listeners.read().iter() {
            listener.identity_remapped(old_id, new_id);
        }
    }
}
