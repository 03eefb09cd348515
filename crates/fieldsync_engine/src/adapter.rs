//! Per-entity-type push adapters.

use crate::error::SyncResult;
use crate::transport::{PushReply, SyncTransport};
use async_trait::async_trait;
use fieldsync_core::{EntityRow, EntityType, Store};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Knows how to load, serialize and push one entity type.
#[async_trait]
pub trait EntityAdapter: Send + Sync {
    /// The entity type handled.
    fn entity_type(&self) -> EntityType;

    /// Loads the row to push.
    fn fetch(&self, store: &Store, entity_id: &str) -> Option<EntityRow> {
        store.get_entity_row(self.entity_type(), entity_id)
    }

    /// Builds the request body.
    fn serialize(&self, row: &EntityRow) -> Value {
        row.to_wire()
    }

    /// Sends the body to the matching push endpoint.
    async fn push(&self, transport: &dyn SyncTransport, payload: &Value) -> SyncResult<PushReply> {
        transport.push(self.entity_type(), payload).await
    }
}

/// Adapter for a plain table whose rows are pushed as-is.
#[derive(Debug, Clone, Copy)]
pub struct TableAdapter {
    entity_type: EntityType,
}

impl TableAdapter {
    /// Creates an adapter for `entity_type`.
    pub fn new(entity_type: EntityType) -> Self {
        Self { entity_type }
    }
}

#[async_trait]
impl EntityAdapter for TableAdapter {
    fn entity_type(&self) -> EntityType {
        self.entity_type
    }
}

/// Registry mapping entity types to adapters.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: BTreeMap<EntityType, Arc<dyn EntityAdapter>>,
}

impl AdapterRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with a [`TableAdapter`] for every pushable entity type.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        for entity_type in EntityType::ALL {
            if entity_type.push_priority().is_some() {
                registry.register(Arc::new(TableAdapter::new(entity_type)));
            }
        }
        registry
    }

    /// Registers (or replaces) an adapter.
    pub fn register(&mut self, adapter: Arc<dyn EntityAdapter>) {
        self.adapters.insert(adapter.entity_type(), adapter);
    }

    /// Looks up the adapter for `entity_type`.
    pub fn get(&self, entity_type: EntityType) -> Option<Arc<dyn EntityAdapter>> {
        self.adapters.get(&entity_type).cloned()
    }

    /// Entity types with an adapter.
    pub fn entity_types(&self) -> impl Iterator<Item = EntityType> + '_ {
        self.adapters.keys().copied()
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.adapters.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_registry_covers_pushable_types() {
        let registry = AdapterRegistry::standard();
        let types: Vec<_> = registry.entity_types().collect();
        assert_eq!(types.len(), 7);
        assert!(registry.get(EntityType::Notification).is_none());
        assert!(registry.get(EntityType::TaskAssignment).is_some());
    }

    #[test]
    fn default_serialization_strips_local_columns() {
        let adapter = TableAdapter::new(EntityType::Supply);
        let mut row = EntityRow::new();
        row.set_id("s1");
        row.set_synced(false);
        let body = adapter.serialize(&row);
        assert!(body.get("synced").is_none());
        assert_eq!(body["id"], "s1");
    }
}
