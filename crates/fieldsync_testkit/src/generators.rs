//! Property-based test generators using proptest.
//!
//! Generates offline work sessions: sequences of creates and edits over
//! locations, supplies and tasks whose foreign keys point at rows created
//! earlier in the same session.

use crate::fixtures::{local_id, row};
use chrono::{DateTime, Utc};
use fieldsync_core::{EntityType, Store, StoreResult};
use proptest::prelude::*;
use serde_json::{json, Map, Value};

/// One offline user action.
#[derive(Debug, Clone, PartialEq)]
pub enum OfflineMutation {
    /// Create a location.
    CreateLocation {
        /// Location name.
        name: String,
    },
    /// Create a supply, optionally at an earlier location (by index).
    CreateSupply {
        /// Supply name.
        name: String,
        /// Index into the locations created so far.
        location: Option<usize>,
    },
    /// Create a task against an earlier supply (by index).
    CreateTask {
        /// Task title.
        title: String,
        /// Index into the supplies created so far.
        supply: usize,
    },
    /// Change the quantity of an earlier supply (by index).
    EditSupply {
        /// Index into the supplies created so far.
        supply: usize,
        /// New quantity.
        quantity: u32,
    },
}

/// Strategy for generating short human-readable labels.
pub fn label_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[A-Z][a-z]{2,8}( [a-z]{2,6})?").expect("Invalid regex")
}

/// Strategy for generating one offline mutation.
pub fn offline_mutation_strategy() -> impl Strategy<Value = OfflineMutation> {
    prop_oneof![
        label_strategy().prop_map(|name| OfflineMutation::CreateLocation { name }),
        (label_strategy(), prop::option::of(0usize..8))
            .prop_map(|(name, location)| OfflineMutation::CreateSupply { name, location }),
        (label_strategy(), 0usize..8)
            .prop_map(|(title, supply)| OfflineMutation::CreateTask { title, supply }),
        (0usize..8, 0u32..500)
            .prop_map(|(supply, quantity)| OfflineMutation::EditSupply { supply, quantity }),
    ]
}

/// Strategy for generating an offline session of 1 to `max` mutations.
pub fn offline_session_strategy(max: usize) -> impl Strategy<Value = Vec<OfflineMutation>> {
    prop::collection::vec(offline_mutation_strategy(), 1..=max.max(1))
}

/// What applying a session created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppliedSession {
    /// Rows created, as `(entity_type, client id)`.
    pub created: Vec<(EntityType, String)>,
    /// Edits applied.
    pub edits: usize,
}

impl AppliedSession {
    /// Client ids created for `entity_type`.
    pub fn ids(&self, entity_type: EntityType) -> Vec<&str> {
        self.created
            .iter()
            .filter(|(et, _)| *et == entity_type)
            .map(|(_, id)| id.as_str())
            .collect()
    }
}

/// Records `mutations` as offline work by `actor_id`.
///
/// Index references wrap around the rows created so far; a reference with
/// nothing to point at drops the foreign key (creates) or the mutation
/// (edits and tasks).
pub fn apply_offline_session(
    store: &Store,
    actor_id: &str,
    mutations: &[OfflineMutation],
    now: DateTime<Utc>,
) -> StoreResult<AppliedSession> {
    let mut applied = AppliedSession::default();
    let mut next = 1;
    let mut locations: Vec<String> = Vec::new();
    let mut supplies: Vec<String> = Vec::new();

    for mutation in mutations {
        match mutation {
            OfflineMutation::CreateLocation { name } => {
                let id = local_id(next);
                next += 1;
                store.record_local_insert(
                    EntityType::Location,
                    row(json!({"id": id, "name": name, "created_by": actor_id})),
                    actor_id,
                    now,
                )?;
                locations.push(id.clone());
                applied.created.push((EntityType::Location, id));
            }
            OfflineMutation::CreateSupply { name, location } => {
                let id = local_id(next);
                next += 1;
                let location_id = location
                    .filter(|_| !locations.is_empty())
                    .map(|i| Value::String(locations[i % locations.len()].clone()))
                    .unwrap_or(Value::Null);
                store.record_local_insert(
                    EntityType::Supply,
                    row(json!({
                        "id": id,
                        "name": name,
                        "quantity": 0,
                        "location_id": location_id,
                        "created_by": actor_id,
                    })),
                    actor_id,
                    now,
                )?;
                supplies.push(id.clone());
                applied.created.push((EntityType::Supply, id));
            }
            OfflineMutation::CreateTask { title, supply } => {
                if supplies.is_empty() {
                    continue;
                }
                let id = local_id(next);
                next += 1;
                store.record_local_insert(
                    EntityType::Task,
                    row(json!({
                        "id": id,
                        "title": title,
                        "supply_id": supplies[supply % supplies.len()],
                        "created_by": actor_id,
                    })),
                    actor_id,
                    now,
                )?;
                applied.created.push((EntityType::Task, id));
            }
            OfflineMutation::EditSupply { supply, quantity } => {
                if supplies.is_empty() {
                    continue;
                }
                let id = &supplies[supply % supplies.len()];
                let mut fields = Map::new();
                fields.insert("quantity".into(), json!(quantity));
                store.record_local_update(EntityType::Supply, id, fields, actor_id, now)?;
                applied.edits += 1;
            }
        }
    }
    Ok(applied)
}
