//! Entity catalogue and generic entity rows.
//!
//! Every domain table shares the columns `id`, `synced`,
//! `sync_status_message` and `updated_at`; everything else is opaque JSON
//! to the reconciliation core. The static schema knowledge the core needs
//! (push priority, foreign keys, natural keys) lives on [`EntityType`].

use crate::error::{StoreError, StoreResult};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Column holding the primary key.
pub const ID_COLUMN: &str = "id";
/// Column holding the 0/1 synced flag.
pub const SYNCED_COLUMN: &str = "synced";
/// Column holding the last sync error shown to the user.
pub const SYNC_STATUS_COLUMN: &str = "sync_status_message";
/// Column holding the last modification time.
pub const UPDATED_AT_COLUMN: &str = "updated_at";
/// Column holding the creation time.
pub const CREATED_AT_COLUMN: &str = "created_at";

/// Status of a row whose conflict was settled on another device. The next
/// pull replaces such a row with the server copy.
pub const REFRESH_REQUIRED_STATUS: &str = "Resolved on another device; refresh required";

/// Columns that never participate in field-level comparison.
pub const BOOKKEEPING_COLUMNS: [&str; 4] = [
    SYNCED_COLUMN,
    SYNC_STATUS_COLUMN,
    UPDATED_AT_COLUMN,
    CREATED_AT_COLUMN,
];

/// Columns that only exist locally and are never sent to the server.
pub const LOCAL_ONLY_COLUMNS: [&str; 2] = [SYNCED_COLUMN, SYNC_STATUS_COLUMN];

/// The entity types known to the reconciliation core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// The identity entity (field workers, administrators).
    User,
    /// Facilities and sites.
    Location,
    /// Patient registrations.
    Registration,
    /// Inventory items.
    Supply,
    /// Work items.
    Task,
    /// Links between tasks and users.
    TaskAssignment,
    /// Raised alerts.
    Alert,
    /// User notifications (pull-only).
    Notification,
}

/// A column in `table` that stores the id of another entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForeignKey {
    /// Table holding the reference.
    pub table: EntityType,
    /// Column holding the referenced id.
    pub column: &'static str,
}

const fn fk(table: EntityType, column: &'static str) -> ForeignKey {
    ForeignKey { table, column }
}

const USER_REFERENCES: &[ForeignKey] = &[
    fk(EntityType::Location, "created_by"),
    fk(EntityType::Registration, "registered_by"),
    fk(EntityType::Supply, "created_by"),
    fk(EntityType::Task, "created_by"),
    fk(EntityType::TaskAssignment, "user_id"),
    fk(EntityType::TaskAssignment, "assigned_by"),
    fk(EntityType::Alert, "created_by"),
    fk(EntityType::Notification, "user_id"),
];

const LOCATION_REFERENCES: &[ForeignKey] = &[
    fk(EntityType::User, "location_id"),
    fk(EntityType::Registration, "location_id"),
    fk(EntityType::Supply, "location_id"),
    fk(EntityType::Task, "location_id"),
    fk(EntityType::Alert, "location_id"),
];

const REGISTRATION_REFERENCES: &[ForeignKey] = &[
    fk(EntityType::Task, "registration_id"),
    fk(EntityType::Alert, "registration_id"),
];

const SUPPLY_REFERENCES: &[ForeignKey] = &[fk(EntityType::Task, "supply_id")];

const TASK_REFERENCES: &[ForeignKey] = &[
    fk(EntityType::TaskAssignment, "task_id"),
    fk(EntityType::Alert, "task_id"),
];

const ALERT_REFERENCES: &[ForeignKey] = &[fk(EntityType::Notification, "alert_id")];

impl EntityType {
    /// All entity types, in dependency order.
    pub const ALL: [EntityType; 8] = [
        EntityType::User,
        EntityType::Location,
        EntityType::Registration,
        EntityType::Supply,
        EntityType::Task,
        EntityType::TaskAssignment,
        EntityType::Alert,
        EntityType::Notification,
    ];

    /// Returns the wire/storage name of this entity type.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::User => "user",
            EntityType::Location => "location",
            EntityType::Registration => "registration",
            EntityType::Supply => "supply",
            EntityType::Task => "task",
            EntityType::TaskAssignment => "task_assignment",
            EntityType::Alert => "alert",
            EntityType::Notification => "notification",
        }
    }

    /// Returns the table (and pull collection) name.
    pub fn table(&self) -> &'static str {
        match self {
            EntityType::User => "users",
            EntityType::Location => "locations",
            EntityType::Registration => "registrations",
            EntityType::Supply => "supplies",
            EntityType::Task => "tasks",
            EntityType::TaskAssignment => "task_assignments",
            EntityType::Alert => "alerts",
            EntityType::Notification => "notifications",
        }
    }

    /// Parses a table name back into an entity type.
    pub fn from_table(table: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|et| et.table() == table)
    }

    /// Push priority; referenced entities are pushed before dependents.
    ///
    /// Returns `None` for pull-only entity types.
    pub fn push_priority(&self) -> Option<u8> {
        match self {
            EntityType::User => Some(0),
            EntityType::Location => Some(1),
            EntityType::Registration => Some(2),
            EntityType::Supply => Some(3),
            EntityType::Task => Some(4),
            EntityType::TaskAssignment => Some(5),
            EntityType::Alert => Some(6),
            EntityType::Notification => None,
        }
    }

    /// Returns true for the identity entity.
    pub fn is_identity(&self) -> bool {
        matches!(self, EntityType::User)
    }

    /// Key carrying the server-assigned id in a push acknowledgement.
    pub fn server_id_key(&self) -> String {
        format!("server_{}_id", self.as_str())
    }

    /// Natural key used to detect identity duplicates.
    pub fn natural_key(&self) -> Option<&'static str> {
        match self {
            EntityType::User => Some("email"),
            _ => None,
        }
    }

    /// Free-text label compared by the fuzzy duplicate check.
    pub fn fuzzy_label(&self) -> Option<&'static str> {
        match self {
            EntityType::Supply => Some("name"),
            _ => None,
        }
    }

    /// Canonical last-modified fields, most authoritative first.
    pub fn last_modified_fields(&self) -> &'static [&'static str] {
        match self {
            EntityType::Alert | EntityType::Notification => {
                &[UPDATED_AT_COLUMN, "timestamp", CREATED_AT_COLUMN]
            }
            _ => &[UPDATED_AT_COLUMN, CREATED_AT_COLUMN],
        }
    }

    /// Columns in other tables that reference rows of this type.
    pub fn referencing_columns(&self) -> &'static [ForeignKey] {
        match self {
            EntityType::User => USER_REFERENCES,
            EntityType::Location => LOCATION_REFERENCES,
            EntityType::Registration => REGISTRATION_REFERENCES,
            EntityType::Supply => SUPPLY_REFERENCES,
            EntityType::Task => TASK_REFERENCES,
            EntityType::Alert => ALERT_REFERENCES,
            EntityType::TaskAssignment | EntityType::Notification => &[],
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|et| et.as_str() == normalized || et.table() == normalized)
            .ok_or_else(|| StoreError::UnknownEntityType(s.to_string()))
    }
}

/// A generic row of any domain table.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityRow(Map<String, Value>);

impl EntityRow {
    /// Creates an empty row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a row from a JSON value, which must be an object with a
    /// string or numeric `id`.
    pub fn from_value(value: Value) -> StoreResult<Self> {
        match value {
            Value::Object(map) => {
                let row = Self(map);
                if row.id().is_none() {
                    return Err(StoreError::InvalidRow("row has no id".into()));
                }
                Ok(row)
            }
            other => Err(StoreError::InvalidRow(format!(
                "expected object, got {other}"
            ))),
        }
    }

    /// Creates a row from a map without validation.
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Returns the row's id as a string.
    ///
    /// Numeric ids are rendered in decimal.
    pub fn id(&self) -> Option<String> {
        match self.0.get(ID_COLUMN)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Sets the row's id.
    pub fn set_id(&mut self, id: &str) {
        self.0.insert(ID_COLUMN.into(), Value::String(id.to_string()));
    }

    /// Returns true when the row is flagged as synced.
    pub fn is_synced(&self) -> bool {
        match self.0.get(SYNCED_COLUMN) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_i64() == Some(1),
            _ => false,
        }
    }

    /// Sets the synced flag, clearing the status message when synced.
    pub fn set_synced(&mut self, synced: bool) {
        self.0
            .insert(SYNCED_COLUMN.into(), Value::from(i64::from(synced)));
        if synced {
            self.0.insert(SYNC_STATUS_COLUMN.into(), Value::Null);
        }
    }

    /// Sets the user-visible sync status message.
    pub fn set_status_message(&mut self, message: Option<&str>) {
        let value = message.map_or(Value::Null, |m| Value::String(m.to_string()));
        self.0.insert(SYNC_STATUS_COLUMN.into(), value);
    }

    /// Marks the row stale until the server copy is pulled.
    pub fn mark_refresh_required(&mut self) {
        self.set_synced(false);
        self.set_status_message(Some(REFRESH_REQUIRED_STATUS));
    }

    /// Returns true while the row waits for the server copy.
    pub fn is_refresh_required(&self) -> bool {
        !self.is_synced() && self.get_str(SYNC_STATUS_COLUMN) == Some(REFRESH_REQUIRED_STATUS)
    }

    /// Gets a field value.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Gets a field as a string slice.
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(Value::as_str)
    }

    /// Sets a field value.
    pub fn set(&mut self, field: impl Into<String>, value: Value) {
        self.0.insert(field.into(), value);
    }

    /// Removes a field.
    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    /// Returns the underlying map.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Consumes the row and returns a JSON object.
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Copies every field of `other` into this row, except `id`.
    pub fn overwrite_from(&mut self, other: &EntityRow) {
        for (key, value) in &other.0 {
            if key != ID_COLUMN {
                self.0.insert(key.clone(), value.clone());
            }
        }
    }

    /// Returns the row without local-only bookkeeping columns.
    pub fn to_wire(&self) -> Value {
        let mut map = self.0.clone();
        for column in LOCAL_ONLY_COLUMNS {
            map.remove(column);
        }
        Value::Object(map)
    }

    /// Returns true when any non-bookkeeping field differs from `other`.
    ///
    /// A missing field and an explicit `null` compare equal.
    pub fn differs_from(&self, other: &EntityRow) -> bool {
        let keys = self.0.keys().chain(other.0.keys());
        for key in keys {
            if BOOKKEEPING_COLUMNS.contains(&key.as_str()) {
                continue;
            }
            let left = self.0.get(key).unwrap_or(&Value::Null);
            let right = other.0.get(key).unwrap_or(&Value::Null);
            if !values_equal(left, right) {
                return true;
            }
        }
        false
    }

    /// Returns the last-modified instant following the entity type's
    /// fallback chain.
    pub fn last_modified(&self, entity_type: EntityType) -> Option<DateTime<Utc>> {
        entity_type
            .last_modified_fields()
            .iter()
            .find_map(|field| self.0.get(*field).and_then(parse_timestamp))
    }
}

/// Compares two field values, treating numeric ids and their string
/// rendering as equal.
fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(n), Value::String(s)) | (Value::String(s), Value::Number(n)) => {
            n.to_string() == *s
        }
        _ => left == right,
    }
}

/// Parses a timestamp stored as RFC 3339, `YYYY-MM-DD HH:MM:SS` (UTC) or
/// integer epoch milliseconds.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
                .map(|naive| naive.and_utc())
        }
        Value::Number(n) => n.as_i64().and_then(DateTime::<Utc>::from_timestamp_millis),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> EntityRow {
        EntityRow::from_value(value).unwrap()
    }

    #[test]
    fn entity_type_names_roundtrip() {
        for et in EntityType::ALL {
            assert_eq!(et.as_str().parse::<EntityType>().unwrap(), et);
            assert_eq!(EntityType::from_table(et.table()), Some(et));
        }
        assert!("spaceship".parse::<EntityType>().is_err());
        assert_eq!("supplies".parse::<EntityType>().unwrap(), EntityType::Supply);
    }

    #[test]
    fn push_priority_orders_dependencies_first() {
        let mut pushable: Vec<_> = EntityType::ALL
            .into_iter()
            .filter_map(|et| et.push_priority().map(|p| (p, et)))
            .collect();
        pushable.sort();
        let order: Vec<_> = pushable.into_iter().map(|(_, et)| et).collect();
        assert_eq!(
            order,
            vec![
                EntityType::User,
                EntityType::Location,
                EntityType::Registration,
                EntityType::Supply,
                EntityType::Task,
                EntityType::TaskAssignment,
                EntityType::Alert,
            ]
        );
        assert_eq!(EntityType::Notification.push_priority(), None);
    }

    #[test]
    fn server_id_key_format() {
        assert_eq!(EntityType::Supply.server_id_key(), "server_supply_id");
        assert_eq!(
            EntityType::TaskAssignment.server_id_key(),
            "server_task_assignment_id"
        );
    }

    #[test]
    fn refresh_marker_is_cleared_by_sync() {
        let mut r = row(json!({"id": "a", "synced": 1}));
        r.mark_refresh_required();
        assert!(r.is_refresh_required());
        assert!(!r.is_synced());
        r.set_synced(true);
        assert!(!r.is_refresh_required());
    }

    #[test]
    fn row_requires_id() {
        assert!(EntityRow::from_value(json!({"name": "x"})).is_err());
        assert!(EntityRow::from_value(json!([1, 2])).is_err());
        assert_eq!(row(json!({"id": 42})).id().as_deref(), Some("42"));
    }

    #[test]
    fn synced_flag_accepts_bool_and_int() {
        assert!(row(json!({"id": "a", "synced": 1})).is_synced());
        assert!(row(json!({"id": "a", "synced": true})).is_synced());
        assert!(!row(json!({"id": "a", "synced": 0})).is_synced());
        assert!(!row(json!({"id": "a"})).is_synced());
    }

    #[test]
    fn differs_ignores_bookkeeping_columns() {
        let local = row(json!({
            "id": "s1", "name": "Gauze", "synced": 1,
            "updated_at": "2024-01-01T00:00:00Z", "sync_status_message": null
        }));
        let server = row(json!({
            "id": "s1", "name": "Gauze", "updated_at": "2024-02-01T00:00:00Z",
            "created_at": "2023-12-01T00:00:00Z"
        }));
        assert!(!local.differs_from(&server));

        let changed = row(json!({"id": "s1", "name": "Bandage"}));
        assert!(local.differs_from(&changed));
    }

    #[test]
    fn differs_treats_missing_as_null() {
        let a = row(json!({"id": "s1", "notes": null}));
        let b = row(json!({"id": "s1"}));
        assert!(!a.differs_from(&b));
    }

    #[test]
    fn last_modified_fallback_chain() {
        let r = row(json!({"id": "a", "created_at": "2024-03-01T10:00:00Z"}));
        assert_eq!(
            r.last_modified(EntityType::Task).unwrap().to_rfc3339(),
            "2024-03-01T10:00:00+00:00"
        );

        let alert = row(json!({"id": "a", "timestamp": 1_700_000_000_000_i64}));
        assert!(alert.last_modified(EntityType::Alert).is_some());
        assert!(alert.last_modified(EntityType::Task).is_none());
    }

    #[test]
    fn parses_sqlite_style_timestamps() {
        let parsed = parse_timestamp(&json!("2024-05-06 07:08:09")).unwrap();
        assert_eq!(parsed.to_rfc3339(), "2024-05-06T07:08:09+00:00");
        assert!(parse_timestamp(&json!("yesterday")).is_none());
    }

    #[test]
    fn wire_form_strips_local_columns() {
        let r = row(json!({"id": "a", "synced": 0, "sync_status_message": "x", "name": "n"}));
        let wire = r.to_wire();
        assert!(wire.get("synced").is_none());
        assert!(wire.get("sync_status_message").is_none());
        assert_eq!(wire["name"], "n");
    }
}
