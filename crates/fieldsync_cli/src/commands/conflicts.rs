//! Conflicts command implementation.

use super::{open_store, print_json};
use fieldsync_core::{EntityRow, MutationRecord};
use serde::Serialize;
use serde_json::Value;
use std::path::Path;

/// One conflict as shown to the operator.
#[derive(Debug, Serialize)]
pub struct ConflictView {
    /// Outbox entry.
    pub record: MutationRecord,
    /// Local row.
    pub local: Option<EntityRow>,
    /// Server snapshot.
    pub server: Option<Value>,
}

/// Runs the conflicts command.
pub fn run(path: &Path, actor: &str, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(path)?;
    let conflicts: Vec<ConflictView> = store
        .conflicted_entries(actor)
        .into_iter()
        .map(|record| ConflictView {
            local: store.get_entity_row(record.entity_type, &record.entity_id),
            server: record
                .latest_data
                .as_deref()
                .and_then(|text| serde_json::from_str(text).ok()),
            record,
        })
        .collect();

    match format {
        "json" => print_json(&conflicts)?,
        _ => print_text_output(actor, &conflicts),
    }
    Ok(())
}

fn print_text_output(actor: &str, conflicts: &[ConflictView]) {
    if conflicts.is_empty() {
        println!("No unresolved conflicts for {actor}");
        return;
    }
    for view in conflicts {
        let record = &view.record;
        println!("{} {}", record.entity_type, record.entity_id);
        println!(
            "  Field:      {}",
            record.conflict_field.as_deref().unwrap_or("-")
        );
        let allowed: Vec<&str> = record.allowed_strategies.iter().map(|s| s.as_str()).collect();
        println!(
            "  Strategies: {}",
            if allowed.is_empty() {
                "any".to_string()
            } else {
                allowed.join(", ")
            }
        );
        if let (Some(field), Some(local)) = (record.conflict_field.as_deref(), &view.local) {
            println!("  Local:      {}", display_field(local.get(field)));
        }
        if let (Some(field), Some(server)) = (record.conflict_field.as_deref(), &view.server) {
            println!("  Server:     {}", display_field(server.get(field)));
        }
        println!();
    }
    println!("{} unresolved conflict(s)", conflicts.len());
}

fn display_field(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => "(missing)".to_string(),
    }
}
