//! Status command implementation.

use super::{open_store, print_json};
use fieldsync_core::{EntityType, OutboxCounts, Session, LAST_PULL_AT_KEY};
use serde::Serialize;
use std::path::Path;

/// Store status.
#[derive(Debug, Serialize)]
pub struct StatusResult {
    /// Store path.
    pub path: String,
    /// Active session, if any.
    pub session: Option<Session>,
    /// Outbox entries by status.
    pub outbox: OutboxCounts,
    /// Unresolved conflicts owned by the requested actor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor_conflicts: Option<usize>,
    /// Last complete pull.
    pub last_pull_at: Option<String>,
    /// Rows per table, in dependency order.
    pub tables: Vec<TableStats>,
}

/// Row counts for one table.
#[derive(Debug, Serialize)]
pub struct TableStats {
    /// Table name.
    pub table: &'static str,
    /// Number of rows.
    pub rows: usize,
    /// Rows with local changes not yet confirmed.
    pub unsynced: usize,
}

/// Runs the status command.
pub fn run(
    path: &Path,
    actor: Option<&str>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(path)?;

    let tables = EntityType::ALL
        .into_iter()
        .map(|entity_type| {
            let rows = store.rows(entity_type);
            TableStats {
                table: entity_type.table(),
                unsynced: rows.iter().filter(|row| !row.is_synced()).count(),
                rows: rows.len(),
            }
        })
        .collect();

    let result = StatusResult {
        path: path.display().to_string(),
        session: store.session(),
        outbox: store.outbox_counts(),
        actor_conflicts: actor.map(|actor| store.conflicted_entries(actor).len()),
        last_pull_at: store.meta(LAST_PULL_AT_KEY),
        tables,
    };

    match format {
        "json" => print_json(&result)?,
        _ => print_text_output(&result),
    }
    Ok(())
}

fn print_text_output(result: &StatusResult) {
    println!("Fieldsync Store: {}", result.path);
    println!();
    match &result.session {
        Some(session) => println!("Session:      {}", session.user_id),
        None => println!("Session:      (none)"),
    }
    println!(
        "Last pull:    {}",
        result.last_pull_at.as_deref().unwrap_or("never")
    );
    println!();
    println!("Outbox:");
    println!("  Pending:    {}", result.outbox.pending);
    println!("  Conflict:   {}", result.outbox.conflict);
    println!("  Success:    {}", result.outbox.success);
    if let Some(conflicts) = result.actor_conflicts {
        println!("  Yours:      {} unresolved", conflicts);
    }
    println!();
    println!("{:<18} {:>8} {:>9}", "Table", "Rows", "Unsynced");
    println!("{:-<18} {:->8} {:->9}", "", "", "");
    for table in &result.tables {
        println!("{:<18} {:>8} {:>9}", table.table, table.rows, table.unsynced);
    }
}
