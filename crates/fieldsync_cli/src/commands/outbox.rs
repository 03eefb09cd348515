//! Outbox command implementation.

use super::{open_store, print_json};
use fieldsync_core::{MutationRecord, OutboxStatus};
use std::path::Path;

/// Runs the outbox command.
pub fn run(
    path: &Path,
    status: Option<&str>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let filter = status.map(parse_status).transpose()?;
    let store = open_store(path)?;
    let records: Vec<MutationRecord> = store
        .outbox_entries()
        .into_iter()
        .filter(|record| filter.map_or(true, |status| record.status == status))
        .collect();

    match format {
        "json" => print_json(&records)?,
        _ => print_text_output(&records),
    }
    Ok(())
}

fn parse_status(value: &str) -> Result<OutboxStatus, String> {
    [
        OutboxStatus::Pending,
        OutboxStatus::Conflict,
        OutboxStatus::Success,
    ]
    .into_iter()
    .find(|status| status.as_str().eq_ignore_ascii_case(value.trim()))
    .ok_or_else(|| format!("Unknown outbox status: {value}"))
}

fn print_text_output(records: &[MutationRecord]) {
    if records.is_empty() {
        println!("Outbox is empty");
        return;
    }
    println!(
        "{:>5}  {:<16} {:<38} {:<9} {:>7}  {}",
        "Seq", "Entity", "Id", "Status", "Retries", "Actor"
    );
    for record in records {
        println!(
            "{:>5}  {:<16} {:<38} {:<9} {:>7}  {}",
            record.seq,
            record.entity_type.as_str(),
            record.entity_id,
            record.status.as_str(),
            record.retry_count,
            record.created_by
        );
    }
    println!();
    println!("{} entries", records.len());
}
