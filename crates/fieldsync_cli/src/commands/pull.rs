//! Pull command implementation.

use super::{open_engine, print_json, RemoteArgs};
use fieldsync_engine::PullReport;
use std::path::Path;

/// Runs the pull command.
pub async fn run(
    path: &Path,
    remote: &RemoteArgs,
    actor: &str,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let engine = open_engine(path, remote)?;
    let report = engine.pull_only(actor).await?;

    match format {
        "json" => print_json(&report)?,
        _ => print_pull(Some(&report), None),
    }
    Ok(())
}

/// Prints a pull phase summary.
pub fn print_pull(report: Option<&PullReport>, error: Option<&str>) {
    if let Some(error) = error {
        println!("Pull failed: {error}");
        return;
    }
    let Some(report) = report else {
        return;
    };
    if report.skipped {
        println!("Pull skipped: minimum interval not elapsed");
        return;
    }
    println!("Pull:");
    println!(
        "{:<18} {:>8} {:>8} {:>8} {:>9} {:>10}",
        "Collection", "Received", "Inserted", "Updated", "Conflicts", "Duplicates"
    );
    for collection in &report.collections {
        let tally = &collection.tally;
        println!(
            "{:<18} {:>8} {:>8} {:>8} {:>9} {:>10}",
            collection.entity_type.table(),
            collection.received,
            tally.inserted,
            tally.updated,
            tally.conflicts,
            tally.duplicates_resolved
        );
    }
    for error in &report.errors {
        println!("{:<18} error: {}", error.entity_type.table(), error.message);
    }
}
