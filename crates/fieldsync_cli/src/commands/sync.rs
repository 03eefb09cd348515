//! Sync command implementation.

use super::{open_engine, print_json, RemoteArgs};
use fieldsync_engine::{RunOutcome, SyncError, SyncRunReport};
use std::path::Path;

/// Runs the sync command.
pub async fn run(
    path: &Path,
    remote: &RemoteArgs,
    actor: &str,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let engine = open_engine(path, remote)?;
    let report = match engine.run_sync(actor).await {
        Ok(report) => report,
        Err(SyncError::ConflictsPending { count }) => {
            return Err(format!(
                "{count} unresolved conflict(s); run `fieldsync conflicts` and resolve them first"
            )
            .into());
        }
        Err(err) => return Err(err.into()),
    };

    match format {
        "json" => print_json(&report)?,
        _ => print_text_output(&report),
    }
    Ok(())
}

fn print_text_output(report: &SyncRunReport) {
    let push = &report.push;
    println!("Push:");
    println!("  Attempted:  {}", push.attempted);
    println!("  Succeeded:  {} ({} remapped)", push.succeeded, push.remapped);
    println!("  Conflicts:  {}", push.conflicts);
    println!("  Failed:     {}", push.failed);
    if push.deferred > 0 {
        println!("  Deferred:   {}", push.deferred);
    }

    match &report.outcome {
        RunOutcome::ConflictPending { conflicts } => {
            println!();
            println!("Pull skipped: {conflicts} conflict(s) need resolution");
        }
        RunOutcome::Completed => {
            println!();
            super::pull::print_pull(report.pull.as_ref(), report.pull_error.as_deref());
        }
    }

    println!();
    if report.is_fully_successful() {
        println!("✓ Sync complete");
    } else {
        println!("✗ Sync incomplete; pending work will be retried");
    }
}
