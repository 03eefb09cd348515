//! Resolve command implementation.

use super::{open_engine, RemoteArgs};
use fieldsync_core::{EntityType, ResolutionStrategy};
use fieldsync_engine::{ResolveConflict, ResolveOutcome};
use serde_json::Value;
use std::path::Path;

/// Builds a resolution from command-line arguments.
pub fn parse_request(
    entity_type: &str,
    entity_id: &str,
    strategy: &str,
    payload: Option<&str>,
) -> Result<ResolveConflict, Box<dyn std::error::Error>> {
    let entity_type: EntityType = entity_type.parse()?;
    let strategy: ResolutionStrategy = strategy.parse()?;
    let mut request = ResolveConflict::new(entity_type, entity_id, strategy);
    if let Some(payload) = payload {
        let value: Value = serde_json::from_str(payload)?;
        if !value.is_object() {
            return Err("Payload must be a JSON object".into());
        }
        request = request.with_payload(value);
    }
    if strategy.requires_payload() && request.edited_payload.is_none() {
        return Err(format!("Strategy {strategy} requires --payload").into());
    }
    Ok(request)
}

/// Runs the resolve command.
pub async fn run(
    path: &Path,
    remote: &RemoteArgs,
    actor: &str,
    request: ResolveConflict,
) -> Result<(), Box<dyn std::error::Error>> {
    let engine = open_engine(path, remote)?;
    let label = format!("{} {}", request.entity_type, request.entity_id);

    match engine.resolve_conflict(actor, request).await? {
        ResolveOutcome::Resolved => println!("✓ Resolved {label}"),
        ResolveOutcome::RefreshRequired { message } => {
            println!("! {label} was already resolved elsewhere ({message}); run `fieldsync pull` to refresh");
        }
    }

    let remaining = engine.list_conflicts(actor).len();
    if remaining == 0 {
        engine.reset();
        println!("All conflicts resolved; sync can resume");
    } else {
        println!("{remaining} conflict(s) remaining");
    }
    Ok(())
}
