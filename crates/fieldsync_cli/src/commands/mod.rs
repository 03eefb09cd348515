//! CLI command implementations.

pub mod conflicts;
pub mod outbox;
pub mod pull;
pub mod resolve;
pub mod status;
pub mod sync;

use fieldsync_core::Store;
use fieldsync_engine::{HttpTransport, SyncConfig, SyncEngine};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Connection options shared by the commands that talk to the server.
pub struct RemoteArgs {
    /// Server base URL.
    pub server: Option<String>,
    /// Bearer token.
    pub token: Option<String>,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// Use the bulk pull endpoint.
    pub bulk_pull: bool,
}

/// Opens an existing store snapshot.
pub fn open_store(path: &Path) -> Result<Store, Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No store found at {:?}", path).into());
    }
    Ok(Store::open(path)?)
}

/// Opens the store and wires an engine to the HTTP transport.
pub fn open_engine(
    path: &Path,
    remote: &RemoteArgs,
) -> Result<SyncEngine, Box<dyn std::error::Error>> {
    let server = remote
        .server
        .as_deref()
        .ok_or("Server URL required (--server or FIELDSYNC_SERVER)")?;
    let store = Arc::new(open_store(path)?);
    let config = SyncConfig::new(server)
        .with_request_timeout(Duration::from_secs(remote.timeout_secs))
        .with_bulk_pull(remote.bulk_pull);
    let transport = HttpTransport::new(&config)?;
    transport.set_token(remote.token.clone());
    Ok(SyncEngine::new(config, store, Arc::new(transport)))
}

/// Prints `value` as pretty JSON.
pub fn print_json<T: serde::Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
