//! Fieldsync CLI
//!
//! Command-line tools for a device store.
//!
//! # Commands
//!
//! - `status` - Display outbox counts, session and last pull time
//! - `outbox` - List outbox entries
//! - `conflicts` - List unresolved conflicts for an actor
//! - `sync` - Run a push-then-pull sync against the server
//! - `pull` - Pull server collections immediately
//! - `resolve` - Resolve one conflict

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Fieldsync command-line tools.
#[derive(Parser)]
#[command(name = "fieldsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the store snapshot file
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Sync server base URL
    #[arg(global = true, short, long, env = "FIELDSYNC_SERVER")]
    server: Option<String>,

    /// Actor (user id) to act as
    #[arg(global = true, short, long, env = "FIELDSYNC_ACTOR")]
    actor: Option<String>,

    /// Bearer token for the sync server
    #[arg(global = true, long, env = "FIELDSYNC_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Per-request timeout in seconds
    #[arg(global = true, long, default_value = "30")]
    timeout_secs: u64,

    /// Fetch every collection in one bulk pull request
    #[arg(global = true, long, env = "FIELDSYNC_BULK_PULL")]
    bulk_pull: bool,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display outbox counts, session and last pull time
    Status {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List outbox entries
    Outbox {
        /// Only show entries with this status (pending, conflict, success)
        #[arg(long)]
        status: Option<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List unresolved conflicts
    Conflicts {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Push the outbox, then pull server collections
    Sync {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Pull server collections now, ignoring the minimum interval
    Pull {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Resolve one conflict
    Resolve {
        /// Entity type (e.g. registration)
        entity_type: String,

        /// Entity id
        entity_id: String,

        /// Strategy (client_wins, server_wins, merge, update_data)
        #[arg(long)]
        strategy: String,

        /// Edited row as JSON, required for merge and update_data
        #[arg(long)]
        payload: Option<String>,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let remote = commands::RemoteArgs {
        server: cli.server,
        token: cli.token,
        timeout_secs: cli.timeout_secs,
        bulk_pull: cli.bulk_pull,
    };

    match cli.command {
        Commands::Status { format } => {
            let path = cli.path.ok_or("Store path required for status")?;
            commands::status::run(&path, cli.actor.as_deref(), &format)?;
        }
        Commands::Outbox { status, format } => {
            let path = cli.path.ok_or("Store path required for outbox")?;
            commands::outbox::run(&path, status.as_deref(), &format)?;
        }
        Commands::Conflicts { format } => {
            let path = cli.path.ok_or("Store path required for conflicts")?;
            let actor = cli.actor.ok_or("Actor required for conflicts")?;
            commands::conflicts::run(&path, &actor, &format)?;
        }
        Commands::Sync { format } => {
            let path = cli.path.ok_or("Store path required for sync")?;
            let actor = cli.actor.ok_or("Actor required for sync")?;
            commands::sync::run(&path, &remote, &actor, &format).await?;
        }
        Commands::Pull { format } => {
            let path = cli.path.ok_or("Store path required for pull")?;
            let actor = cli.actor.ok_or("Actor required for pull")?;
            commands::pull::run(&path, &remote, &actor, &format).await?;
        }
        Commands::Resolve {
            entity_type,
            entity_id,
            strategy,
            payload,
        } => {
            let path = cli.path.ok_or("Store path required for resolve")?;
            let actor = cli.actor.ok_or("Actor required for resolve")?;
            let request = commands::resolve::parse_request(
                &entity_type,
                &entity_id,
                &strategy,
                payload.as_deref(),
            )?;
            commands::resolve::run(&path, &remote, &actor, request).await?;
        }
        Commands::Version => {
            println!("Fieldsync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("Store snapshot format v{}", fieldsync_core::SNAPSHOT_VERSION);
        }
    }

    Ok(())
}
