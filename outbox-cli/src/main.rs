//! outbox: inspect and maintain an offline mutation queue
//!
//! Works directly on the SQLite file a replay engine persists its queue in.
//! Run it while the owning application is stopped, or at least idle.
//!
//! Usage:
//!   outbox --db app-queue.db list
//!   outbox --db app-queue.db drop <id>

use anyhow::{ensure, Context, Result};
use clap::{Parser, Subcommand};
use outbox_cli::{drop_entry, list_entries, render_list, render_stats, requeue, show_entry, stats};
use outbox_store::SqliteQueueStore;
use std::path::PathBuf;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "outbox")]
#[command(about = "Inspect and maintain an offline mutation queue")]
struct Args {
    /// Path to the queue database
    #[arg(long, default_value = "outbox.db")]
    db: PathBuf,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    /// Enable verbose debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List queued mutations in replay order
    List,
    /// Show one queued mutation in full
    Show { id: String },
    /// Remove a queued mutation without replaying it
    Drop { id: String },
    /// Reset mutations stuck in-flight back to pending
    Requeue,
    /// Count queued mutations by status
    Stats,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    ensure!(
        args.db.exists(),
        "No queue database at {}",
        args.db.display()
    );
    let store = SqliteQueueStore::open(&args.db)
        .with_context(|| format!("Failed to open queue at {}", args.db.display()))?;
    debug!("Opened queue at {}", args.db.display());

    match args.command {
        Command::List => {
            let entries = list_entries(&store)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                print!("{}", render_list(&entries));
            }
        }
        Command::Show { id } => {
            let entry = show_entry(&store, &id)?;
            println!("{}", serde_json::to_string_pretty(&entry)?);
        }
        Command::Drop { id } => {
            let id = drop_entry(&store, &id)?;
            info!("Dropped {}", id);
        }
        Command::Requeue => {
            let count = requeue(&store)?;
            info!("Reset {} in-flight entries to pending", count);
        }
        Command::Stats => {
            let stats = stats(&store)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                print!("{}", render_stats(&stats));
            }
        }
    }
    Ok(())
}
