//! `tollgate` — inspect and maintain the durable tier of a named cache.
//!
//! Build: `cargo build --bin tollgate --features cli`

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use dialoguer::Confirm;

use tollgate::{Config, Services};

// ── CLI ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "tollgate", version = tollgate::version::PKG_VERSION, about = "manage tollgate response caches")]
struct Args {
    /// path to config.toml (defaults to ~/.tollgate or /etc/tollgate)
    #[arg(long, env = "TOLLGATE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// print hit/miss counters and tier sizes as JSON
    Stats {
        /// logical cache name (e.g. "gemini")
        cache: String,
    },
    /// delete every entry carrying a tag
    Invalidate {
        cache: String,
        /// tag to invalidate (e.g. "lead_42")
        tag: String,
    },
    /// delete expired and unreadable records
    Sweep { cache: String },
    /// delete the least recently used fifth of the durable tier
    Prune {
        cache: String,
        /// skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
    /// print build metadata
    Version,
}

/// confirm a prompt with the user; returns false if declined.
fn confirm(prompt: &str) -> bool {
    Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()
        .unwrap_or(false)
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    if let Command::Version = args.command {
        let build = tollgate::version::BUILD;
        println!("tollgate {build} (built {})", build.built_at);
        return Ok(());
    }

    let config = Config::load(args.config.as_deref())?;
    let services = Services::new(config);

    match args.command {
        Command::Stats { cache } => {
            let metrics = services.cache(&cache)?.metrics().await;
            println!("{}", serde_json::to_string_pretty(&metrics)?);
        }
        Command::Invalidate { cache, tag } => {
            let removed = services.cache(&cache)?.invalidate_by_tag(&tag).await;
            println!("removed {removed} entries tagged '{tag}'.");
        }
        Command::Sweep { cache } => {
            let removed = services.cache(&cache)?.sweep_expired().await;
            println!("removed {removed} expired entries.");
        }
        Command::Prune { cache, yes } => {
            if !yes && !confirm(&format!("prune the oldest entries of '{cache}'?")) {
                println!("aborted.");
                return Ok(());
            }
            let removed = services.cache(&cache)?.prune_durable().await;
            println!("pruned {removed} entries.");
        }
        Command::Version => {}
    }
    Ok(())
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run(Args::parse()).await {
        eprintln!("error: {e}");
        process::exit(1);
    }
}
