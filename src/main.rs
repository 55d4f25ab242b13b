// SPDX-License-Identifier: MIT OR Apache-2.0

//! convomem - Conversation memory CLI
//!
//! Drives the interaction store from the shell: record exchanges, look up
//! context, build enhanced prompts, and migrate legacy databases.

mod cli;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Commands, OutputFormat};
use convomem::config::Config;
use convomem::embedding::create_provider;
use convomem::memory::{enhance_prompt, InteractionStore};
use convomem::output::{
    colorize_bot, colorize_heading, colorize_label, colorize_number, colorize_user, use_colors,
};
use serde_json::json;
use std::path::Path;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    // Initialize tracing with CONVOMEM_LOG env var (e.g., CONVOMEM_LOG=debug convomem context "query")
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_env("CONVOMEM_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let format = cli.format.unwrap_or_default();
    let config = Config::load();
    let user = cli
        .user
        .unwrap_or_else(|| config.user().default_id().to_string());
    let db = cli.db;
    let migrate_on_open = config.storage().migrate_on_open();

    match cli.command {
        Commands::Record { message, response } => {
            let store = open_store(&config, db.as_deref(), migrate_on_open)?;
            let id = store
                .record(&user, &message, &response)
                .context("Failed to record exchange")?;
            match format {
                OutputFormat::Json => print_json(&json!({ "id": id, "user": user }))?,
                OutputFormat::Text => println!(
                    "Recorded exchange {} for {}",
                    colorize_number(id, use_colors()),
                    user
                ),
            }
        }
        Commands::Context { query, limit } => {
            let store = open_store(&config, db.as_deref(), migrate_on_open)?;
            let limit = config.retrieval().resolve_limit(limit);
            let context = store
                .retrieve_context(&user, &query, limit)
                .context("Failed to retrieve context")?;
            match format {
                OutputFormat::Json => print_json(&json!({
                    "user": user,
                    "query": query,
                    "context": context,
                }))?,
                OutputFormat::Text => {
                    let color = use_colors();
                    if context.is_empty() {
                        eprintln!("No stored exchanges for {}", user);
                    }
                    for (rank, line) in context.iter().enumerate() {
                        println!("{} {}", colorize_number(rank + 1, color), line);
                    }
                }
            }
        }
        Commands::Prompt { message, limit } => {
            let store = open_store(&config, db.as_deref(), migrate_on_open)?;
            let limit = config.retrieval().resolve_limit(limit);
            let context = store
                .retrieve_context(&user, &message, limit)
                .context("Failed to retrieve context")?;
            let prompt = enhance_prompt(&context, &message);
            match format {
                OutputFormat::Json => print_json(&json!({
                    "user": user,
                    "message": message,
                    "context": context,
                    "prompt": prompt,
                }))?,
                OutputFormat::Text => println!("{}", prompt),
            }
        }
        Commands::Recent { limit } => {
            let store = open_store(&config, db.as_deref(), migrate_on_open)?;
            let limit = config.retrieval().resolve_limit(limit);
            let exchanges = store
                .recent_exchanges(&user, limit)
                .context("Failed to load recent exchanges")?;
            match format {
                OutputFormat::Json => print_json(&json!({
                    "user": user,
                    "exchanges": exchanges,
                }))?,
                OutputFormat::Text => {
                    let color = use_colors();
                    for exchange in &exchanges {
                        println!(
                            "{} {} {} {} {}",
                            colorize_number(exchange.id, color),
                            colorize_label("User:", color),
                            colorize_user(&exchange.user_text, color),
                            colorize_label("| Bot:", color),
                            colorize_bot(&exchange.assistant_text, color),
                        );
                    }
                }
            }
        }
        Commands::Migrate => {
            let store = open_store(&config, db.as_deref(), false)?;
            let report = store.migrate_legacy().context("Migration failed")?;
            match format {
                OutputFormat::Json => print_json(&report)?,
                OutputFormat::Text => {
                    if report.is_noop() {
                        println!("Nothing to migrate");
                    } else {
                        println!(
                            "Added {} columns, backfilled {} exchanges, re-encoded {} exchanges",
                            report.added_columns, report.backfilled, report.reencoded
                        );
                    }
                    if report.skipped > 0 {
                        println!("Skipped {} exchanges with missing text", report.skipped);
                    }
                }
            }
        }
        Commands::Stats => {
            let store = open_store(&config, db.as_deref(), migrate_on_open)?;
            let stats = store.stats().context("Failed to read statistics")?;
            match format {
                OutputFormat::Json => print_json(&stats)?,
                OutputFormat::Text => {
                    let color = use_colors();
                    println!("{}", colorize_heading("Interaction store", color));
                    println!("  exchanges: {}", colorize_number(stats.exchanges, color));
                    println!("  embedded:  {}", colorize_number(stats.embedded, color));
                    println!("  users:     {}", colorize_number(stats.users, color));
                    println!(
                        "  model:     {}",
                        stats.model.as_deref().unwrap_or("(none recorded)")
                    );
                    if let Some(dimension) = stats.dimension {
                        println!("  dimension: {}", colorize_number(dimension, color));
                    }
                }
            }
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "convomem", &mut std::io::stdout());
        }
    }

    Ok(())
}

fn open_store(config: &Config, db: Option<&Path>, migrate: bool) -> Result<InteractionStore> {
    let provider =
        create_provider(config.embeddings()).context("Failed to configure embedding provider")?;
    let path = db
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config.storage().path());
    let store = InteractionStore::open(&path, provider)
        .with_context(|| format!("Failed to open interaction store at {}", path.display()))?;
    if migrate {
        store
            .migrate_legacy()
            .context("Failed to migrate legacy exchanges")?;
    }
    Ok(store)
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to serialize output")?
    );
    Ok(())
}
