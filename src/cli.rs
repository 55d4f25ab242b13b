// SPDX-License-Identifier: MIT OR Apache-2.0

//! CLI argument parsing using clap

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

/// convomem - Conversation memory for AI browser sessions
///
/// Records user/assistant exchanges with local sentence embeddings and
/// recalls the most relevant ones as context for the next prompt.
#[derive(Parser, Debug)]
#[command(name = "convomem")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Output format (text or json)
    #[arg(long, global = true)]
    pub format: Option<OutputFormat>,

    /// Path to the interaction database (overrides config)
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Conversation owner (defaults to the configured user)
    #[arg(short, long, global = true)]
    pub user: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Output format for results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Store a completed exchange
    Record {
        /// Message the user sent
        message: String,

        /// Reply the assistant gave
        response: String,
    },

    /// Show prior exchanges most relevant to a query
    #[command(alias = "c")]
    Context {
        /// Text to find related exchanges for
        query: String,

        /// Maximum number of exchanges
        #[arg(short = 'm', long = "limit")]
        limit: Option<usize>,
    },

    /// Print a message prefixed with relevant context
    Prompt {
        /// Message about to be sent
        message: String,

        /// Maximum number of context exchanges
        #[arg(short = 'm', long = "limit")]
        limit: Option<usize>,
    },

    /// Show the most recent exchanges, oldest first
    Recent {
        /// Maximum number of exchanges
        #[arg(short = 'm', long = "limit")]
        limit: Option<usize>,
    },

    /// Add missing embedding columns and backfill legacy rows
    Migrate,

    /// Show row counts and embedding model metadata
    Stats,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}
