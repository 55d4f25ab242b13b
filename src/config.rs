// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration file support for convomem
//!
//! Loads configuration from .convomemrc.toml in current directory or ~/.config/convomem/config.toml

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::embedding::DEFAULT_EMBEDDING_DIM;
use crate::memory::DEFAULT_CONTEXT_LIMIT;

/// Embedding provider type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProviderType {
    /// Local fastembed model
    #[default]
    Builtin,
    /// External command speaking JSON over stdin/stdout
    Command,
    /// Feature-hashing embedder, no model files
    Hashing,
}

/// Storage configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path of the SQLite database
    pub path: Option<PathBuf>,
    /// Backfill legacy rows whenever the store is opened
    pub migrate_on_open: Option<bool>,
}

impl StorageConfig {
    /// Get database path (defaults to convomem.db)
    pub fn path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| PathBuf::from("convomem.db"))
    }

    /// Whether opening the store runs the legacy migration (defaults to true)
    pub fn migrate_on_open(&self) -> bool {
        self.migrate_on_open.unwrap_or(true)
    }
}

/// Embedding configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Provider type (builtin, command, hashing)
    pub provider: Option<EmbeddingProviderType>,
    /// Model identifier for the embedding provider
    pub model: Option<String>,
    /// Command to execute for command provider
    pub command: Option<String>,
    /// Vector dimension for the hashing provider
    pub dimension: Option<usize>,
}

impl EmbeddingConfig {
    /// Get provider type (defaults to Builtin)
    pub fn provider(&self) -> EmbeddingProviderType {
        self.provider.unwrap_or_default()
    }

    /// Get model identifier (defaults to "minilm")
    pub fn model(&self) -> &str {
        self.model.as_deref().unwrap_or("minilm")
    }

    /// Get command (defaults to "embedder")
    pub fn command(&self) -> &str {
        self.command.as_deref().unwrap_or("embedder")
    }

    /// Get hashing dimension (defaults to 384)
    pub fn dimension(&self) -> usize {
        self.dimension.unwrap_or(DEFAULT_EMBEDDING_DIM)
    }
}

/// Retrieval configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Context lines returned when no limit is given
    pub default_limit: Option<usize>,
    /// Upper bound applied to requested limits
    pub max_limit: Option<usize>,
}

impl RetrievalConfig {
    /// Get default limit (defaults to 3)
    pub fn default_limit(&self) -> usize {
        self.default_limit
            .filter(|&limit| limit > 0)
            .unwrap_or(DEFAULT_CONTEXT_LIMIT)
    }

    /// Get max limit (defaults to 50)
    pub fn max_limit(&self) -> usize {
        self.max_limit.filter(|&limit| limit > 0).unwrap_or(50)
    }

    /// Resolve a requested limit against the configured bounds.
    ///
    /// A missing request uses the default; larger requests are clamped. Zero
    /// is passed through so the store can reject it.
    pub fn resolve_limit(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or_else(|| self.default_limit())
            .min(self.max_limit())
    }
}

/// User configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    /// Identifier used when none is given on the command line
    pub default_id: Option<String>,
}

impl UserConfig {
    /// Get default user id (defaults to "web_user")
    pub fn default_id(&self) -> &str {
        self.default_id.as_deref().unwrap_or("web_user")
    }
}

/// Configuration loaded from .convomemrc.toml or ~/.config/convomem/config.toml
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Embedding configuration
    #[serde(default)]
    pub embeddings: EmbeddingConfig,

    /// Retrieval configuration
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// User configuration
    #[serde(default)]
    pub user: UserConfig,
}

impl Config {
    /// Load configuration from files
    ///
    /// Precedence (highest to lowest):
    /// 1. .convomemrc.toml in current directory
    /// 2. ~/.config/convomem/config.toml
    pub fn load() -> Self {
        if let Some(config) = Self::load_from_path(Path::new(".convomemrc.toml")) {
            return config;
        }

        if let Some(home) = dirs::home_dir() {
            let config_path = home.join(".config").join("convomem").join("config.toml");
            if let Some(config) = Self::load_from_path(&config_path) {
                return config;
            }
        }

        Self::default()
    }

    /// Load configuration from a specific file, ignoring it if unreadable or invalid.
    pub fn load_from_path(path: &Path) -> Option<Self> {
        let content = std::fs::read_to_string(path).ok()?;
        match toml::from_str(&content) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!("failed to parse {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Get the storage configuration
    pub fn storage(&self) -> &StorageConfig {
        &self.storage
    }

    /// Get the embedding configuration
    pub fn embeddings(&self) -> &EmbeddingConfig {
        &self.embeddings
    }

    /// Get the retrieval configuration
    pub fn retrieval(&self) -> &RetrievalConfig {
        &self.retrieval
    }

    /// Get the user configuration
    pub fn user(&self) -> &UserConfig {
        &self.user
    }
}
