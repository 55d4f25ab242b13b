// SPDX-License-Identifier: MIT OR Apache-2.0

//! Embedding provider interface and implementations.
//!
//! The default provider runs sentence-transformers/all-MiniLM-L6-v2 locally
//! through fastembed. The model is loaded on first use and shared by every
//! caller of the same provider instance.

use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use once_cell::sync::OnceCell;
use serde_json::Value;
use std::borrow::Cow;
use std::env;
use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::config::{EmbeddingConfig, EmbeddingProviderType};
use crate::errors::{MemoryError, Result};

/// Default embedding dimension for sentence-transformers/all-MiniLM-L6-v2.
pub const DEFAULT_EMBEDDING_DIM: usize = 384;

const DEFAULT_FASTEMBED_MODEL: &str = "minilm";
const DEFAULT_FASTEMBED_BATCH_SIZE: usize = 64;
const MAX_FASTEMBED_BATCH_SIZE: usize = 1024;
const DEFAULT_FASTEMBED_MAX_CHARS: usize = 2000;
const DEFAULT_COMMAND_BATCH_SIZE: usize = 64;

/// Configuration for the fastembed provider.
#[derive(Debug, Clone)]
pub struct EmbeddingProviderConfig {
    pub model: EmbeddingModel,
    pub batch_size: usize,
    pub max_chars: usize,
    pub normalize: bool,
}

impl EmbeddingProviderConfig {
    pub fn from_env() -> Result<Self> {
        let model = parse_model_env()?;
        let mut batch_size = parse_usize_env("FASTEMBED_BATCH_SIZE", DEFAULT_FASTEMBED_BATCH_SIZE)?;
        if batch_size == 0 {
            batch_size = DEFAULT_FASTEMBED_BATCH_SIZE;
        }
        if batch_size > MAX_FASTEMBED_BATCH_SIZE {
            warn!(
                "FASTEMBED_BATCH_SIZE={} exceeds max {}; clamping",
                batch_size, MAX_FASTEMBED_BATCH_SIZE
            );
            batch_size = MAX_FASTEMBED_BATCH_SIZE;
        }

        let mut max_chars = parse_usize_env("FASTEMBED_MAX_CHARS", DEFAULT_FASTEMBED_MAX_CHARS)?;
        if max_chars == 0 {
            max_chars = DEFAULT_FASTEMBED_MAX_CHARS;
        }

        let normalize = parse_bool_env("FASTEMBED_NORMALIZE", true)?;

        Ok(Self {
            model,
            batch_size,
            max_chars,
            normalize,
        })
    }
}

impl Default for EmbeddingProviderConfig {
    fn default() -> Self {
        Self {
            model: EmbeddingModel::AllMiniLML6V2,
            batch_size: DEFAULT_FASTEMBED_BATCH_SIZE,
            max_chars: DEFAULT_FASTEMBED_MAX_CHARS,
            normalize: true,
        }
    }
}

/// Trait for embedding providers.
///
/// Implementations must be deterministic: the same text always maps to the
/// same vector, and every vector from one provider has the same dimension.
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier.
    fn model_id(&self) -> &str;

    /// Returns the batch size used by the provider.
    fn batch_size(&self) -> usize;

    /// Generates embeddings for the given texts, one vector per input.
    fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Generates an embedding for a single text.
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut result = self.embed_texts(&[text.to_string()])?;
        result
            .pop()
            .ok_or_else(|| MemoryError::ModelUnavailable("no embedding returned".into()))
    }
}

/// A value built on first use and then shared behind a mutex.
///
/// Callers racing on the first access block until one of them finishes
/// `init`; the rest reuse its result. A failed init leaves the cell empty so
/// a later call can try again.
pub struct LazyModel<T> {
    cell: OnceCell<Mutex<T>>,
}

impl<T> LazyModel<T> {
    pub fn new() -> Self {
        Self {
            cell: OnceCell::new(),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.cell.get().is_some()
    }

    pub fn get_or_init<F>(&self, init: F) -> Result<&Mutex<T>>
    where
        F: FnOnce() -> Result<T>,
    {
        self.cell.get_or_try_init(|| init().map(Mutex::new))
    }
}

impl<T> Default for LazyModel<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// FastEmbed provider using sentence-transformers/all-MiniLM-L6-v2.
///
/// Construction is cheap; the ONNX model is loaded by the first embed call.
/// Inference is serialized through a mutex because the session needs
/// exclusive access.
pub struct FastEmbedder {
    embedder: LazyModel<TextEmbedding>,
    config: EmbeddingProviderConfig,
    model_id: String,
}

impl FastEmbedder {
    pub fn new(config: EmbeddingProviderConfig) -> Self {
        let model_id = config.model.to_string();
        Self {
            embedder: LazyModel::new(),
            config,
            model_id,
        }
    }

    /// Returns true once the model has been loaded.
    pub fn is_loaded(&self) -> bool {
        self.embedder.is_loaded()
    }

    fn embedder(&self) -> Result<&Mutex<TextEmbedding>> {
        self.embedder.get_or_init(|| {
            info!("loading embedding model {}", self.model_id);
            let init = InitOptions::new(self.config.model.clone());
            TextEmbedding::try_new(init).map_err(|e| {
                MemoryError::ModelUnavailable(format!(
                    "failed to initialize fastembed model {}: {e}",
                    self.model_id
                ))
            })
        })
    }
}

impl EmbeddingProvider for FastEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn batch_size(&self) -> usize {
        self.config.batch_size
    }

    fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let prepared = truncate_texts(texts, self.config.max_chars);
        let mut embedder = self
            .embedder()?
            .lock()
            .map_err(|_| MemoryError::ModelUnavailable("embedding model lock poisoned".into()))?;
        let mut embeddings = embedder
            .embed(&prepared, Some(self.config.batch_size))
            .map_err(|e| MemoryError::ModelUnavailable(format!("inference failed: {e}")))?;
        drop(embedder);

        if self.config.normalize {
            for embedding in embeddings.iter_mut() {
                l2_normalize(embedding);
            }
        }

        Ok(embeddings)
    }
}

/// Command provider that shells out to an external process.
///
/// The command receives `{"model": ..., "texts": [...]}` on stdin and must
/// print either a JSON array of vectors or an object holding one under
/// `embeddings`, `vectors`, or `data`.
pub struct CommandProvider {
    command: String,
    model: String,
    batch_size: usize,
}

impl CommandProvider {
    pub fn new(command: String, model: String) -> Self {
        Self {
            command,
            model,
            batch_size: DEFAULT_COMMAND_BATCH_SIZE,
        }
    }

    fn run_command(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let payload = serde_json::json!({
            "model": self.model,
            "texts": texts,
        });

        debug!("running embedding command for {} texts", texts.len());
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                command_error(format!("failed to spawn embedding command {}: {e}", self.command))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(payload.to_string().as_bytes())
                .map_err(|e| command_error(format!("failed to write payload to stdin: {e}")))?;
        }

        let output = child
            .wait_with_output()
            .map_err(|e| command_error(format!("failed to read command output: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(command_error(format!(
                "embedding command failed (status {}): {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let vectors = parse_command_output(stdout.trim())?;
        if vectors.len() != texts.len() {
            return Err(command_error(format!(
                "embedding command returned {} vectors for {} texts",
                vectors.len(),
                texts.len()
            )));
        }

        Ok(vectors)
    }
}

impl EmbeddingProvider for CommandProvider {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.run_command(texts)
    }
}

/// Deterministic feature-hashing provider.
///
/// Lowercased alphanumeric tokens are hashed into signed buckets and the
/// result is L2-normalized, so texts sharing words score higher. Needs no
/// model files, which makes it the provider of choice for tests and offline use.
pub struct HashingProvider {
    model: String,
    dimension: usize,
}

impl HashingProvider {
    pub fn new(dimension: usize) -> Self {
        let dimension = dimension.max(1);
        Self {
            model: format!("hashing-{dimension}"),
            dimension,
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let token = token.to_lowercase();
            let hash = blake3::hash(token.as_bytes());
            let bytes = hash.as_bytes();
            let bucket = u64::from_le_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
            ]) % self.dimension as u64;
            let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket as usize] += sign;
        }
        l2_normalize(&mut vector);
        vector
    }
}

impl Default for HashingProvider {
    fn default() -> Self {
        Self::new(DEFAULT_EMBEDDING_DIM)
    }
}

impl EmbeddingProvider for HashingProvider {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn batch_size(&self) -> usize {
        DEFAULT_COMMAND_BATCH_SIZE
    }

    fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|text| self.embed_text(text)).collect())
    }
}

/// Builds the provider selected by configuration.
///
/// For the builtin provider `FASTEMBED_MODEL` wins over the configured model.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider() {
        EmbeddingProviderType::Builtin => {
            let mut provider_config = EmbeddingProviderConfig::from_env()?;
            if env::var_os("FASTEMBED_MODEL").is_none() {
                provider_config.model = parse_model_name(config.model())?;
            }
            Ok(Arc::new(FastEmbedder::new(provider_config)))
        }
        EmbeddingProviderType::Command => Ok(Arc::new(CommandProvider::new(
            config.command().to_string(),
            config.model().to_string(),
        ))),
        EmbeddingProviderType::Hashing => Ok(Arc::new(HashingProvider::new(config.dimension()))),
    }
}

fn command_error(message: String) -> MemoryError {
    MemoryError::ModelUnavailable(message)
}

fn parse_command_output(stdout: &str) -> Result<Vec<Vec<f32>>> {
    let parsed: Value = serde_json::from_str(stdout).map_err(|e| {
        command_error(format!("failed to parse embedding command output as JSON: {e}"))
    })?;

    let rows = match &parsed {
        Value::Array(rows) => rows,
        Value::Object(obj) => ["embeddings", "vectors", "data"]
            .iter()
            .find_map(|key| obj.get(*key))
            .ok_or_else(|| command_error("embedding command output has no vector list".into()))?
            .as_array()
            .ok_or_else(|| command_error("embedding list must be a JSON array".into()))?,
        _ => {
            return Err(command_error(
                "embedding command output must be a JSON array or object".into(),
            ))
        }
    };

    rows.iter().map(parse_vector).collect()
}

fn parse_vector(row: &Value) -> Result<Vec<f32>> {
    row.as_array()
        .ok_or_else(|| command_error("each embedding must be an array".into()))?
        .iter()
        .map(|value| {
            value
                .as_f64()
                .map(|v| v as f32)
                .ok_or_else(|| command_error(format!("non-numeric embedding component {value}")))
        })
        .collect()
}

fn truncate_texts<'a>(texts: &'a [String], max_chars: usize) -> Vec<Cow<'a, str>> {
    texts
        .iter()
        .map(|text| truncate_to_chars(text.as_str(), max_chars))
        .collect()
}

fn truncate_to_chars(input: &str, max_chars: usize) -> Cow<'_, str> {
    match input.char_indices().nth(max_chars) {
        Some((idx, _)) => Cow::Owned(input[..idx].to_string()),
        None => Cow::Borrowed(input),
    }
}

fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm == 0.0 {
        return;
    }
    for value in vector.iter_mut() {
        *value /= norm;
    }
}

/// Maps a model name from config or `FASTEMBED_MODEL` to a fastembed model.
pub fn parse_model_name(raw: &str) -> Result<EmbeddingModel> {
    let value = raw.trim();
    if value.is_empty() {
        return Ok(EmbeddingModel::AllMiniLML6V2);
    }

    match value.to_lowercase().as_str() {
        "minilm"
        | "all-minilm-l6-v2"
        | "allminilm-l6-v2"
        | "sentence-transformers/all-minilm-l6-v2" => Ok(EmbeddingModel::AllMiniLML6V2),
        other => Err(MemoryError::Config(format!(
            "unsupported embedding model '{}'; supported value: {}",
            other, DEFAULT_FASTEMBED_MODEL
        ))),
    }
}

fn parse_model_env() -> Result<EmbeddingModel> {
    let raw = env::var("FASTEMBED_MODEL").unwrap_or_else(|_| DEFAULT_FASTEMBED_MODEL.to_string());
    parse_model_name(&raw)
}

/// Reads a trimmed, non-empty environment value.
fn env_value(name: &str) -> Result<Option<String>> {
    match env::var(name) {
        Ok(raw) => {
            let trimmed = raw.trim();
            Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
        }
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(MemoryError::Config(format!("{name}: {err}"))),
    }
}

fn parse_usize_env(name: &str, default: usize) -> Result<usize> {
    env_value(name)?.map_or(Ok(default), |value| {
        value.parse().map_err(|_| {
            MemoryError::Config(format!("{name} must be a non-negative integer, got {value}"))
        })
    })
}

fn parse_bool_env(name: &str, default: bool) -> Result<bool> {
    let Some(value) = env_value(name)? else {
        return Ok(default);
    };
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(MemoryError::Config(format!("{name} must be a boolean, got {value}"))),
    }
}
