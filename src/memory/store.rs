// SPDX-License-Identifier: MIT OR Apache-2.0

//! SQLite-backed interaction store.
//!
//! Exchanges live in a single append-only `conversations` table. Writes go
//! through one connection guarded by a mutex and always run inside a
//! transaction; embeddings are computed before that lock is taken. File-backed
//! stores use WAL mode and give every read its own read-only connection, so
//! lookups see a consistent snapshot and never queue behind the writer.
//!
//! Similarity search is a brute-force scan over one user's exchanges.

use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row, Transaction};
use serde::Serialize;
use std::cmp::Ordering;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use crate::embedding::codec::{cosine_similarity, decode_column, embedding_to_blob};
use crate::embedding::EmbeddingProvider;
use crate::errors::{MemoryError, Result};
use crate::memory::prompt::{compose_exchange, context_line};

/// Number of context lines returned when the caller has no preference.
pub const DEFAULT_CONTEXT_LIMIT: usize = 3;

const SCHEMA_VERSION: &str = "2";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const EMBEDDING_COLUMNS: [&str; 3] = [
    "user_input_embedding",
    "bot_response_embedding",
    "combined_embedding",
];

/// One stored user/assistant exchange.
#[derive(Debug, Clone, Serialize)]
pub struct Exchange {
    /// Auto-incremented row identifier
    pub id: i64,
    /// Owner of the conversation
    pub user_id: String,
    /// Unix timestamp (seconds) at insertion
    pub timestamp: f64,
    /// User turn, verbatim
    pub user_text: String,
    /// Assistant turn, verbatim
    pub assistant_text: String,
    /// Embedding of the user turn
    #[serde(skip)]
    pub user_embedding: Option<Vec<f32>>,
    /// Embedding of the assistant turn
    #[serde(skip)]
    pub assistant_embedding: Option<Vec<f32>>,
    /// Embedding of the composed exchange text
    #[serde(skip)]
    pub combined_embedding: Option<Vec<f32>>,
}

impl Exchange {
    /// Formats the exchange as a context line.
    pub fn context_line(&self) -> String {
        context_line(&self.user_text, &self.assistant_text)
    }
}

/// A ranked context candidate.
#[derive(Debug, Clone, Serialize)]
pub struct ContextMatch {
    /// Row identifier of the matched exchange
    pub id: i64,
    /// Cosine similarity against the query (-1.0 to 1.0)
    pub score: f32,
    /// User turn of the matched exchange
    pub user_text: String,
    /// Assistant turn of the matched exchange
    pub assistant_text: String,
}

impl ContextMatch {
    pub fn context_line(&self) -> String {
        context_line(&self.user_text, &self.assistant_text)
    }
}

/// Outcome of a legacy migration pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    /// Embedding columns that had to be added to the table
    pub added_columns: usize,
    /// Rows that received freshly computed embeddings
    pub backfilled: usize,
    /// Rows whose JSON-text vectors were rewritten as blobs
    pub reencoded: usize,
    /// Rows left without embeddings because a text field is missing
    pub skipped: usize,
}

impl MigrationReport {
    /// True when the pass changed nothing.
    pub fn is_noop(&self) -> bool {
        self.added_columns == 0 && self.backfilled == 0 && self.reencoded == 0
    }
}

/// Row counts and embedding metadata.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    /// Stored exchanges across all users
    pub exchanges: u64,
    /// Exchanges with a combined embedding
    pub embedded: u64,
    /// Distinct conversation owners
    pub users: u64,
    /// Embedding model recorded by the first embedded write
    pub model: Option<String>,
    /// Vector length recorded alongside the model
    pub dimension: Option<usize>,
}

enum Location {
    File(PathBuf),
    Memory,
}

/// Connection used for a single read.
enum ReadHandle<'a> {
    Owned(Connection),
    Shared(MutexGuard<'a, Connection>),
}

impl Deref for ReadHandle<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        match self {
            ReadHandle::Owned(conn) => conn,
            ReadHandle::Shared(guard) => guard,
        }
    }
}

struct ExchangeEmbeddings {
    user: Vec<f32>,
    assistant: Vec<f32>,
    combined: Vec<f32>,
}

struct Candidate {
    id: i64,
    user_text: String,
    assistant_text: String,
    embedding: Result<Option<Vec<f32>>>,
}

struct LegacyRow {
    id: i64,
    user_text: Option<String>,
    assistant_text: Option<String>,
}

/// Durable exchange log plus similarity retrieval, scoped per user.
pub struct InteractionStore {
    writer: Mutex<Connection>,
    location: Location,
    provider: Arc<dyn EmbeddingProvider>,
}

impl InteractionStore {
    /// Opens or creates a store at the specified path.
    ///
    /// Missing tables and embedding columns are created; legacy rows are not
    /// backfilled until [`InteractionStore::migrate_legacy`] runs.
    pub fn open<P: AsRef<Path>>(path: P, provider: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        info!("opening interaction store at {}", path.display());

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                MemoryError::StorageUnavailable(format!(
                    "failed to create directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let conn = Connection::open(&path).map_err(|e| {
            MemoryError::StorageUnavailable(format!(
                "failed to open database {}: {e}",
                path.display()
            ))
        })?;
        let journal_mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!("journal mode {}", journal_mode);

        Self::from_connection(conn, Location::File(path), provider)
    }

    /// Creates a store backed by a private in-memory database.
    pub fn in_memory(provider: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| {
            MemoryError::StorageUnavailable(format!("failed to open in-memory database: {e}"))
        })?;
        Self::from_connection(conn, Location::Memory, provider)
    }

    fn from_connection(
        conn: Connection,
        location: Location,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        init_schema(&conn)?;
        ensure_embedding_columns(&conn)?;

        let store = Self {
            writer: Mutex::new(conn),
            location,
            provider,
        };
        store.check_model_meta()?;
        Ok(store)
    }

    /// Returns the database path, or `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        match &self.location {
            Location::File(path) => Some(path),
            Location::Memory => None,
        }
    }

    /// Returns the embedding provider this store scores with.
    pub fn provider(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.provider
    }

    fn writer(&self) -> Result<MutexGuard<'_, Connection>> {
        self.writer
            .lock()
            .map_err(|_| MemoryError::StorageUnavailable("database writer lock poisoned".into()))
    }

    fn reader(&self) -> Result<ReadHandle<'_>> {
        match &self.location {
            Location::File(path) => {
                let conn = Connection::open_with_flags(
                    path,
                    OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
                )
                .map_err(|e| {
                    MemoryError::StorageUnavailable(format!(
                        "failed to open read connection {}: {e}",
                        path.display()
                    ))
                })?;
                conn.busy_timeout(BUSY_TIMEOUT)?;
                Ok(ReadHandle::Owned(conn))
            }
            Location::Memory => self.writer().map(ReadHandle::Shared),
        }
    }

    fn check_model_meta(&self) -> Result<()> {
        let conn = self.writer()?;
        let stored = get_meta(&conn, "embedding_model")?;
        if let Some(stored) = stored {
            if stored != self.provider.model_id() {
                warn!(
                    "store embeddings were produced by {}, provider is {}; similarity across models is unreliable",
                    stored,
                    self.provider.model_id()
                );
            }
        }
        Ok(())
    }

    fn embed_exchange(&self, user_text: &str, assistant_text: &str) -> Result<ExchangeEmbeddings> {
        self.embed_exchanges(&[(user_text, assistant_text)])?
            .pop()
            .ok_or_else(|| MemoryError::ModelUnavailable("no embedding returned".into()))
    }

    /// Embeds several exchanges with a single provider call.
    fn embed_exchanges(&self, pairs: &[(&str, &str)]) -> Result<Vec<ExchangeEmbeddings>> {
        let texts: Vec<String> = pairs
            .iter()
            .flat_map(|(user_text, assistant_text)| {
                [
                    user_text.to_string(),
                    assistant_text.to_string(),
                    compose_exchange(user_text, assistant_text),
                ]
            })
            .collect();

        let vectors = self.provider.embed_texts(&texts)?;
        if vectors.len() != texts.len() {
            return Err(MemoryError::ModelUnavailable(format!(
                "embedding provider returned {} vectors for {} texts",
                vectors.len(),
                texts.len()
            )));
        }

        let mut vectors = vectors.into_iter();
        let mut out = Vec::with_capacity(pairs.len());
        while let (Some(user), Some(assistant), Some(combined)) =
            (vectors.next(), vectors.next(), vectors.next())
        {
            out.push(ExchangeEmbeddings {
                user,
                assistant,
                combined,
            });
        }
        Ok(out)
    }

    /// Stores one exchange and returns its id.
    ///
    /// All three embeddings are computed before the write lock is taken; the
    /// insert itself runs in a transaction.
    pub fn record(&self, user_id: &str, user_text: &str, assistant_text: &str) -> Result<i64> {
        if user_id.is_empty() {
            return Err(MemoryError::InvalidArgument(
                "user_id must not be empty".into(),
            ));
        }

        let embeddings = self.embed_exchange(user_text, assistant_text)?;

        let mut conn = self.writer()?;
        let tx = conn.transaction()?;
        // Stamped under the writer lock so timestamps follow id order.
        let timestamp = unix_now();
        tx.execute(
            r#"
            INSERT INTO conversations (
                user_id, timestamp, user_input, bot_response,
                user_input_embedding, bot_response_embedding, combined_embedding
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                user_id,
                timestamp,
                user_text,
                assistant_text,
                embedding_to_blob(&embeddings.user),
                embedding_to_blob(&embeddings.assistant),
                embedding_to_blob(&embeddings.combined),
            ],
        )?;
        let id = tx.last_insert_rowid();
        record_model_meta(&tx, self.provider.model_id(), embeddings.combined.len())?;
        tx.commit()?;

        debug!("recorded exchange {} for user {}", id, user_id);
        Ok(id)
    }

    /// Returns context lines for `query_text`, most relevant first.
    ///
    /// Users without any embedded exchange get their most recent exchanges in
    /// chronological order instead.
    pub fn retrieve_context(
        &self,
        user_id: &str,
        query_text: &str,
        limit: usize,
    ) -> Result<Vec<String>> {
        validate_limit(limit)?;

        let candidates = self.embedded_candidates(user_id)?;
        if candidates.is_empty() {
            debug!("no embedded exchanges for {}; using recency fallback", user_id);
            return self.recent_context(user_id, limit);
        }

        let query = self.provider.embed(query_text)?;
        Ok(rank_candidates(&query, candidates, limit)
            .iter()
            .map(ContextMatch::context_line)
            .collect())
    }

    /// Ranks a user's embedded exchanges against `query_text`.
    ///
    /// Unlike [`InteractionStore::retrieve_context`] this never falls back to
    /// recency: a user without embedded exchanges yields no matches.
    pub fn search_similar(
        &self,
        user_id: &str,
        query_text: &str,
        limit: usize,
    ) -> Result<Vec<ContextMatch>> {
        validate_limit(limit)?;

        let candidates = self.embedded_candidates(user_id)?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let query = self.provider.embed(query_text)?;
        Ok(rank_candidates(&query, candidates, limit))
    }

    /// Returns the `limit` most recent exchanges for a user, oldest first.
    pub fn recent_context(&self, user_id: &str, limit: usize) -> Result<Vec<String>> {
        Ok(self
            .recent_exchanges(user_id, limit)?
            .iter()
            .map(Exchange::context_line)
            .collect())
    }

    /// Loads the `limit` most recent exchanges for a user, oldest first.
    pub fn recent_exchanges(&self, user_id: &str, limit: usize) -> Result<Vec<Exchange>> {
        validate_limit(limit)?;

        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, user_id, timestamp, user_input, bot_response,
                   user_input_embedding, bot_response_embedding, combined_embedding
            FROM conversations
            WHERE user_id = ?1
            ORDER BY id DESC
            LIMIT ?2
            "#,
        )?;

        let mut exchanges = stmt
            .query_map(params![user_id, limit as i64], row_to_exchange)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        exchanges.reverse();

        Ok(exchanges)
    }

    /// Retrieves a specific exchange by id.
    pub fn get_exchange(&self, id: i64) -> Result<Option<Exchange>> {
        let conn = self.reader()?;
        let exchange = conn
            .query_row(
                r#"
                SELECT id, user_id, timestamp, user_input, bot_response,
                       user_input_embedding, bot_response_embedding, combined_embedding
                FROM conversations
                WHERE id = ?1
                "#,
                params![id],
                row_to_exchange,
            )
            .optional()?;

        Ok(exchange)
    }

    fn embedded_candidates(&self, user_id: &str) -> Result<Vec<Candidate>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, user_input, bot_response, combined_embedding
            FROM conversations
            WHERE user_id = ?1 AND combined_embedding IS NOT NULL
            ORDER BY id
            "#,
        )?;

        let candidates = stmt
            .query_map(params![user_id], |row| {
                Ok(Candidate {
                    id: row.get(0)?,
                    user_text: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    assistant_text: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                    embedding: decode_column(row.get_ref(3)?),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(candidates)
    }

    /// Brings legacy rows up to the current layout.
    ///
    /// Adds missing embedding columns, computes embeddings for rows that have
    /// none, and rewrites JSON-text vectors as blobs. Running it again after
    /// completion changes nothing.
    pub fn migrate_legacy(&self) -> Result<MigrationReport> {
        let mut report = MigrationReport {
            added_columns: ensure_embedding_columns(&*self.writer()?)?,
            ..MigrationReport::default()
        };

        let (eligible, skipped): (Vec<LegacyRow>, Vec<LegacyRow>) = self
            .rows_missing_embeddings()?
            .into_iter()
            .partition(|row| has_text(&row.user_text) && has_text(&row.assistant_text));
        report.skipped = skipped.len();

        let mut updates = Vec::with_capacity(eligible.len());
        let chunk_size = (self.provider.batch_size() / 3).max(1);
        for chunk in eligible.chunks(chunk_size) {
            let pairs: Vec<(&str, &str)> = chunk
                .iter()
                .map(|row| {
                    (
                        row.user_text.as_deref().unwrap_or_default(),
                        row.assistant_text.as_deref().unwrap_or_default(),
                    )
                })
                .collect();
            let embeddings = self.embed_exchanges(&pairs)?;
            updates.extend(chunk.iter().map(|row| row.id).zip(embeddings));
        }

        if !updates.is_empty() {
            let mut conn = self.writer()?;
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    r#"
                    UPDATE conversations
                    SET user_input_embedding = ?1,
                        bot_response_embedding = ?2,
                        combined_embedding = ?3
                    WHERE id = ?4 AND combined_embedding IS NULL
                    "#,
                )?;
                for (id, embeddings) in &updates {
                    report.backfilled += stmt.execute(params![
                        embedding_to_blob(&embeddings.user),
                        embedding_to_blob(&embeddings.assistant),
                        embedding_to_blob(&embeddings.combined),
                        id
                    ])?;
                }
            }
            if let Some((_, first)) = updates.first() {
                record_model_meta(&tx, self.provider.model_id(), first.combined.len())?;
            }
            tx.commit()?;
        }

        report.reencoded = self.reencode_text_vectors()?;

        info!(
            "migration complete: {} columns added, {} rows backfilled, {} rows re-encoded, {} rows skipped",
            report.added_columns, report.backfilled, report.reencoded, report.skipped
        );
        Ok(report)
    }

    fn rows_missing_embeddings(&self) -> Result<Vec<LegacyRow>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, user_input, bot_response
            FROM conversations
            WHERE combined_embedding IS NULL
            ORDER BY id
            "#,
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok(LegacyRow {
                    id: row.get(0)?,
                    user_text: row.get(1)?,
                    assistant_text: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows)
    }

    /// Rewrites decodable JSON-text vectors as blobs; undecodable ones stay.
    fn reencode_text_vectors(&self) -> Result<usize> {
        let mut conn = self.writer()?;
        let tx = conn.transaction()?;

        let rewrites: Vec<(i64, &'static str, Vec<u8>)> = {
            let mut stmt = tx.prepare(
                r#"
                SELECT id, user_input_embedding, bot_response_embedding, combined_embedding
                FROM conversations
                WHERE typeof(user_input_embedding) = 'text'
                   OR typeof(bot_response_embedding) = 'text'
                   OR typeof(combined_embedding) = 'text'
                "#,
            )?;
            let rows = stmt.query_map([], |row| {
                let id: i64 = row.get(0)?;
                let mut found = Vec::new();
                for (idx, column) in EMBEDDING_COLUMNS.iter().enumerate() {
                    let value = row.get_ref(idx + 1)?;
                    if !matches!(value, ValueRef::Text(_)) {
                        continue;
                    }
                    match decode_column(value) {
                        Ok(Some(vector)) => found.push((id, *column, embedding_to_blob(&vector))),
                        Ok(None) => {}
                        Err(err) => debug!("leaving {} of exchange {} as is: {}", column, id, err),
                    }
                }
                Ok(found)
            })?;

            let mut all = Vec::new();
            for row in rows {
                all.extend(row?);
            }
            all
        };

        let mut touched: Vec<i64> = Vec::new();
        for (id, column, blob) in &rewrites {
            let sql = format!("UPDATE conversations SET {column} = ?1 WHERE id = ?2");
            tx.execute(&sql, params![blob, id])?;
            if touched.last() != Some(id) {
                touched.push(*id);
            }
        }
        tx.commit()?;

        Ok(touched.len())
    }

    /// Counts exchanges, embedded exchanges, and distinct users.
    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.reader()?;
        let (exchanges, embedded, users): (i64, i64, i64) = conn.query_row(
            "SELECT COUNT(*), COUNT(combined_embedding), COUNT(DISTINCT user_id) FROM conversations",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        let model = get_meta(&conn, "embedding_model")?;
        let dimension = get_meta(&conn, "embedding_dim")?.and_then(|d| d.parse().ok());

        Ok(StoreStats {
            exchanges: exchanges as u64,
            embedded: embedded as u64,
            users: users as u64,
            model,
            dimension,
        })
    }
}

/// Creates the tables if they do not exist.
fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS conversations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT,
            timestamp REAL,
            user_input TEXT,
            bot_response TEXT,
            user_input_embedding BLOB,
            bot_response_embedding BLOB,
            combined_embedding BLOB
        );

        CREATE INDEX IF NOT EXISTS idx_conversations_user
            ON conversations(user_id, id);
        "#,
    )
    .map_err(|e| MemoryError::StorageUnavailable(format!("failed to initialize schema: {e}")))?;

    conn.execute(
        "INSERT OR IGNORE INTO meta (key, value) VALUES ('schema_version', ?1)",
        params![SCHEMA_VERSION],
    )?;
    Ok(())
}

/// Adds any embedding column the table lacks. Returns how many were added.
fn ensure_embedding_columns(conn: &Connection) -> Result<usize> {
    let mut stmt = conn.prepare("PRAGMA table_info(conversations)")?;
    let existing = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut added = 0;
    for column in EMBEDDING_COLUMNS {
        if !existing.iter().any(|name| name == column) {
            info!("adding missing column conversations.{}", column);
            conn.execute(
                &format!("ALTER TABLE conversations ADD COLUMN {column} BLOB"),
                [],
            )?;
            added += 1;
        }
    }

    Ok(added)
}

fn record_model_meta(tx: &Transaction<'_>, model: &str, dimension: usize) -> Result<()> {
    tx.execute(
        "INSERT OR IGNORE INTO meta (key, value) VALUES ('embedding_model', ?1)",
        params![model],
    )?;
    tx.execute(
        "INSERT OR IGNORE INTO meta (key, value) VALUES ('embedding_dim', ?1)",
        params![dimension.to_string()],
    )?;
    Ok(())
}

fn get_meta(conn: &Connection, key: &str) -> Result<Option<String>> {
    let value = conn
        .query_row(
            "SELECT value FROM meta WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

/// Scores candidates and keeps the best `limit`.
///
/// Candidates arrive in id order and the sort is stable, so equal scores
/// keep the earlier exchange first. Undecodable vectors, vectors whose
/// dimension differs from the query, and non-finite scores drop out.
fn rank_candidates(query: &[f32], candidates: Vec<Candidate>, limit: usize) -> Vec<ContextMatch> {
    let mut scored: Vec<ContextMatch> = candidates
        .into_iter()
        .filter_map(|candidate| {
            let vector = match candidate.embedding {
                Ok(Some(vector)) => vector,
                Ok(None) => return None,
                Err(err) => {
                    debug!("skipping exchange {}: {}", candidate.id, err);
                    return None;
                }
            };
            if vector.len() != query.len() {
                debug!(
                    "skipping exchange {}: dimension {} does not match query dimension {}",
                    candidate.id,
                    vector.len(),
                    query.len()
                );
                return None;
            }

            let score = cosine_similarity(query, &vector);
            if !score.is_finite() {
                debug!("skipping exchange {}: non-finite score", candidate.id);
                return None;
            }

            Some(ContextMatch {
                id: candidate.id,
                score,
                user_text: candidate.user_text,
                assistant_text: candidate.assistant_text,
            })
        })
        .collect();

    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
    scored.truncate(limit);
    scored
}

fn row_to_exchange(row: &Row<'_>) -> rusqlite::Result<Exchange> {
    Ok(Exchange {
        id: row.get(0)?,
        user_id: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
        timestamp: timestamp_from(row.get_ref(2)?),
        user_text: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
        assistant_text: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
        user_embedding: lenient_embedding(row, 5)?,
        assistant_embedding: lenient_embedding(row, 6)?,
        combined_embedding: lenient_embedding(row, 7)?,
    })
}

fn lenient_embedding(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Vec<f32>>> {
    Ok(decode_column(row.get_ref(idx)?).unwrap_or_else(|err| {
        debug!("ignoring embedding column {}: {}", idx, err);
        None
    }))
}

/// Reads timestamps written as REAL, INTEGER, or legacy text.
fn timestamp_from(value: ValueRef<'_>) -> f64 {
    match value {
        ValueRef::Real(v) => v,
        ValueRef::Integer(v) => v as f64,
        ValueRef::Text(raw) => std::str::from_utf8(raw)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0.0),
        ValueRef::Null | ValueRef::Blob(_) => 0.0,
    }
}

fn has_text(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|s| !s.is_empty())
}

fn validate_limit(limit: usize) -> Result<()> {
    if limit == 0 {
        return Err(MemoryError::InvalidArgument(
            "limit must be a positive integer".into(),
        ));
    }
    Ok(())
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingProvider;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    /// Counts occurrences of fixed keywords, one dimension per keyword.
    struct KeywordProvider {
        keywords: Vec<&'static str>,
    }

    impl KeywordProvider {
        fn new() -> Self {
            Self {
                keywords: vec!["rust", "borrow", "checker", "pizza", "compile"],
            }
        }
    }

    impl EmbeddingProvider for KeywordProvider {
        fn model_id(&self) -> &str {
            "keywords"
        }

        fn batch_size(&self) -> usize {
            2
        }

        fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|text| {
                    let lower = text.to_lowercase();
                    let tokens: Vec<&str> = lower
                        .split(|c: char| !c.is_alphanumeric())
                        .filter(|t| !t.is_empty())
                        .collect();
                    self.keywords
                        .iter()
                        .map(|k| tokens.iter().filter(|t| *t == k).count() as f32)
                        .collect()
                })
                .collect())
        }
    }

    /// Serves `successes` embed calls, then reports the model as unavailable.
    struct FailingProvider {
        successes: AtomicUsize,
    }

    impl FailingProvider {
        fn after(successes: usize) -> Self {
            Self {
                successes: AtomicUsize::new(successes),
            }
        }
    }

    impl EmbeddingProvider for FailingProvider {
        fn model_id(&self) -> &str {
            "failing"
        }

        fn batch_size(&self) -> usize {
            3
        }

        fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let left = self.successes.load(AtomicOrdering::SeqCst);
            if left == 0 {
                return Err(MemoryError::ModelUnavailable("model failed to load".into()));
            }
            self.successes.store(left - 1, AtomicOrdering::SeqCst);
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    fn keyword_store() -> InteractionStore {
        InteractionStore::in_memory(Arc::new(KeywordProvider::new())).unwrap()
    }

    fn legacy_store(provider: Arc<dyn EmbeddingProvider>) -> InteractionStore {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE conversations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT,
                timestamp TEXT,
                user_input TEXT,
                bot_response TEXT
            );
            INSERT INTO conversations (user_id, timestamp, user_input, bot_response)
                VALUES ('web_user', '1700000000.5', 'first question', 'first answer');
            INSERT INTO conversations (user_id, timestamp, user_input, bot_response)
                VALUES ('web_user', '1700000001.5', 'second question', 'second answer');
            INSERT INTO conversations (user_id, timestamp, user_input, bot_response)
                VALUES ('web_user', '1700000002.5', 'third question', 'third answer');
            "#,
        )
        .unwrap();
        InteractionStore::from_connection(conn, Location::Memory, provider).unwrap()
    }

    #[test]
    fn test_schema_has_embedding_columns() {
        let store = keyword_store();
        let conn = store.writer().unwrap();
        let mut stmt = conn.prepare("PRAGMA table_info(conversations)").unwrap();
        let columns: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        for column in EMBEDDING_COLUMNS {
            assert!(columns.iter().any(|c| c == column), "missing {column}");
        }
    }

    #[test]
    fn test_record_round_trip() {
        let store = InteractionStore::in_memory(Arc::new(HashingProvider::default())).unwrap();
        store.record("u", "hello", "hi there").unwrap();

        let context = store.retrieve_context("u", "hello", 1).unwrap();
        assert_eq!(context, vec!["User: hello | Bot: hi there".to_string()]);
    }

    #[test]
    fn test_record_stores_three_embeddings() {
        let store = keyword_store();
        let id = store.record("u", "rust", "pizza").unwrap();

        let exchange = store.get_exchange(id).unwrap().unwrap();
        assert_eq!(exchange.user_embedding, Some(vec![1.0, 0.0, 0.0, 0.0, 0.0]));
        assert_eq!(exchange.assistant_embedding, Some(vec![0.0, 0.0, 0.0, 1.0, 0.0]));
        assert_eq!(exchange.combined_embedding, Some(vec![1.0, 0.0, 0.0, 1.0, 0.0]));
        assert!(exchange.timestamp > 0.0);
    }

    #[test]
    fn test_record_ids_increase() {
        let store = keyword_store();
        let a = store.record("u", "one", "two").unwrap();
        let b = store.record("u", "three", "four").unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_concurrent_records_keep_timestamps_in_id_order() {
        let store = InteractionStore::in_memory(Arc::new(HashingProvider::new(16))).unwrap();

        std::thread::scope(|scope| {
            for worker in 0..16 {
                let store = &store;
                scope.spawn(move || {
                    for i in 0..200 {
                        store
                            .record("u", &format!("q{worker}-{i}"), "a")
                            .unwrap();
                    }
                });
            }
        });

        let rows = store.recent_exchanges("u", 10_000).unwrap();
        assert_eq!(rows.len(), 3200);
        for pair in rows.windows(2) {
            assert!(pair[0].id < pair[1].id);
            assert!(
                pair[0].timestamp <= pair[1].timestamp,
                "id {} ts {} > id {} ts {}",
                pair[0].id,
                pair[0].timestamp,
                pair[1].id,
                pair[1].timestamp
            );
        }
    }

    #[test]
    fn test_record_surfaces_model_failure() {
        let store = InteractionStore::in_memory(Arc::new(FailingProvider::after(0))).unwrap();
        let err = store.record("u", "hello", "hi").unwrap_err();
        assert!(matches!(err, MemoryError::ModelUnavailable(_)));
        assert_eq!(store.stats().unwrap().exchanges, 0);
    }

    #[test]
    fn test_retrieve_surfaces_model_failure() {
        let store = InteractionStore::in_memory(Arc::new(FailingProvider::after(1))).unwrap();
        store.record("u", "hello", "hi").unwrap();

        let err = store.retrieve_context("u", "hello", 3).unwrap_err();
        assert!(matches!(err, MemoryError::ModelUnavailable(_)));
    }

    #[test]
    fn test_record_rejects_empty_user() {
        let store = keyword_store();
        let err = store.record("", "hello", "hi").unwrap_err();
        assert!(matches!(err, MemoryError::InvalidArgument(_)));
        assert_eq!(store.stats().unwrap().exchanges, 0);
    }

    #[test]
    fn test_zero_limit_is_rejected() {
        let store = keyword_store();
        assert!(matches!(
            store.retrieve_context("u", "q", 0),
            Err(MemoryError::InvalidArgument(_))
        ));
        assert!(matches!(
            store.recent_context("u", 0),
            Err(MemoryError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_search_similar_scores_without_fallback() {
        let store = keyword_store();
        store.record("u", "rust borrow", "yes").unwrap();
        store.record("u", "pizza", "no").unwrap();

        let matches = store.search_similar("u", "borrow checker", 5).unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].user_text, "rust borrow");
        assert!((matches[0].score - 0.5).abs() < 1e-6);
        assert_eq!(matches[1].score, 0.0);

        assert!(store.search_similar("nobody", "borrow", 5).unwrap().is_empty());
    }

    #[test]
    fn test_similarity_ranking_ignores_insertion_order() {
        let store = keyword_store();
        store.record("u", "best pizza", "naples").unwrap();
        store.record("u", "rust compile speed", "use incremental builds").unwrap();
        store
            .record("u", "explain the rust borrow checker", "it enforces ownership")
            .unwrap();

        let context = store.retrieve_context("u", "rust borrow checker", 3).unwrap();
        assert_eq!(
            context,
            vec![
                "User: explain the rust borrow checker | Bot: it enforces ownership".to_string(),
                "User: rust compile speed | Bot: use incremental builds".to_string(),
                "User: best pizza | Bot: naples".to_string(),
            ]
        );
    }

    #[test]
    fn test_ties_keep_insertion_order() {
        let store = keyword_store();
        store.record("u", "rust", "first").unwrap();
        store.record("u", "rust", "second").unwrap();

        let matches = store.search_similar("u", "rust", 2).unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].assistant_text, "first");
        assert_eq!(matches[1].assistant_text, "second");
        assert_eq!(matches[0].score, matches[1].score);
    }

    #[test]
    fn test_limit_boundary() {
        let store = keyword_store();
        for i in 0..5 {
            store.record("u", &format!("rust question {i}"), "answer").unwrap();
        }

        assert_eq!(store.retrieve_context("u", "rust", 2).unwrap().len(), 2);
        assert_eq!(store.retrieve_context("u", "rust", 10).unwrap().len(), 5);
    }

    #[test]
    fn test_users_are_isolated() {
        let store = keyword_store();
        store.record("alice", "rust borrow", "yes").unwrap();
        store.record("bob", "pizza", "no").unwrap();

        let context = store.retrieve_context("alice", "pizza", 5).unwrap();
        assert_eq!(context, vec!["User: rust borrow | Bot: yes".to_string()]);
    }

    #[test]
    fn test_unknown_user_gets_empty_context() {
        let store = keyword_store();
        store.record("u", "rust", "pizza").unwrap();
        assert!(store
            .retrieve_context("nonexistent_user", "anything", 5)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_fallback_to_recent_without_embeddings() {
        let store = legacy_store(Arc::new(KeywordProvider::new()));

        let context = store.retrieve_context("web_user", "rust", 2).unwrap();
        assert_eq!(
            context,
            vec![
                "User: second question | Bot: second answer".to_string(),
                "User: third question | Bot: third answer".to_string(),
            ]
        );
    }

    #[test]
    fn test_legacy_text_timestamp_is_read() {
        let store = legacy_store(Arc::new(KeywordProvider::new()));
        let exchange = store.get_exchange(1).unwrap().unwrap();
        assert!((exchange.timestamp - 1_700_000_000.5).abs() < 1e-6);
        assert!(exchange.combined_embedding.is_none());
    }

    #[test]
    fn test_corrupted_embedding_is_skipped() {
        let store = keyword_store();
        store.record("u", "rust borrow checker", "first").unwrap();
        let corrupt = store.record("u", "rust borrow checker", "second").unwrap();
        store.record("u", "rust compile", "third").unwrap();

        store
            .writer()
            .unwrap()
            .execute(
                "UPDATE conversations SET combined_embedding = X'010203' WHERE id = ?1",
                params![corrupt],
            )
            .unwrap();

        let context = store.retrieve_context("u", "rust borrow checker", 5).unwrap();
        assert_eq!(
            context,
            vec![
                "User: rust borrow checker | Bot: first".to_string(),
                "User: rust compile | Bot: third".to_string(),
            ]
        );
    }

    #[test]
    fn test_dimension_mismatch_is_skipped() {
        let store = keyword_store();
        let odd = store.record("u", "rust", "odd").unwrap();
        store.record("u", "rust", "kept").unwrap();

        store
            .writer()
            .unwrap()
            .execute(
                "UPDATE conversations SET combined_embedding = ?1 WHERE id = ?2",
                params![embedding_to_blob(&[1.0, 0.0]), odd],
            )
            .unwrap();

        let matches = store.search_similar("u", "rust", 5).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].assistant_text, "kept");
    }

    #[test]
    fn test_legacy_json_vectors_are_scored() {
        let store = keyword_store();
        store
            .writer()
            .unwrap()
            .execute(
                "INSERT INTO conversations (user_id, timestamp, user_input, bot_response, combined_embedding)
                 VALUES ('u', '1.0', 'old rust talk', 'old answer', '[1.0, 0.0, 0.0, 0.0, 0.0]')",
                [],
            )
            .unwrap();
        store.record("u", "pizza", "new answer").unwrap();

        let context = store.retrieve_context("u", "rust", 1).unwrap();
        assert_eq!(context, vec!["User: old rust talk | Bot: old answer".to_string()]);
    }

    #[test]
    fn test_migrate_backfills_and_is_idempotent() {
        let store = legacy_store(Arc::new(KeywordProvider::new()));
        store
            .writer()
            .unwrap()
            .execute(
                "INSERT INTO conversations (user_id, user_input, bot_response) VALUES ('web_user', 'orphan', NULL)",
                [],
            )
            .unwrap();

        let first = store.migrate_legacy().unwrap();
        assert_eq!(first.added_columns, 0);
        assert_eq!(first.backfilled, 3);
        assert_eq!(first.skipped, 1);

        let before: Vec<Option<Vec<f32>>> = (1..=4)
            .map(|id| store.get_exchange(id).unwrap().unwrap().combined_embedding)
            .collect();
        assert!(before[..3].iter().all(Option::is_some));
        assert!(before[3].is_none());

        let second = store.migrate_legacy().unwrap();
        assert!(second.is_noop());
        assert_eq!(second.skipped, 1);

        let after: Vec<Option<Vec<f32>>> = (1..=4)
            .map(|id| store.get_exchange(id).unwrap().unwrap().combined_embedding)
            .collect();
        assert_eq!(before, after);
        assert_eq!(store.stats().unwrap().exchanges, 4);
    }

    #[test]
    fn test_migrate_model_failure_writes_nothing() {
        // Batches hold one exchange each; the second batch fails.
        let store = legacy_store(Arc::new(FailingProvider::after(1)));

        let err = store.migrate_legacy().unwrap_err();
        assert!(matches!(err, MemoryError::ModelUnavailable(_)));

        let stats = store.stats().unwrap();
        assert_eq!(stats.exchanges, 3);
        assert_eq!(stats.embedded, 0);
        assert_eq!(stats.model, None);
    }

    #[test]
    fn test_migrate_makes_similarity_available() {
        let store = legacy_store(Arc::new(KeywordProvider::new()));
        store.migrate_legacy().unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.embedded, 3);
        assert_eq!(stats.model.as_deref(), Some("keywords"));
        assert_eq!(stats.dimension, Some(5));
    }

    #[test]
    fn test_migrate_reencodes_json_vectors() {
        let store = keyword_store();
        store
            .writer()
            .unwrap()
            .execute_batch(
                r#"
                INSERT INTO conversations (user_id, user_input, bot_response,
                    user_input_embedding, bot_response_embedding, combined_embedding)
                VALUES ('u', 'a', 'b', '[1.0, 0.0]', '[0.0, 1.0]', '[1.0, 1.0]');
                INSERT INTO conversations (user_id, user_input, bot_response, combined_embedding)
                VALUES ('u', 'c', 'd', 'garbage');
                "#,
            )
            .unwrap();

        let report = store.migrate_legacy().unwrap();
        assert_eq!(report.reencoded, 1);
        assert_eq!(report.backfilled, 0);

        let conn = store.writer().unwrap();
        let kinds: (String, String) = conn
            .query_row(
                "SELECT typeof(combined_embedding), typeof(user_input_embedding) FROM conversations WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(kinds, ("blob".to_string(), "blob".to_string()));

        let untouched: String = conn
            .query_row(
                "SELECT combined_embedding FROM conversations WHERE id = 2",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(untouched, "garbage");
    }

    #[test]
    fn test_migrate_adds_missing_columns() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE conversations (id INTEGER PRIMARY KEY AUTOINCREMENT, user_id TEXT, timestamp TEXT, user_input TEXT, bot_response TEXT);",
        )
        .unwrap();
        assert_eq!(ensure_embedding_columns(&conn).unwrap(), 3);
        assert_eq!(ensure_embedding_columns(&conn).unwrap(), 0);
    }

    #[test]
    fn test_recent_exchanges_are_chronological() {
        let store = keyword_store();
        for i in 0..4 {
            store.record("u", &format!("q{i}"), &format!("a{i}")).unwrap();
        }

        let recent = store.recent_exchanges("u", 3).unwrap();
        let texts: Vec<&str> = recent.iter().map(|e| e.user_text.as_str()).collect();
        assert_eq!(texts, vec!["q1", "q2", "q3"]);
    }

    #[test]
    fn test_stats_counts_users() {
        let store = keyword_store();
        store.record("a", "x", "y").unwrap();
        store.record("a", "x", "y").unwrap();
        store.record("b", "x", "y").unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.exchanges, 3);
        assert_eq!(stats.embedded, 3);
        assert_eq!(stats.users, 2);
    }
}
