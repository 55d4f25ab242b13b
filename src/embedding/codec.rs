// SPDX-License-Identifier: MIT OR Apache-2.0

//! Column encoding for embedding vectors and the similarity measure over them.
//!
//! Vectors are stored as little-endian `f32` blobs. Databases written by the
//! earlier JSON-based layout keep vectors as text arrays; those still decode
//! here so retrieval and migration can read them.

use rusqlite::types::ValueRef;

use crate::errors::{MemoryError, Result};

/// Converts an embedding vector to a compact blob.
pub fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Converts a blob back to an embedding vector.
pub fn blob_to_embedding(blob: &[u8]) -> Result<Vec<f32>> {
    if blob.is_empty() || blob.len() % 4 != 0 {
        return Err(MemoryError::MalformedEmbedding(format!(
            "blob length {} is not a positive multiple of 4",
            blob.len()
        )));
    }

    Ok(blob
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

/// Parses a legacy JSON array embedding.
pub fn json_to_embedding(text: &str) -> Result<Vec<f32>> {
    let vector: Vec<f32> = serde_json::from_str(text)
        .map_err(|e| MemoryError::MalformedEmbedding(format!("invalid JSON vector: {e}")))?;
    if vector.is_empty() {
        return Err(MemoryError::MalformedEmbedding("empty JSON vector".into()));
    }
    Ok(vector)
}

/// Decodes a nullable embedding column.
///
/// `NULL` decodes to `None`. Blobs and legacy JSON text decode to a vector;
/// anything else is malformed.
pub fn decode_column(value: ValueRef<'_>) -> Result<Option<Vec<f32>>> {
    match value {
        ValueRef::Null => Ok(None),
        ValueRef::Blob(blob) => blob_to_embedding(blob).map(Some),
        ValueRef::Text(raw) => {
            let text = std::str::from_utf8(raw)
                .map_err(|e| MemoryError::MalformedEmbedding(format!("non UTF-8 text: {e}")))?;
            json_to_embedding(text).map(Some)
        }
        ValueRef::Integer(_) | ValueRef::Real(_) => Err(MemoryError::MalformedEmbedding(
            "numeric value in embedding column".into(),
        )),
    }
}

/// Computes cosine similarity between two vectors.
///
/// A zero-norm operand yields 0.0. Callers check dimensions before scoring.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let magnitude_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let magnitude_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if magnitude_a == 0.0 || magnitude_b == 0.0 {
        return 0.0;
    }

    dot_product / (magnitude_a * magnitude_b)
}
