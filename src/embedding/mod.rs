// SPDX-License-Identifier: MIT OR Apache-2.0

//! Embedding module - turns text into vectors and compares them
//!
//! Providers produce fixed-dimension vectors; the codec stores them in SQLite
//! columns and scores them with cosine similarity.

pub mod codec;
pub mod provider;

pub use codec::cosine_similarity;
pub use provider::{
    create_provider, CommandProvider, EmbeddingProvider, EmbeddingProviderConfig, FastEmbedder,
    HashingProvider, LazyModel, DEFAULT_EMBEDDING_DIM,
};
