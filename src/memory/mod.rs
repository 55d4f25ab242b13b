// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interaction memory - durable exchange log with similarity recall
//!
//! Every stored exchange carries embeddings for the user turn, the assistant
//! turn, and the combined exchange. Context lookups rank a user's exchanges by
//! cosine similarity against the combined embedding.

pub mod prompt;
pub mod store;

pub use prompt::{compose_exchange, context_line, enhance_prompt};
pub use store::{
    ContextMatch, Exchange, InteractionStore, MigrationReport, StoreStats, DEFAULT_CONTEXT_LIMIT,
};
