// SPDX-License-Identifier: MIT OR Apache-2.0

//! convomem - Conversation memory for AI browser sessions
//!
//! Stores user/assistant exchanges with sentence embeddings and recalls the
//! most relevant ones as context for the next prompt.

pub mod config;
pub mod embedding;
pub mod errors;
pub mod memory;
pub mod output;

pub use errors::{MemoryError, Result};
pub use memory::InteractionStore;
