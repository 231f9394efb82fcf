//! # Grounding Core
//!
//! Runtime-agnostic logic for the grounding engine: fragment models,
//! verse/paragraph chunking, the partitioned vector store abstraction,
//! similarity search with scatter-gather merging, tenant behaviour
//! tables, and grounded prompt assembly.
//!
//! This crate contains no tokio, sqlx, or filesystem I/O. Storage
//! backends, embedding/generation providers, and the analytics workers
//! live in the `grounding-engine` application crate.

pub mod assemble;
pub mod chunk;
pub mod embedding;
pub mod error;
pub mod models;
pub mod search;
pub mod store;
pub mod tenant;

pub use error::RetrievalError;
