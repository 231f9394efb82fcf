//! # Grounding Engine
//!
//! A multi-tenant retrieval engine that answers questions from each
//! tenant's own source texts, and a change-stream analytics pipeline
//! over the answers it gives.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────────┐   ┌──────────────────┐
//! │  Ingest  │──▶│ Chunk+Embed │──▶│ SQLite fragments │
//! └──────────┘   └─────────────┘   │ tenant::source   │
//!                                  └────────┬─────────┘
//!                       search (fan-out per partition)
//!                                           ▼
//!        ┌──────────┐   ┌──────────┐   ┌──────────┐
//!        │ Assemble │──▶│ Generate │──▶│   Log    │──▶ change stream
//!        └──────────┘   └──────────┘   └──────────┘         │
//!                                                           ▼
//!                                        cost · content · health consumers
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! gnd init
//! gnd ingest-dir sage ./texts/stoics
//! gnd query sage "tell me about discipline"
//! gnd ask sage "tell me about discipline"
//! gnd analytics run --once
//! gnd serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`ingest`] | Chunking, embedding, and storing sources |
//! | [`embedding`] | Embedding providers |
//! | [`sqlite_store`] | Partitioned fragment store |
//! | [`query`] | Tenant-scoped similarity search |
//! | [`generation`] | Generation providers and the retry/timeout adapter |
//! | [`answer`] | Search → assemble → generate → log |
//! | [`interactions`] | Interaction log and change feed |
//! | [`analytics`] | Change-stream consumers, checkpoints, poison queue |
//! | [`server`] | HTTP API |

pub mod analytics;
pub mod answer;
pub mod app;
pub mod config;
pub mod db;
pub mod embedding;
pub mod generation;
pub mod ingest;
pub mod interactions;
pub mod logging;
pub mod migrate;
pub mod query;
pub mod retry;
pub mod server;
pub mod sqlite_store;

pub use grounding_core;
