//! # Ingest Harness
//!
//! A connector framework and indexing pipeline for turning external data
//! sources into chunked, embedded, versioned content.
//!
//! Connectors pull normalized [`models::Content`] from files, SQL databases,
//! or HTTP APIs behind a shared retry/timeout/metrics contract. The indexing
//! service chunks that content, extracts metadata, generates embeddings, and
//! uses a content-hash cache to skip unchanged input.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐   ┌──────────────────────────┐   ┌───────────┐
//! │ Connectors       │──▶│ IndexingService          │──▶│ Content   │
//! │ File / DB / API  │   │ hash → chunk → embed     │   │ + chunks  │
//! └────────┬─────────┘   └────────────┬─────────────┘   └───────────┘
//!          │                          │
//!   retry · timeout ·          HashCache (memory / SQLite)
//!   rate limit · watch         Embedder (OpenAI / Ollama / local)
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! ingest sources                        # list sources with health
//! ingest sync docs                      # incremental sync pass
//! ingest index docs --strategy sentence-based
//! ingest strategies                     # list chunking strategies
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and clamping |
//! | [`models`] | Core data types |
//! | [`error`] | Connector error taxonomy |
//! | [`retry`] | Backoff, retry, and timeout wrappers |
//! | [`rate_limit`] | Sliding-window request limiter |
//! | [`connector`] | Connector trait, shared core, and implementations |
//! | [`registry`] | Connector construction from configuration |
//! | [`extract`] | PDF / DOCX / Markdown text extraction |
//! | [`chunk`] | Chunking strategies |
//! | [`metadata`] | Text statistics, keywords, and entities |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`cache`] | Content-hash cache backends |
//! | [`indexing`] | The indexing service |
//! | [`ingest`] | CLI pipeline drivers |
//! | [`sources`] | Source listing and health |

pub mod cache;
pub mod chunk;
pub mod config;
pub mod connector;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod indexing;
pub mod ingest;
pub mod metadata;
pub mod models;
pub mod rate_limit;
pub mod registry;
pub mod retry;
pub mod sources;
