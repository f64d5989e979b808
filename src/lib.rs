//! # opsight
//!
//! Context retrieval and correlation for log and metric analysis.
//!
//! opsight gathers the evidence an analyst (or an LLM) needs to answer a
//! question like "why did CPU spike in the last hour?": logs, metric
//! samples, and operational events from Loki, semantically similar log
//! lines and metric readings from a vector store, and the cross-source
//! correlations between them.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────────┐   ┌──────────────┐
//! │   Loki   │──▶│ ContextManager │──▶│ Correlation  │──▶ ContextDocument
//! └──────────┘   └────────────────┘   │   Engine     │
//!                        ▲            └──────────────┘
//! ┌──────────┐   ┌───────┴────────┐
//! │  Chroma  │──▶│   Retrievers   │──▶ ContextProcessor ──▶ RetrievalContext
//! └──────────┘   └────────────────┘                              │
//!                        ▲                                       ▼
//! ┌──────────┐           │                                 prompt + LLM
//! │  Ollama  │───────────┘ (embeddings, completions)
//! └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`cache`] | TTL + LRU cache with background sweep |
//! | [`log_source`] | Loki client with retry |
//! | [`embedding`] | Ollama embedding provider |
//! | [`chroma`] | Chroma vector index |
//! | [`context_manager`] | Multi-source context assembly |
//! | [`context_processor`] | Vector retrieval for prompts |
//! | [`prompt`] | Prompt construction |
//! | [`llm`] | Ollama completion client |
//!
//! Data models, time windows, classification, correlation, and the
//! retriever/index traits live in [`opsight_core`].

pub mod cache;
pub mod chroma;
pub mod config;
pub mod context_manager;
pub mod context_processor;
pub mod embedding;
pub mod llm;
pub mod log_source;
pub mod prompt;

pub use opsight_core as core;
