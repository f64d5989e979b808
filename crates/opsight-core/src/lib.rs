//! # opsight Core
//!
//! Runtime-agnostic logic for opsight: data models, time window
//! resolution, log/event classification, the correlation engine, the
//! embedding and vector index traits, and the vector retrievers.
//!
//! This crate contains no tokio, HTTP client, or filesystem I/O. The
//! application crate supplies concrete backends (Loki, Chroma, Ollama)
//! and the caching/orchestration layer.

pub mod classify;
pub mod correlation;
pub mod embedding;
pub mod error;
pub mod index;
pub mod models;
pub mod retrieval;
pub mod time_window;
