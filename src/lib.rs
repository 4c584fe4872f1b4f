#![deny(missing_docs)]

//! Core library for the Rusty Ingest document pipeline.

/// Environment-driven configuration management.
pub mod config;
/// Embedding client abstraction and adapters.
pub mod embedding;
/// Live pipeline events and their fan-out.
pub mod events;
/// Text and structured-field extraction collaborators.
pub mod extraction;
/// Vector index contract and backends.
pub mod index;
/// Structured logging and tracing setup.
pub mod logging;
/// Pipeline counters.
pub mod metrics;
/// Document processing pipeline utilities.
pub mod processing;
/// Job queue, per-document claims and the worker pool.
pub mod queue;
/// Service facade owning the queue, pool and collaborators.
pub mod service;
/// Per-document stage status, audit log and metadata store.
pub mod status;
