//! Chunked OCR Processing Worker Library
//!
//! This library crate defines the core modules of the worker service. It
//! serves as the foundation for the binary executable (`main.rs`).
//!
//! ## Architecture Modules
//! The system is composed of four loosely coupled subsystems:
//!
//! - **`worker`**: The chunk processing engine. One driver task per accepted
//!   chunk advances a FETCH → PROCESS → PUBLISH state machine, with bounded
//!   parallel OCR dispatch, adaptive rate-limit backoff, and an
//!   at-least-once final callback to the orchestrator.
//! - **`persistence`**: The durable state layer. One SQLite database per
//!   chunk holds the state row, per-entity rows, the row-per-ref work queue,
//!   and a capped debug log.
//! - **`ocr`**: The OCR provider client. Single-shot chat-completions calls
//!   with a substring-table error classifier and the CDN variant/fallback
//!   rule.
//! - **`store`**: The CAS entity store client. Blob upload/download, manifest
//!   and tip reads, and compare-and-swap version appends with a bounded
//!   fresh-tip retry loop.

pub mod config;
pub mod ocr;
pub mod persistence;
pub mod store;
pub mod worker;
