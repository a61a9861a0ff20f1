//! Durable Chunk State Module
//!
//! Everything a chunk worker persists lives here, in one SQLite database per
//! chunk: the single `state` row, one `pis` row per entity, one `refs` row per
//! image (the work queue), and a capped `debug_log` ring for operator
//! diagnosis.
//!
//! ## Core Concepts
//! - **Row-per-ref queue**: refs are individual rows indexed by `status`, so a
//!   chunk can hold thousands of images and still claim pending work with an
//!   indexed `LIMIT n` query.
//! - **Crash safety**: every fire of the phase engine reads state before
//!   acting and writes it back after, so a missed or duplicated fire never
//!   corrupts progress.
//! - **Bounded footprint**: the debug log is trimmed to its cap on every
//!   insert; `cleanup` drops all tables once the final callback lands.

pub mod store;
pub mod types;
