//! Chunk Worker Module
//!
//! The core of the service: a stateful, resumable, self-driven processing
//! unit responsible for a single chunk from acceptance through final
//! callback.
//!
//! ## Architecture Overview
//! Each accepted chunk gets one driver task that re-enters the worker on a
//! timer, advancing a three-phase state machine:
//! 1. **FETCH**: walk each entity's manifest, download its `*.ref.json`
//!    components, and materialize the work queue as rows. The store is never
//!    touched again until PUBLISH.
//! 2. **PROCESS**: claim up to `MAX_PARALLEL_OCR` pending refs per fire, fan
//!    the OCR calls out in parallel, classify every outcome
//!    (permanent / transient / rate-limit), and pause the whole chunk behind
//!    an exponential jittered backoff window when the provider throttles.
//! 3. **PUBLISH**: per entity, append one new version carrying the completed
//!    components, guarded by a fresh-tip CAS with bounded retries.
//! A terminal chunk reports back to the orchestrator with an at-least-once
//! callback and then drops its tables.
//!
//! ## Submodules
//! - **`engine`**: the driver loop and per-fire dispatch, including
//!   global-error absorption.
//! - **`fetch`** / **`process`** / **`publish`**: one file per phase.
//! - **`backoff`**: the per-chunk rate-limit bucket.
//! - **`callback`**: result summary derivation and delivery.
//! - **`registry`**: maps `(batch_id, chunk_id)` to live workers, seeds new
//!   chunks, resumes unfinished ones at startup.
//! - **`protocol`**: HTTP API contracts (worker surface and callback).
//! - **`handlers`**: axum route handlers over the registry.

pub mod backoff;
pub mod callback;
pub mod engine;
pub mod fetch;
pub mod handlers;
pub mod process;
pub mod protocol;
pub mod publish;
pub mod registry;

#[cfg(test)]
mod tests;
