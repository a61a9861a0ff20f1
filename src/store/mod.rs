//! CAS Entity Store Module
//!
//! Client for the content-addressed entity store: blob upload/download,
//! entity manifest reads, tip resolution, and the compare-and-swap
//! `append_version` operation the PUBLISH phase is built on.
//!
//! ## CAS Protocol
//! `append_version` carries the caller's expected tip; the store rejects the
//! append with a conflict when the entity has advanced past it. The client
//! exposes a bounded fresh-tip retry loop so concurrent publishers (other
//! chunks, external writers) converge instead of livelocking.

pub mod client;
pub mod types;
