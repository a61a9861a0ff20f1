//! OCR Provider Module
//!
//! Thin client over a chat-completions-style vision endpoint plus the pure
//! logic around it: the substring-table error classifier that sorts provider
//! failures into rate-limit / permanent / transient, and the CDN asset
//! variant rule that picks a downscaled image for the primary attempt.
//!
//! The classifier is brittle by nature (it matches provider error text), so
//! it is isolated in `classify` behind a small pure function and covered by
//! its own tests.

pub mod classify;
pub mod client;

#[cfg(test)]
mod tests;
