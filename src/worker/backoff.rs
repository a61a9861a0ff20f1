//! Rate-limit backoff controller.
//!
//! One bucket per chunk: consecutive rate-limited batches widen the window
//! exponentially, the first clean batch closes it. The window is persisted in
//! the chunk state so a resumed worker honors it.

pub const BASE_DELAY_MS: u64 = 1000;
pub const MAX_EXPONENT: u32 = 5;
pub const MAX_DELAY_MS: u64 = 60_000;
const JITTER_RATIO: f64 = 0.25;

#[derive(Debug, Clone, Copy)]
pub struct BackoffController {
    pub consecutive_errors: u32,
    pub backoff_until: Option<u64>,
}

impl BackoffController {
    pub fn new(consecutive_errors: u32, backoff_until: Option<u64>) -> Self {
        Self {
            consecutive_errors,
            backoff_until,
        }
    }

    pub fn on_success(&mut self) {
        self.consecutive_errors = 0;
        self.backoff_until = None;
    }

    /// Widens the window: `1000 · 2^min(k−1, 5)` ms capped at 60 s, with
    /// symmetric ±25% jitter so parallel chunks don't thunder back together.
    pub fn on_error(&mut self, now: u64) {
        self.consecutive_errors += 1;
        let exponent = (self.consecutive_errors - 1).min(MAX_EXPONENT);
        let base = BASE_DELAY_MS << exponent;
        let delay = base.min(MAX_DELAY_MS) as f64;
        let jitter = (rand::random::<f64>() * 2.0 - 1.0) * JITTER_RATIO;
        self.backoff_until = Some(now + (delay * (1.0 + jitter)).round() as u64);
    }

    pub fn in_backoff(&self, now: u64) -> bool {
        matches!(self.backoff_until, Some(until) if now < until)
    }

    pub fn remaining_ms(&self, now: u64) -> u64 {
        self.backoff_until
            .map(|until| until.saturating_sub(now))
            .unwrap_or(0)
    }
}
