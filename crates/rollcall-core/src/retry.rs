//! Reconnect policy and backoff calculation.
//!
//! Holds the portable, sync-only building blocks for reconnect timing. The
//! async loop that actually sleeps and redials lives in `rollcall-client`.
//!
//! - [`ReconnectPolicy`]: base delay, cap and jitter for reconnect attempts
//! - [`calculate_backoff_delay_with_random`]: exponential backoff with jitter

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Default delay before the first reconnect attempt, in milliseconds.
pub const DEFAULT_BASE_DELAY_MS: u64 = 500;
/// Default ceiling for a single reconnect delay, in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
/// Default jitter factor (0.0–1.0).
pub const DEFAULT_JITTER_FACTOR: f64 = 0.2;

/// How a client spaces out reconnect attempts after losing its connection.
///
/// Attempts are unbounded: the client keeps trying until it is explicitly
/// disconnected. Only the spacing grows.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectPolicy {
    /// Base delay for exponential backoff in ms.
    pub base_delay_ms: u64,
    /// Maximum delay between attempts in ms.
    pub max_delay_ms: u64,
    /// Jitter factor 0.0–1.0, applied symmetrically.
    pub jitter_factor: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (zero-based), given a
    /// uniform sample `random` in `[0.0, 1.0)`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32, random: f64) -> Duration {
        Duration::from_millis(calculate_backoff_delay_with_random(
            attempt,
            self.base_delay_ms,
            self.max_delay_ms,
            self.jitter_factor,
            random,
        ))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Backoff calculation
// ─────────────────────────────────────────────────────────────────────────────

/// Calculate exponential backoff delay with explicit randomness.
///
/// Formula: `min(max_delay, base_delay * 2^attempt) * (1 + (2r - 1) * jitter)`
///
/// A jitter factor of 0.2 lets the delay vary by ±20% around the capped
/// exponential value. `random` should be a value in `[0.0, 1.0)` from a PRNG.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn calculate_backoff_delay_with_random(
    attempt: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    jitter_factor: f64,
    random: f64,
) -> u64 {
    let exponential = base_delay_ms.saturating_mul(1u64 << attempt.min(31));
    let capped = exponential.min(max_delay_ms);

    // Maps random [0,1) to [-jitter, +jitter]
    let jitter = 1.0 + (random.clamp(0.0, 1.0) * 2.0 - 1.0) * jitter_factor.clamp(0.0, 1.0);
    let with_jitter = (capped as f64) * jitter;

    with_jitter.round().max(0.0) as u64
}
