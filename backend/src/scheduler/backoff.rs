//! The two independent pacing layers.
//!
//! - [`RetryBackoff`]: per-job exponential delay with jitter, persisted as
//!   `next_retry_at` and enforced by the claim query.
//! - [`AdaptiveBatchBackoff`]: process-local delay applied before each claim,
//!   growing while batches keep failing and decaying once they recover.

use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, info, warn};

/// `delay(n) = min(base * multiplier^(n-1), max) + jitter`, with
/// `jitter ∈ [0, jitter_factor * min(base * multiplier^(n-1), max)]`.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryBackoff {
    pub base_ms: u64,
    pub multiplier: f64,
    pub max_ms: u64,
    pub jitter_factor: f64,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            base_ms: 60_000,
            multiplier: 2.0,
            max_ms: 2 * 60 * 60 * 1_000,
            jitter_factor: 0.2,
        }
    }
}

impl RetryBackoff {
    /// Deterministic part of the delay for the `attempt`-th failure (1-based).
    pub fn base_delay_ms(&self, attempt: u32) -> u64 {
        let exp = i32::try_from(attempt.max(1) - 1).unwrap_or(i32::MAX);
        let raw = self.base_ms as f64 * self.multiplier.max(1.0).powi(exp);
        let capped = raw.min(self.max_ms as f64);
        if capped.is_finite() {
            capped as u64
        } else {
            self.max_ms
        }
    }

    pub fn delay_ms(&self, attempt: u32) -> u64 {
        self.delay_ms_with(attempt, &mut rand::thread_rng())
    }

    pub fn delay_ms_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> u64 {
        let base = self.base_delay_ms(attempt);
        let factor = self.jitter_factor.max(0.0);
        if base == 0 || factor == 0.0 {
            return base;
        }
        let jitter = (base as f64 * rng.gen_range(0.0..=factor)).floor() as u64;
        base.saturating_add(jitter)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct BatchBackoffConfig {
    pub base_ms: u64,
    pub max_ms: u64,
    /// Failure ratio above which a batch counts as bad.
    pub failure_threshold: f64,
}

impl Default for BatchBackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            max_ms: 60_000,
            failure_threshold: 0.5,
        }
    }
}

#[derive(Debug, Default)]
struct BatchBackoffState {
    consecutive_bad: u32,
    delay_ms: u64,
}

/// Shared inter-batch delay for this process only.
///
/// Other worker replicas keep their own state, so this damps load from one
/// instance; it is not a cluster-wide circuit breaker.
#[derive(Debug, Default)]
pub struct AdaptiveBatchBackoff {
    cfg: BatchBackoffConfig,
    state: Mutex<BatchBackoffState>,
}

impl AdaptiveBatchBackoff {
    pub fn new(cfg: BatchBackoffConfig) -> Self {
        Self {
            cfg,
            state: Mutex::new(BatchBackoffState::default()),
        }
    }

    pub fn current_delay(&self) -> Duration {
        Duration::from_millis(self.state.lock().delay_ms)
    }

    /// Folds one batch's outcome into the delay and returns the new delay in ms.
    ///
    /// Empty batches carry no signal and leave the state unchanged.
    pub fn record_batch(&self, succeeded: usize, failed: usize) -> u64 {
        let total = succeeded + failed;
        let mut state = self.state.lock();
        if total == 0 {
            return state.delay_ms;
        }

        let ratio = failed as f64 / total as f64;
        if ratio > self.cfg.failure_threshold {
            state.consecutive_bad = state.consecutive_bad.saturating_add(1);
            let exp = state.consecutive_bad.saturating_sub(1).min(32);
            state.delay_ms = self
                .cfg
                .base_ms
                .saturating_mul(1u64 << exp)
                .min(self.cfg.max_ms);
            warn!(
                failure_ratio = ratio,
                consecutive_bad = state.consecutive_bad,
                delay_ms = state.delay_ms,
                "batch failure ratio above threshold; slowing down"
            );
        } else {
            let before = state.delay_ms;
            state.consecutive_bad = 0;
            state.delay_ms /= 2;
            if state.delay_ms < self.cfg.base_ms {
                state.delay_ms = 0;
            }
            if before > 0 && state.delay_ms == 0 {
                info!("batch health recovered; adaptive delay cleared");
            } else if before != state.delay_ms {
                debug!(delay_ms = state.delay_ms, "adaptive delay decayed");
            }
        }

        state.delay_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> RetryBackoff {
        RetryBackoff {
            base_ms: 1_000,
            multiplier: 2.0,
            max_ms: 10_000,
            jitter_factor: 0.25,
        }
    }

    #[test]
    fn base_delay_grows_then_caps() {
        let b = backoff();
        assert_eq!(b.base_delay_ms(1), 1_000);
        assert_eq!(b.base_delay_ms(2), 2_000);
        assert_eq!(b.base_delay_ms(4), 8_000);
        assert_eq!(b.base_delay_ms(5), 10_000);
        assert_eq!(b.base_delay_ms(500), 10_000);
        // attempt 0 is treated as the first failure
        assert_eq!(b.base_delay_ms(0), 1_000);
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        let b = RetryBackoff {
            jitter_factor: 0.0,
            ..backoff()
        };
        assert_eq!(b.delay_ms(3), 4_000);
    }

    #[test]
    fn bad_batches_grow_delay_and_good_batches_decay_it() {
        let a = AdaptiveBatchBackoff::new(BatchBackoffConfig {
            base_ms: 100,
            max_ms: 1_000,
            failure_threshold: 0.5,
        });

        assert_eq!(a.record_batch(1, 9), 100);
        assert_eq!(a.record_batch(0, 10), 200);
        assert_eq!(a.record_batch(0, 10), 400);
        assert_eq!(a.record_batch(0, 10), 800);
        assert_eq!(a.record_batch(0, 10), 1_000);
        assert_eq!(a.current_delay(), Duration::from_millis(1_000));

        assert_eq!(a.record_batch(10, 0), 500);
        assert_eq!(a.record_batch(10, 0), 250);
        assert_eq!(a.record_batch(10, 0), 125);
        assert_eq!(a.record_batch(10, 0), 0);
        assert_eq!(a.current_delay(), Duration::ZERO);
    }

    #[test]
    fn ratio_at_threshold_is_healthy_and_empty_batches_are_ignored() {
        let a = AdaptiveBatchBackoff::new(BatchBackoffConfig {
            base_ms: 100,
            max_ms: 1_000,
            failure_threshold: 0.5,
        });

        assert_eq!(a.record_batch(5, 5), 0);
        assert_eq!(a.record_batch(0, 3), 100);
        assert_eq!(a.record_batch(0, 0), 100);
        // recovery resets the streak, so the next bad batch starts from base again
        a.record_batch(3, 0);
        assert_eq!(a.record_batch(0, 3), 100);
    }
}
