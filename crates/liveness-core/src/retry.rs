use std::time::Duration;

use rand::Rng;

const DEFAULT_MULTIPLIER: f64 = 1.5;
const DEFAULT_JITTER_RATIO: f64 = 0.3;

/// Exponential backoff with additive jitter, bounded by a cap.
///
/// `delay(n) = min(base * m^(n-1) + uniform(0, j * base * m^(n-1)), cap)` for
/// the 1-based attempt `n`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    base_delay_ms: u64,
    max_delay_ms: u64,
    multiplier: f64,
    jitter_ratio: f64,
}

impl RetryPolicy {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms: max_delay_ms.max(base_delay_ms),
            multiplier: DEFAULT_MULTIPLIER,
            jitter_ratio: DEFAULT_JITTER_RATIO,
        }
    }

    pub fn with_jitter_ratio(mut self, jitter_ratio: f64) -> Self {
        self.jitter_ratio = jitter_ratio.max(0.0);
        self
    }

    pub fn base_delay_ms(&self) -> u64 {
        self.base_delay_ms
    }

    pub fn max_delay_ms(&self) -> u64 {
        self.max_delay_ms
    }

    /// Un-jittered delay for `attempt`, before the cap is applied.
    fn raw_delay_ms(&self, attempt: u32) -> f64 {
        let exponent = attempt.max(1).saturating_sub(1).min(128) as i32;
        self.base_delay_ms as f64 * self.multiplier.powi(exponent)
    }

    /// Deterministic part of the delay for `attempt`, capped.
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        let capped = self.raw_delay_ms(attempt).min(self.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }

    /// Jittered delay for `attempt`.
    ///
    /// A backend retry hint lengthens the delay when larger, still bounded by
    /// the cap.
    pub fn delay_for_attempt<R: Rng>(
        &self,
        attempt: u32,
        retry_after_hint_ms: Option<u64>,
        rng: &mut R,
    ) -> Duration {
        let raw = self.raw_delay_ms(attempt);
        let spread = raw * self.jitter_ratio;
        let jitter = if spread > 0.0 && spread.is_finite() {
            rng.gen_range(0.0..=spread)
        } else {
            0.0
        };
        let hinted = retry_after_hint_ms.unwrap_or(0) as f64;
        let bounded = (raw + jitter).max(hinted).min(self.max_delay_ms as f64);
        Duration::from_millis(bounded as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(2_000, 30_000)
    }
}
