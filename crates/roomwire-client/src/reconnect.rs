//! Backoff schedule for re-establishing a dropped connection.

use std::time::Duration;

use rand::Rng;

pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_JITTER_FACTOR: f64 = 0.2;

#[derive(Clone, Debug)]
pub struct ReconnectPolicy {
    /// Disable to treat the first drop as final.
    pub enabled: bool,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Fraction of the delay added as random jitter (0.0–1.0).
    pub jitter_factor: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_attempts: None,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Whether attempt number `attempt` (zero-based) may run.
    pub fn allows(&self, attempt: u32) -> bool {
        self.enabled && self.max_attempts.map_or(true, |max| attempt < max)
    }

    /// `min(max_delay, initial_delay * 2^attempt)` without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }

    /// `jitter_factor` limited to `0.0..=1.0`; NaN counts as no jitter.
    pub fn jitter(&self) -> f64 {
        if self.jitter_factor.is_nan() {
            0.0
        } else {
            self.jitter_factor.clamp(0.0, 1.0)
        }
    }

    /// Base delay plus up to `jitter_factor` of it, drawn from `rng`.
    /// Saturates at `Duration::MAX`.
    pub fn delay_with<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = self.jitter();
        if jitter == 0.0 {
            return base;
        }
        let extra = Duration::try_from_secs_f64(base.as_secs_f64() * rng.gen_range(0.0..jitter))
            .unwrap_or(Duration::ZERO);
        base.saturating_add(extra)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }
}
