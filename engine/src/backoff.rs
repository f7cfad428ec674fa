//! Retry delays for payment notifications.

use rand::{Rng, RngCore};
use std::time::Duration;

/// Exponential retry schedule with equal jitter.
///
/// Each delay falls in `[step / 2, step]`, where `step` starts at `initial` and doubles after every
/// delay until it reaches `max`.
#[derive(Clone, Debug)]
pub(crate) struct RetryBackoff {
    step: Duration,
    max: Duration,
}

impl RetryBackoff {
    pub(crate) fn new(initial: Duration, max: Duration) -> Self {
        Self {
            step: initial.min(max),
            max,
        }
    }

    pub(crate) fn next_delay(&mut self, rng: &mut impl RngCore) -> Duration {
        let step_ms = u64::try_from(self.step.as_millis()).unwrap_or(u64::MAX);
        self.step = self.step.saturating_mul(2).min(self.max);
        if step_ms <= 1 {
            return Duration::from_millis(step_ms);
        }
        let half_ms = step_ms / 2;
        Duration::from_millis(half_ms.saturating_add(rng.gen_range(0..=half_ms)))
    }
}
