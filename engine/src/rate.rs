use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use std::time::Duration;
use wagerbook_types::WalletId;

use crate::config::RateLimit;
use crate::EngineError;

/// Per-wallet operation budget: at most `max_operations` back to back, refilled evenly over the
/// window.
pub struct RateGate {
    limiter: DefaultKeyedRateLimiter<WalletId>,
}

impl RateGate {
    pub fn new(limit: RateLimit) -> Self {
        let period = (limit.window / limit.max_operations.get()).max(Duration::from_nanos(1));
        let quota = Quota::with_period(period)
            .unwrap_or_else(|| Quota::per_second(limit.max_operations))
            .allow_burst(limit.max_operations);
        Self {
            limiter: RateLimiter::keyed(quota),
        }
    }

    pub fn check(&self, wallet: WalletId) -> Result<(), EngineError> {
        self.limiter
            .check_key(&wallet)
            .map_err(|_| EngineError::RateLimited(wallet))
    }

    /// Drop state for wallets whose budget is fully replenished.
    pub fn shrink(&self) {
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroU32;

    fn gate(max: u32) -> RateGate {
        RateGate::new(RateLimit {
            max_operations: NonZeroU32::new(max).unwrap(),
            window: Duration::from_secs(60),
        })
    }

    #[test]
    fn budget_is_per_wallet() {
        let gate = gate(3);
        for _ in 0..3 {
            gate.check(WalletId(1)).unwrap();
        }
        assert!(matches!(
            gate.check(WalletId(1)),
            Err(EngineError::RateLimited(WalletId(1)))
        ));
        assert!(gate.check(WalletId(2)).is_ok());
    }
}
