use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::EngineError;

const LATENCY_BUCKET_COUNT: usize = 12;
const LATENCY_BUCKETS_MS: [u64; LATENCY_BUCKET_COUNT] =
    [1, 2, 5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000];

#[derive(Clone, Debug, Serialize)]
pub struct LatencySnapshot {
    pub buckets_ms: Vec<u64>,
    pub counts: Vec<u64>,
    pub overflow: u64,
    pub count: u64,
    pub avg_ms: f64,
    pub max_ms: u64,
}

#[derive(Default)]
struct LatencyMetrics {
    buckets: [AtomicU64; LATENCY_BUCKET_COUNT],
    overflow: AtomicU64,
    count: AtomicU64,
    total_ms: AtomicU64,
    max_ms: AtomicU64,
}

impl LatencyMetrics {
    fn record(&self, duration: Duration) {
        let ms = duration.as_millis() as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ms.fetch_add(ms, Ordering::Relaxed);
        self.update_max(ms);

        match LATENCY_BUCKETS_MS.iter().position(|bucket| ms <= *bucket) {
            Some(idx) => self.buckets[idx].fetch_add(1, Ordering::Relaxed),
            None => self.overflow.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn snapshot(&self) -> LatencySnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let total_ms = self.total_ms.load(Ordering::Relaxed);
        let avg_ms = if count > 0 {
            total_ms as f64 / count as f64
        } else {
            0.0
        };
        LatencySnapshot {
            buckets_ms: LATENCY_BUCKETS_MS.to_vec(),
            counts: self
                .buckets
                .iter()
                .map(|bucket| bucket.load(Ordering::Relaxed))
                .collect(),
            overflow: self.overflow.load(Ordering::Relaxed),
            count,
            avg_ms,
            max_ms: self.max_ms.load(Ordering::Relaxed),
        }
    }

    fn update_max(&self, value: u64) {
        let mut current = self.max_ms.load(Ordering::Relaxed);
        while value > current {
            match self.max_ms.compare_exchange_weak(
                current,
                value,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(next) => current = next,
            }
        }
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct OutcomeSnapshot {
    pub applied: u64,
    pub replayed: u64,
    pub insufficient_funds: u64,
    pub busy: u64,
    pub timeout: u64,
    pub risk_denied: u64,
    pub risk_review: u64,
    pub rate_limited: u64,
    pub invariant_violations: u64,
    pub key_conflicts: u64,
    pub other_errors: u64,
}

#[derive(Default)]
struct OutcomeCounters {
    applied: AtomicU64,
    replayed: AtomicU64,
    insufficient_funds: AtomicU64,
    busy: AtomicU64,
    timeout: AtomicU64,
    risk_denied: AtomicU64,
    risk_review: AtomicU64,
    rate_limited: AtomicU64,
    invariant_violations: AtomicU64,
    key_conflicts: AtomicU64,
    other_errors: AtomicU64,
}

#[derive(Clone, Debug, Serialize)]
pub struct EngineMetricsSnapshot {
    pub outcomes: OutcomeSnapshot,
    pub commit_latency: LatencySnapshot,
    pub bets_settled: u64,
    pub bets_refunded: u64,
    pub commission_collected: u64,
}

/// Operation counters exposed by the node's metrics endpoint.
#[derive(Default)]
pub struct EngineMetrics {
    outcomes: OutcomeCounters,
    commit_latency: LatencyMetrics,
    bets_settled: AtomicU64,
    bets_refunded: AtomicU64,
    commission_collected: AtomicU64,
}

impl EngineMetrics {
    pub fn record_commit(&self, duration: Duration, replayed: bool) {
        self.commit_latency.record(duration);
        let counter = if replayed {
            &self.outcomes.replayed
        } else {
            &self.outcomes.applied
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, err: &EngineError) {
        let counter = match err {
            EngineError::InsufficientFunds { .. } => &self.outcomes.insufficient_funds,
            EngineError::Busy { .. } => &self.outcomes.busy,
            EngineError::Timeout => &self.outcomes.timeout,
            EngineError::RiskDenied { .. } => &self.outcomes.risk_denied,
            EngineError::RateLimited(_) => &self.outcomes.rate_limited,
            EngineError::InvariantViolation { .. } => &self.outcomes.invariant_violations,
            EngineError::IdempotencyConflict { .. } | EngineError::IdempotencyKeyReused { .. } => {
                &self.outcomes.key_conflicts
            }
            _ => &self.outcomes.other_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_review(&self) {
        self.outcomes.risk_review.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_settlement(&self, commission: i64) {
        self.bets_settled.fetch_add(1, Ordering::Relaxed);
        self.commission_collected
            .fetch_add(commission.max(0) as u64, Ordering::Relaxed);
    }

    pub fn record_refund(&self) {
        self.bets_refunded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EngineMetricsSnapshot {
        let o = &self.outcomes;
        EngineMetricsSnapshot {
            outcomes: OutcomeSnapshot {
                applied: o.applied.load(Ordering::Relaxed),
                replayed: o.replayed.load(Ordering::Relaxed),
                insufficient_funds: o.insufficient_funds.load(Ordering::Relaxed),
                busy: o.busy.load(Ordering::Relaxed),
                timeout: o.timeout.load(Ordering::Relaxed),
                risk_denied: o.risk_denied.load(Ordering::Relaxed),
                risk_review: o.risk_review.load(Ordering::Relaxed),
                rate_limited: o.rate_limited.load(Ordering::Relaxed),
                invariant_violations: o.invariant_violations.load(Ordering::Relaxed),
                key_conflicts: o.key_conflicts.load(Ordering::Relaxed),
                other_errors: o.other_errors.load(Ordering::Relaxed),
            },
            commit_latency: self.commit_latency.snapshot(),
            bets_settled: self.bets_settled.load(Ordering::Relaxed),
            bets_refunded: self.bets_refunded.load(Ordering::Relaxed),
            commission_collected: self.commission_collected.load(Ordering::Relaxed),
        }
    }
}
