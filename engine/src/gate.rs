use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::{debug, warn};
use wagerbook_types::{Amount, EntryType, WalletId};

use crate::metrics::EngineMetrics;
use crate::rate::RateGate;
use crate::risk::{Decision, Eligibility, RiskGate, RiskOperation, RiskRequest, WindowVolume};
use crate::store::LedgerStore;
use crate::EngineError;

/// Trailing windows for per-wallet volume limits.
pub const DAY_MS: u64 = 24 * 60 * 60 * 1000;
pub const WEEK_MS: u64 = 7 * DAY_MS;
pub const MONTH_MS: u64 = 30 * DAY_MS;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ReviewItem {
    pub wallet: WalletId,
    pub operation: RiskOperation,
    pub amount: Amount,
    pub reason: String,
    pub flagged_at: u64,
}

/// Bounded queue of operations a risk gate flagged for review.
///
/// When full, the oldest item is dropped to make room.
pub struct ReviewQueue {
    items: Mutex<VecDeque<ReviewItem>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
}

impl ReviewQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    fn items(&self) -> MutexGuard<'_, VecDeque<ReviewItem>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, item: ReviewItem) {
        {
            let mut items = self.items();
            if items.len() >= self.capacity {
                items.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(capacity = self.capacity, "review queue full, dropping oldest item");
            }
            items.push_back(item);
        }
        self.notify.notify_one();
    }

    pub fn try_pop(&self) -> Option<ReviewItem> {
        self.items().pop_front()
    }

    /// Wait for the next flagged operation.
    pub async fn next(&self) -> ReviewItem {
        loop {
            if let Some(item) = self.try_pop() {
                return item;
            }
            self.notify.notified().await;
        }
    }

    pub fn drain(&self) -> Vec<ReviewItem> {
        self.items().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Admission check run before any balance mutation it covers.
pub struct Gate {
    rate: RateGate,
    risk: RiskGate,
    reviews: ReviewQueue,
    metrics: Arc<EngineMetrics>,
}

fn volume_entry_type(operation: RiskOperation) -> EntryType {
    match operation {
        RiskOperation::Deposit => EntryType::Deposit,
        RiskOperation::Withdrawal => EntryType::Withdrawal,
        RiskOperation::BetAcceptance => EntryType::BetLock,
    }
}

impl Gate {
    pub fn new(
        rate: RateGate,
        risk: RiskGate,
        reviews: ReviewQueue,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            rate,
            risk,
            reviews,
            metrics,
        }
    }

    pub fn reviews(&self) -> &ReviewQueue {
        &self.reviews
    }

    pub fn rate(&self) -> &RateGate {
        &self.rate
    }

    /// Apply the rate limit, then the risk gate.
    ///
    /// Returns the decision when the operation may proceed (`Allow` or `Review`). A `Review` is
    /// queued by [`Gate::flag`] once the operation commits.
    pub async fn admit<S: LedgerStore>(
        &self,
        store: &S,
        wallet: WalletId,
        operation: RiskOperation,
        amount: Amount,
        eligibility: Eligibility,
        now: u64,
    ) -> Result<Decision, EngineError> {
        self.rate.check(wallet)?;

        let entry_type = volume_entry_type(operation);
        let used = |window: u64| {
            store.entry_volume_since(wallet, entry_type, now.saturating_sub(window))
        };
        let volume = WindowVolume {
            day: used(DAY_MS)?,
            week: used(WEEK_MS)?,
            month: used(MONTH_MS)?,
        };
        let request = RiskRequest {
            wallet,
            operation,
            amount,
            eligibility,
            volume,
        };

        let decision = self.risk.evaluate(&request).await;
        match &decision {
            Decision::Allow => debug!(%wallet, ?operation, "risk gate allowed"),
            Decision::Review(reason) => {
                debug!(%wallet, ?operation, %reason, "risk gate wants review")
            }
            Decision::Deny(reason) => {
                return Err(EngineError::RiskDenied {
                    wallet,
                    reason: reason.clone(),
                });
            }
        }
        Ok(decision)
    }

    /// Queue a committed operation that its admission decision flagged. No-op for `Allow`.
    pub fn flag(
        &self,
        wallet: WalletId,
        operation: RiskOperation,
        amount: Amount,
        decision: &Decision,
        now: u64,
    ) {
        let Decision::Review(reason) = decision else {
            return;
        };
        warn!(%wallet, ?operation, %amount, %reason, "operation flagged for review");
        self.metrics.record_review();
        self.reviews.push(ReviewItem {
            wallet,
            operation,
            amount,
            reason: reason.clone(),
            flagged_at: now,
        });
    }
}
