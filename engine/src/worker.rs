//! Payment notification intake.
//!
//! External processors report settled deposits and withdrawals. Notifications are queued and
//! applied by a small pool of workers; transient failures are retried with the notification's own
//! idempotency key, so a retry that races a successful first attempt is replayed, not re-applied.

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error as ThisError;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use wagerbook_types::{Currency, IdempotencyKey, MinorUnits, OwnerId};

use crate::backoff::RetryBackoff;
use crate::operator::BalanceChange;
use crate::risk::Eligibility;
use crate::store::LedgerStore;
use crate::{Completion, Engine, EngineError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentKind {
    Deposit,
    Withdrawal,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Succeeded,
    Failed,
}

/// A payment processor's report about one transfer.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct PaymentNotification {
    pub idempotency_key: String,
    pub owner: OwnerId,
    pub kind: PaymentKind,
    pub amount: MinorUnits,
    pub currency: String,
    pub status: PaymentStatus,
    #[serde(default)]
    pub kyc_verified: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NotificationOutcome {
    Applied(BalanceChange),
    Replayed(BalanceChange),
    /// The transfer has not settled; nothing was written.
    Ignored(PaymentStatus),
}

/// Apply one notification to the owner's wallet in the notified currency.
pub async fn process_notification<S: LedgerStore>(
    engine: &Engine<S>,
    notification: &PaymentNotification,
) -> Result<NotificationOutcome, EngineError> {
    let key = IdempotencyKey::new(notification.idempotency_key.clone())?;
    let currency: Currency = notification.currency.parse()?;
    if notification.status != PaymentStatus::Succeeded {
        debug!(%key, status = ?notification.status, "ignoring unsettled payment");
        return Ok(NotificationOutcome::Ignored(notification.status));
    }
    let eligibility = if notification.kyc_verified {
        Eligibility::Verified
    } else {
        Eligibility::Unverified
    };

    let wallet = engine.ensure_wallet(notification.owner, currency)?;
    let completion = match notification.kind {
        PaymentKind::Deposit => {
            engine
                .deposit(wallet.id, notification.amount, key, eligibility)
                .await?
        }
        PaymentKind::Withdrawal => {
            engine
                .withdraw(wallet.id, notification.amount, key, eligibility)
                .await?
        }
    };
    Ok(match completion {
        Completion::Applied(change) => NotificationOutcome::Applied(change),
        Completion::IdempotentReplay(change) => NotificationOutcome::Replayed(change),
    })
}

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    /// Attempts per notification, including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
            max_attempts: 5,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, ThisError, PartialEq, Eq)]
pub enum EnqueueError {
    #[error("payment queue is full")]
    Full,
    #[error("payment workers have stopped")]
    Closed,
}

/// Producer side of the payment queue. Dropping every clone stops the workers once the queue
/// drains.
#[derive(Clone)]
pub struct PaymentQueue {
    sender: mpsc::Sender<PaymentNotification>,
}

impl PaymentQueue {
    pub fn try_enqueue(&self, notification: PaymentNotification) -> Result<(), EnqueueError> {
        match self.sender.try_send(notification) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(notification)) => {
                warn!(key = %notification.idempotency_key, "payment queue full");
                Err(EnqueueError::Full)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(EnqueueError::Closed),
        }
    }

    pub fn capacity(&self) -> usize {
        self.sender.capacity()
    }
}

/// Start `config.workers` tasks draining a bounded payment queue.
pub fn spawn_payment_workers<S: LedgerStore>(
    engine: Arc<Engine<S>>,
    config: WorkerConfig,
) -> (PaymentQueue, Vec<JoinHandle<()>>) {
    let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
    let receiver = Arc::new(Mutex::new(receiver));
    let handles = (0..config.workers.max(1))
        .map(|worker| {
            let engine = engine.clone();
            let receiver = receiver.clone();
            let config = config.clone();
            tokio::spawn(async move {
                let mut rng = StdRng::from_entropy();
                loop {
                    let next = receiver.lock().await.recv().await;
                    let Some(notification) = next else {
                        break;
                    };
                    handle(&engine, &notification, &config, &mut rng, worker).await;
                }
                debug!(worker, "payment worker stopped");
            })
        })
        .collect();
    (PaymentQueue { sender }, handles)
}

async fn handle<S: LedgerStore>(
    engine: &Engine<S>,
    notification: &PaymentNotification,
    config: &WorkerConfig,
    rng: &mut StdRng,
    worker: usize,
) {
    let key = &notification.idempotency_key;
    let mut backoff = RetryBackoff::new(config.initial_backoff, config.max_backoff);
    let mut attempt = 1;
    loop {
        match process_notification(engine, notification).await {
            Ok(NotificationOutcome::Applied(change)) => {
                info!(
                    worker,
                    %key,
                    wallet = %change.wallet.id,
                    available = change.wallet.available,
                    "payment applied"
                );
                return;
            }
            Ok(NotificationOutcome::Replayed(_)) => {
                debug!(worker, %key, "payment already applied");
                return;
            }
            Ok(NotificationOutcome::Ignored(_)) => return,
            Err(err) if err.is_retryable() && attempt < config.max_attempts => {
                let delay = backoff.next_delay(rng);
                warn!(worker, %key, attempt, ?delay, %err, "payment failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                warn!(worker, %key, attempt, %err, "dropping payment notification");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{create_engine, create_permissive_config};

    fn notification(key: &str, kind: PaymentKind, amount: i64) -> PaymentNotification {
        PaymentNotification {
            idempotency_key: key.to_string(),
            owner: OwnerId(7),
            kind,
            amount,
            currency: "USD".to_string(),
            status: PaymentStatus::Succeeded,
            kyc_verified: true,
        }
    }

    fn fast_config() -> WorkerConfig {
        WorkerConfig {
            workers: 2,
            queue_capacity: 8,
            max_attempts: 5,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    #[tokio::test]
    async fn deposit_notification_creates_and_credits_wallet() {
        let t = create_engine(create_permissive_config());
        let deposit = notification("psp-1", PaymentKind::Deposit, 500);
        let outcome = process_notification(&t.engine, &deposit).await.unwrap();
        let NotificationOutcome::Applied(change) = outcome else {
            panic!("expected applied, got {outcome:?}");
        };
        assert_eq!(change.wallet.owner, OwnerId(7));
        assert_eq!(change.wallet.available, 500);

        let again = process_notification(&t.engine, &deposit).await.unwrap();
        assert!(matches!(again, NotificationOutcome::Replayed(_)));
        assert_eq!(t.engine.wallet(change.wallet.id).unwrap().available, 500);
    }

    #[tokio::test]
    async fn unsettled_payments_are_ignored() {
        let t = create_engine(create_permissive_config());
        let mut pending = notification("psp-2", PaymentKind::Deposit, 500);
        pending.status = PaymentStatus::Pending;
        let outcome = process_notification(&t.engine, &pending).await.unwrap();
        assert_eq!(outcome, NotificationOutcome::Ignored(PaymentStatus::Pending));
        assert!(t
            .engine
            .wallet_by_owner(OwnerId(7), Currency::USD)
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn malformed_notifications_are_rejected() {
        let t = create_engine(create_permissive_config());
        let mut bad = notification("psp-3", PaymentKind::Deposit, 500);
        bad.currency = "usd".to_string();
        assert!(matches!(
            process_notification(&t.engine, &bad).await,
            Err(EngineError::Invalid(_))
        ));
        let zero = notification("psp-4", PaymentKind::Deposit, 0);
        assert!(matches!(
            process_notification(&t.engine, &zero).await,
            Err(EngineError::InvalidAmount(_))
        ));
    }

    #[tokio::test]
    async fn workers_retry_busy_storage() {
        let t = create_engine(create_permissive_config());
        let (queue, handles) = spawn_payment_workers(t.engine.clone(), fast_config());
        t.store.inject_busy(2);
        queue
            .try_enqueue(notification("psp-5", PaymentKind::Deposit, 900))
            .unwrap();
        drop(queue);
        for handle in handles {
            handle.await.unwrap();
        }

        let wallet = t
            .engine
            .wallet_by_owner(OwnerId(7), Currency::USD)
            .unwrap()
            .expect("wallet created");
        assert_eq!(wallet.available, 900);
        assert_eq!(t.engine.entries(wallet.id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn overdrawn_withdrawal_is_rejected() {
        let t = create_engine(create_permissive_config());
        let (queue, handles) = spawn_payment_workers(t.engine.clone(), fast_config());
        queue
            .try_enqueue(notification("psp-6", PaymentKind::Deposit, 100))
            .unwrap();
        drop(queue);
        for handle in handles {
            handle.await.unwrap();
        }
        let wallet = t
            .engine
            .wallet_by_owner(OwnerId(7), Currency::USD)
            .unwrap()
            .unwrap();

        let withdrawal = notification("psp-7", PaymentKind::Withdrawal, 250);
        let err = process_notification(&t.engine, &withdrawal)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InsufficientFunds { .. }));
        assert_eq!(t.engine.wallet(wallet.id).unwrap().available, 100);
    }

    #[tokio::test]
    async fn full_queue_rejects_enqueue() {
        let (sender, _receiver) = mpsc::channel(1);
        let queue = PaymentQueue { sender };
        queue
            .try_enqueue(notification("psp-8", PaymentKind::Deposit, 1))
            .unwrap();
        assert_eq!(
            queue.try_enqueue(notification("psp-9", PaymentKind::Deposit, 1)),
            Err(EnqueueError::Full)
        );
    }
}
