//! Atomic balance operations.
//!
//! Every operation enters the critical sections of the wallets it touches, then commits one
//! [`Batch`]. The store re-checks balances inside the transaction, so the sections only keep
//! contending writers from racing to a rollback.

use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error};
use wagerbook_types::{
    Amount, BetId, CommissionRate, Currency, EntryType, IdempotencyKey, LedgerEntry, MinorUnits,
    OperationType, OwnerId, Wallet, WalletId, WalletStatus,
};

use crate::cache::BalanceCache;
use crate::clock::Clock;
use crate::coordinator::{Coordinator, LockKey, SectionGuard};
use crate::metrics::EngineMetrics;
use crate::store::{Batch, CommitOutcome, CommitReceipt, LedgerStore, Posting};
use crate::{Completion, EngineError, StoreError};

/// Result of a single-wallet operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BalanceChange {
    pub wallet: Wallet,
    pub entries: Vec<LedgerEntry>,
}

impl BalanceChange {
    fn from_receipt(wallet: WalletId, receipt: CommitReceipt) -> Option<Self> {
        let state = receipt.wallet(wallet).cloned()?;
        Some(Self {
            wallet: state,
            entries: receipt.entries,
        })
    }

    /// Rebuild a replayed result, which must have been recorded against `wallet`.
    fn from_replay(
        wallet: WalletId,
        key: &IdempotencyKey,
        operation: OperationType,
        receipt: CommitReceipt,
    ) -> Result<Self, EngineError> {
        let recorded = receipt
            .wallets
            .iter()
            .map(|state| format!("wallet {}", state.id))
            .collect::<Vec<_>>()
            .join(", ");
        Self::from_receipt(wallet, receipt).ok_or_else(|| EngineError::IdempotencyKeyReused {
            key: key.to_string(),
            operation,
            recorded,
            requested: format!("wallet {wallet}"),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stake {
    pub wallet: WalletId,
    pub amount: Amount,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Settlement {
    pub winner: WalletId,
    pub pot: Amount,
    pub payout: MinorUnits,
    pub commission: MinorUnits,
    pub entries: Vec<LedgerEntry>,
    pub wallets: Vec<Wallet>,
}

impl From<CommitOutcome> for Completion<CommitReceipt> {
    fn from(outcome: CommitOutcome) -> Self {
        match outcome {
            CommitOutcome::Applied(receipt) => Completion::Applied(receipt),
            CommitOutcome::Replayed(receipt) => Completion::IdempotentReplay(receipt),
        }
    }
}

/// Postings that pay a settled pot out of escrow.
///
/// Every loser's stake leaves their locked bucket. The winner's stake leaves their locked
/// bucket and the payout lands in their available bucket. The commission goes to `platform`.
/// The postings sum to zero.
pub(crate) fn settlement_postings(
    losers: &[Stake],
    winner: Stake,
    rate: CommissionRate,
    platform: WalletId,
    bet: Option<BetId>,
) -> Result<(Vec<Posting>, Amount, MinorUnits, MinorUnits), EngineError> {
    if losers.iter().any(|stake| stake.wallet == winner.wallet) {
        return Err(EngineError::InvalidBet(format!(
            "wallet {} cannot both win and lose",
            winner.wallet
        )));
    }
    let pot = losers
        .iter()
        .try_fold(winner.amount, |acc, stake| acc.checked_add(stake.amount))
        .ok_or_else(|| EngineError::InvalidBet("pot overflows".to_string()))?;
    let split = rate.split(pot);

    let attach = |posting: Posting| match bet {
        Some(bet) => posting.for_bet(bet),
        None => posting,
    };
    let mut postings: Vec<Posting> = losers
        .iter()
        .map(|stake| {
            attach(Posting::new(
                stake.wallet,
                EntryType::BetPayout,
                0,
                -stake.amount.get(),
            ))
        })
        .collect();
    postings.push(attach(Posting::new(
        winner.wallet,
        EntryType::BetPayout,
        split.payout,
        -winner.amount.get(),
    )));
    if split.commission > 0 {
        postings.push(attach(Posting::new(
            platform,
            EntryType::Commission,
            split.commission,
            0,
        )));
    }
    Ok((postings, pot, split.payout, split.commission))
}

pub struct BalanceOperator<S: LedgerStore> {
    store: Arc<S>,
    coordinator: Arc<Coordinator>,
    cache: Arc<BalanceCache>,
    metrics: Arc<EngineMetrics>,
    clock: Arc<dyn Clock>,
    platform_owner: OwnerId,
    max_amount: MinorUnits,
}

impl<S: LedgerStore> Clone for BalanceOperator<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            coordinator: self.coordinator.clone(),
            cache: self.cache.clone(),
            metrics: self.metrics.clone(),
            clock: self.clock.clone(),
            platform_owner: self.platform_owner,
            max_amount: self.max_amount,
        }
    }
}

impl<S: LedgerStore> BalanceOperator<S> {
    pub fn new(
        store: Arc<S>,
        coordinator: Arc<Coordinator>,
        cache: Arc<BalanceCache>,
        metrics: Arc<EngineMetrics>,
        clock: Arc<dyn Clock>,
        platform_owner: OwnerId,
        max_amount: MinorUnits,
    ) -> Self {
        Self {
            store,
            coordinator,
            cache,
            metrics,
            clock,
            platform_owner,
            max_amount,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub(crate) fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub(crate) fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    pub fn now(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Validate a caller-supplied amount against the configured maximum.
    pub fn amount(&self, minor_units: MinorUnits) -> Result<Amount, EngineError> {
        Ok(Amount::bounded(minor_units, self.max_amount)?)
    }

    pub fn ensure_wallet(&self, owner: OwnerId, currency: Currency) -> Result<Wallet, EngineError> {
        Ok(self.store.ensure_wallet(owner, currency, self.now())?)
    }

    pub fn platform_wallet(&self, currency: Currency) -> Result<Wallet, EngineError> {
        self.ensure_wallet(self.platform_owner, currency)
    }

    /// Read-through wallet lookup.
    pub fn wallet(&self, id: WalletId) -> Result<Wallet, EngineError> {
        if let Some(wallet) = self.cache.get(id) {
            return Ok(wallet);
        }
        let generation = self.cache.generation();
        let wallet = self
            .store
            .wallet(id)?
            .ok_or(EngineError::WalletNotFound(id))?;
        self.cache.insert(wallet.clone(), generation);
        Ok(wallet)
    }

    pub(crate) async fn enter(
        &self,
        wallets: &[WalletId],
    ) -> Result<SectionGuard, EngineError> {
        let keys = wallets.iter().copied().map(LockKey::Wallet).collect();
        self.coordinator.acquire(keys).await
    }

    /// The receipt recorded for `key`, if it was already used for `operation`.
    pub(crate) fn replayed(
        &self,
        key: &IdempotencyKey,
        operation: OperationType,
    ) -> Result<Option<CommitReceipt>, EngineError> {
        let Some(record) = self.store.idempotency_record(key)? else {
            return Ok(None);
        };
        if record.operation != operation {
            return Err(EngineError::IdempotencyConflict {
                key: key.to_string(),
                recorded: record.operation,
                requested: operation,
            });
        }
        let receipt = serde_json::from_str(&record.result_snapshot).map_err(StoreError::from)?;
        Ok(Some(receipt))
    }

    /// Commit a batch. The caller must hold the sections of every wallet it posts to.
    pub(crate) fn commit(&self, batch: Batch) -> Result<CommitOutcome, EngineError> {
        let wallets = batch.wallets();
        let started = Instant::now();
        let result = self.store.commit(batch);
        self.cache.invalidate(wallets.iter().copied());
        match result {
            Ok(outcome) => {
                self.metrics
                    .record_commit(started.elapsed(), outcome.is_replay());
                debug!(
                    wallets = wallets.len(),
                    entries = outcome.receipt().entries.len(),
                    replay = outcome.is_replay(),
                    "batch committed"
                );
                Ok(outcome)
            }
            Err(StoreError::InvariantViolation { wallet, detail }) => {
                self.freeze(wallet, &detail);
                Err(EngineError::InvariantViolation { wallet, detail })
            }
            Err(err) => Err(err.into()),
        }
    }

    pub(crate) fn set_status(
        &self,
        wallet: WalletId,
        status: WalletStatus,
    ) -> Result<Wallet, EngineError> {
        let result = self.store.set_wallet_status(wallet, status, self.now());
        self.cache.invalidate([wallet]);
        Ok(result?)
    }

    fn freeze(&self, wallet: WalletId, detail: &str) {
        error!(%wallet, %detail, "ledger invariant violated, freezing wallet");
        let status = WalletStatus::Frozen {
            reason: detail.to_string(),
        };
        if let Err(err) = self.store.set_wallet_status(wallet, status, self.now()) {
            error!(%wallet, ?err, "failed to freeze wallet");
        }
        self.cache.invalidate([wallet]);
    }

    async fn single(
        &self,
        posting: Posting,
        key: IdempotencyKey,
        operation: OperationType,
    ) -> Result<Completion<BalanceChange>, EngineError> {
        let wallet = posting.wallet;
        let _guard = self.enter(&[wallet]).await?;
        let outcome = self.commit(
            Batch::new(self.now())
                .keyed(key.clone(), operation)
                .posting(posting),
        )?;
        let completion: Completion<CommitReceipt> = outcome.into();
        match completion {
            Completion::Applied(receipt) => BalanceChange::from_receipt(wallet, receipt)
                .map(Completion::Applied)
                .ok_or_else(|| {
                    StoreError::Corrupt(format!("receipt is missing wallet {wallet}")).into()
                }),
            Completion::IdempotentReplay(receipt) => Ok(Completion::IdempotentReplay(
                BalanceChange::from_replay(wallet, &key, operation, receipt)?,
            )),
        }
    }

    /// Rebuild the result of an earlier single-wallet operation from its receipt.
    pub(crate) fn replayed_change(
        &self,
        wallet: WalletId,
        key: &IdempotencyKey,
        operation: OperationType,
    ) -> Result<Option<BalanceChange>, EngineError> {
        self.replayed(key, operation)?
            .map(|receipt| BalanceChange::from_replay(wallet, key, operation, receipt))
            .transpose()
    }

    pub async fn deposit(
        &self,
        wallet: WalletId,
        amount: Amount,
        key: IdempotencyKey,
    ) -> Result<Completion<BalanceChange>, EngineError> {
        let posting = Posting::new(wallet, EntryType::Deposit, amount.get(), 0);
        self.single(posting, key, OperationType::Deposit).await
    }

    pub async fn withdraw(
        &self,
        wallet: WalletId,
        amount: Amount,
        key: IdempotencyKey,
    ) -> Result<Completion<BalanceChange>, EngineError> {
        let posting = Posting::new(wallet, EntryType::Withdrawal, -amount.get(), 0);
        self.single(posting, key, OperationType::Withdraw).await
    }

    /// Move funds from available to locked.
    pub async fn lock(
        &self,
        wallet: WalletId,
        amount: Amount,
        key: IdempotencyKey,
        bet: Option<BetId>,
    ) -> Result<Completion<BalanceChange>, EngineError> {
        let mut posting = Posting::new(wallet, EntryType::BetLock, -amount.get(), amount.get());
        posting.bet = bet;
        self.single(posting, key, OperationType::Lock).await
    }

    /// Move funds from locked back to available.
    pub async fn release(
        &self,
        wallet: WalletId,
        amount: Amount,
        key: IdempotencyKey,
        bet: Option<BetId>,
    ) -> Result<Completion<BalanceChange>, EngineError> {
        let mut posting =
            Posting::new(wallet, EntryType::BetRelease, amount.get(), -amount.get());
        posting.bet = bet;
        self.single(posting, key, OperationType::Release).await
    }

    /// Pay a pot out of escrow: losers forfeit their locked stakes, the winner receives the pot
    /// minus commission, and the platform wallet of the winner's currency takes the commission.
    pub async fn settle(
        &self,
        losers: &[Stake],
        winner: Stake,
        rate: CommissionRate,
        key: IdempotencyKey,
        bet: Option<BetId>,
    ) -> Result<Completion<Settlement>, EngineError> {
        let currency = self.wallet(winner.wallet)?.currency;
        for stake in losers {
            let wallet = self.wallet(stake.wallet)?;
            if wallet.currency != currency {
                return Err(EngineError::CurrencyMismatch {
                    wallet: wallet.id,
                    expected: currency,
                    actual: wallet.currency,
                });
            }
        }
        let platform = self.platform_wallet(currency)?.id;
        let (postings, pot, payout, commission) =
            settlement_postings(losers, winner, rate, platform, bet)?;

        let wallets: Vec<WalletId> = postings.iter().map(|posting| posting.wallet).collect();
        let _guard = self.enter(&wallets).await?;
        let mut batch = Batch::new(self.now()).keyed(key, OperationType::Settle);
        batch.postings = postings;
        let completion: Completion<CommitReceipt> = self.commit(batch)?.into();
        Ok(completion.map(|receipt| Settlement {
            winner: winner.wallet,
            pot,
            payout,
            commission,
            entries: receipt.entries,
            wallets: receipt.wallets,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn operator() -> BalanceOperator<MemoryStore> {
        BalanceOperator::new(
            Arc::new(MemoryStore::new()),
            Coordinator::new(Duration::from_secs(1)),
            Arc::new(BalanceCache::new(16)),
            Arc::new(EngineMetrics::default()),
            Arc::new(SystemClock),
            OwnerId(0),
            1_000_000,
        )
    }

    fn key(raw: &str) -> IdempotencyKey {
        IdempotencyKey::new(raw).unwrap()
    }

    fn amount(value: i64) -> Amount {
        Amount::new(value).unwrap()
    }

    #[test]
    fn settlement_postings_sum_to_zero() {
        let winner = Stake {
            wallet: WalletId(2),
            amount: amount(10_000),
        };
        let losers = [Stake {
            wallet: WalletId(3),
            amount: amount(10_000),
        }];
        let rate = CommissionRate::from_bps(500).unwrap();
        let (postings, pot, payout, commission) =
            settlement_postings(&losers, winner, rate, WalletId(1), None).unwrap();
        assert_eq!(pot.get(), 20_000);
        assert_eq!(payout, 19_000);
        assert_eq!(commission, 1_000);
        let net: i64 = postings
            .iter()
            .map(|p| p.available_delta + p.locked_delta)
            .sum();
        assert_eq!(net, 0);
    }

    #[test]
    fn zero_commission_skips_platform_posting() {
        let stake = |id| Stake {
            wallet: WalletId(id),
            amount: amount(10),
        };
        let (postings, ..) =
            settlement_postings(&[stake(3)], stake(2), CommissionRate::ZERO, WalletId(1), None)
                .unwrap();
        assert_eq!(postings.len(), 2);
        assert!(postings.iter().all(|p| p.wallet != WalletId(1)));
    }

    #[test]
    fn amount_respects_maximum() {
        let operator = operator();
        assert!(matches!(
            operator.amount(0),
            Err(EngineError::InvalidAmount(_))
        ));
        assert!(matches!(
            operator.amount(1_000_001),
            Err(EngineError::InvalidAmount(_))
        ));
        assert_eq!(operator.amount(1_000_000).unwrap().get(), 1_000_000);
    }

    #[tokio::test]
    async fn lock_and_release_move_between_buckets() {
        let operator = operator();
        let wallet = operator.ensure_wallet(OwnerId(7), Currency::USD).unwrap();
        operator
            .deposit(wallet.id, amount(500), key("d"))
            .await
            .unwrap();
        let locked = operator
            .lock(wallet.id, amount(200), key("l"), None)
            .await
            .unwrap()
            .into_inner();
        assert_eq!((locked.wallet.available, locked.wallet.locked), (300, 200));

        let released = operator
            .release(wallet.id, amount(50), key("r"), None)
            .await
            .unwrap()
            .into_inner();
        assert_eq!((released.wallet.available, released.wallet.locked), (350, 150));

        let err = operator
            .release(wallet.id, amount(151), key("r2"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InsufficientFunds { .. }));
    }

    #[tokio::test]
    async fn replay_against_another_wallet_is_rejected() {
        let operator = operator();
        let first = operator.ensure_wallet(OwnerId(1), Currency::USD).unwrap();
        let second = operator.ensure_wallet(OwnerId(2), Currency::USD).unwrap();
        operator
            .deposit(first.id, amount(500), key("dep-x"))
            .await
            .unwrap();

        let err = operator
            .deposit(second.id, amount(500), key("dep-x"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::IdempotencyKeyReused {
                operation: OperationType::Deposit,
                ..
            }
        ));
        assert_eq!(operator.wallet(second.id).unwrap().available, 0);
        assert_eq!(operator.wallet(first.id).unwrap().available, 500);
    }

    #[tokio::test]
    async fn settle_pays_winner_and_platform() {
        let operator = operator();
        let winner = operator.ensure_wallet(OwnerId(1), Currency::USD).unwrap();
        let loser = operator.ensure_wallet(OwnerId(2), Currency::USD).unwrap();
        for (wallet, tag) in [(winner.id, "w"), (loser.id, "l")] {
            operator
                .deposit(wallet, amount(10_000), key(&format!("dep-{tag}")))
                .await
                .unwrap();
            operator
                .lock(wallet, amount(10_000), key(&format!("lock-{tag}")), None)
                .await
                .unwrap();
        }

        let settlement = operator
            .settle(
                &[Stake {
                    wallet: loser.id,
                    amount: amount(10_000),
                }],
                Stake {
                    wallet: winner.id,
                    amount: amount(10_000),
                },
                CommissionRate::from_bps(500).unwrap(),
                key("settle"),
                None,
            )
            .await
            .unwrap();
        assert!(!settlement.is_replay());

        let winner = operator.wallet(winner.id).unwrap();
        assert_eq!((winner.available, winner.locked), (19_000, 0));
        let loser = operator.wallet(loser.id).unwrap();
        assert_eq!((loser.available, loser.locked), (0, 0));
        let platform = operator.platform_wallet(Currency::USD).unwrap();
        assert_eq!(platform.available, 1_000);
    }

    #[tokio::test]
    async fn tampered_wallet_is_frozen() {
        let operator = operator();
        let wallet = operator.ensure_wallet(OwnerId(1), Currency::USD).unwrap();
        operator
            .deposit(wallet.id, amount(100), key("d"))
            .await
            .unwrap();
        operator.store().tamper_balances(wallet.id, 5_000, 0);

        let err = operator
            .withdraw(wallet.id, amount(10), key("w"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvariantViolation { .. }));
        assert!(operator.wallet(wallet.id).unwrap().status.is_frozen());

        let err = operator
            .deposit(wallet.id, amount(10), key("d2"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::WalletFrozen { .. }));
    }
}
