use anyhow::Context;
use std::sync::Arc;
use tracing::{debug, info, warn};
use wagerbook_types::{
    BetId, BetOutcome, CommissionRate, Currency, IdempotencyKey, LedgerEntry, MinorUnits,
    OperationType, OwnerId, Wallet, WalletId, WalletStatus,
};

use crate::cache::BalanceCache;
use crate::clock::Clock;
use crate::config::ValidatedEngineConfig;
use crate::coordinator::Coordinator;
use crate::escrow::{Adjudication, BetUpdate, EscrowManager, NewBet, SweepReport};
use crate::gate::{Gate, ReviewQueue};
use crate::metrics::{EngineMetrics, EngineMetricsSnapshot};
use crate::operator::{BalanceChange, BalanceOperator, Settlement, Stake};
use crate::rate::RateGate;
use crate::reconcile::{reconcile, Reconciliation};
use crate::risk::{Eligibility, RiskEvaluator, RiskGate, RiskOperation};
use crate::store::LedgerStore;
use crate::{Completion, EngineError};

/// Entry point for callers: gates risk-bearing operations, then routes to the balance operator
/// or the escrow manager. Every failure is counted in [`EngineMetrics`].
pub struct Engine<S: LedgerStore> {
    operator: BalanceOperator<S>,
    escrow: EscrowManager<S>,
    gate: Gate,
    metrics: Arc<EngineMetrics>,
}

impl<S: LedgerStore> Engine<S> {
    /// Build the engine and make sure the platform wallet exists.
    ///
    /// `evaluator` backs any `model_based` risk gate in the configuration.
    pub fn new(
        store: Arc<S>,
        config: ValidatedEngineConfig,
        clock: Arc<dyn Clock>,
        evaluator: Option<Arc<dyn RiskEvaluator>>,
    ) -> anyhow::Result<Self> {
        let metrics = Arc::new(EngineMetrics::default());
        let operator = BalanceOperator::new(
            store,
            Coordinator::new(config.section_timeout),
            Arc::new(BalanceCache::new(config.cache_capacity)),
            metrics.clone(),
            clock,
            config.platform_owner,
            config.max_amount,
        );
        let risk = RiskGate::from_config(&config.risk, evaluator.as_ref())
            .context("failed to build risk gate")?;
        let gate = Gate::new(
            RateGate::new(config.rate_limit),
            risk,
            ReviewQueue::new(config.review_queue_capacity.get()),
            metrics.clone(),
        );
        let platform = operator
            .platform_wallet(config.currency)
            .context("failed to create platform wallet")?;
        info!(
            platform_wallet = %platform.id,
            currency = %config.currency,
            "engine ready"
        );
        let escrow = EscrowManager::new(operator.clone(), config.betting);
        Ok(Self {
            operator,
            escrow,
            gate,
            metrics,
        })
    }

    fn observe<T>(&self, result: Result<T, EngineError>) -> Result<T, EngineError> {
        if let Err(err) = &result {
            self.metrics.record_error(err);
        }
        result
    }

    pub fn store(&self) -> &Arc<S> {
        self.operator.store()
    }

    pub fn now(&self) -> u64 {
        self.operator.now()
    }

    pub fn escrow(&self) -> &EscrowManager<S> {
        &self.escrow
    }

    pub fn reviews(&self) -> &ReviewQueue {
        self.gate.reviews()
    }

    pub fn metrics(&self) -> EngineMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn ensure_wallet(&self, owner: OwnerId, currency: Currency) -> Result<Wallet, EngineError> {
        self.observe(self.operator.ensure_wallet(owner, currency))
    }

    pub fn wallet(&self, id: WalletId) -> Result<Wallet, EngineError> {
        self.operator.wallet(id)
    }

    pub fn wallet_by_owner(
        &self,
        owner: OwnerId,
        currency: Currency,
    ) -> Result<Option<Wallet>, EngineError> {
        Ok(self.store().wallet_by_owner(owner, currency)?)
    }

    pub fn entries(&self, id: WalletId) -> Result<Vec<LedgerEntry>, EngineError> {
        self.operator.wallet(id)?;
        Ok(self.store().entries(id)?)
    }

    async fn gated(
        &self,
        wallet: WalletId,
        operation: RiskOperation,
        amount: MinorUnits,
        key: IdempotencyKey,
        eligibility: Eligibility,
    ) -> Result<Completion<BalanceChange>, EngineError> {
        let amount = self.operator.amount(amount)?;
        let keyed = match operation {
            RiskOperation::Deposit => OperationType::Deposit,
            _ => OperationType::Withdraw,
        };
        if let Some(change) = self.operator.replayed_change(wallet, &key, keyed)? {
            debug!(%wallet, %key, "replayed before gate");
            return Ok(Completion::IdempotentReplay(change));
        }
        self.operator.wallet(wallet)?;
        let now = self.now();
        let decision = self
            .gate
            .admit(self.store().as_ref(), wallet, operation, amount, eligibility, now)
            .await?;

        let completion = match operation {
            RiskOperation::Deposit => self.operator.deposit(wallet, amount, key).await?,
            _ => self.operator.withdraw(wallet, amount, key).await?,
        };
        let change = completion.get();
        if !completion.is_replay() {
            self.gate.flag(wallet, operation, amount, &decision, now);
            info!(
                %wallet,
                %amount,
                ?operation,
                available = change.wallet.available,
                "balance updated"
            );
        }
        Ok(completion)
    }

    pub async fn deposit(
        &self,
        wallet: WalletId,
        amount: MinorUnits,
        key: IdempotencyKey,
        eligibility: Eligibility,
    ) -> Result<Completion<BalanceChange>, EngineError> {
        let result = self
            .gated(wallet, RiskOperation::Deposit, amount, key, eligibility)
            .await;
        self.observe(result)
    }

    pub async fn withdraw(
        &self,
        wallet: WalletId,
        amount: MinorUnits,
        key: IdempotencyKey,
        eligibility: Eligibility,
    ) -> Result<Completion<BalanceChange>, EngineError> {
        let result = self
            .gated(wallet, RiskOperation::Withdrawal, amount, key, eligibility)
            .await;
        self.observe(result)
    }

    pub async fn lock(
        &self,
        wallet: WalletId,
        amount: MinorUnits,
        key: IdempotencyKey,
    ) -> Result<Completion<BalanceChange>, EngineError> {
        let result = match self.operator.amount(amount) {
            Ok(amount) => self.operator.lock(wallet, amount, key, None).await,
            Err(err) => Err(err),
        };
        self.observe(result)
    }

    pub async fn release(
        &self,
        wallet: WalletId,
        amount: MinorUnits,
        key: IdempotencyKey,
    ) -> Result<Completion<BalanceChange>, EngineError> {
        let result = match self.operator.amount(amount) {
            Ok(amount) => self.operator.release(wallet, amount, key, None).await,
            Err(err) => Err(err),
        };
        self.observe(result)
    }

    pub async fn settle(
        &self,
        losers: &[Stake],
        winner: Stake,
        rate: CommissionRate,
        key: IdempotencyKey,
    ) -> Result<Completion<Settlement>, EngineError> {
        let result = self.operator.settle(losers, winner, rate, key, None).await;
        self.observe(result)
    }

    pub async fn create_bet(
        &self,
        new: NewBet,
        key: IdempotencyKey,
    ) -> Result<Completion<BetUpdate>, EngineError> {
        let result = self.escrow.create_bet(new, key).await;
        self.observe(result)
    }

    async fn gated_join(
        &self,
        bet: BetId,
        wallet: WalletId,
        key: IdempotencyKey,
        eligibility: Eligibility,
    ) -> Result<Completion<BetUpdate>, EngineError> {
        if let Some(replay) = self.escrow.replay(&key, OperationType::JoinBet, Some(bet))? {
            return Ok(replay);
        }
        let stake = self.escrow.bet(bet)?.stake;
        self.operator.wallet(wallet)?;
        let operation = RiskOperation::BetAcceptance;
        let now = self.now();
        let decision = self
            .gate
            .admit(self.store().as_ref(), wallet, operation, stake, eligibility, now)
            .await?;
        let completion = self.escrow.join_bet(bet, wallet, key).await?;
        if !completion.is_replay() {
            self.gate.flag(wallet, operation, stake, &decision, now);
        }
        Ok(completion)
    }

    /// Accept a pending bet on behalf of `wallet`, after the risk and rate gate.
    pub async fn join_bet(
        &self,
        bet: BetId,
        wallet: WalletId,
        key: IdempotencyKey,
        eligibility: Eligibility,
    ) -> Result<Completion<BetUpdate>, EngineError> {
        let result = self.gated_join(bet, wallet, key, eligibility).await;
        self.observe(result)
    }

    pub async fn activate_bet(
        &self,
        bet: BetId,
        actor: WalletId,
        key: IdempotencyKey,
    ) -> Result<Completion<BetUpdate>, EngineError> {
        let result = self.escrow.activate(bet, actor, key).await;
        self.observe(result)
    }

    pub async fn resolve_bet(
        &self,
        bet: BetId,
        outcome: BetOutcome,
        resolver: &str,
        key: IdempotencyKey,
    ) -> Result<Completion<BetUpdate>, EngineError> {
        let result = self.escrow.resolve(bet, outcome, resolver, key).await;
        self.observe(result)
    }

    pub async fn cancel_bet(
        &self,
        bet: BetId,
        actor: WalletId,
        key: IdempotencyKey,
    ) -> Result<Completion<BetUpdate>, EngineError> {
        let result = self.escrow.cancel(bet, actor, key).await;
        self.observe(result)
    }

    pub async fn refund_bet(
        &self,
        bet: BetId,
        actor: &str,
        reason: Option<String>,
        key: IdempotencyKey,
    ) -> Result<Completion<BetUpdate>, EngineError> {
        let result = self.escrow.refund(bet, actor, reason, key).await;
        self.observe(result)
    }

    pub async fn dispute_bet(
        &self,
        bet: BetId,
        actor: WalletId,
        reason: String,
        key: IdempotencyKey,
    ) -> Result<Completion<BetUpdate>, EngineError> {
        let result = self.escrow.dispute(bet, actor, reason, key).await;
        self.observe(result)
    }

    pub async fn adjudicate_bet(
        &self,
        bet: BetId,
        adjudicator: &str,
        decision: Adjudication,
        key: IdempotencyKey,
    ) -> Result<Completion<BetUpdate>, EngineError> {
        let result = self.escrow.adjudicate(bet, adjudicator, decision, key).await;
        self.observe(result)
    }

    /// Sweep elapsed deadlines and drop idle rate-limiter state.
    pub async fn expire_due(&self) -> Result<SweepReport, EngineError> {
        let result = self.escrow.expire_due().await;
        self.gate.rate().shrink();
        self.observe(result)
    }

    pub fn reconcile_wallet(&self, wallet: WalletId) -> Result<Reconciliation, EngineError> {
        reconcile(self.store().as_ref(), wallet)
    }

    /// Reactivate a frozen wallet once its ledger reconciles.
    pub async fn unfreeze_wallet(&self, wallet: WalletId) -> Result<Wallet, EngineError> {
        let _guard = self.operator.enter(&[wallet]).await?;
        let report = reconcile(self.store().as_ref(), wallet)?;
        if let Some(detail) = report.discrepancy {
            warn!(%wallet, %detail, "refusing to unfreeze wallet");
            return Err(EngineError::InvariantViolation { wallet, detail });
        }
        let wallet = self.operator.set_status(wallet, WalletStatus::Active)?;
        info!(wallet = %wallet.id, "wallet unfrozen");
        Ok(wallet)
    }
}
