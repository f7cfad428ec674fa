//! Bet lifecycle and escrow.
//!
//! Every transition runs inside the bet's critical section and commits one batch holding the
//! bet update, its audit transition, the balance postings, the hold changes, and the idempotency
//! record. Stakes are locked only when the last participant joins; if any stake cannot be locked
//! the batch aborts and no lock is ever visible.
//!
//! ```text
//! pending ──join (full)──▶ accepted ──activate──▶ active
//!    │                        │  │                  │
//!    ▼                        │  └──────┬───────────┘
//! cancelled                   ▼         ▼
//!                  resolved / refunded / expired / disputed ──adjudicate──▶ resolved / refunded
//! ```

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use wagerbook_types::{
    Amount, Bet, BetId, BetOutcome, BetStatus, BetTransition, CommissionRate, EntryType,
    EscrowHold, IdempotencyKey, LedgerEntry, MinorUnits, OperationType, Participant, WalletId,
    WalletStatus,
};

use crate::config::{AcceptFailurePolicy, BettingRules};
use crate::coordinator::LockKey;
use crate::operator::{settlement_postings, BalanceOperator, Stake};
use crate::store::{Batch, BetWrite, CommitReceipt, HoldChange, LedgerStore, NewHold, Posting};
use crate::{Completion, EngineError, StoreError};

const MAX_TITLE_LEN: usize = 200;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct NewBet {
    pub creator: WalletId,
    pub title: String,
    /// Stake every participant puts up, in minor units.
    pub stake: MinorUnits,
    #[serde(default)]
    pub commission_bps: Option<u16>,
    #[serde(default)]
    pub required_participants: Option<u8>,
    #[serde(default)]
    pub acceptance_deadline: Option<u64>,
    #[serde(default)]
    pub resolution_deadline: Option<u64>,
}

/// Decision of an adjudicator on a disputed bet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "decision", content = "wallet", rename_all = "snake_case")]
pub enum Adjudication {
    Winner(WalletId),
    Push,
    Refund,
}

/// State of a bet after a lifecycle operation, with what the operation wrote.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BetUpdate {
    pub bet: Bet,
    pub entries: Vec<LedgerEntry>,
    pub holds: Vec<EscrowHold>,
}

impl BetUpdate {
    fn from_receipt(receipt: CommitReceipt) -> Result<Self, EngineError> {
        let bet = receipt
            .bet
            .ok_or_else(|| StoreError::Corrupt("receipt is missing the bet".to_string()))?;
        Ok(Self {
            bet,
            entries: receipt.entries,
            holds: receipt.holds,
        })
    }
}

fn into_update(
    completion: Completion<CommitReceipt>,
) -> Result<Completion<BetUpdate>, EngineError> {
    Ok(match completion {
        Completion::Applied(receipt) => Completion::Applied(BetUpdate::from_receipt(receipt)?),
        Completion::IdempotentReplay(receipt) => {
            Completion::IdempotentReplay(BetUpdate::from_receipt(receipt)?)
        }
    })
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub cancelled: Vec<BetId>,
    pub expired: Vec<BetId>,
    pub failed: Vec<BetId>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.cancelled.is_empty() && self.expired.is_empty() && self.failed.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Effect {
    None,
    Settled(MinorUnits),
    Refunded,
}

/// The next state of a bet and the writes that take it there.
struct Plan {
    bet: Bet,
    postings: Vec<Posting>,
    holds: HoldChange,
    actor: Option<String>,
    reason: Option<String>,
    effect: Effect,
}

impl Plan {
    fn new(bet: Bet) -> Self {
        Self {
            bet,
            postings: Vec::new(),
            holds: HoldChange::None,
            actor: None,
            reason: None,
            effect: Effect::None,
        }
    }

    fn by(mut self, actor: impl ToString) -> Self {
        self.actor = Some(actor.to_string());
        self
    }

    fn because(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    fn wallets(&self) -> Vec<WalletId> {
        self.postings.iter().map(|posting| posting.wallet).collect()
    }

    fn into_batch(
        self,
        current: &Bet,
        key: Option<(IdempotencyKey, OperationType)>,
        now: u64,
    ) -> Batch {
        let Plan {
            bet,
            postings,
            holds,
            actor,
            reason,
            ..
        } = self;
        let transition = (bet.status != current.status).then(|| BetTransition {
            bet: current.id,
            from: Some(current.status),
            to: bet.status,
            actor,
            reason,
            at: now,
        });
        Batch {
            postings,
            bet: Some(BetWrite::Update {
                bet,
                expected_version: current.version,
            }),
            holds,
            transition,
            idempotency: key,
            now,
        }
    }
}

fn conflict(bet: &Bet, action: &'static str) -> EngineError {
    EngineError::BetStateConflict {
        bet: bet.id,
        status: bet.status,
        action,
    }
}

fn refund_postings(bet: BetId, holds: &[EscrowHold]) -> Vec<Posting> {
    holds
        .iter()
        .filter(|hold| hold.is_open())
        .map(|hold| {
            Posting::new(
                hold.wallet,
                EntryType::Refund,
                hold.amount.get(),
                -hold.amount.get(),
            )
            .for_bet(bet)
        })
        .collect()
}

pub struct EscrowManager<S: LedgerStore> {
    operator: BalanceOperator<S>,
    rules: BettingRules,
}

impl<S: LedgerStore> EscrowManager<S> {
    pub fn new(operator: BalanceOperator<S>, rules: BettingRules) -> Self {
        Self { operator, rules }
    }

    pub fn rules(&self) -> &BettingRules {
        &self.rules
    }

    pub fn bet(&self, id: BetId) -> Result<Bet, EngineError> {
        self.operator
            .store()
            .bet(id)?
            .ok_or(EngineError::BetNotFound(id))
    }

    pub fn holds(&self, id: BetId) -> Result<Vec<EscrowHold>, EngineError> {
        Ok(self.operator.store().holds(id)?)
    }

    pub fn transitions(&self, id: BetId) -> Result<Vec<BetTransition>, EngineError> {
        Ok(self.operator.store().transitions(id)?)
    }

    pub fn bets_for_wallet(&self, wallet: WalletId) -> Result<Vec<Bet>, EngineError> {
        Ok(self.operator.store().bets_for_wallet(wallet)?)
    }

    /// Pending bets still waiting for participants.
    pub fn open_bets(&self) -> Result<Vec<Bet>, EngineError> {
        Ok(self.operator.store().bets_with_status(BetStatus::Pending)?)
    }

    fn validate_stake(&self, stake: MinorUnits) -> Result<Amount, EngineError> {
        let stake = Amount::new(stake)?;
        if stake < self.rules.min_stake || stake > self.rules.max_stake {
            return Err(EngineError::InvalidBet(format!(
                "stake {stake} outside [{}, {}]",
                self.rules.min_stake, self.rules.max_stake
            )));
        }
        Ok(stake)
    }

    /// The recorded result for `key`. When `bet` is given, the key must have been used on it.
    pub(crate) fn replay(
        &self,
        key: &IdempotencyKey,
        operation: OperationType,
        bet: Option<BetId>,
    ) -> Result<Option<Completion<BetUpdate>>, EngineError> {
        let Some(receipt) = self.operator.replayed(key, operation)? else {
            return Ok(None);
        };
        let update = BetUpdate::from_receipt(receipt)?;
        if let Some(requested) = bet.filter(|id| *id != update.bet.id) {
            return Err(EngineError::IdempotencyKeyReused {
                key: key.to_string(),
                operation,
                recorded: format!("bet {}", update.bet.id),
                requested: format!("bet {requested}"),
            });
        }
        debug!(%key, %operation, "bet operation replayed");
        Ok(Some(Completion::IdempotentReplay(update)))
    }

    pub async fn create_bet(
        &self,
        new: NewBet,
        key: IdempotencyKey,
    ) -> Result<Completion<BetUpdate>, EngineError> {
        if let Some(replay) = self.replay(&key, OperationType::CreateBet, None)? {
            return Ok(replay);
        }
        let now = self.operator.now();
        let stake = self.validate_stake(new.stake)?;
        let commission = match new.commission_bps {
            Some(bps) => CommissionRate::from_bps(bps)?,
            None => self.rules.default_commission,
        };
        let required = new.required_participants.unwrap_or(2);
        if required < 2 || required > self.rules.max_participants {
            return Err(EngineError::InvalidBet(format!(
                "required participants must be in [2, {}] (got {required})",
                self.rules.max_participants
            )));
        }
        let title = new.title.trim();
        if title.is_empty() || title.len() > MAX_TITLE_LEN {
            return Err(EngineError::InvalidBet(format!(
                "title must be 1..={MAX_TITLE_LEN} bytes"
            )));
        }
        if new.acceptance_deadline.is_some_and(|deadline| deadline <= now) {
            return Err(EngineError::InvalidBet(
                "acceptance deadline is in the past".to_string(),
            ));
        }
        if let Some(resolution) = new.resolution_deadline {
            let floor = new.acceptance_deadline.unwrap_or(now);
            if resolution <= floor {
                return Err(EngineError::InvalidBet(
                    "resolution deadline must follow acceptance".to_string(),
                ));
            }
        }

        let creator = self.operator.wallet(new.creator)?;
        if let WalletStatus::Frozen { reason } = creator.status {
            return Err(EngineError::WalletFrozen {
                wallet: creator.id,
                reason,
            });
        }

        let bet = Bet {
            id: BetId(0),
            creator: creator.id,
            title: title.to_string(),
            currency: creator.currency,
            stake,
            commission,
            required_participants: required,
            participants: vec![Participant {
                wallet: creator.id,
                stake,
                joined_at: now,
            }],
            status: BetStatus::Pending,
            outcome: BetOutcome::Undecided,
            created_at: now,
            acceptance_deadline: new.acceptance_deadline,
            resolution_deadline: new.resolution_deadline,
            resolved_at: None,
            version: 0,
        };
        let batch = Batch {
            bet: Some(BetWrite::Insert(bet)),
            transition: Some(BetTransition {
                bet: BetId(0),
                from: None,
                to: BetStatus::Pending,
                actor: Some(creator.id.to_string()),
                reason: None,
                at: now,
            }),
            ..Batch::new(now).keyed(key, OperationType::CreateBet)
        };
        let completion = into_update(self.operator.commit(batch)?.into())?;
        if let Completion::Applied(update) = &completion {
            info!(bet = %update.bet.id, creator = %creator.id, %stake, "bet created");
        }
        Ok(completion)
    }

    /// Run one lifecycle transition of an existing bet.
    async fn apply<F>(
        &self,
        id: BetId,
        key: IdempotencyKey,
        operation: OperationType,
        action: &'static str,
        plan: F,
    ) -> Result<Completion<BetUpdate>, EngineError>
    where
        F: FnOnce(Bet, u64) -> Result<Plan, EngineError>,
    {
        let _bet = self
            .operator
            .coordinator()
            .acquire(vec![LockKey::Bet(id)])
            .await?;
        if let Some(replay) = self.replay(&key, operation, Some(id))? {
            return Ok(replay);
        }
        let current = self.bet(id)?;
        let now = self.operator.now();
        let plan = plan(current.clone(), now)?;
        let next = plan.bet.status;
        if next != current.status && !current.status.can_transition_to(next) {
            return Err(conflict(&current, action));
        }
        let effect = plan.effect;

        let wallets = plan.wallets();
        let _wallets = self.operator.enter(&wallets).await?;
        let batch = plan.into_batch(&current, Some((key, operation)), now);
        let completion = into_update(self.operator.commit(batch)?.into())?;
        if !completion.is_replay() {
            info!(bet = %id, from = %current.status, to = %next, action, "bet transition");
            match effect {
                Effect::Settled(commission) => {
                    self.operator.metrics().record_settlement(commission)
                }
                Effect::Refunded => self.operator.metrics().record_refund(),
                Effect::None => {}
            }
        }
        Ok(completion)
    }

    fn open_holds(&self, bet: BetId) -> Result<Vec<EscrowHold>, EngineError> {
        let mut holds = self.holds(bet)?;
        holds.retain(EscrowHold::is_open);
        Ok(holds)
    }

    fn refund_plan(&self, mut bet: Bet, status: BetStatus) -> Result<Plan, EngineError> {
        let holds = self.open_holds(bet.id)?;
        let postings = refund_postings(bet.id, &holds);
        let id = bet.id;
        bet.status = status;
        Ok(Plan {
            postings,
            holds: HoldChange::ReleaseAll(id),
            effect: Effect::Refunded,
            ..Plan::new(bet)
        })
    }

    fn resolution_plan(
        &self,
        mut bet: Bet,
        outcome: BetOutcome,
        now: u64,
    ) -> Result<Plan, EngineError> {
        let holds = self.open_holds(bet.id)?;
        let id = bet.id;
        let (postings, effect) = match outcome {
            BetOutcome::Undecided => {
                return Err(EngineError::InvalidBet(
                    "resolution needs a winner or a push".to_string(),
                ))
            }
            BetOutcome::Push => (refund_postings(id, &holds), Effect::Settled(0)),
            BetOutcome::Winner(winner) => {
                if !bet.is_participant(winner) {
                    return Err(EngineError::InvalidBet(format!(
                        "winner {winner} is not a participant of bet {id}"
                    )));
                }
                let stake = |hold: &EscrowHold| Stake {
                    wallet: hold.wallet,
                    amount: hold.amount,
                };
                let winner_stake = holds
                    .iter()
                    .find(|hold| hold.wallet == winner)
                    .map(stake)
                    .ok_or_else(|| {
                        EngineError::InvalidBet(format!("winner {winner} holds no stake"))
                    })?;
                let losers: Vec<Stake> = holds
                    .iter()
                    .filter(|hold| hold.wallet != winner)
                    .map(stake)
                    .collect();
                let platform = self.operator.platform_wallet(bet.currency)?.id;
                let (postings, _, _, commission) = settlement_postings(
                    &losers,
                    winner_stake,
                    bet.commission,
                    platform,
                    Some(id),
                )?;
                (postings, Effect::Settled(commission))
            }
        };
        bet.status = BetStatus::Resolved;
        bet.outcome = outcome;
        bet.resolved_at = Some(now);
        Ok(Plan {
            postings,
            holds: HoldChange::ReleaseAll(id),
            effect,
            ..Plan::new(bet)
        })
    }

    /// Add `wallet` to a pending bet. When it is the last required participant, every stake is
    /// locked and the bet becomes accepted in the same commit.
    pub async fn join_bet(
        &self,
        id: BetId,
        wallet: WalletId,
        key: IdempotencyKey,
    ) -> Result<Completion<BetUpdate>, EngineError> {
        let _bet = self
            .operator
            .coordinator()
            .acquire(vec![LockKey::Bet(id)])
            .await?;
        if let Some(replay) = self.replay(&key, OperationType::JoinBet, Some(id))? {
            return Ok(replay);
        }
        let current = self.bet(id)?;
        let now = self.operator.now();
        if current.status != BetStatus::Pending || current.is_full() {
            return Err(conflict(&current, "join"));
        }
        if current
            .acceptance_deadline
            .is_some_and(|deadline| deadline <= now)
        {
            return Err(EngineError::InvalidBet(format!(
                "acceptance deadline of bet {id} has passed"
            )));
        }
        if current.is_participant(wallet) {
            return Err(EngineError::InvalidBet(format!(
                "wallet {wallet} already joined bet {id}"
            )));
        }
        let joiner = self.operator.wallet(wallet)?;
        if joiner.currency != current.currency {
            return Err(EngineError::CurrencyMismatch {
                wallet,
                expected: current.currency,
                actual: joiner.currency,
            });
        }
        if let WalletStatus::Frozen { reason } = joiner.status {
            return Err(EngineError::WalletFrozen { wallet, reason });
        }

        let mut next = current.clone();
        next.participants.push(Participant {
            wallet,
            stake: current.stake,
            joined_at: now,
        });
        let accepting = next.is_full();
        let mut plan = Plan::new(next).by(wallet);
        if accepting {
            plan.postings = plan
                .bet
                .participants
                .iter()
                .map(|p| {
                    Posting::new(p.wallet, EntryType::BetLock, -p.stake.get(), p.stake.get())
                        .for_bet(id)
                })
                .collect();
            plan.holds = HoldChange::Open(
                plan.bet
                    .participants
                    .iter()
                    .map(|p| NewHold {
                        bet: id,
                        wallet: p.wallet,
                        amount: p.stake,
                    })
                    .collect(),
            );
            plan.bet.status = BetStatus::Accepted;
        }

        let wallets = plan.wallets();
        let _wallets = self.operator.enter(&wallets).await?;
        let batch = plan.into_batch(&current, Some((key, OperationType::JoinBet)), now);
        match self.operator.commit(batch) {
            Ok(outcome) => {
                let completion = into_update(outcome.into())?;
                if !completion.is_replay() {
                    info!(bet = %id, %wallet, accepted = accepting, "participant joined");
                }
                Ok(completion)
            }
            Err(
                err @ (EngineError::InsufficientFunds { .. } | EngineError::WalletFrozen { .. }),
            ) if accepting => {
                warn!(bet = %id, %wallet, %err, "stake lock failed on acceptance");
                if self.rules.on_accept_failure == AcceptFailurePolicy::Cancel {
                    self.cancel_failed_acceptance(&current, &err, now);
                }
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Cancel a pending bet whose acceptance failed. Caller holds the bet's section.
    fn cancel_failed_acceptance(&self, current: &Bet, cause: &EngineError, now: u64) {
        let mut bet = current.clone();
        bet.status = BetStatus::Cancelled;
        let batch = Plan::new(bet)
            .because(format!("stake lock failed: {cause}"))
            .into_batch(current, None, now);
        match self.operator.commit(batch) {
            Ok(_) => info!(bet = %current.id, "bet cancelled after failed acceptance"),
            Err(err) => warn!(bet = %current.id, %err, "failed to cancel bet"),
        }
    }

    pub async fn activate(
        &self,
        id: BetId,
        actor: WalletId,
        key: IdempotencyKey,
    ) -> Result<Completion<BetUpdate>, EngineError> {
        self.apply(id, key, OperationType::ActivateBet, "activate", |mut bet, _| {
            if !bet.is_participant(actor) {
                return Err(EngineError::Unauthorized {
                    actor: actor.to_string(),
                    action: "activate bet",
                });
            }
            if bet.status != BetStatus::Accepted {
                return Err(conflict(&bet, "activate"));
            }
            bet.status = BetStatus::Active;
            Ok(Plan::new(bet).by(actor))
        })
        .await
    }

    /// Settle an accepted or active bet with an authoritative outcome.
    pub async fn resolve(
        &self,
        id: BetId,
        outcome: BetOutcome,
        resolver: &str,
        key: IdempotencyKey,
    ) -> Result<Completion<BetUpdate>, EngineError> {
        self.apply(id, key, OperationType::ResolveBet, "resolve", |bet, now| {
            if !matches!(bet.status, BetStatus::Accepted | BetStatus::Active) {
                return Err(conflict(&bet, "resolve"));
            }
            Ok(self.resolution_plan(bet, outcome, now)?.by(resolver))
        })
        .await
    }

    /// Withdraw a bet. Only its creator may cancel. A pending bet is cancelled outright; an
    /// accepted or active bet is refunded.
    pub async fn cancel(
        &self,
        id: BetId,
        actor: WalletId,
        key: IdempotencyKey,
    ) -> Result<Completion<BetUpdate>, EngineError> {
        self.apply(id, key, OperationType::CancelBet, "cancel", |mut bet, _| {
            if bet.creator != actor {
                return Err(EngineError::Unauthorized {
                    actor: actor.to_string(),
                    action: "cancel bet",
                });
            }
            let plan = match bet.status {
                BetStatus::Pending => {
                    bet.status = BetStatus::Cancelled;
                    Plan::new(bet)
                }
                BetStatus::Accepted | BetStatus::Active => {
                    self.refund_plan(bet, BetStatus::Refunded)?
                }
                _ => return Err(conflict(&bet, "cancel")),
            };
            Ok(plan.by(actor).because("cancelled by creator"))
        })
        .await
    }

    /// Return every stake of an accepted or active bet to its owner.
    pub async fn refund(
        &self,
        id: BetId,
        actor: &str,
        reason: Option<String>,
        key: IdempotencyKey,
    ) -> Result<Completion<BetUpdate>, EngineError> {
        self.apply(id, key, OperationType::RefundBet, "refund", |bet, _| {
            if !matches!(bet.status, BetStatus::Accepted | BetStatus::Active) {
                return Err(conflict(&bet, "refund"));
            }
            let mut plan = self.refund_plan(bet, BetStatus::Refunded)?.by(actor);
            plan.reason = reason;
            Ok(plan)
        })
        .await
    }

    /// Contest the outcome of a bet. Freezes it until adjudicated.
    pub async fn dispute(
        &self,
        id: BetId,
        actor: WalletId,
        reason: String,
        key: IdempotencyKey,
    ) -> Result<Completion<BetUpdate>, EngineError> {
        self.apply(id, key, OperationType::DisputeBet, "dispute", |mut bet, _| {
            if !bet.is_participant(actor) {
                return Err(EngineError::Unauthorized {
                    actor: actor.to_string(),
                    action: "dispute bet",
                });
            }
            if !matches!(bet.status, BetStatus::Accepted | BetStatus::Active) {
                return Err(conflict(&bet, "dispute"));
            }
            bet.status = BetStatus::Disputed;
            Ok(Plan::new(bet).by(actor).because(reason))
        })
        .await
    }

    /// Close a disputed bet. `adjudicator` must be on the configured allow-list.
    pub async fn adjudicate(
        &self,
        id: BetId,
        adjudicator: &str,
        decision: Adjudication,
        key: IdempotencyKey,
    ) -> Result<Completion<BetUpdate>, EngineError> {
        if !self.rules.adjudicators.contains(adjudicator) {
            return Err(EngineError::Unauthorized {
                actor: adjudicator.to_string(),
                action: "adjudicate bet",
            });
        }
        self.apply(id, key, OperationType::AdjudicateBet, "adjudicate", |bet, now| {
            if bet.status != BetStatus::Disputed {
                return Err(conflict(&bet, "adjudicate"));
            }
            let plan = match decision {
                Adjudication::Winner(wallet) => {
                    self.resolution_plan(bet, BetOutcome::Winner(wallet), now)?
                }
                Adjudication::Push => self.resolution_plan(bet, BetOutcome::Push, now)?,
                Adjudication::Refund => self.refund_plan(bet, BetStatus::Refunded)?,
            };
            Ok(plan.by(adjudicator).because("adjudicated"))
        })
        .await
    }

    /// Close every bet whose deadline has elapsed: pending bets are cancelled, accepted and
    /// active bets expire with their stakes refunded. Disputed bets are left alone.
    pub async fn expire_due(&self) -> Result<SweepReport, EngineError> {
        let now = self.operator.now();
        let due = self.operator.store().bets_due(now)?;
        let mut report = SweepReport::default();
        for bet in due {
            let (target, operation) = match bet.status {
                BetStatus::Pending => (BetStatus::Cancelled, OperationType::CancelBet),
                _ => (BetStatus::Expired, OperationType::RefundBet),
            };
            let key = IdempotencyKey::new(format!("sweep:{}:{}", bet.id, target))?;
            let result = self
                .apply(bet.id, key, operation, "expire", |current, now| {
                    match current.status {
                        BetStatus::Pending
                            if current
                                .acceptance_deadline
                                .is_some_and(|deadline| deadline <= now) =>
                        {
                            let mut next = current;
                            next.status = BetStatus::Cancelled;
                            Ok(Plan::new(next).because("acceptance deadline elapsed"))
                        }
                        BetStatus::Accepted | BetStatus::Active
                            if current
                                .resolution_deadline
                                .is_some_and(|deadline| deadline <= now) =>
                        {
                            Ok(self
                                .refund_plan(current, BetStatus::Expired)?
                                .because("resolution deadline elapsed"))
                        }
                        _ => Err(conflict(&current, "expire")),
                    }
                })
                .await;
            match result {
                Ok(_) if target == BetStatus::Cancelled => report.cancelled.push(bet.id),
                Ok(_) => report.expired.push(bet.id),
                // Moved on since the scan.
                Err(EngineError::BetStateConflict { .. }) => {}
                Err(err) => {
                    warn!(bet = %bet.id, %err, "failed to expire bet");
                    report.failed.push(bet.id);
                }
            }
        }
        if !report.is_empty() {
            info!(
                cancelled = report.cancelled.len(),
                expired = report.expired.len(),
                failed = report.failed.len(),
                "deadline sweep"
            );
        }
        Ok(report)
    }
}
