//! Durable ledger storage.
//!
//! A [`LedgerStore`] owns wallet balances, the append-only ledger, bets, escrow holds, the bet
//! audit trail, and idempotency records. All mutation goes through [`LedgerStore::commit`], which
//! applies a [`Batch`] as one transaction: either every posting, bet write, hold change,
//! transition, and idempotency record lands, or none does.
//!
//! Inside the transaction, and before anything is written, a commit:
//! 1. returns the recorded receipt if the batch's idempotency key was already used;
//! 2. for each posting, rejects frozen wallets, verifies the stored balances against the last
//!    ledger entry, and applies the deltas without letting either bucket go negative;
//! 3. rejects bet updates whose expected version is stale.

use serde::{Deserialize, Serialize};
use wagerbook_types::{
    Amount, Bet, BetId, BetStatus, BetTransition, Bucket, Currency, EntryId, EntryType,
    EscrowHold, IdempotencyKey, IdempotencyRecord, LedgerEntry, MinorUnits, OperationType,
    OwnerId, Wallet, WalletId, WalletStatus,
};

use crate::StoreError;

#[cfg(any(test, feature = "mocks"))]
mod memory;
mod sqlite;

#[cfg(any(test, feature = "mocks"))]
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// One balance movement against one wallet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Posting {
    pub wallet: WalletId,
    pub entry_type: EntryType,
    pub available_delta: MinorUnits,
    pub locked_delta: MinorUnits,
    pub bet: Option<BetId>,
}

impl Posting {
    pub fn new(
        wallet: WalletId,
        entry_type: EntryType,
        available_delta: MinorUnits,
        locked_delta: MinorUnits,
    ) -> Self {
        Self {
            wallet,
            entry_type,
            available_delta,
            locked_delta,
            bet: None,
        }
    }

    pub fn for_bet(mut self, bet: BetId) -> Self {
        self.bet = Some(bet);
        self
    }
}

#[derive(Clone, Debug)]
pub enum BetWrite {
    /// Persist a new bet. The store assigns its id and sets its version to 1.
    Insert(Bet),
    /// Replace a bet, provided its stored version still equals `expected_version`.
    Update { bet: Bet, expected_version: u64 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewHold {
    pub bet: BetId,
    pub wallet: WalletId,
    pub amount: Amount,
}

#[derive(Clone, Debug, Default)]
pub enum HoldChange {
    #[default]
    None,
    Open(Vec<NewHold>),
    /// Mark every open hold of the bet released.
    ReleaseAll(BetId),
}

/// Everything one logical operation writes.
#[derive(Clone, Debug, Default)]
pub struct Batch {
    pub postings: Vec<Posting>,
    pub bet: Option<BetWrite>,
    pub holds: HoldChange,
    /// For [`BetWrite::Insert`] the transition's bet id is replaced by the assigned id.
    pub transition: Option<BetTransition>,
    pub idempotency: Option<(IdempotencyKey, OperationType)>,
    pub now: u64,
}

impl Batch {
    pub fn new(now: u64) -> Self {
        Self {
            now,
            ..Default::default()
        }
    }

    pub fn keyed(mut self, key: IdempotencyKey, operation: OperationType) -> Self {
        self.idempotency = Some((key, operation));
        self
    }

    pub fn posting(mut self, posting: Posting) -> Self {
        self.postings.push(posting);
        self
    }

    /// Wallets touched by the batch's postings, deduplicated in first-touch order.
    pub fn wallets(&self) -> Vec<WalletId> {
        let mut wallets = Vec::with_capacity(self.postings.len());
        for posting in &self.postings {
            if !wallets.contains(&posting.wallet) {
                wallets.push(posting.wallet);
            }
        }
        wallets
    }
}

/// What a committed batch produced. Stored verbatim as the idempotency snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitReceipt {
    pub entries: Vec<LedgerEntry>,
    /// Final state of every wallet the batch touched.
    pub wallets: Vec<Wallet>,
    pub bet: Option<Bet>,
    pub holds: Vec<EscrowHold>,
    pub committed_at: u64,
}

impl CommitReceipt {
    pub fn wallet(&self, id: WalletId) -> Option<&Wallet> {
        self.wallets.iter().find(|wallet| wallet.id == id)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    Applied(CommitReceipt),
    /// The idempotency key was already recorded; nothing was written.
    Replayed(CommitReceipt),
}

impl CommitOutcome {
    pub fn receipt(&self) -> &CommitReceipt {
        match self {
            CommitOutcome::Applied(receipt) | CommitOutcome::Replayed(receipt) => receipt,
        }
    }

    pub fn is_replay(&self) -> bool {
        matches!(self, CommitOutcome::Replayed(_))
    }
}

/// Durable system of record for balances and bets.
///
/// Calls are synchronous and short. Implementations must make every successful [`commit`]
/// durable before returning.
///
/// [`commit`]: LedgerStore::commit
pub trait LedgerStore: Send + Sync + 'static {
    /// Return the wallet for `(owner, currency)`, creating an empty one if absent.
    fn ensure_wallet(
        &self,
        owner: OwnerId,
        currency: Currency,
        now: u64,
    ) -> Result<Wallet, StoreError>;
    fn wallet(&self, id: WalletId) -> Result<Option<Wallet>, StoreError>;
    fn wallet_by_owner(
        &self,
        owner: OwnerId,
        currency: Currency,
    ) -> Result<Option<Wallet>, StoreError>;
    fn set_wallet_status(
        &self,
        id: WalletId,
        status: WalletStatus,
        now: u64,
    ) -> Result<Wallet, StoreError>;

    /// Ledger entries of a wallet in append order.
    fn entries(&self, wallet: WalletId) -> Result<Vec<LedgerEntry>, StoreError>;
    /// Sum of `|available_delta|` over entries of `entry_type` created at or after `since`.
    fn entry_volume_since(
        &self,
        wallet: WalletId,
        entry_type: EntryType,
        since: u64,
    ) -> Result<MinorUnits, StoreError>;

    fn idempotency_record(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, StoreError>;

    fn bet(&self, id: BetId) -> Result<Option<Bet>, StoreError>;
    fn bets_for_wallet(&self, wallet: WalletId) -> Result<Vec<Bet>, StoreError>;
    fn bets_with_status(&self, status: BetStatus) -> Result<Vec<Bet>, StoreError>;
    /// Pending bets past their acceptance deadline and accepted/active bets past their
    /// resolution deadline.
    fn bets_due(&self, now: u64) -> Result<Vec<Bet>, StoreError>;
    fn holds(&self, bet: BetId) -> Result<Vec<EscrowHold>, StoreError>;
    fn transitions(&self, bet: BetId) -> Result<Vec<BetTransition>, StoreError>;

    fn commit(&self, batch: Batch) -> Result<CommitOutcome, StoreError>;

    /// Apply a single posting and return the wallet's new state with the entry id.
    fn append(
        &self,
        posting: Posting,
        idempotency: Option<(IdempotencyKey, OperationType)>,
        now: u64,
    ) -> Result<(Wallet, EntryId), StoreError> {
        let wallet_id = posting.wallet;
        let mut batch = Batch::new(now).posting(posting);
        batch.idempotency = idempotency;
        let outcome = self.commit(batch)?;
        let receipt = outcome.receipt();
        let wallet = receipt
            .wallet(wallet_id)
            .cloned()
            .ok_or_else(|| StoreError::Corrupt("receipt missing wallet".to_string()))?;
        let entry = receipt
            .entries
            .first()
            .map(|entry| entry.id)
            .ok_or_else(|| StoreError::Corrupt("receipt missing entry".to_string()))?;
        Ok((wallet, entry))
    }
}

/// Storage primitives available inside one open transaction.
pub(crate) trait Txn {
    fn idempotency_record(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, StoreError>;
    fn wallet(&self, id: WalletId) -> Result<Option<Wallet>, StoreError>;
    fn last_entry(&self, wallet: WalletId) -> Result<Option<LedgerEntry>, StoreError>;
    fn put_wallet(&mut self, wallet: &Wallet) -> Result<(), StoreError>;
    /// Persist `entry`, ignoring its id, and return it with the assigned id.
    fn append_entry(&mut self, entry: LedgerEntry) -> Result<LedgerEntry, StoreError>;
    fn bet(&self, id: BetId) -> Result<Option<Bet>, StoreError>;
    fn insert_bet(&mut self, bet: Bet) -> Result<Bet, StoreError>;
    fn update_bet(&mut self, bet: &Bet) -> Result<(), StoreError>;
    fn insert_hold(&mut self, hold: NewHold, now: u64) -> Result<EscrowHold, StoreError>;
    fn release_holds(&mut self, bet: BetId, now: u64) -> Result<Vec<EscrowHold>, StoreError>;
    fn insert_transition(&mut self, transition: &BetTransition) -> Result<(), StoreError>;
    fn insert_idempotency(&mut self, record: &IdempotencyRecord) -> Result<(), StoreError>;
}

/// Apply `batch` inside `txn`. The caller commits the transaction on `Ok` and rolls it back on
/// `Err`.
pub(crate) fn apply_batch<T: Txn>(txn: &mut T, batch: Batch) -> Result<CommitOutcome, StoreError> {
    let Batch {
        postings,
        bet,
        holds,
        transition,
        idempotency,
        now,
    } = batch;

    if let Some((key, operation)) = &idempotency {
        if let Some(record) = txn.idempotency_record(key)? {
            if record.operation != *operation {
                return Err(StoreError::IdempotencyConflict {
                    key: key.to_string(),
                    recorded: record.operation,
                    requested: *operation,
                });
            }
            let receipt: CommitReceipt = serde_json::from_str(&record.result_snapshot)?;
            return Ok(CommitOutcome::Replayed(receipt));
        }
    }

    let mut receipt = CommitReceipt {
        committed_at: now,
        ..Default::default()
    };

    let mut inserted_bet = None;
    match bet {
        Some(BetWrite::Insert(mut bet)) => {
            bet.version = 1;
            let stored = txn.insert_bet(bet)?;
            inserted_bet = Some(stored.id);
            receipt.bet = Some(stored);
        }
        Some(BetWrite::Update {
            mut bet,
            expected_version,
        }) => {
            let current = txn.bet(bet.id)?.ok_or(StoreError::BetNotFound(bet.id))?;
            if current.version != expected_version {
                return Err(StoreError::StaleBet {
                    bet: bet.id,
                    expected: expected_version,
                    found: current.version,
                });
            }
            bet.version = expected_version + 1;
            txn.update_bet(&bet)?;
            receipt.bet = Some(bet);
        }
        None => {}
    }

    let reference = idempotency.as_ref().map(|(key, _)| key.to_string());
    for posting in postings {
        let (wallet, entry) = apply_posting(txn, posting, reference.clone(), now)?;
        match receipt.wallets.iter_mut().find(|w| w.id == wallet.id) {
            Some(slot) => *slot = wallet,
            None => receipt.wallets.push(wallet),
        }
        receipt.entries.push(entry);
    }

    match holds {
        HoldChange::None => {}
        HoldChange::Open(new_holds) => {
            for hold in new_holds {
                receipt.holds.push(txn.insert_hold(hold, now)?);
            }
        }
        HoldChange::ReleaseAll(bet) => {
            receipt.holds = txn.release_holds(bet, now)?;
        }
    }

    if let Some(mut transition) = transition {
        if let Some(id) = inserted_bet {
            transition.bet = id;
        }
        txn.insert_transition(&transition)?;
    }

    if let Some((key, operation)) = idempotency {
        let record = IdempotencyRecord {
            key,
            operation,
            result_snapshot: serde_json::to_string(&receipt)?,
            created_at: now,
        };
        txn.insert_idempotency(&record)?;
    }

    Ok(CommitOutcome::Applied(receipt))
}

fn apply_posting<T: Txn>(
    txn: &mut T,
    posting: Posting,
    reference: Option<String>,
    now: u64,
) -> Result<(Wallet, LedgerEntry), StoreError> {
    let mut wallet = txn
        .wallet(posting.wallet)?
        .ok_or(StoreError::WalletNotFound(posting.wallet))?;
    if let WalletStatus::Frozen { reason } = &wallet.status {
        return Err(StoreError::WalletFrozen {
            wallet: wallet.id,
            reason: reason.clone(),
        });
    }
    verify_against_ledger(txn, &wallet)?;

    let overflow = || StoreError::Overflow(posting.wallet);
    let available = wallet
        .available
        .checked_add(posting.available_delta)
        .ok_or_else(overflow)?;
    if available < 0 {
        return Err(StoreError::InsufficientFunds {
            wallet: wallet.id,
            bucket: Bucket::Available,
            requested: posting.available_delta.saturating_neg(),
            available: wallet.available,
        });
    }
    let locked = wallet
        .locked
        .checked_add(posting.locked_delta)
        .ok_or_else(overflow)?;
    if locked < 0 {
        return Err(StoreError::InsufficientFunds {
            wallet: wallet.id,
            bucket: Bucket::Locked,
            requested: posting.locked_delta.saturating_neg(),
            available: wallet.locked,
        });
    }
    let delta = posting
        .available_delta
        .checked_add(posting.locked_delta)
        .ok_or_else(overflow)?;

    let totals = &mut wallet.totals;
    let counter = match posting.entry_type {
        EntryType::Deposit => Some((&mut totals.deposited, delta)),
        EntryType::Withdrawal => Some((&mut totals.withdrawn, delta.saturating_neg())),
        EntryType::BetLock => Some((&mut totals.wagered, posting.locked_delta)),
        EntryType::BetPayout if posting.available_delta > 0 => {
            Some((&mut totals.won, posting.available_delta))
        }
        _ => None,
    };
    if let Some((counter, amount)) = counter {
        *counter = counter.checked_add(amount).ok_or_else(overflow)?;
    }

    wallet.available = available;
    wallet.locked = locked;
    wallet.version += 1;
    wallet.updated_at = now;
    txn.put_wallet(&wallet)?;

    let entry = txn.append_entry(LedgerEntry {
        id: EntryId(0),
        wallet: wallet.id,
        entry_type: posting.entry_type,
        delta,
        available_delta: posting.available_delta,
        locked_delta: posting.locked_delta,
        resulting_available: available,
        resulting_locked: locked,
        idempotency_key: reference,
        bet: posting.bet,
        created_at: now,
    })?;
    Ok((wallet, entry))
}

/// Continuous reconciliation: the stored balances must equal the last entry's results.
fn verify_against_ledger<T: Txn>(txn: &T, wallet: &Wallet) -> Result<(), StoreError> {
    let (available, locked) = match txn.last_entry(wallet.id)? {
        Some(entry) => (entry.resulting_available, entry.resulting_locked),
        None => (0, 0),
    };
    if available != wallet.available || locked != wallet.locked {
        return Err(StoreError::InvariantViolation {
            wallet: wallet.id,
            detail: format!(
                "stored balances ({}, {}) differ from ledger ({available}, {locked})",
                wallet.available, wallet.locked
            ),
        });
    }
    wallet
        .validate_invariants()
        .map_err(|err| StoreError::InvariantViolation {
            wallet: wallet.id,
            detail: err.to_string(),
        })
}

#[cfg(test)]
mod tests;
