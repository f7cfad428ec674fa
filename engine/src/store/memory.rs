use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use wagerbook_types::{
    Bet, BetId, BetStatus, BetTransition, Currency, EntryId, EntryType, EscrowHold, HoldId,
    IdempotencyKey, IdempotencyRecord, LedgerEntry, MinorUnits, OwnerId, Wallet, WalletId,
    WalletStatus,
};

use super::{apply_batch, Batch, CommitOutcome, LedgerStore, NewHold, Txn};
use crate::StoreError;

#[derive(Clone, Default)]
struct MemoryState {
    wallets: BTreeMap<WalletId, Wallet>,
    entries: BTreeMap<WalletId, Vec<LedgerEntry>>,
    bets: BTreeMap<BetId, Bet>,
    holds: Vec<EscrowHold>,
    transitions: Vec<BetTransition>,
    idempotency: HashMap<IdempotencyKey, IdempotencyRecord>,
    next_wallet: u64,
    next_entry: u64,
    next_bet: u64,
    next_hold: u64,
}

/// In-memory [`LedgerStore`] for tests.
///
/// A commit applies the batch to a copy of the state and swaps it in only on success, so failed
/// batches leave no trace.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    injected_busy: Mutex<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `commits` calls to [`LedgerStore::commit`] fail with [`StoreError::Busy`].
    pub fn inject_busy(&self, commits: usize) {
        *self
            .injected_busy
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = commits;
    }

    /// Overwrite a wallet's stored balances without a ledger entry.
    pub fn tamper_balances(&self, wallet: WalletId, available: MinorUnits, locked: MinorUnits) {
        if let Some(wallet) = self.state().wallets.get_mut(&wallet) {
            wallet.available = available;
            wallet.locked = locked;
        }
    }

    fn take_injected_busy(&self) -> bool {
        let mut remaining = self
            .injected_busy
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *remaining == 0 {
            return false;
        }
        *remaining -= 1;
        true
    }
}

impl Txn for MemoryState {
    fn idempotency_record(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        Ok(self.idempotency.get(key).cloned())
    }

    fn wallet(&self, id: WalletId) -> Result<Option<Wallet>, StoreError> {
        Ok(self.wallets.get(&id).cloned())
    }

    fn last_entry(&self, wallet: WalletId) -> Result<Option<LedgerEntry>, StoreError> {
        Ok(self
            .entries
            .get(&wallet)
            .and_then(|entries| entries.last())
            .cloned())
    }

    fn put_wallet(&mut self, wallet: &Wallet) -> Result<(), StoreError> {
        match self.wallets.get_mut(&wallet.id) {
            Some(slot) => {
                *slot = wallet.clone();
                Ok(())
            }
            None => Err(StoreError::WalletNotFound(wallet.id)),
        }
    }

    fn append_entry(&mut self, mut entry: LedgerEntry) -> Result<LedgerEntry, StoreError> {
        self.next_entry += 1;
        entry.id = EntryId(self.next_entry);
        self.entries
            .entry(entry.wallet)
            .or_default()
            .push(entry.clone());
        Ok(entry)
    }

    fn bet(&self, id: BetId) -> Result<Option<Bet>, StoreError> {
        Ok(self.bets.get(&id).cloned())
    }

    fn insert_bet(&mut self, mut bet: Bet) -> Result<Bet, StoreError> {
        self.next_bet += 1;
        bet.id = BetId(self.next_bet);
        self.bets.insert(bet.id, bet.clone());
        Ok(bet)
    }

    fn update_bet(&mut self, bet: &Bet) -> Result<(), StoreError> {
        match self.bets.get_mut(&bet.id) {
            Some(slot) => {
                *slot = bet.clone();
                Ok(())
            }
            None => Err(StoreError::BetNotFound(bet.id)),
        }
    }

    fn insert_hold(&mut self, hold: NewHold, now: u64) -> Result<EscrowHold, StoreError> {
        self.next_hold += 1;
        let hold = EscrowHold {
            id: HoldId(self.next_hold),
            bet: hold.bet,
            wallet: hold.wallet,
            amount: hold.amount,
            created_at: now,
            released_at: None,
        };
        self.holds.push(hold.clone());
        Ok(hold)
    }

    fn release_holds(&mut self, bet: BetId, now: u64) -> Result<Vec<EscrowHold>, StoreError> {
        let mut released = Vec::new();
        for hold in self
            .holds
            .iter_mut()
            .filter(|hold| hold.bet == bet && hold.is_open())
        {
            hold.released_at = Some(now);
            released.push(hold.clone());
        }
        Ok(released)
    }

    fn insert_transition(&mut self, transition: &BetTransition) -> Result<(), StoreError> {
        self.transitions.push(transition.clone());
        Ok(())
    }

    fn insert_idempotency(&mut self, record: &IdempotencyRecord) -> Result<(), StoreError> {
        self.idempotency.insert(record.key.clone(), record.clone());
        Ok(())
    }
}

impl LedgerStore for MemoryStore {
    fn ensure_wallet(
        &self,
        owner: OwnerId,
        currency: Currency,
        now: u64,
    ) -> Result<Wallet, StoreError> {
        let mut state = self.state();
        if let Some(wallet) = state
            .wallets
            .values()
            .find(|w| w.owner == owner && w.currency == currency)
        {
            return Ok(wallet.clone());
        }
        state.next_wallet += 1;
        let wallet = Wallet::new(WalletId(state.next_wallet), owner, currency, now);
        state.wallets.insert(wallet.id, wallet.clone());
        Ok(wallet)
    }

    fn wallet(&self, id: WalletId) -> Result<Option<Wallet>, StoreError> {
        Ok(self.state().wallets.get(&id).cloned())
    }

    fn wallet_by_owner(
        &self,
        owner: OwnerId,
        currency: Currency,
    ) -> Result<Option<Wallet>, StoreError> {
        Ok(self
            .state()
            .wallets
            .values()
            .find(|w| w.owner == owner && w.currency == currency)
            .cloned())
    }

    fn set_wallet_status(
        &self,
        id: WalletId,
        status: WalletStatus,
        now: u64,
    ) -> Result<Wallet, StoreError> {
        let mut state = self.state();
        let wallet = state
            .wallets
            .get_mut(&id)
            .ok_or(StoreError::WalletNotFound(id))?;
        wallet.status = status;
        wallet.updated_at = now;
        Ok(wallet.clone())
    }

    fn entries(&self, wallet: WalletId) -> Result<Vec<LedgerEntry>, StoreError> {
        Ok(self
            .state()
            .entries
            .get(&wallet)
            .cloned()
            .unwrap_or_default())
    }

    fn entry_volume_since(
        &self,
        wallet: WalletId,
        entry_type: EntryType,
        since: u64,
    ) -> Result<MinorUnits, StoreError> {
        let state = self.state();
        let volume = state
            .entries
            .get(&wallet)
            .into_iter()
            .flatten()
            .filter(|entry| entry.entry_type == entry_type && entry.created_at >= since)
            .fold(0i64, |acc, entry| {
                acc.saturating_add(entry.available_delta.saturating_abs())
            });
        Ok(volume)
    }

    fn idempotency_record(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        Ok(self.state().idempotency.get(key).cloned())
    }

    fn bet(&self, id: BetId) -> Result<Option<Bet>, StoreError> {
        Ok(self.state().bets.get(&id).cloned())
    }

    fn bets_for_wallet(&self, wallet: WalletId) -> Result<Vec<Bet>, StoreError> {
        Ok(self
            .state()
            .bets
            .values()
            .filter(|bet| bet.is_participant(wallet))
            .cloned()
            .collect())
    }

    fn bets_with_status(&self, status: BetStatus) -> Result<Vec<Bet>, StoreError> {
        Ok(self
            .state()
            .bets
            .values()
            .filter(|bet| bet.status == status)
            .cloned()
            .collect())
    }

    fn bets_due(&self, now: u64) -> Result<Vec<Bet>, StoreError> {
        Ok(self
            .state()
            .bets
            .values()
            .filter(|bet| match bet.status {
                BetStatus::Pending => bet.acceptance_deadline.is_some_and(|at| at <= now),
                BetStatus::Accepted | BetStatus::Active => {
                    bet.resolution_deadline.is_some_and(|at| at <= now)
                }
                _ => false,
            })
            .cloned()
            .collect())
    }

    fn holds(&self, bet: BetId) -> Result<Vec<EscrowHold>, StoreError> {
        Ok(self
            .state()
            .holds
            .iter()
            .filter(|hold| hold.bet == bet)
            .cloned()
            .collect())
    }

    fn transitions(&self, bet: BetId) -> Result<Vec<BetTransition>, StoreError> {
        Ok(self
            .state()
            .transitions
            .iter()
            .filter(|transition| transition.bet == bet)
            .cloned()
            .collect())
    }

    fn commit(&self, batch: Batch) -> Result<CommitOutcome, StoreError> {
        if self.take_injected_busy() {
            return Err(StoreError::Busy);
        }
        let mut state = self.state();
        let mut working = state.clone();
        let outcome = apply_batch(&mut working, batch)?;
        *state = working;
        Ok(outcome)
    }
}
