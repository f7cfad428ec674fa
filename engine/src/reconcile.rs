use serde::Serialize;
use wagerbook_types::{MinorUnits, Wallet, WalletId};

use crate::store::LedgerStore;
use crate::EngineError;

/// Outcome of folding a wallet's full ledger history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Reconciliation {
    pub wallet: WalletId,
    pub entries: usize,
    pub ledger_available: MinorUnits,
    pub ledger_locked: MinorUnits,
    pub stored_available: MinorUnits,
    pub stored_locked: MinorUnits,
    /// First inconsistency found, if any.
    pub discrepancy: Option<String>,
}

impl Reconciliation {
    pub fn is_consistent(&self) -> bool {
        self.discrepancy.is_none()
    }
}

/// Replay every ledger entry of `wallet` and compare against the stored balances.
///
/// Besides the final totals, each entry's recorded resulting balances must match the running
/// fold, its `delta` must equal the sum of its bucket deltas, and no running balance may be
/// negative.
pub fn reconcile<S: LedgerStore>(
    store: &S,
    wallet: WalletId,
) -> Result<Reconciliation, EngineError> {
    let stored: Wallet = store
        .wallet(wallet)?
        .ok_or(EngineError::WalletNotFound(wallet))?;
    let entries = store.entries(wallet)?;

    let mut available: MinorUnits = 0;
    let mut locked: MinorUnits = 0;
    let mut discrepancy = None;
    for entry in &entries {
        available = available.saturating_add(entry.available_delta);
        locked = locked.saturating_add(entry.locked_delta);
        if discrepancy.is_some() {
            continue;
        }
        if entry.available_delta.checked_add(entry.locked_delta) != Some(entry.delta) {
            discrepancy = Some(format!("entry {} has inconsistent deltas", entry.id));
        } else if entry.resulting_available != available || entry.resulting_locked != locked {
            discrepancy = Some(format!(
                "entry {} records ({}, {}) but the fold is ({available}, {locked})",
                entry.id, entry.resulting_available, entry.resulting_locked
            ));
        } else if available < 0 || locked < 0 {
            discrepancy = Some(format!("entry {} drives a bucket negative", entry.id));
        }
    }
    if discrepancy.is_none() && (available != stored.available || locked != stored.locked) {
        discrepancy = Some(format!(
            "stored balances ({}, {}) differ from ledger ({available}, {locked})",
            stored.available, stored.locked
        ));
    }

    Ok(Reconciliation {
        wallet,
        entries: entries.len(),
        ledger_available: available,
        ledger_locked: locked,
        stored_available: stored.available,
        stored_locked: stored.locked,
        discrepancy,
    })
}
