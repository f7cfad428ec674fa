use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error as ThisError;

use crate::{Currency, MinorUnits};

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct WalletId(pub u64);

impl fmt::Display for WalletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of the user (or system principal) that owns a wallet.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct OwnerId(pub u64);

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WalletStatus {
    #[default]
    Active,
    /// Mutations are refused until the wallet is reconciled.
    Frozen { reason: String },
}

impl WalletStatus {
    pub fn is_frozen(&self) -> bool {
        matches!(self, WalletStatus::Frozen { .. })
    }
}

/// Lifetime counters, never decremented.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletTotals {
    pub deposited: MinorUnits,
    pub withdrawn: MinorUnits,
    pub wagered: MinorUnits,
    pub won: MinorUnits,
}

#[derive(Debug, ThisError, PartialEq, Eq)]
pub enum WalletInvariantError {
    #[error("available balance is negative (got={0})")]
    NegativeAvailable(MinorUnits),
    #[error("locked balance is negative (got={0})")]
    NegativeLocked(MinorUnits),
    #[error("total balance overflows")]
    TotalOverflow,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    pub id: WalletId,
    pub owner: OwnerId,
    pub currency: Currency,
    pub available: MinorUnits,
    pub locked: MinorUnits,
    /// Incremented on every balance change.
    pub version: u64,
    pub status: WalletStatus,
    pub totals: WalletTotals,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Wallet {
    pub fn new(id: WalletId, owner: OwnerId, currency: Currency, now: u64) -> Self {
        Self {
            id,
            owner,
            currency,
            available: 0,
            locked: 0,
            version: 0,
            status: WalletStatus::Active,
            totals: WalletTotals::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// `available + locked`, or `None` on overflow.
    pub fn total(&self) -> Option<MinorUnits> {
        self.available.checked_add(self.locked)
    }

    pub fn validate_invariants(&self) -> Result<(), WalletInvariantError> {
        if self.available < 0 {
            return Err(WalletInvariantError::NegativeAvailable(self.available));
        }
        if self.locked < 0 {
            return Err(WalletInvariantError::NegativeLocked(self.locked));
        }
        if self.total().is_none() {
            return Err(WalletInvariantError::TotalOverflow);
        }
        Ok(())
    }
}
