//! Append-only ledger entries.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{BetId, MinorUnits, ValidationError, WalletId};

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct EntryId(pub u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The two balance buckets of a wallet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    Available,
    Locked,
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bucket::Available => f.write_str("available"),
            Bucket::Locked => f.write_str("locked"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    Deposit,
    Withdrawal,
    BetLock,
    BetRelease,
    BetPayout,
    Commission,
    Refund,
}

impl EntryType {
    pub const ALL: [EntryType; 7] = [
        EntryType::Deposit,
        EntryType::Withdrawal,
        EntryType::BetLock,
        EntryType::BetRelease,
        EntryType::BetPayout,
        EntryType::Commission,
        EntryType::Refund,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntryType::Deposit => "deposit",
            EntryType::Withdrawal => "withdrawal",
            EntryType::BetLock => "bet_lock",
            EntryType::BetRelease => "bet_release",
            EntryType::BetPayout => "bet_payout",
            EntryType::Commission => "commission",
            EntryType::Refund => "refund",
        }
    }
}

impl FromStr for EntryType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntryType::ALL
            .into_iter()
            .find(|entry_type| entry_type.as_str() == s)
            .ok_or_else(|| ValidationError::UnknownVariant {
                kind: "entry type",
                value: s.to_string(),
            })
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable balance-affecting event.
///
/// `delta` is the change of the wallet total (`available + locked`), so moving funds between
/// buckets records a zero `delta` with opposite `available_delta`/`locked_delta`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub wallet: WalletId,
    pub entry_type: EntryType,
    pub delta: MinorUnits,
    pub available_delta: MinorUnits,
    pub locked_delta: MinorUnits,
    pub resulting_available: MinorUnits,
    pub resulting_locked: MinorUnits,
    pub idempotency_key: Option<String>,
    pub bet: Option<BetId>,
    pub created_at: u64,
}

impl LedgerEntry {
    pub fn resulting_total(&self) -> MinorUnits {
        self.resulting_available.saturating_add(self.resulting_locked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_type_str_round_trips() {
        for entry_type in EntryType::ALL {
            assert_eq!(entry_type.as_str().parse::<EntryType>(), Ok(entry_type));
            let json = serde_json::to_string(&entry_type).unwrap();
            assert_eq!(json, format!("\"{}\"", entry_type.as_str()));
        }
        assert!("bonus".parse::<EntryType>().is_err());
    }
}
