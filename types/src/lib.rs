//! Common types used throughout wagerbook.
//!
//! Every monetary value in this crate is an integer count of currency minor units. There is no
//! floating-point representation of money anywhere in the workspace.

pub mod bet;
pub mod error;
pub mod idempotency;
pub mod ledger;
pub mod money;
pub mod wallet;

pub use bet::{
    Bet, BetId, BetOutcome, BetStatus, BetTransition, EscrowHold, HoldId, Participant,
};
pub use error::ValidationError;
pub use idempotency::{IdempotencyKey, IdempotencyRecord, OperationType, MAX_IDEMPOTENCY_KEY_LEN};
pub use ledger::{Bucket, EntryId, EntryType, LedgerEntry};
pub use money::{Amount, CommissionRate, Currency, MinorUnits, PotSplit, BASIS_POINTS_SCALE};
pub use wallet::{OwnerId, Wallet, WalletId, WalletInvariantError, WalletStatus, WalletTotals};
