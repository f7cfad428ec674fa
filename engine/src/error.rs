use thiserror::Error as ThisError;
use wagerbook_types::{
    BetId, BetStatus, Bucket, Currency, MinorUnits, OperationType, ValidationError, WalletId,
};

use crate::coordinator::LockKey;

/// Failures raised inside a ledger store transaction.
///
/// Any error aborts the whole batch; nothing is written.
#[derive(Debug, ThisError)]
pub enum StoreError {
    #[error("wallet {0} not found")]
    WalletNotFound(WalletId),
    #[error("bet {0} not found")]
    BetNotFound(BetId),
    #[error("wallet {wallet} is frozen: {reason}")]
    WalletFrozen { wallet: WalletId, reason: String },
    #[error("insufficient {bucket} funds in wallet {wallet} (requested={requested}, available={available})")]
    InsufficientFunds {
        wallet: WalletId,
        bucket: Bucket,
        requested: MinorUnits,
        available: MinorUnits,
    },
    #[error("balance overflow in wallet {0}")]
    Overflow(WalletId),
    #[error("bet {bet} was modified concurrently (expected version {expected}, found {found})")]
    StaleBet { bet: BetId, expected: u64, found: u64 },
    #[error("idempotency key {key:?} already used for {recorded} (requested {requested})")]
    IdempotencyConflict {
        key: String,
        recorded: OperationType,
        requested: OperationType,
    },
    #[error("ledger invariant violated for wallet {wallet}: {detail}")]
    InvariantViolation { wallet: WalletId, detail: String },
    #[error("storage busy")]
    Busy,
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("snapshot encoding failed: {0}")]
    Snapshot(#[from] serde_json::Error),
}

/// Errors returned by engine operations.
///
/// [`EngineError::Busy`], [`EngineError::Timeout`] and [`EngineError::StaleBet`] are transient;
/// callers may retry them with the identical idempotency key. Everything else is a definitive
/// rejection.
#[derive(Debug, ThisError)]
pub enum EngineError {
    #[error("insufficient {bucket} funds in wallet {wallet} (requested={requested}, available={available})")]
    InsufficientFunds {
        wallet: WalletId,
        bucket: Bucket,
        requested: MinorUnits,
        available: MinorUnits,
    },
    #[error("invalid amount: {0}")]
    InvalidAmount(ValidationError),
    #[error(transparent)]
    Invalid(ValidationError),
    #[error("wallet {0} not found")]
    WalletNotFound(WalletId),
    #[error("wallet {wallet} holds {actual}, operation is in {expected}")]
    CurrencyMismatch {
        wallet: WalletId,
        expected: Currency,
        actual: Currency,
    },
    #[error("wallet {wallet} is frozen: {reason}")]
    WalletFrozen { wallet: WalletId, reason: String },
    #[error("critical section {key:?} busy")]
    Busy { key: LockKey },
    #[error("storage commit timed out")]
    Timeout,
    #[error("risk check denied operation on wallet {wallet}: {reason}")]
    RiskDenied { wallet: WalletId, reason: String },
    #[error("rate limit exceeded for wallet {0}")]
    RateLimited(WalletId),
    #[error("bet {0} not found")]
    BetNotFound(BetId),
    #[error("cannot {action} bet {bet} in status {status}")]
    BetStateConflict {
        bet: BetId,
        status: BetStatus,
        action: &'static str,
    },
    #[error("bet {bet} was modified concurrently")]
    StaleBet { bet: BetId },
    #[error("{actor} is not authorized to {action}")]
    Unauthorized { actor: String, action: &'static str },
    #[error("idempotency key {key:?} already used for {recorded} (requested {requested})")]
    IdempotencyConflict {
        key: String,
        recorded: OperationType,
        requested: OperationType,
    },
    #[error("idempotency key {key:?} already used for {operation} on {recorded} (requested {requested})")]
    IdempotencyKeyReused {
        key: String,
        operation: OperationType,
        recorded: String,
        requested: String,
    },
    #[error("ledger invariant violated for wallet {wallet}: {detail}")]
    InvariantViolation { wallet: WalletId, detail: String },
    #[error("invalid bet: {0}")]
    InvalidBet(String),
    #[error("storage failure: {0}")]
    Storage(#[source] StoreError),
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Busy { .. } | EngineError::Timeout | EngineError::StaleBet { .. }
        )
    }
}

impl From<ValidationError> for EngineError {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::InvalidAmount { .. } | ValidationError::AmountTooLarge { .. } => {
                EngineError::InvalidAmount(err)
            }
            other => EngineError::Invalid(other),
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::WalletNotFound(wallet) => EngineError::WalletNotFound(wallet),
            StoreError::BetNotFound(bet) => EngineError::BetNotFound(bet),
            StoreError::WalletFrozen { wallet, reason } => {
                EngineError::WalletFrozen { wallet, reason }
            }
            StoreError::InsufficientFunds {
                wallet,
                bucket,
                requested,
                available,
            } => EngineError::InsufficientFunds {
                wallet,
                bucket,
                requested,
                available,
            },
            StoreError::StaleBet { bet, .. } => EngineError::StaleBet { bet },
            StoreError::IdempotencyConflict {
                key,
                recorded,
                requested,
            } => EngineError::IdempotencyConflict {
                key,
                recorded,
                requested,
            },
            StoreError::InvariantViolation { wallet, detail } => {
                EngineError::InvariantViolation { wallet, detail }
            }
            StoreError::Busy => EngineError::Timeout,
            other => EngineError::Storage(other),
        }
    }
}

/// Result of a keyed operation.
///
/// A replay is not a failure: it carries the result recorded by the first execution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Completion<T> {
    Applied(T),
    IdempotentReplay(T),
}

impl<T> Completion<T> {
    pub fn is_replay(&self) -> bool {
        matches!(self, Completion::IdempotentReplay(_))
    }

    pub fn get(&self) -> &T {
        match self {
            Completion::Applied(value) | Completion::IdempotentReplay(value) => value,
        }
    }

    pub fn into_inner(self) -> T {
        match self {
            Completion::Applied(value) | Completion::IdempotentReplay(value) => value,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Completion<U> {
        match self {
            Completion::Applied(value) => Completion::Applied(f(value)),
            Completion::IdempotentReplay(value) => Completion::IdempotentReplay(f(value)),
        }
    }
}
