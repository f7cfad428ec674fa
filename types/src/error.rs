use thiserror::Error as ThisError;

/// Rejections produced while constructing domain values from untrusted input.
#[derive(Debug, ThisError, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("amount must be a positive number of minor units (got {got})")]
    InvalidAmount { got: i64 },
    #[error("amount exceeds maximum (got={got}, max={max})")]
    AmountTooLarge { got: i64, max: i64 },
    #[error("invalid currency code: {0:?}")]
    InvalidCurrency(String),
    #[error("commission rate out of range (got={got} bps, max={max} bps)")]
    InvalidCommissionRate { got: u32, max: u32 },
    #[error("invalid idempotency key (len={len}, max={max})")]
    InvalidIdempotencyKey { len: usize, max: usize },
    #[error("unknown {kind}: {value:?}")]
    UnknownVariant { kind: &'static str, value: String },
    #[error("{field} must not be negative (got {value})")]
    NegativeBalance { field: &'static str, value: i64 },
}
