use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::ValidationError;

pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;

/// Caller-supplied key that makes a mutating operation safe to retry.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn new(key: impl Into<String>) -> Result<Self, ValidationError> {
        let key = key.into();
        if key.is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_LEN {
            return Err(ValidationError::InvalidIdempotencyKey {
                len: key.len(),
                max: MAX_IDEMPOTENCY_KEY_LEN,
            });
        }
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derive a per-participant key from an operation key.
    ///
    /// Used when one caller request expands into several ledger postings that each need a
    /// distinct reference. Suffixes that would overflow the length limit are truncated from the
    /// base, keeping the suffix intact.
    pub fn child(&self, suffix: &str) -> IdempotencyKey {
        let suffix = &suffix[..suffix.len().min(MAX_IDEMPOTENCY_KEY_LEN - 1)];
        let room = MAX_IDEMPOTENCY_KEY_LEN - 1 - suffix.len();
        let mut cut = self.0.len().min(room);
        while !self.0.is_char_boundary(cut) {
            cut -= 1;
        }
        IdempotencyKey(format!("{}:{}", &self.0[..cut], suffix))
    }
}

impl TryFrom<String> for IdempotencyKey {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<IdempotencyKey> for String {
    fn from(value: IdempotencyKey) -> Self {
        value.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdempotencyKey({:?})", self.0)
    }
}

/// Kind of operation an idempotency key was first used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Deposit,
    Withdraw,
    Lock,
    Release,
    Settle,
    CreateBet,
    JoinBet,
    ActivateBet,
    ResolveBet,
    CancelBet,
    RefundBet,
    DisputeBet,
    AdjudicateBet,
}

impl OperationType {
    pub const ALL: [OperationType; 13] = [
        OperationType::Deposit,
        OperationType::Withdraw,
        OperationType::Lock,
        OperationType::Release,
        OperationType::Settle,
        OperationType::CreateBet,
        OperationType::JoinBet,
        OperationType::ActivateBet,
        OperationType::ResolveBet,
        OperationType::CancelBet,
        OperationType::RefundBet,
        OperationType::DisputeBet,
        OperationType::AdjudicateBet,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OperationType::Deposit => "deposit",
            OperationType::Withdraw => "withdraw",
            OperationType::Lock => "lock",
            OperationType::Release => "release",
            OperationType::Settle => "settle",
            OperationType::CreateBet => "create_bet",
            OperationType::JoinBet => "join_bet",
            OperationType::ActivateBet => "activate_bet",
            OperationType::ResolveBet => "resolve_bet",
            OperationType::CancelBet => "cancel_bet",
            OperationType::RefundBet => "refund_bet",
            OperationType::DisputeBet => "dispute_bet",
            OperationType::AdjudicateBet => "adjudicate_bet",
        }
    }
}

impl FromStr for OperationType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OperationType::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| ValidationError::UnknownVariant {
                kind: "operation type",
                value: s.to_string(),
            })
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored result of the first successful execution of a keyed operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: IdempotencyKey,
    pub operation: OperationType,
    /// JSON document returned verbatim on replay.
    pub result_snapshot: String,
    pub created_at: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_length_bounds() {
        assert!(IdempotencyKey::new("").is_err());
        assert!(IdempotencyKey::new("dep-42").is_ok());
        assert!(IdempotencyKey::new("k".repeat(MAX_IDEMPOTENCY_KEY_LEN)).is_ok());
        assert_eq!(
            IdempotencyKey::new("k".repeat(MAX_IDEMPOTENCY_KEY_LEN + 1)),
            Err(ValidationError::InvalidIdempotencyKey {
                len: MAX_IDEMPOTENCY_KEY_LEN + 1,
                max: MAX_IDEMPOTENCY_KEY_LEN,
            })
        );
    }

    #[test]
    fn child_keys_are_distinct_and_bounded() {
        let base = IdempotencyKey::new("join-7").unwrap();
        assert_eq!(base.child("w1").as_str(), "join-7:w1");
        assert_ne!(base.child("w1"), base.child("w2"));

        let long = IdempotencyKey::new("x".repeat(MAX_IDEMPOTENCY_KEY_LEN)).unwrap();
        let child = long.child("w12");
        assert_eq!(child.as_str().len(), MAX_IDEMPOTENCY_KEY_LEN);
        assert!(child.as_str().ends_with(":w12"));
    }

    #[test]
    fn operation_type_round_trips() {
        for op in OperationType::ALL {
            assert_eq!(op.as_str().parse::<OperationType>(), Ok(op));
        }
    }
}
