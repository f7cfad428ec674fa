//! Peer-to-peer bet records and their escrow holds.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Amount, CommissionRate, Currency, ValidationError, WalletId};

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct BetId(pub u64);

impl fmt::Display for BetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct HoldId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetStatus {
    Pending,
    Accepted,
    Active,
    Resolved,
    Cancelled,
    Refunded,
    Disputed,
    Expired,
}

impl BetStatus {
    pub const ALL: [BetStatus; 8] = [
        BetStatus::Pending,
        BetStatus::Accepted,
        BetStatus::Active,
        BetStatus::Resolved,
        BetStatus::Cancelled,
        BetStatus::Refunded,
        BetStatus::Disputed,
        BetStatus::Expired,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BetStatus::Pending => "pending",
            BetStatus::Accepted => "accepted",
            BetStatus::Active => "active",
            BetStatus::Resolved => "resolved",
            BetStatus::Cancelled => "cancelled",
            BetStatus::Refunded => "refunded",
            BetStatus::Disputed => "disputed",
            BetStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BetStatus::Resolved | BetStatus::Cancelled | BetStatus::Refunded | BetStatus::Expired
        )
    }

    /// Whether stakes are held in escrow while the bet is in this status.
    pub fn holds_funds(self) -> bool {
        matches!(
            self,
            BetStatus::Accepted | BetStatus::Active | BetStatus::Disputed
        )
    }

    /// The lifecycle graph. Terminal statuses have no outgoing edges.
    pub fn can_transition_to(self, next: BetStatus) -> bool {
        use BetStatus::*;
        match self {
            Pending => matches!(next, Accepted | Cancelled),
            Accepted | Active => {
                matches!(next, Resolved | Refunded | Disputed | Expired)
                    || (self == Accepted && next == Active)
            }
            Disputed => matches!(next, Resolved | Refunded),
            Resolved | Cancelled | Refunded | Expired => false,
        }
    }
}

impl FromStr for BetStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BetStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ValidationError::UnknownVariant {
                kind: "bet status",
                value: s.to_string(),
            })
    }
}

impl fmt::Display for BetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "wallet", rename_all = "snake_case")]
pub enum BetOutcome {
    #[default]
    Undecided,
    Winner(WalletId),
    /// Tie: every stake is returned and no commission is charged.
    Push,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub wallet: WalletId,
    pub stake: Amount,
    pub joined_at: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bet {
    pub id: BetId,
    /// Wallet of the participant that opened the bet.
    pub creator: WalletId,
    pub title: String,
    pub currency: Currency,
    /// Stake every participant must put up.
    pub stake: Amount,
    pub commission: CommissionRate,
    pub required_participants: u8,
    /// Ordered by join time; the creator is always first.
    pub participants: Vec<Participant>,
    pub status: BetStatus,
    pub outcome: BetOutcome,
    pub created_at: u64,
    pub acceptance_deadline: Option<u64>,
    pub resolution_deadline: Option<u64>,
    pub resolved_at: Option<u64>,
    pub version: u64,
}

impl Bet {
    pub fn is_participant(&self, wallet: WalletId) -> bool {
        self.participants.iter().any(|p| p.wallet == wallet)
    }

    pub fn is_full(&self) -> bool {
        self.participants.len() >= usize::from(self.required_participants)
    }

    /// Sum of all participant stakes, or `None` on overflow.
    pub fn pot(&self) -> Option<Amount> {
        let mut participants = self.participants.iter();
        let first = participants.next()?.stake;
        participants.try_fold(first, |acc, p| acc.checked_add(p.stake))
    }

    pub fn wallets(&self) -> impl Iterator<Item = WalletId> + '_ {
        self.participants.iter().map(|p| p.wallet)
    }
}

/// Funds locked in a wallet on behalf of one bet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowHold {
    pub id: HoldId,
    pub bet: BetId,
    pub wallet: WalletId,
    pub amount: Amount,
    pub created_at: u64,
    pub released_at: Option<u64>,
}

impl EscrowHold {
    pub fn is_open(&self) -> bool {
        self.released_at.is_none()
    }
}

/// Audit record for one bet status change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BetTransition {
    pub bet: BetId,
    /// `None` for the creation of the bet.
    pub from: Option<BetStatus>,
    pub to: BetStatus,
    pub actor: Option<String>,
    pub reason: Option<String>,
    pub at: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bet_with(stakes: &[i64]) -> Bet {
        Bet {
            id: BetId(1),
            creator: WalletId(10),
            title: "derby".to_string(),
            currency: Currency::USD,
            stake: Amount::new(stakes[0]).unwrap(),
            commission: CommissionRate::from_bps(500).unwrap(),
            required_participants: 2,
            participants: stakes
                .iter()
                .enumerate()
                .map(|(i, stake)| Participant {
                    wallet: WalletId(10 + i as u64),
                    stake: Amount::new(*stake).unwrap(),
                    joined_at: 0,
                })
                .collect(),
            status: BetStatus::Pending,
            outcome: BetOutcome::Undecided,
            created_at: 0,
            acceptance_deadline: None,
            resolution_deadline: None,
            resolved_at: None,
            version: 0,
        }
    }

    #[test]
    fn terminal_statuses_have_no_exits() {
        for from in BetStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in BetStatus::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be rejected");
            }
        }
    }

    #[test]
    fn lifecycle_edges() {
        use BetStatus::*;
        assert!(Pending.can_transition_to(Accepted));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(!Pending.can_transition_to(Resolved));
        assert!(!Pending.can_transition_to(Refunded));
        assert!(Accepted.can_transition_to(Active));
        assert!(!Active.can_transition_to(Active));
        assert!(!Active.can_transition_to(Cancelled));
        assert!(Active.can_transition_to(Expired));
        assert!(Disputed.can_transition_to(Resolved));
        assert!(Disputed.can_transition_to(Refunded));
        assert!(!Disputed.can_transition_to(Expired));
    }

    #[test]
    fn only_escrow_statuses_hold_funds() {
        let holding: Vec<_> = BetStatus::ALL
            .into_iter()
            .filter(|s| s.holds_funds())
            .collect();
        assert_eq!(
            holding,
            vec![BetStatus::Accepted, BetStatus::Active, BetStatus::Disputed]
        );
    }

    #[test]
    fn pot_sums_stakes() {
        let bet = bet_with(&[10_000, 10_000]);
        assert_eq!(bet.pot().map(Amount::get), Some(20_000));
        assert!(bet.is_full());
        assert!(bet.is_participant(WalletId(11)));
        assert!(!bet.is_participant(WalletId(12)));
    }

    #[test]
    fn pot_overflow_is_none() {
        let bet = bet_with(&[i64::MAX, 1]);
        assert_eq!(bet.pot(), None);
    }

    #[test]
    fn outcome_serialization() {
        let json = serde_json::to_string(&BetOutcome::Winner(WalletId(3))).unwrap();
        assert_eq!(json, r#"{"kind":"winner","wallet":3}"#);
        let json = serde_json::to_string(&BetOutcome::Push).unwrap();
        assert_eq!(json, r#"{"kind":"push"}"#);
    }
}
