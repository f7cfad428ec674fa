//! Monetary primitives.
//!
//! Amounts are integer counts of a currency's minor unit (cents for USD). Commission rates are
//! basis points, and splitting a pot rounds half-up to the nearest minor unit.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::ValidationError;

/// Signed count of minor units, used for balances and ledger deltas.
pub type MinorUnits = i64;

/// Denominator of [`CommissionRate`].
pub const BASIS_POINTS_SCALE: u16 = 10_000;

/// A strictly positive amount of minor units.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Amount(i64);

impl Amount {
    pub fn new(minor_units: i64) -> Result<Self, ValidationError> {
        if minor_units <= 0 {
            return Err(ValidationError::InvalidAmount { got: minor_units });
        }
        Ok(Self(minor_units))
    }

    /// Like [`Amount::new`], additionally enforcing an upper bound.
    pub fn bounded(minor_units: i64, max: i64) -> Result<Self, ValidationError> {
        let amount = Self::new(minor_units)?;
        if minor_units > max {
            return Err(ValidationError::AmountTooLarge {
                got: minor_units,
                max,
            });
        }
        Ok(amount)
    }

    pub fn get(self) -> i64 {
        self.0
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }
}

impl TryFrom<i64> for Amount {
    type Error = ValidationError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Amount> for i64 {
    fn from(value: Amount) -> Self {
        value.0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// ISO-4217 style three-letter uppercase currency code.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Currency([u8; 3]);

impl Currency {
    pub const USD: Currency = Currency(*b"USD");

    pub fn as_str(&self) -> &str {
        // Construction only admits ASCII uppercase letters.
        std::str::from_utf8(&self.0).unwrap_or("???")
    }
}

impl FromStr for Currency {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() != 3 || !bytes.iter().all(u8::is_ascii_uppercase) {
            return Err(ValidationError::InvalidCurrency(s.to_string()));
        }
        Ok(Self([bytes[0], bytes[1], bytes[2]]))
    }
}

impl TryFrom<String> for Currency {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Currency> for String {
    fn from(value: Currency) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Currency({})", self.as_str())
    }
}

/// Commission charged on a settled pot, in basis points (1 bp = 0.01%).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct CommissionRate(u16);

/// Result of splitting a pot between the winner and the platform.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PotSplit {
    pub payout: MinorUnits,
    pub commission: MinorUnits,
}

impl CommissionRate {
    pub const ZERO: CommissionRate = CommissionRate(0);

    pub fn from_bps(bps: u16) -> Result<Self, ValidationError> {
        if bps > BASIS_POINTS_SCALE {
            return Err(ValidationError::InvalidCommissionRate {
                got: u32::from(bps),
                max: u32::from(BASIS_POINTS_SCALE),
            });
        }
        Ok(Self(bps))
    }

    pub fn bps(self) -> u16 {
        self.0
    }

    /// Split `pot` into winner payout and commission.
    ///
    /// The payout is rounded half-up to the minor unit and the commission takes the remainder, so
    /// `payout + commission == pot` always holds.
    pub fn split(self, pot: Amount) -> PotSplit {
        let pot_wide = i128::from(pot.get());
        let keep = i128::from(BASIS_POINTS_SCALE - self.0);
        let scale = i128::from(BASIS_POINTS_SCALE);
        let payout = (pot_wide * keep + scale / 2) / scale;
        // payout <= pot, so narrowing back cannot truncate.
        let payout = payout as i64;
        PotSplit {
            payout,
            commission: pot.get() - payout,
        }
    }
}

impl TryFrom<u16> for CommissionRate {
    type Error = ValidationError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Self::from_bps(value)
    }
}

impl From<CommissionRate> for u16 {
    fn from(value: CommissionRate) -> Self {
        value.0
    }
}

impl fmt::Display for CommissionRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}bps", self.0)
    }
}
