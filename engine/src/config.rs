//! Engine configuration.
//!
//! [`EngineConfig`] is the serde form embedded in the node's YAML file. [`EngineConfig::validate`]
//! turns it into a [`ValidatedEngineConfig`] with typed money values and durations.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::num::{NonZeroU32, NonZeroUsize};
use std::time::Duration;
use thiserror::Error;
use wagerbook_types::{Amount, CommissionRate, Currency, OwnerId, BASIS_POINTS_SCALE};

pub const DEFAULT_CURRENCY: &str = "USD";
/// Owner id of the wallet that collects commission.
pub const DEFAULT_PLATFORM_OWNER: u64 = 0;
/// Largest single deposit, withdrawal, or stake (1,000,000.00 in cents).
pub const DEFAULT_MAX_AMOUNT: i64 = 100_000_000;
pub const DEFAULT_SECTION_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_COMMIT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;
pub const DEFAULT_REVIEW_QUEUE_CAPACITY: usize = 1_024;
pub const DEFAULT_RATE_LIMIT_MAX_OPERATIONS: u32 = 60;
pub const DEFAULT_RATE_LIMIT_WINDOW_MS: u64 = 60_000;
/// 5% commission.
pub const DEFAULT_COMMISSION_BPS: u16 = 500;
pub const DEFAULT_MIN_STAKE: i64 = 100;
pub const DEFAULT_MAX_STAKE: i64 = 1_000_000;
pub const DEFAULT_MAX_PARTICIPANTS: u8 = 2;
pub const DEFAULT_DAILY_DEPOSIT_LIMIT: i64 = 100_000;
pub const DEFAULT_DAILY_WITHDRAWAL_LIMIT: i64 = 500_000;
pub const DEFAULT_DAILY_BET_LIMIT: i64 = 100_000;
pub const DEFAULT_WEEKLY_BET_LIMIT: i64 = 500_000;
pub const DEFAULT_MONTHLY_BET_LIMIT: i64 = 2_000_000;
pub const DEFAULT_MODEL_TIMEOUT_MS: u64 = 250;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EngineConfig {
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default = "default_platform_owner")]
    pub platform_owner: u64,
    #[serde(default = "default_max_amount")]
    pub max_amount: i64,
    #[serde(default = "default_section_timeout_ms")]
    pub section_timeout_ms: u64,
    #[serde(default = "default_commit_timeout_ms")]
    pub commit_timeout_ms: u64,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    #[serde(default = "default_review_queue_capacity")]
    pub review_queue_capacity: usize,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub betting: BettingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            currency: default_currency(),
            platform_owner: default_platform_owner(),
            max_amount: default_max_amount(),
            section_timeout_ms: default_section_timeout_ms(),
            commit_timeout_ms: default_commit_timeout_ms(),
            cache_capacity: default_cache_capacity(),
            review_queue_capacity: default_review_queue_capacity(),
            rate_limit: RateLimitConfig::default(),
            risk: RiskConfig::default(),
            betting: BettingConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_limit_max_operations")]
    pub max_operations: u32,
    #[serde(default = "default_rate_limit_window_ms")]
    pub window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_operations: default_rate_limit_max_operations(),
            window_ms: default_rate_limit_window_ms(),
        }
    }
}

/// What a model-based gate decides when the evaluator fails or times out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailPolicy {
    #[default]
    Closed,
    Open,
    Review,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RiskConfig {
    AllowAll,
    RuleBased {
        #[serde(default)]
        max_amount: Option<i64>,
        #[serde(default)]
        review_above: Option<i64>,
        #[serde(default)]
        kyc_required_above: Option<i64>,
        #[serde(default)]
        daily_deposit_limit: Option<i64>,
        #[serde(default)]
        daily_withdrawal_limit: Option<i64>,
        /// Caps on stakes locked over the trailing day, week, and 30 days.
        #[serde(default)]
        daily_bet_limit: Option<i64>,
        #[serde(default)]
        weekly_bet_limit: Option<i64>,
        #[serde(default)]
        monthly_bet_limit: Option<i64>,
    },
    ModelBased {
        #[serde(default = "default_model_timeout_ms")]
        timeout_ms: u64,
        #[serde(default)]
        on_failure: FailPolicy,
    },
    Composite {
        gates: Vec<RiskConfig>,
    },
}

impl Default for RiskConfig {
    fn default() -> Self {
        RiskConfig::RuleBased {
            max_amount: None,
            review_above: None,
            kyc_required_above: None,
            daily_deposit_limit: Some(DEFAULT_DAILY_DEPOSIT_LIMIT),
            daily_withdrawal_limit: Some(DEFAULT_DAILY_WITHDRAWAL_LIMIT),
            daily_bet_limit: Some(DEFAULT_DAILY_BET_LIMIT),
            weekly_bet_limit: Some(DEFAULT_WEEKLY_BET_LIMIT),
            monthly_bet_limit: Some(DEFAULT_MONTHLY_BET_LIMIT),
        }
    }
}

/// Policy applied when locking stakes fails as the last participant joins.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceptFailurePolicy {
    /// The bet stays pending without the joiner.
    #[default]
    RevertToPending,
    Cancel,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BettingConfig {
    #[serde(default = "default_commission_bps")]
    pub default_commission_bps: u16,
    #[serde(default = "default_min_stake")]
    pub min_stake: i64,
    #[serde(default = "default_max_stake")]
    pub max_stake: i64,
    #[serde(default = "default_max_participants")]
    pub max_participants: u8,
    #[serde(default)]
    pub on_accept_failure: AcceptFailurePolicy,
    /// Principals allowed to adjudicate disputed bets.
    #[serde(default)]
    pub adjudicators: Vec<String>,
}

impl Default for BettingConfig {
    fn default() -> Self {
        Self {
            default_commission_bps: default_commission_bps(),
            min_stake: default_min_stake(),
            max_stake: default_max_stake(),
            max_participants: default_max_participants(),
            on_accept_failure: AcceptFailurePolicy::default(),
            adjudicators: Vec::new(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be > 0 (got {value})")]
    InvalidNonZero { field: &'static str, value: i64 },
    #[error("invalid currency: {value}")]
    InvalidCurrency { value: String },
    #[error("{field} must be <= {max} bps (got {value})")]
    InvalidCommissionRate {
        field: &'static str,
        value: u32,
        max: u32,
    },
    #[error("min_stake ({min}) must not exceed max_stake ({max})")]
    InvalidStakeRange { min: i64, max: i64 },
    #[error("max_stake ({max_stake}) must not exceed max_amount ({max_amount})")]
    StakeAboveMaxAmount { max_stake: i64, max_amount: i64 },
    #[error("max_participants must be at least 2 (got {value})")]
    InvalidMaxParticipants { value: u8 },
    #[error("invalid risk config: {reason}")]
    InvalidRiskConfig { reason: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimit {
    pub max_operations: NonZeroU32,
    pub window: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BettingRules {
    pub default_commission: CommissionRate,
    pub min_stake: Amount,
    pub max_stake: Amount,
    pub max_participants: u8,
    pub on_accept_failure: AcceptFailurePolicy,
    pub adjudicators: BTreeSet<String>,
}

#[derive(Clone, Debug)]
pub struct ValidatedEngineConfig {
    pub currency: Currency,
    pub platform_owner: OwnerId,
    pub max_amount: i64,
    pub section_timeout: Duration,
    pub commit_timeout: Duration,
    pub cache_capacity: usize,
    pub review_queue_capacity: NonZeroUsize,
    pub rate_limit: RateLimit,
    pub risk: RiskConfig,
    pub betting: BettingRules,
}

fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}

fn default_platform_owner() -> u64 {
    DEFAULT_PLATFORM_OWNER
}

fn default_max_amount() -> i64 {
    DEFAULT_MAX_AMOUNT
}

fn default_section_timeout_ms() -> u64 {
    DEFAULT_SECTION_TIMEOUT_MS
}

fn default_commit_timeout_ms() -> u64 {
    DEFAULT_COMMIT_TIMEOUT_MS
}

fn default_cache_capacity() -> usize {
    DEFAULT_CACHE_CAPACITY
}

fn default_review_queue_capacity() -> usize {
    DEFAULT_REVIEW_QUEUE_CAPACITY
}

fn default_rate_limit_max_operations() -> u32 {
    DEFAULT_RATE_LIMIT_MAX_OPERATIONS
}

fn default_rate_limit_window_ms() -> u64 {
    DEFAULT_RATE_LIMIT_WINDOW_MS
}

fn default_commission_bps() -> u16 {
    DEFAULT_COMMISSION_BPS
}

fn default_min_stake() -> i64 {
    DEFAULT_MIN_STAKE
}

fn default_max_stake() -> i64 {
    DEFAULT_MAX_STAKE
}

fn default_max_participants() -> u8 {
    DEFAULT_MAX_PARTICIPANTS
}

fn default_model_timeout_ms() -> u64 {
    DEFAULT_MODEL_TIMEOUT_MS
}

fn ensure_positive(field: &'static str, value: i64) -> Result<(), ConfigError> {
    if value <= 0 {
        return Err(ConfigError::InvalidNonZero { field, value });
    }
    Ok(())
}

fn ensure_nonzero_u64(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidNonZero { field, value: 0 });
    }
    Ok(())
}

fn nonzero_usize(field: &'static str, value: usize) -> Result<NonZeroUsize, ConfigError> {
    NonZeroUsize::new(value).ok_or(ConfigError::InvalidNonZero { field, value: 0 })
}

fn nonzero_u32(field: &'static str, value: u32) -> Result<NonZeroU32, ConfigError> {
    NonZeroU32::new(value).ok_or(ConfigError::InvalidNonZero { field, value: 0 })
}

fn validate_risk(risk: &RiskConfig) -> Result<(), ConfigError> {
    match risk {
        RiskConfig::AllowAll => Ok(()),
        RiskConfig::RuleBased {
            max_amount,
            review_above,
            kyc_required_above,
            daily_deposit_limit,
            daily_withdrawal_limit,
            daily_bet_limit,
            weekly_bet_limit,
            monthly_bet_limit,
        } => {
            let limits = [
                ("risk.max_amount", max_amount),
                ("risk.review_above", review_above),
                ("risk.kyc_required_above", kyc_required_above),
                ("risk.daily_deposit_limit", daily_deposit_limit),
                ("risk.daily_withdrawal_limit", daily_withdrawal_limit),
                ("risk.daily_bet_limit", daily_bet_limit),
                ("risk.weekly_bet_limit", weekly_bet_limit),
                ("risk.monthly_bet_limit", monthly_bet_limit),
            ];
            for (field, value) in limits {
                if let Some(value) = value {
                    ensure_positive(field, *value)?;
                }
            }
            Ok(())
        }
        RiskConfig::ModelBased { timeout_ms, .. } => {
            ensure_nonzero_u64("risk.timeout_ms", *timeout_ms)
        }
        RiskConfig::Composite { gates } => {
            if gates.is_empty() {
                return Err(ConfigError::InvalidRiskConfig {
                    reason: "composite gate needs at least one member".to_string(),
                });
            }
            gates.iter().try_for_each(validate_risk)
        }
    }
}

impl EngineConfig {
    pub fn validate(self) -> Result<ValidatedEngineConfig, ConfigError> {
        let currency = self
            .currency
            .parse::<Currency>()
            .map_err(|_| ConfigError::InvalidCurrency {
                value: self.currency.clone(),
            })?;
        ensure_positive("max_amount", self.max_amount)?;
        ensure_nonzero_u64("section_timeout_ms", self.section_timeout_ms)?;
        ensure_nonzero_u64("commit_timeout_ms", self.commit_timeout_ms)?;
        let review_queue_capacity =
            nonzero_usize("review_queue_capacity", self.review_queue_capacity)?;
        let max_operations =
            nonzero_u32("rate_limit.max_operations", self.rate_limit.max_operations)?;
        ensure_nonzero_u64("rate_limit.window_ms", self.rate_limit.window_ms)?;
        validate_risk(&self.risk)?;

        let betting = self.betting;
        let default_commission = CommissionRate::from_bps(betting.default_commission_bps)
            .map_err(|_| ConfigError::InvalidCommissionRate {
                field: "betting.default_commission_bps",
                value: u32::from(betting.default_commission_bps),
                max: u32::from(BASIS_POINTS_SCALE),
            })?;
        let min_stake = Amount::new(betting.min_stake).map_err(|_| ConfigError::InvalidNonZero {
            field: "betting.min_stake",
            value: betting.min_stake,
        })?;
        let max_stake = Amount::new(betting.max_stake).map_err(|_| ConfigError::InvalidNonZero {
            field: "betting.max_stake",
            value: betting.max_stake,
        })?;
        if min_stake > max_stake {
            return Err(ConfigError::InvalidStakeRange {
                min: betting.min_stake,
                max: betting.max_stake,
            });
        }
        if betting.max_stake > self.max_amount {
            return Err(ConfigError::StakeAboveMaxAmount {
                max_stake: betting.max_stake,
                max_amount: self.max_amount,
            });
        }
        if betting.max_participants < 2 {
            return Err(ConfigError::InvalidMaxParticipants {
                value: betting.max_participants,
            });
        }

        Ok(ValidatedEngineConfig {
            currency,
            platform_owner: OwnerId(self.platform_owner),
            max_amount: self.max_amount,
            section_timeout: Duration::from_millis(self.section_timeout_ms),
            commit_timeout: Duration::from_millis(self.commit_timeout_ms),
            cache_capacity: self.cache_capacity,
            review_queue_capacity,
            rate_limit: RateLimit {
                max_operations,
                window: Duration::from_millis(self.rate_limit.window_ms),
            },
            risk: self.risk,
            betting: BettingRules {
                default_commission,
                min_stake,
                max_stake,
                max_participants: betting.max_participants,
                on_accept_failure: betting.on_accept_failure,
                adjudicators: betting.adjudicators.into_iter().collect(),
            },
        })
    }
}
