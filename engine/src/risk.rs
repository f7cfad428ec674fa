//! Risk evaluation for deposits, withdrawals, and stake acceptance.
//!
//! A [`RiskGate`] is built from [`RiskConfig`]. Rule-based gates are evaluated inline. Model-based
//! gates call an external [`RiskEvaluator`] on the blocking pool under a deadline, and a
//! composite gate runs its members concurrently and keeps the most severe decision.

use futures::future::{join_all, BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use wagerbook_types::{Amount, MinorUnits, WalletId};

use crate::config::{ConfigError, FailPolicy, RiskConfig};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", content = "reason", rename_all = "snake_case")]
pub enum Decision {
    Allow,
    /// Proceed, but queue the operation for manual review.
    Review(String),
    Deny(String),
}

impl Decision {
    fn severity(&self) -> u8 {
        match self {
            Decision::Allow => 0,
            Decision::Review(_) => 1,
            Decision::Deny(_) => 2,
        }
    }

    /// The more severe of two decisions; ties keep `self`.
    pub fn max(self, other: Decision) -> Decision {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskOperation {
    Deposit,
    Withdrawal,
    BetAcceptance,
}

/// Identity verification state of the wallet owner, supplied by the caller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Eligibility {
    Verified,
    #[default]
    Unverified,
}

/// Prior volume of one operation type over trailing windows, excluding the current request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct WindowVolume {
    pub day: MinorUnits,
    pub week: MinorUnits,
    pub month: MinorUnits,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RiskRequest {
    pub wallet: WalletId,
    pub operation: RiskOperation,
    pub amount: Amount,
    pub eligibility: Eligibility,
    pub volume: WindowVolume,
}

/// External risk model.
///
/// Implementations may block; the gate always calls them off the async runtime.
pub trait RiskEvaluator: Send + Sync + 'static {
    fn evaluate(&self, request: &RiskRequest) -> Decision;
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RuleSet {
    pub max_amount: Option<MinorUnits>,
    pub review_above: Option<MinorUnits>,
    pub kyc_required_above: Option<MinorUnits>,
    pub daily_deposit_limit: Option<MinorUnits>,
    pub daily_withdrawal_limit: Option<MinorUnits>,
    pub daily_bet_limit: Option<MinorUnits>,
    pub weekly_bet_limit: Option<MinorUnits>,
    pub monthly_bet_limit: Option<MinorUnits>,
}

const NO_LIMIT: (&str, Option<MinorUnits>, MinorUnits) = ("", None, 0);

impl RuleSet {
    pub fn evaluate(&self, request: &RiskRequest) -> Decision {
        let amount = request.amount.get();
        if self.max_amount.is_some_and(|max| amount > max) {
            return Decision::Deny(format!("amount {amount} exceeds single-operation maximum"));
        }
        if request.eligibility == Eligibility::Unverified
            && self.kyc_required_above.is_some_and(|limit| amount > limit)
        {
            return Decision::Deny("identity verification required".to_string());
        }
        let volume = request.volume;
        let windows = match request.operation {
            RiskOperation::Deposit => {
                [("daily", self.daily_deposit_limit, volume.day), NO_LIMIT, NO_LIMIT]
            }
            RiskOperation::Withdrawal => {
                [("daily", self.daily_withdrawal_limit, volume.day), NO_LIMIT, NO_LIMIT]
            }
            RiskOperation::BetAcceptance => [
                ("daily", self.daily_bet_limit, volume.day),
                ("weekly", self.weekly_bet_limit, volume.week),
                ("monthly", self.monthly_bet_limit, volume.month),
            ],
        };
        for (window, limit, used) in windows {
            if let Some(limit) = limit {
                if used.saturating_add(amount) > limit {
                    return Decision::Deny(format!(
                        "{window} limit {limit} exceeded (used {used}, requested {amount})"
                    ));
                }
            }
        }
        if self.review_above.is_some_and(|threshold| amount > threshold) {
            return Decision::Review(format!("amount {amount} above review threshold"));
        }
        Decision::Allow
    }
}

pub enum RiskGate {
    AllowAll,
    RuleBased(RuleSet),
    ModelBased {
        evaluator: Arc<dyn RiskEvaluator>,
        timeout: Duration,
        on_failure: FailPolicy,
    },
    Composite(Vec<RiskGate>),
}

fn failure_decision(policy: FailPolicy, reason: &str) -> Decision {
    match policy {
        FailPolicy::Closed => Decision::Deny(reason.to_string()),
        FailPolicy::Open => Decision::Allow,
        FailPolicy::Review => Decision::Review(reason.to_string()),
    }
}

impl RiskGate {
    /// Build a gate. Model-based members share `evaluator`, which must be present if any are
    /// configured.
    pub fn from_config(
        config: &RiskConfig,
        evaluator: Option<&Arc<dyn RiskEvaluator>>,
    ) -> Result<Self, ConfigError> {
        Ok(match config {
            RiskConfig::AllowAll => RiskGate::AllowAll,
            RiskConfig::RuleBased {
                max_amount,
                review_above,
                kyc_required_above,
                daily_deposit_limit,
                daily_withdrawal_limit,
                daily_bet_limit,
                weekly_bet_limit,
                monthly_bet_limit,
            } => RiskGate::RuleBased(RuleSet {
                max_amount: *max_amount,
                review_above: *review_above,
                kyc_required_above: *kyc_required_above,
                daily_deposit_limit: *daily_deposit_limit,
                daily_withdrawal_limit: *daily_withdrawal_limit,
                daily_bet_limit: *daily_bet_limit,
                weekly_bet_limit: *weekly_bet_limit,
                monthly_bet_limit: *monthly_bet_limit,
            }),
            RiskConfig::ModelBased {
                timeout_ms,
                on_failure,
            } => {
                let evaluator = evaluator.ok_or_else(|| ConfigError::InvalidRiskConfig {
                    reason: "model_based gate configured without a risk evaluator".to_string(),
                })?;
                RiskGate::ModelBased {
                    evaluator: evaluator.clone(),
                    timeout: Duration::from_millis(*timeout_ms),
                    on_failure: *on_failure,
                }
            }
            RiskConfig::Composite { gates } => RiskGate::Composite(
                gates
                    .iter()
                    .map(|gate| RiskGate::from_config(gate, evaluator))
                    .collect::<Result<_, _>>()?,
            ),
        })
    }

    pub fn evaluate<'a>(&'a self, request: &'a RiskRequest) -> BoxFuture<'a, Decision> {
        match self {
            RiskGate::AllowAll => futures::future::ready(Decision::Allow).boxed(),
            RiskGate::RuleBased(rules) => futures::future::ready(rules.evaluate(request)).boxed(),
            RiskGate::ModelBased {
                evaluator,
                timeout,
                on_failure,
            } => {
                let evaluator = evaluator.clone();
                let owned = request.clone();
                let call = tokio::task::spawn_blocking(move || evaluator.evaluate(&owned));
                async move {
                    match tokio::time::timeout(*timeout, call).await {
                        Ok(Ok(decision)) => decision,
                        Ok(Err(err)) => {
                            warn!(wallet = %request.wallet, ?err, "risk evaluator failed");
                            failure_decision(*on_failure, "risk evaluator failed")
                        }
                        Err(_) => {
                            warn!(wallet = %request.wallet, ?timeout, "risk evaluator timed out");
                            failure_decision(*on_failure, "risk evaluator timed out")
                        }
                    }
                }
                .boxed()
            }
            RiskGate::Composite(gates) => async move {
                join_all(gates.iter().map(|gate| gate.evaluate(request)))
                    .await
                    .into_iter()
                    .fold(Decision::Allow, Decision::max)
            }
            .boxed(),
        }
    }
}
