//! Wagerbook wallet ledger and escrow engine.
//!
//! This crate owns every balance mutation in the system: deposits, withdrawals, stake locks and
//! releases, and the settlement of peer-to-peer bets held in escrow. The primary entrypoint is
//! [`Engine`].
//!
//! ## Ledger invariants
//! - A wallet's stored `available` and `locked` balances always equal the fold of its ledger
//!   entries, and neither is ever negative.
//! - Ledger entries are append-only. A correction is a new entry, never an edit.
//! - Every balance change, its ledger entries, and its idempotency record commit in one storage
//!   transaction. A replayed idempotency key returns the recorded result and writes nothing.
//! - A commit that finds stored balances out of step with the ledger aborts and freezes the
//!   wallet until it is reconciled.
//!
//! ## Concurrency
//! Operations on one wallet run inside that wallet's critical section; multi-wallet operations
//! take every section in one canonical order (bets before wallets, then ascending id). The
//! storage transaction re-validates balances regardless, so the sections only serialise
//! contending writers.
//!
//! ## Minimal usage (example)
//! ```rust,ignore
//! # #[cfg(feature = "mocks")]
//! # {
//! use wagerbook_engine::mocks::{create_engine, create_permissive_config, key};
//! use wagerbook_engine::risk::Eligibility;
//! use wagerbook_types::{Currency, OwnerId};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let test = create_engine(create_permissive_config());
//! let wallet = test.engine.ensure_wallet(OwnerId(1), Currency::USD)?;
//! test.engine
//!     .deposit(wallet.id, 1_000, key("deposit-1"), Eligibility::Verified)
//!     .await?;
//! # Ok(())
//! # }
//! # }
//! ```

mod backoff;
pub mod cache;
pub mod clock;
pub mod config;
pub mod coordinator;
mod engine;
mod error;
pub mod escrow;
pub mod gate;
pub mod metrics;
pub mod operator;
pub mod rate;
pub mod reconcile;
pub mod risk;
pub mod store;
pub mod worker;

#[cfg(any(test, feature = "mocks"))]
pub mod mocks;

#[cfg(test)]
mod escrow_tests;
#[cfg(test)]
mod idempotency_tests;

pub use clock::{Clock, SystemClock};
pub use config::{ConfigError, EngineConfig, ValidatedEngineConfig};
pub use engine::Engine;
pub use error::{Completion, EngineError, StoreError};
pub use escrow::{Adjudication, BetUpdate, NewBet, SweepReport};
pub use metrics::EngineMetricsSnapshot;
pub use operator::{BalanceChange, Settlement, Stake};
pub use reconcile::Reconciliation;
pub use risk::{Decision, Eligibility, RiskEvaluator, RiskOperation, RiskRequest};
pub use store::{LedgerStore, SqliteStore};
pub use worker::{
    process_notification, spawn_payment_workers, EnqueueError, NotificationOutcome,
    PaymentKind, PaymentNotification, PaymentQueue, PaymentStatus, WorkerConfig,
};
