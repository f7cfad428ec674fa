use crate::config::{EngineConfig, RateLimitConfig, RiskConfig};
use crate::risk::{Eligibility, RiskEvaluator};
use crate::{Clock, Engine};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use wagerbook_types::{Currency, IdempotencyKey, OwnerId, Wallet};

pub use crate::store::MemoryStore;

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            now: AtomicU64::new(start_ms),
        })
    }

    pub fn set(&self, now_ms: u64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Creates a config with no risk rules and a rate limit tests will not hit
pub fn create_permissive_config() -> EngineConfig {
    let mut config = EngineConfig {
        risk: RiskConfig::AllowAll,
        rate_limit: RateLimitConfig {
            max_operations: 100_000,
            window_ms: 1_000,
        },
        ..EngineConfig::default()
    };
    config.betting.min_stake = 1;
    config.betting.max_participants = 4;
    config.betting.adjudicators = vec!["ops".to_string()];
    config
}

pub struct TestEngine {
    pub engine: Arc<Engine<MemoryStore>>,
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
}

/// Creates an engine over a fresh in-memory store with the clock at 1_000 ms
pub fn create_engine(config: EngineConfig) -> TestEngine {
    create_engine_with_evaluator(config, None)
}

pub fn create_engine_with_evaluator(
    config: EngineConfig,
    evaluator: Option<Arc<dyn RiskEvaluator>>,
) -> TestEngine {
    let store = Arc::new(MemoryStore::new());
    let clock = ManualClock::new(1_000);
    let config = config.validate().expect("invalid test config");
    let engine = Engine::new(store.clone(), config, clock.clone(), evaluator)
        .expect("Failed to create engine");
    TestEngine {
        engine: Arc::new(engine),
        store,
        clock,
    }
}

pub fn key(raw: &str) -> IdempotencyKey {
    IdempotencyKey::new(raw).expect("invalid test key")
}

/// Creates a USD wallet for `owner` holding `amount` in its available bucket
pub async fn create_funded_wallet(
    engine: &Engine<MemoryStore>,
    owner: u64,
    amount: i64,
) -> Wallet {
    let wallet = engine
        .ensure_wallet(OwnerId(owner), Currency::USD)
        .expect("Failed to create wallet");
    if amount > 0 {
        engine
            .deposit(
                wallet.id,
                amount,
                key(&format!("fund-{owner}-{}", wallet.version)),
                Eligibility::Verified,
            )
            .await
            .expect("Failed to fund wallet");
    }
    engine.wallet(wallet.id).expect("wallet vanished")
}
