//! Per-wallet and per-bet critical sections.
//!
//! Sections are FIFO-fair tokio mutexes keyed by [`LockKey`]. A guard over several keys always
//! acquires them in ascending key order against a single deadline, so two operations touching the
//! same set of wallets can never deadlock and unrelated wallets never contend.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex as SectionMutex, OwnedMutexGuard};
use tokio::time::{timeout_at, Instant};
use tracing::debug;
use wagerbook_types::{BetId, WalletId};

use crate::EngineError;

/// Canonical lock order: every bet section sorts before every wallet section, then by id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum LockKey {
    Bet(BetId),
    Wallet(WalletId),
}

pub struct Coordinator {
    sections: Mutex<HashMap<LockKey, Arc<SectionMutex<()>>>>,
    timeout: Duration,
}

impl Coordinator {
    pub fn new(timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            sections: Mutex::new(HashMap::new()),
            timeout,
        })
    }

    fn section(&self, key: LockKey) -> Arc<SectionMutex<()>> {
        let mut sections = self.sections.lock().unwrap_or_else(PoisonError::into_inner);
        sections.entry(key).or_default().clone()
    }

    /// Drop map entries nobody holds or waits on.
    fn prune(&self, keys: &[LockKey]) {
        let mut sections = self.sections.lock().unwrap_or_else(PoisonError::into_inner);
        for key in keys {
            if sections
                .get(key)
                .is_some_and(|section| Arc::strong_count(section) == 1)
            {
                sections.remove(key);
            }
        }
    }

    /// Enter the sections for `keys`, waiting at most the configured timeout in total.
    ///
    /// On timeout every section already entered is released before [`EngineError::Busy`] is
    /// returned, naming the key that could not be acquired.
    pub async fn acquire(
        self: &Arc<Self>,
        mut keys: Vec<LockKey>,
    ) -> Result<SectionGuard, EngineError> {
        keys.sort_unstable();
        keys.dedup();

        let deadline = Instant::now() + self.timeout;
        let mut held = Vec::with_capacity(keys.len());
        for key in &keys {
            let section = self.section(*key);
            match timeout_at(deadline, section.lock_owned()).await {
                Ok(guard) => held.push(guard),
                Err(_) => {
                    drop(held);
                    self.prune(&keys);
                    debug!(?key, "critical section busy");
                    return Err(EngineError::Busy { key: *key });
                }
            }
        }
        Ok(SectionGuard {
            coordinator: self.clone(),
            keys,
            held,
        })
    }

    /// Number of sections currently tracked.
    pub fn tracked(&self) -> usize {
        self.sections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Holds a set of critical sections until dropped.
pub struct SectionGuard {
    coordinator: Arc<Coordinator>,
    keys: Vec<LockKey>,
    held: Vec<OwnedMutexGuard<()>>,
}

impl SectionGuard {
    pub fn keys(&self) -> &[LockKey] {
        &self.keys
    }
}

impl Drop for SectionGuard {
    fn drop(&mut self) {
        self.held.clear();
        self.coordinator.prune(&self.keys);
    }
}
