use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use wagerbook_types::{Wallet, WalletId};

struct CacheInner {
    wallets: HashMap<WalletId, Wallet>,
    /// Bumped on every invalidation; loads that started before a bump are not cached.
    generation: u64,
}

/// Read-through cache of wallet snapshots.
///
/// The store stays the system of record. Every commit invalidates the wallets it touched before
/// returning, and a load racing with an invalidation is discarded rather than cached.
pub struct BalanceCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
}

impl BalanceCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                wallets: HashMap::new(),
                generation: 0,
            }),
            capacity,
        }
    }

    fn inner(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, id: WalletId) -> Option<Wallet> {
        self.inner().wallets.get(&id).cloned()
    }

    /// Token to pass to [`BalanceCache::insert`] after loading from the store.
    pub fn generation(&self) -> u64 {
        self.inner().generation
    }

    pub fn insert(&self, wallet: Wallet, generation: u64) {
        if self.capacity == 0 {
            return;
        }
        let mut inner = self.inner();
        if inner.generation != generation {
            return;
        }
        if inner.wallets.len() >= self.capacity && !inner.wallets.contains_key(&wallet.id) {
            if let Some(evict) = inner.wallets.keys().next().copied() {
                inner.wallets.remove(&evict);
            }
        }
        inner.wallets.insert(wallet.id, wallet);
    }

    pub fn invalidate(&self, ids: impl IntoIterator<Item = WalletId>) {
        let mut inner = self.inner();
        inner.generation += 1;
        for id in ids {
            inner.wallets.remove(&id);
        }
    }

    pub fn len(&self) -> usize {
        self.inner().wallets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
