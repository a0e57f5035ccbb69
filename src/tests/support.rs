use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    DurableStore, ExpirationSubscription, FastStore, LocalFastStore, LocalFastStoreOptions,
    LocalSumStore, OpenWindow, ShadowClaim, ShadowRestore, StorePrefix, SumRecord, TallyKey,
    TallymanError, TokenBucketState, WindowKeys, store::KeyGenerator,
};

pub(super) fn unique_prefix() -> StorePrefix {
    let n: u64 = rand::random();
    StorePrefix::try_from(format!("tallyman_test_{n}")).unwrap()
}

pub(super) fn key(s: &str) -> TallyKey {
    TallyKey::try_from(s).unwrap()
}

pub(super) fn keygen(prefix: &StorePrefix) -> KeyGenerator {
    KeyGenerator::new(prefix.clone())
}

pub(super) fn local_store() -> Arc<LocalFastStore> {
    LocalFastStore::new(LocalFastStoreOptions::default())
}

/// A [`DurableStore`] that can be switched into failing every write.
#[derive(Default)]
pub(super) struct FlakySumStore {
    inner: LocalSumStore,
    failing: AtomicBool,
    attempts: AtomicUsize,
}

impl FlakySumStore {
    pub(super) fn new(failing: bool) -> Arc<Self> {
        let store = Self::default();
        store.set_failing(failing);
        Arc::new(store)
    }

    pub(super) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub(super) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DurableStore for FlakySumStore {
    async fn upsert_add(&self, key: &TallyKey, delta: i64) -> Result<i64, TallymanError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if self.failing.load(Ordering::SeqCst) {
            return Err(TallymanError::StoreUnavailable(
                "durable store down".to_string(),
            ));
        }

        self.inner.upsert_add(key, delta).await
    }

    async fn get(&self, key: &TallyKey) -> Result<Option<SumRecord>, TallymanError> {
        self.inner.get(key).await
    }
}

/// A [`DurableStore`] whose writes take `delay` and can be switched into failing.
pub(super) struct SlowSumStore {
    inner: LocalSumStore,
    delay: Duration,
    failing: AtomicBool,
}

impl SlowSumStore {
    pub(super) fn new(delay: Duration, failing: bool) -> Arc<Self> {
        Arc::new(Self {
            inner: LocalSumStore::new(),
            delay,
            failing: AtomicBool::new(failing),
        })
    }
}

#[async_trait]
impl DurableStore for SlowSumStore {
    async fn upsert_add(&self, key: &TallyKey, delta: i64) -> Result<i64, TallymanError> {
        tokio::time::sleep(self.delay).await;

        if self.failing.load(Ordering::SeqCst) {
            return Err(TallymanError::StoreUnavailable(
                "durable store timed out".to_string(),
            ));
        }

        self.inner.upsert_add(key, delta).await
    }

    async fn get(&self, key: &TallyKey) -> Result<Option<SumRecord>, TallymanError> {
        self.inner.get(key).await
    }
}

/// A [`FastStore`] over [`LocalFastStore`] whose first `release_shadow` call fails
/// without reaching the store.
pub(super) struct UnreleasableFastStore {
    inner: Arc<LocalFastStore>,
    release_failed: AtomicBool,
}

impl UnreleasableFastStore {
    pub(super) fn new(inner: Arc<LocalFastStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            release_failed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl FastStore for UnreleasableFastStore {
    async fn exists(&self, key: &str) -> Result<bool, TallymanError> {
        self.inner.exists(key).await
    }

    async fn get(&self, key: &str) -> Result<Option<i64>, TallymanError> {
        self.inner.get(key).await
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: i64,
        ttl: Duration,
    ) -> Result<bool, TallymanError> {
        self.inner.set_if_absent(key, value, ttl).await
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, TallymanError> {
        self.inner.incr_by(key, delta).await
    }

    async fn delete(&self, key: &str) -> Result<bool, TallymanError> {
        self.inner.delete(key).await
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, TallymanError> {
        self.inner.scan_prefix(prefix).await
    }

    async fn subscribe_expirations(&self) -> Result<ExpirationSubscription, TallymanError> {
        self.inner.subscribe_expirations().await
    }

    async fn open_window(
        &self,
        keys: &WindowKeys,
        delta: i64,
        ttl: Duration,
    ) -> Result<OpenWindow, TallymanError> {
        self.inner.open_window(keys, delta, ttl).await
    }

    async fn add_to_window(
        &self,
        keys: &WindowKeys,
        delta: i64,
    ) -> Result<Option<i64>, TallymanError> {
        self.inner.add_to_window(keys, delta).await
    }

    async fn claim_shadow(
        &self,
        keys: &WindowKeys,
        expected: i64,
        token: &str,
        ttl: Duration,
    ) -> Result<ShadowClaim, TallymanError> {
        self.inner.claim_shadow(keys, expected, token, ttl).await
    }

    async fn release_shadow(&self, keys: &WindowKeys, token: &str) -> Result<bool, TallymanError> {
        if !self.release_failed.swap(true, Ordering::SeqCst) {
            return Err(TallymanError::StoreUnavailable(
                "fast store connection reset".to_string(),
            ));
        }

        self.inner.release_shadow(keys, token).await
    }

    async fn restore_shadow(
        &self,
        keys: &WindowKeys,
        token: &str,
        value: i64,
    ) -> Result<ShadowRestore, TallymanError> {
        self.inner.restore_shadow(keys, token, value).await
    }

    async fn take_tokens(
        &self,
        key: &str,
        capacity: u64,
        refill_period: Duration,
        cost: u64,
    ) -> Result<TokenBucketState, TallymanError> {
        self.inner.take_tokens(key, capacity, refill_period, cost).await
    }
}
