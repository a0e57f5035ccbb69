use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::Duration,
};

use async_trait::async_trait;
use tokio::time::Instant;

use crate::{
    TallymanError,
    store::{
        ExpirationSubscription, FastStore, OpenWindow, ShadowClaim, ShadowRestore,
        TokenBucketState, WindowKeys,
    },
};

/// Configuration for [`LocalFastStore`].
#[derive(Clone, Debug)]
pub struct LocalFastStoreOptions {
    /// How often the reaper removes expired keys that nobody touched.
    pub reap_interval: Duration,
    /// Capacity of each expiration subscription. Events beyond it are dropped.
    pub expiration_channel_capacity: usize,
}

impl Default for LocalFastStoreOptions {
    fn default() -> Self {
        Self {
            reap_interval: Duration::from_millis(100),
            expiration_channel_capacity: 10_000,
        }
    }
}

#[derive(Debug, Clone)]
enum Value {
    Int(i64),
    Token(Arc<str>),
    Bucket { tokens: f64, refilled_at: Instant },
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Keys and expiry bookkeeping for one locked operation.
///
/// Keys found expired are removed immediately and queued in `expired` until the lock
/// is released, then published.
struct Keyspace<'a> {
    entries: &'a mut HashMap<String, Entry>,
    expired: Vec<String>,
    now: Instant,
}

impl Keyspace<'_> {
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        if self.entries.get(key).is_some_and(|e| e.is_expired(self.now)) {
            self.entries.remove(key);
            self.expired.push(key.to_string());
        }

        self.entries.get_mut(key)
    }

    fn contains(&mut self, key: &str) -> bool {
        self.live(key).is_some()
    }

    fn get_int(&mut self, key: &str) -> Result<Option<i64>, TallymanError> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Int(v),
                ..
            }) => Ok(Some(*v)),
            Some(_) => Err(TallymanError::WrongType(key.to_string())),
        }
    }

    fn get_token(&mut self, key: &str) -> Option<Arc<str>> {
        match self.live(key) {
            Some(Entry {
                value: Value::Token(token),
                ..
            }) => Some(token.clone()),
            _ => None,
        }
    }

    fn incr(&mut self, key: &str, delta: i64) -> Result<Option<i64>, TallymanError> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Int(v),
                ..
            }) => {
                *v = v
                    .checked_add(delta)
                    .ok_or_else(|| TallymanError::Overflow(key.to_string()))?;
                Ok(Some(*v))
            }
            Some(_) => Err(TallymanError::WrongType(key.to_string())),
        }
    }

    /// Add `delta` to an integer, creating it without a TTL when absent.
    fn incr_or_create(&mut self, key: &str, delta: i64) -> Result<i64, TallymanError> {
        match self.incr(key, delta)? {
            Some(value) => Ok(value),
            None => {
                self.put(key, Value::Int(delta), None);
                Ok(delta)
            }
        }
    }

    /// Replace the TTL of a live key. Returns whether the key exists.
    fn set_ttl(&mut self, key: &str, ttl: Option<Duration>) -> bool {
        let expires_at = ttl.map(|ttl| self.now + ttl);

        match self.live(key) {
            Some(entry) => {
                entry.expires_at = expires_at;
                true
            }
            None => false,
        }
    }

    fn put(&mut self, key: &str, value: Value, ttl: Option<Duration>) {
        let expires_at = ttl.map(|ttl| self.now + ttl);
        self.entries
            .insert(key.to_string(), Entry { value, expires_at });
    }

    fn remove(&mut self, key: &str) -> bool {
        self.live(key).is_some() && self.entries.remove(key).is_some()
    }

    fn reap(&mut self) {
        let now = self.now;
        let expired = &mut self.expired;

        self.entries.retain(|key, entry| {
            if entry.is_expired(now) {
                expired.push(key.clone());
                false
            } else {
                true
            }
        });
    }
}

/// In-process [`FastStore`].
///
/// Every operation runs under one mutex, so the window primitives are atomic across
/// their keys. TTLs follow the tokio clock, so a paused runtime controls expiry.
///
/// Expired keys are removed lazily on access and by a background reaper, and their
/// names are published to every live [`ExpirationSubscription`].
///
/// Must be constructed inside a tokio runtime. The reaper stops once the last
/// `Arc<LocalFastStore>` is dropped.
pub struct LocalFastStore {
    keyspace: Mutex<HashMap<String, Entry>>,
    subscribers: Mutex<Vec<async_channel::Sender<String>>>,
    options: LocalFastStoreOptions,
}

impl LocalFastStore {
    /// Create a store and start its reaper.
    pub fn new(options: LocalFastStoreOptions) -> Arc<Self> {
        let store = Arc::new(Self {
            keyspace: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
            options,
        });

        Self::spawn_reaper(Arc::downgrade(&store), store.options.reap_interval);

        store
    }

    fn spawn_reaper(store: Weak<Self>, reap_interval: Duration) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(reap_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                interval.tick().await;

                let Some(store) = store.upgrade() else {
                    break;
                };

                if let Err(err) = store.with_keyspace(|keyspace| {
                    keyspace.reap();
                    Ok(())
                }) {
                    tracing::error!(error = ?err, "Local fast store reaper failed");
                    break;
                }
            }
        });
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.with_keyspace(|keyspace| {
            keyspace.reap();
            Ok(keyspace.entries.len())
        })
        .unwrap_or(0)
    }

    /// Whether no live keys remain.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining TTL of `key`, if it exists and has one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        self.with_keyspace(|keyspace| {
            let now = keyspace.now;
            Ok(keyspace
                .live(key)
                .and_then(|entry| entry.expires_at)
                .map(|at| at.saturating_duration_since(now)))
        })
        .ok()
        .flatten()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Entry>>, TallymanError> {
        self.keyspace.lock().map_err(|_| {
            TallymanError::StoreUnavailable("local fast store lock poisoned".to_string())
        })
    }

    fn with_keyspace<T>(
        &self,
        f: impl FnOnce(&mut Keyspace<'_>) -> Result<T, TallymanError>,
    ) -> Result<T, TallymanError> {
        let mut guard = self.lock()?;

        let mut keyspace = Keyspace {
            entries: &mut guard,
            expired: Vec::new(),
            now: Instant::now(),
        };

        let result = f(&mut keyspace);
        let expired = std::mem::take(&mut keyspace.expired);
        drop(guard);

        self.publish_expired(expired);

        result
    }

    fn publish_expired(&self, expired: Vec<String>) {
        if expired.is_empty() {
            return;
        }

        let Ok(mut subscribers) = self.subscribers.lock() else {
            tracing::error!("Local fast store subscriber lock poisoned");
            return;
        };

        subscribers.retain(|sender| !sender.is_closed());

        for key in expired {
            tracing::debug!(key = %key, "Key expired");

            for sender in subscribers.iter() {
                if let Err(err) = sender.try_send(key.clone()) {
                    tracing::warn!(error = ?err, key = %key, "Dropped expiration event");
                }
            }
        }
    }
}

#[async_trait]
impl FastStore for LocalFastStore {
    async fn exists(&self, key: &str) -> Result<bool, TallymanError> {
        self.with_keyspace(|keyspace| Ok(keyspace.contains(key)))
    }

    async fn get(&self, key: &str) -> Result<Option<i64>, TallymanError> {
        self.with_keyspace(|keyspace| keyspace.get_int(key))
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: i64,
        ttl: Duration,
    ) -> Result<bool, TallymanError> {
        self.with_keyspace(|keyspace| {
            if keyspace.contains(key) {
                return Ok(false);
            }

            keyspace.put(key, Value::Int(value), Some(ttl));
            Ok(true)
        })
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, TallymanError> {
        self.with_keyspace(|keyspace| {
            keyspace
                .incr(key, delta)?
                .ok_or_else(|| TallymanError::NotFound(key.to_string()))
        })
    }

    async fn delete(&self, key: &str) -> Result<bool, TallymanError> {
        self.with_keyspace(|keyspace| Ok(keyspace.remove(key)))
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, TallymanError> {
        self.with_keyspace(|keyspace| {
            keyspace.reap();

            Ok(keyspace
                .entries
                .keys()
                .filter(|key| key.starts_with(prefix))
                .cloned()
                .collect())
        })
    }

    async fn subscribe_expirations(&self) -> Result<ExpirationSubscription, TallymanError> {
        let (tx, rx) = async_channel::bounded(self.options.expiration_channel_capacity.max(1));

        self.subscribers
            .lock()
            .map_err(|_| {
                TallymanError::StoreUnavailable("local fast store lock poisoned".to_string())
            })?
            .push(tx);

        Ok(ExpirationSubscription::new(rx))
    }

    async fn open_window(
        &self,
        keys: &WindowKeys,
        delta: i64,
        ttl: Duration,
    ) -> Result<OpenWindow, TallymanError> {
        self.with_keyspace(|keyspace| {
            if keyspace.contains(&keys.buffer) {
                return Ok(OpenWindow::AlreadyOpen);
            }

            let displaced = keyspace.get_int(&keys.shadow).ok().flatten();

            keyspace.put(&keys.buffer, Value::Int(delta), Some(ttl));
            keyspace.put(&keys.shadow, Value::Int(delta), None);
            keyspace.remove(&keys.claim);

            Ok(OpenWindow::Opened { displaced })
        })
    }

    async fn add_to_window(
        &self,
        keys: &WindowKeys,
        delta: i64,
    ) -> Result<Option<i64>, TallymanError> {
        self.with_keyspace(|keyspace| {
            let Some(buffer) = keyspace.get_int(&keys.buffer)? else {
                return Ok(None);
            };

            if buffer.checked_add(delta).is_none() {
                return Err(TallymanError::Overflow(keys.buffer.to_string()));
            }

            let shadow = keyspace.incr_or_create(&keys.shadow, delta)?;
            keyspace.incr(&keys.buffer, delta)?;

            Ok(Some(shadow))
        })
    }

    async fn claim_shadow(
        &self,
        keys: &WindowKeys,
        expected: i64,
        token: &str,
        ttl: Duration,
    ) -> Result<ShadowClaim, TallymanError> {
        self.with_keyspace(|keyspace| {
            if keyspace.contains(&keys.buffer) {
                return Ok(ShadowClaim::WindowOpen);
            }

            if keyspace.get_int(&keys.shadow)? != Some(expected) || keyspace.contains(&keys.claim)
            {
                return Ok(ShadowClaim::Lost);
            }

            keyspace.put(&keys.claim, Value::Token(Arc::from(token)), Some(ttl));
            keyspace.set_ttl(&keys.shadow, Some(ttl));
            Ok(ShadowClaim::Claimed)
        })
    }

    async fn release_shadow(&self, keys: &WindowKeys, token: &str) -> Result<bool, TallymanError> {
        self.with_keyspace(|keyspace| {
            if keyspace.get_token(&keys.claim).as_deref() != Some(token) {
                return Ok(false);
            }

            keyspace.remove(&keys.shadow);
            keyspace.remove(&keys.claim);
            Ok(true)
        })
    }

    async fn restore_shadow(
        &self,
        keys: &WindowKeys,
        token: &str,
        value: i64,
    ) -> Result<ShadowRestore, TallymanError> {
        self.with_keyspace(|keyspace| {
            let claim = keyspace.get_token(&keys.claim);
            let claim_held = claim.as_deref() == Some(token);

            if claim_held && keyspace.set_ttl(&keys.shadow, None) {
                return Ok(ShadowRestore::Retained);
            }

            if claim_held || claim.is_none() || keyspace.contains(&keys.buffer) {
                keyspace.incr_or_create(&keys.shadow, value)?;
                return Ok(ShadowRestore::Merged);
            }

            Ok(ShadowRestore::Conflict)
        })
    }

    async fn take_tokens(
        &self,
        key: &str,
        capacity: u64,
        refill_period: Duration,
        cost: u64,
    ) -> Result<TokenBucketState, TallymanError> {
        self.with_keyspace(|keyspace| {
            let now = keyspace.now;

            let tokens = match keyspace.live(key) {
                None => capacity as f64,
                Some(Entry {
                    value:
                        Value::Bucket {
                            tokens,
                            refilled_at,
                        },
                    ..
                }) => refill(*tokens, *refilled_at, now, capacity, refill_period),
                Some(_) => return Err(TallymanError::WrongType(key.to_string())),
            };

            let (tokens, state) = take(tokens, capacity, refill_period, cost);

            keyspace.put(
                key,
                Value::Bucket {
                    tokens,
                    refilled_at: now,
                },
                Some(refill_period),
            );

            Ok(state)
        })
    }
}

/// Tokens in a bucket after refilling continuously from `refilled_at` to `now`.
fn refill(
    tokens: f64,
    refilled_at: Instant,
    now: Instant,
    capacity: u64,
    refill_period: Duration,
) -> f64 {
    let elapsed_ms = now.saturating_duration_since(refilled_at).as_secs_f64() * 1000.0;
    let period_ms = (refill_period.as_secs_f64() * 1000.0).max(1.0);

    (tokens + elapsed_ms * capacity as f64 / period_ms).min(capacity as f64)
}

/// Take `cost` tokens if available; returns the new level and the outcome.
fn take(
    tokens: f64,
    capacity: u64,
    refill_period: Duration,
    cost: u64,
) -> (f64, TokenBucketState) {
    let cost_f = cost as f64;

    if tokens >= cost_f {
        let left = tokens - cost_f;
        return (
            left,
            TokenBucketState {
                admitted: true,
                remaining: left.floor() as u64,
                retry_after_ms: 0,
            },
        );
    }

    let period_ms = (refill_period.as_secs_f64() * 1000.0).max(1.0);
    let retry_after_ms = ((cost_f - tokens) * period_ms / capacity as f64).ceil() as u64;

    (
        tokens,
        TokenBucketState {
            admitted: false,
            remaining: tokens.floor() as u64,
            retry_after_ms,
        },
    )
}
