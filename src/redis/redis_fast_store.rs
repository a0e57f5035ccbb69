use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use redis::Script;

use crate::{
    TallymanError,
    redis::{RedisExpirationListener, TallymanRedisClient},
    store::{
        ExpirationSubscription, FastStore, OpenWindow, ShadowClaim, ShadowRestore,
        TokenBucketState, WindowKeys,
    },
};

/// Configuration for [`RedisFastStore`].
#[derive(Clone, Debug)]
pub struct RedisFastStoreOptions {
    /// Capacity of each expiration subscription. Events beyond it are dropped.
    pub expiration_channel_capacity: usize,
    /// Run `CONFIG SET notify-keyspace-events Ex` on startup.
    ///
    /// Redis publishes no expiration events unless keyspace notifications are enabled.
    /// Leave this off when the server is configured externally or `CONFIG` is disabled.
    pub configure_keyspace_events: bool,
    /// Delay before the expiration listener reconnects after losing its connection.
    pub reconnect_delay: Duration,
    /// Page size hint for `SCAN`.
    pub scan_count: usize,
}

impl Default for RedisFastStoreOptions {
    fn default() -> Self {
        Self {
            expiration_channel_capacity: 10_000,
            configure_keyspace_events: false,
            reconnect_delay: Duration::from_secs(1),
            scan_count: 500,
        }
    }
}

struct Scripts {
    open_window: Script,
    add_to_window: Script,
    incr_existing: Script,
    claim_shadow: Script,
    release_shadow: Script,
    restore_shadow: Script,
    take_tokens: Script,
}

impl Scripts {
    fn new() -> Self {
        Self {
            open_window: Script::new(
                r#"
                local buffer_key = KEYS[1]
                local shadow_key = KEYS[2]
                local claim_key = KEYS[3]

                local delta = ARGV[1]
                local ttl_ms = ARGV[2]

                if not redis.call("SET", buffer_key, delta, "NX", "PX", ttl_ms) then
                    return {0, 0, 0}
                end

                local displaced = redis.call("GET", shadow_key)

                redis.call("SET", shadow_key, delta)
                redis.call("DEL", claim_key)

                if displaced then
                    return {1, 1, tonumber(displaced) or 0}
                end

                return {1, 0, 0}
            "#,
            ),
            add_to_window: Script::new(
                r#"
                local buffer_key = KEYS[1]
                local shadow_key = KEYS[2]

                local delta = ARGV[1]

                if redis.call("EXISTS", buffer_key) == 0 then
                    return false
                end

                local had_shadow = redis.call("EXISTS", shadow_key)
                local shadow = redis.call("INCRBY", shadow_key, delta)

                local buffer = redis.pcall("INCRBY", buffer_key, delta)
                if type(buffer) == "table" and buffer.err then
                    if had_shadow == 1 then
                        redis.call("DECRBY", shadow_key, delta)
                    else
                        redis.call("DEL", shadow_key)
                    end

                    return buffer
                end

                return shadow
            "#,
            ),
            incr_existing: Script::new(
                r#"
                if redis.call("EXISTS", KEYS[1]) == 0 then
                    return false
                end

                return redis.call("INCRBY", KEYS[1], ARGV[1])
            "#,
            ),
            claim_shadow: Script::new(
                r#"
                local buffer_key = KEYS[1]
                local shadow_key = KEYS[2]
                local claim_key = KEYS[3]

                local expected = ARGV[1]
                local token = ARGV[2]
                local ttl_ms = ARGV[3]

                if redis.call("EXISTS", buffer_key) == 1 then
                    return "window_open"
                end

                local shadow = redis.call("GET", shadow_key)
                if not shadow or shadow ~= expected then
                    return "lost"
                end

                if not redis.call("SET", claim_key, token, "NX", "PX", ttl_ms) then
                    return "lost"
                end

                redis.call("PEXPIRE", shadow_key, ttl_ms)

                return "claimed"
            "#,
            ),
            release_shadow: Script::new(
                r#"
                local shadow_key = KEYS[1]
                local claim_key = KEYS[2]

                if redis.call("GET", claim_key) ~= ARGV[1] then
                    return 0
                end

                redis.call("DEL", shadow_key, claim_key)

                return 1
            "#,
            ),
            restore_shadow: Script::new(
                r#"
                local buffer_key = KEYS[1]
                local shadow_key = KEYS[2]
                local claim_key = KEYS[3]

                local token = ARGV[1]
                local value = ARGV[2]

                local claim = redis.call("GET", claim_key)
                local claim_held = claim == token

                if claim_held and redis.call("EXISTS", shadow_key) == 1 then
                    redis.call("PERSIST", shadow_key)
                    return "retained"
                end

                if claim_held or not claim or redis.call("EXISTS", buffer_key) == 1 then
                    redis.call("INCRBY", shadow_key, value)
                    return "merged"
                end

                return "conflict"
            "#,
            ),
            take_tokens: Script::new(
                r#"
                local time_array = redis.call("TIME")
                local now_ms = tonumber(time_array[1]) * 1000 + tonumber(time_array[2]) / 1000

                local bucket_key = KEYS[1]

                local capacity = tonumber(ARGV[1])
                local period_ms = tonumber(ARGV[2])
                local cost = tonumber(ARGV[3])

                local state = redis.call("HMGET", bucket_key, "tokens", "ts")
                local tokens = tonumber(state[1])
                local refilled_at = tonumber(state[2])

                if tokens == nil or refilled_at == nil then
                    tokens = capacity
                else
                    local elapsed_ms = math.max(0, now_ms - refilled_at)
                    tokens = math.min(capacity, tokens + elapsed_ms * capacity / period_ms)
                end

                local admitted = 0
                local retry_after_ms = 0

                if tokens >= cost then
                    tokens = tokens - cost
                    admitted = 1
                else
                    retry_after_ms = math.ceil((cost - tokens) * period_ms / capacity)
                end

                redis.call("HSET", bucket_key, "tokens", tostring(tokens), "ts", tostring(now_ms))
                redis.call("PEXPIRE", bucket_key, period_ms)

                return {admitted, math.floor(tokens), retry_after_ms}
            "#,
            ),
        }
    }
}

/// [`FastStore`] backed by Redis.
///
/// The window primitives and the token bucket run as Lua scripts, so each is atomic on
/// the server. Expiration events come from Redis keyspace notifications.
///
/// # Requirements
///
/// - **Redis version:** >= 6.2.0
/// - **Keyspace notifications:** `notify-keyspace-events` must include `Ex`, either
///   configured on the server or via [`RedisFastStoreOptions::configure_keyspace_events`]
pub struct RedisFastStore {
    client: TallymanRedisClient,
    options: RedisFastStoreOptions,
    database: i64,
    scripts: Scripts,
}

impl RedisFastStore {
    /// Create a store over `client`.
    ///
    /// Expiration events are only taken from the database the client is connected to.
    pub async fn new(
        client: TallymanRedisClient,
        options: RedisFastStoreOptions,
    ) -> Result<Arc<Self>, TallymanError> {
        let mut connection_manager = client.get();

        let info: String = redis::cmd("CLIENT")
            .arg("INFO")
            .query_async(&mut connection_manager)
            .await?;
        let database = client_info_database(&info).ok_or_else(|| {
            TallymanError::InvalidConfig("CLIENT INFO did not report a database".to_string())
        })?;

        if options.configure_keyspace_events {
            redis::cmd("CONFIG")
                .arg("SET")
                .arg("notify-keyspace-events")
                .arg("Ex")
                .query_async::<()>(&mut connection_manager)
                .await?;

            tracing::info!("Enabled Redis keyspace notifications for expired keys");
        }

        Ok(Arc::new(Self {
            client,
            options,
            database,
            scripts: Scripts::new(),
        }))
    }

    /// The Redis database this store reads, writes and listens to.
    pub fn database(&self) -> i64 {
        self.database
    }
}

/// The `db=` field of a `CLIENT INFO` reply.
pub(crate) fn client_info_database(info: &str) -> Option<i64> {
    info.split_whitespace()
        .find_map(|field| field.strip_prefix("db="))
        .and_then(|db| db.parse().ok())
}

/// Redis rejects an `INCRBY` past `i64` with "increment or decrement would overflow".
pub(crate) fn overflow_or(err: redis::RedisError, key: &str) -> TallymanError {
    if err.to_string().contains("would overflow") {
        TallymanError::Overflow(key.to_string())
    } else {
        err.into()
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis())
        .unwrap_or(u64::MAX)
        .max(1)
}

/// Escape glob metacharacters so `prefix` matches literally in `SCAN MATCH`.
fn glob_escape(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len() + 1);

    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }

    escaped.push('*');
    escaped
}

#[async_trait]
impl FastStore for RedisFastStore {
    async fn exists(&self, key: &str) -> Result<bool, TallymanError> {
        let mut connection_manager = self.client.get();

        Ok(redis::cmd("EXISTS")
            .arg(key)
            .query_async::<bool>(&mut connection_manager)
            .await?)
    }

    async fn get(&self, key: &str) -> Result<Option<i64>, TallymanError> {
        let mut connection_manager = self.client.get();

        Ok(redis::cmd("GET")
            .arg(key)
            .query_async::<Option<i64>>(&mut connection_manager)
            .await?)
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: i64,
        ttl: Duration,
    ) -> Result<bool, TallymanError> {
        let mut connection_manager = self.client.get();

        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut connection_manager)
            .await?;

        Ok(reply.is_some())
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, TallymanError> {
        let mut connection_manager = self.client.get();

        let value: Option<i64> = self
            .scripts
            .incr_existing
            .key(key)
            .arg(delta)
            .invoke_async(&mut connection_manager)
            .await
            .map_err(|err| overflow_or(err, key))?;

        value.ok_or_else(|| TallymanError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<bool, TallymanError> {
        let mut connection_manager = self.client.get();

        let removed: u64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut connection_manager)
            .await?;

        Ok(removed > 0)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, TallymanError> {
        let mut connection_manager = self.client.get();
        let pattern = glob_escape(prefix);

        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, page): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(self.options.scan_count)
                .query_async(&mut connection_manager)
                .await?;

            keys.extend(page.into_iter().filter(|key| key.starts_with(prefix)));

            if next == 0 {
                break;
            }
            cursor = next;
        }

        keys.sort_unstable();
        keys.dedup();

        Ok(keys)
    } // end method scan_prefix

    async fn subscribe_expirations(&self) -> Result<ExpirationSubscription, TallymanError> {
        let (tx, rx) = async_channel::bounded(self.options.expiration_channel_capacity.max(1));

        RedisExpirationListener::new(
            self.client.client().clone(),
            self.database,
            tx,
            self.options.reconnect_delay,
        )
        .spawn();

        Ok(ExpirationSubscription::new(rx))
    }

    async fn open_window(
        &self,
        keys: &WindowKeys,
        delta: i64,
        ttl: Duration,
    ) -> Result<OpenWindow, TallymanError> {
        let mut connection_manager = self.client.get();

        let (opened, has_displaced, displaced): (u8, u8, i64) = self
            .scripts
            .open_window
            .key(&*keys.buffer)
            .key(&*keys.shadow)
            .key(&*keys.claim)
            .arg(delta)
            .arg(millis(ttl))
            .invoke_async(&mut connection_manager)
            .await?;

        if opened == 0 {
            return Ok(OpenWindow::AlreadyOpen);
        }

        Ok(OpenWindow::Opened {
            displaced: (has_displaced == 1).then_some(displaced),
        })
    } // end method open_window

    async fn add_to_window(
        &self,
        keys: &WindowKeys,
        delta: i64,
    ) -> Result<Option<i64>, TallymanError> {
        let mut connection_manager = self.client.get();

        self.scripts
            .add_to_window
            .key(&*keys.buffer)
            .key(&*keys.shadow)
            .arg(delta)
            .invoke_async(&mut connection_manager)
            .await
            .map_err(|err| overflow_or(err, &keys.buffer))
    }

    async fn claim_shadow(
        &self,
        keys: &WindowKeys,
        expected: i64,
        token: &str,
        ttl: Duration,
    ) -> Result<ShadowClaim, TallymanError> {
        let mut connection_manager = self.client.get();

        let result: String = self
            .scripts
            .claim_shadow
            .key(&*keys.buffer)
            .key(&*keys.shadow)
            .key(&*keys.claim)
            .arg(expected)
            .arg(token)
            .arg(millis(ttl))
            .invoke_async(&mut connection_manager)
            .await?;

        match result.as_str() {
            "claimed" => Ok(ShadowClaim::Claimed),
            "lost" => Ok(ShadowClaim::Lost),
            "window_open" => Ok(ShadowClaim::WindowOpen),
            _ => Err(TallymanError::StoreUnavailable(format!(
                "unexpected result from claim script: {result}"
            ))),
        }
    } // end method claim_shadow

    async fn release_shadow(&self, keys: &WindowKeys, token: &str) -> Result<bool, TallymanError> {
        let mut connection_manager = self.client.get();

        let released: u8 = self
            .scripts
            .release_shadow
            .key(&*keys.shadow)
            .key(&*keys.claim)
            .arg(token)
            .invoke_async(&mut connection_manager)
            .await?;

        Ok(released == 1)
    }

    async fn restore_shadow(
        &self,
        keys: &WindowKeys,
        token: &str,
        value: i64,
    ) -> Result<ShadowRestore, TallymanError> {
        let mut connection_manager = self.client.get();

        let result: String = self
            .scripts
            .restore_shadow
            .key(&*keys.buffer)
            .key(&*keys.shadow)
            .key(&*keys.claim)
            .arg(token)
            .arg(value)
            .invoke_async(&mut connection_manager)
            .await?;

        match result.as_str() {
            "retained" => Ok(ShadowRestore::Retained),
            "merged" => Ok(ShadowRestore::Merged),
            "conflict" => Ok(ShadowRestore::Conflict),
            _ => Err(TallymanError::StoreUnavailable(format!(
                "unexpected result from restore script: {result}"
            ))),
        }
    } // end method restore_shadow

    async fn take_tokens(
        &self,
        key: &str,
        capacity: u64,
        refill_period: Duration,
        cost: u64,
    ) -> Result<TokenBucketState, TallymanError> {
        let mut connection_manager = self.client.get();

        let (admitted, remaining, retry_after_ms): (u8, u64, u64) = self
            .scripts
            .take_tokens
            .key(key)
            .arg(capacity)
            .arg(millis(refill_period))
            .arg(cost)
            .invoke_async(&mut connection_manager)
            .await?;

        Ok(TokenBucketState {
            admitted: admitted == 1,
            remaining,
            retry_after_ms,
        })
    } // end method take_tokens
}
