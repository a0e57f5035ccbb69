/// Error type for this crate.
#[derive(Debug, thiserror::Error)]
pub enum TallymanError {
    /// A caller-supplied key, delta, or caller id was rejected at the boundary.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// An option value was out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The caller exhausted its token bucket.
    #[error("rate limited: caller {caller_id}, retry after {retry_after_ms}ms")]
    RateLimited {
        /// Caller identity the bucket is keyed by.
        caller_id: String,
        /// Best-effort hint until one token is available again.
        retry_after_ms: u64,
    },

    /// The fast store or the durable store could not be reached.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// `incr_by` targeted a key that does not exist.
    #[error("key not found: {0}")]
    NotFound(String),

    /// A key holds a value of a different shape than the operation expects.
    #[error("wrong value type at key: {0}")]
    WrongType(String),

    /// Adding to the value at a key would overflow `i64`; nothing was written.
    #[error("integer overflow at key: {0}")]
    Overflow(String),

    /// The buffering window kept flipping between open and closed while applying.
    #[error("window contention on key: {0}")]
    WindowContention(String),

    /// The durable write failed during a flush; the shadow entry is retained.
    #[error("flush commit failed for key {key}: {reason}")]
    FlushCommitFailed {
        /// Caller key whose window could not be committed.
        key: String,
        /// Underlying durable store failure.
        reason: String,
    },

    /// Redis error.
    #[cfg(feature = "redis")]
    #[cfg_attr(docsrs, doc(cfg(feature = "redis")))]
    #[error("redis error: {0}")]
    RedisError(redis::RedisError),

    /// SQLite error.
    #[cfg(feature = "sqlite")]
    #[cfg_attr(docsrs, doc(cfg(feature = "sqlite")))]
    #[error("sqlite error: {0}")]
    SqliteError(#[from] rusqlite::Error),
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for TallymanError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_timeout()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
        {
            Self::StoreUnavailable(err.to_string())
        } else {
            Self::RedisError(err)
        }
    }
}

impl TallymanError {
    /// Whether the failure came from an unreachable store rather than a bad request.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}
