use std::{ops::Deref, sync::Arc, time::Duration};

use crate::TallymanError;

/// Namespace prepended to every fast store key.
///
/// Constraints:
/// - Must not be empty
/// - Must not be longer than 64 bytes
/// - Must not contain colons or glob metacharacters (`*`, `?`, `[`, `]`, `\`)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorePrefix(Arc<str>);

impl Default for StorePrefix {
    /// Returns the `"tallyman"` prefix.
    fn default() -> Self {
        Self(Arc::from("tallyman"))
    }
}

impl Deref for StorePrefix {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<String> for StorePrefix {
    type Error = TallymanError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.is_empty() {
            Err(TallymanError::InvalidConfig(
                "Store prefix must not be empty".to_string(),
            ))
        } else if value.len() > 64 {
            Err(TallymanError::InvalidConfig(
                "Store prefix must not be longer than 64 bytes".to_string(),
            ))
        } else if value.contains([':', '*', '?', '[', ']', '\\']) {
            Err(TallymanError::InvalidConfig(
                "Store prefix must not contain colons or glob characters".to_string(),
            ))
        } else {
            Ok(Self(Arc::from(value)))
        }
    }
}

impl TryFrom<&str> for StorePrefix {
    type Error = TallymanError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::try_from(value.to_string())
    }
}

/// A caller-supplied counter key.
///
/// Must not be blank and must not be longer than 255 bytes. Colons are allowed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TallyKey(Arc<str>);

impl TallyKey {
    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Deref for TallyKey {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for TallyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TallyKey {
    type Error = TallymanError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.trim().is_empty() {
            Err(TallymanError::ValidationError(
                "Key is mandatory".to_string(),
            ))
        } else if value.len() > 255 {
            Err(TallymanError::ValidationError(
                "Key must not be longer than 255 bytes".to_string(),
            ))
        } else {
            Ok(Self(Arc::from(value)))
        }
    }
}

impl TryFrom<&str> for TallyKey {
    type Error = TallymanError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::try_from(value.to_string())
    }
}

/// A strictly positive increment.
///
/// Durable sums only ever grow, so zero and negative deltas are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct IncrementDelta(i64);

impl Deref for IncrementDelta {
    type Target = i64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<i64> for IncrementDelta {
    type Error = TallymanError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        if value <= 0 {
            Err(TallymanError::ValidationError(
                "Value must be greater than 0".to_string(),
            ))
        } else {
            Ok(Self(value))
        }
    }
}

/// Length of a buffering window.
///
/// The window opens with the first increment for a key and closes exactly this long
/// afterwards, no matter how many increments arrive in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct WindowSizeSeconds(u64);

impl WindowSizeSeconds {
    /// The window as a [`Duration`].
    pub fn as_duration(&self) -> Duration {
        Duration::from_secs(self.0)
    }
}

impl Default for WindowSizeSeconds {
    /// Returns a window of 10 seconds.
    fn default() -> Self {
        Self(10)
    }
}

impl Deref for WindowSizeSeconds {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<u64> for WindowSizeSeconds {
    type Error = TallymanError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        if value < 1 {
            Err(TallymanError::InvalidConfig(
                "Window size must be at least 1".to_string(),
            ))
        } else {
            Ok(Self(value))
        }
    }
}

/// Lifetime of a flush claim.
///
/// Bounds how long a crashed or failed flush blocks the next attempt. Keep it well
/// above the expected durable write latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ClaimTtlMs(u64);

impl ClaimTtlMs {
    /// The claim lifetime as a [`Duration`].
    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.0)
    }
}

impl Default for ClaimTtlMs {
    /// Returns a claim lifetime of 10 seconds.
    fn default() -> Self {
        Self(10_000)
    }
}

impl Deref for ClaimTtlMs {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<u64> for ClaimTtlMs {
    type Error = TallymanError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        if value == 0 {
            Err(TallymanError::InvalidConfig(
                "Claim TTL must be greater than 0".to_string(),
            ))
        } else {
            Ok(Self(value))
        }
    }
}

/// Token bucket capacity (requests admitted per refill period).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct BucketCapacity(u64);

impl Default for BucketCapacity {
    /// Returns a capacity of 100 requests.
    fn default() -> Self {
        Self(100)
    }
}

impl Deref for BucketCapacity {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<u64> for BucketCapacity {
    type Error = TallymanError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        if value == 0 {
            Err(TallymanError::InvalidConfig(
                "Bucket capacity must be greater than 0".to_string(),
            ))
        } else {
            Ok(Self(value))
        }
    }
}

/// Time for an empty token bucket to refill completely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RefillPeriodMs(u64);

impl RefillPeriodMs {
    /// The refill period as a [`Duration`].
    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.0)
    }
}

impl Default for RefillPeriodMs {
    /// Returns a refill period of one minute.
    fn default() -> Self {
        Self(60_000)
    }
}

impl Deref for RefillPeriodMs {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<u64> for RefillPeriodMs {
    type Error = TallymanError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        if value == 0 {
            Err(TallymanError::InvalidConfig(
                "Refill period must be greater than 0".to_string(),
            ))
        } else {
            Ok(Self(value))
        }
    }
}

/// Period of the reconciliation sweep over stranded shadow entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SweepIntervalMs(u64);

impl SweepIntervalMs {
    /// The sweep period as a [`Duration`].
    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.0)
    }
}

impl Default for SweepIntervalMs {
    /// Returns a sweep period of 30 seconds.
    fn default() -> Self {
        Self(30_000)
    }
}

impl Deref for SweepIntervalMs {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<u64> for SweepIntervalMs {
    type Error = TallymanError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        if value == 0 {
            Err(TallymanError::InvalidConfig(
                "Sweep interval must be greater than 0".to_string(),
            ))
        } else {
            Ok(Self(value))
        }
    }
}

/// Result of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// The call is admitted and one token (or `cost` tokens) was taken.
    Allowed {
        /// Whole tokens left in the caller's bucket.
        remaining_tokens: u64,
    },
    /// The call is rejected; no token was taken.
    Rejected {
        /// Whole tokens left in the caller's bucket.
        remaining_tokens: u64,
        /// Milliseconds until enough tokens have refilled for this cost.
        retry_after_ms: u64,
    },
    /// The request path is on the bypass list; the bucket was not touched.
    Bypassed,
}

impl RateLimitDecision {
    /// Whether the call may proceed.
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Self::Rejected { .. })
    }

    /// Tokens left after the decision, if a bucket was consulted.
    pub fn remaining_tokens(&self) -> Option<u64> {
        match self {
            Self::Allowed { remaining_tokens } | Self::Rejected { remaining_tokens, .. } => {
                Some(*remaining_tokens)
            }
            Self::Bypassed => None,
        }
    }
}

/// An inbound increment call as received at the boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncrementRequest {
    /// Identity the rate limiter buckets by, e.g. the client address.
    pub caller_id: String,
    /// Request path, checked against the rate limiter bypass list.
    pub path: String,
    /// Counter key.
    pub key: String,
    /// Amount to add.
    pub value: i64,
}

impl IncrementRequest {
    /// Check the key and value, returning their validated forms.
    pub fn validate(&self) -> Result<(TallyKey, IncrementDelta), TallymanError> {
        let key = TallyKey::try_from(self.key.as_str())?;
        let delta = IncrementDelta::try_from(self.value)?;

        Ok((key, delta))
    }
}
