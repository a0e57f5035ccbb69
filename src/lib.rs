#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod tallyman;
pub use tallyman::*;

mod coordinator;
pub use coordinator::*;

mod rate_limiter;
pub use rate_limiter::*;

mod flush;
pub use flush::*;

mod store;
pub use store::*;

mod local;
pub use local::*;

#[cfg(feature = "redis")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis")))]
mod redis;
#[cfg(feature = "redis")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis")))]
pub use redis::*;

#[cfg(feature = "sqlite")]
#[cfg_attr(docsrs, doc(cfg(feature = "sqlite")))]
mod sqlite;
#[cfg(feature = "sqlite")]
#[cfg_attr(docsrs, doc(cfg(feature = "sqlite")))]
pub use sqlite::*;

mod error;
pub use error::*;

mod common;
pub use common::{
    BucketCapacity, ClaimTtlMs, IncrementDelta, IncrementRequest, RateLimitDecision,
    RefillPeriodMs, StorePrefix, SweepIntervalMs, TallyKey, WindowSizeSeconds,
};

#[cfg(test)]
mod tests;
