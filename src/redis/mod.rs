//! Redis-backed [`FastStore`](crate::FastStore).
//!
//! Windows, shadows, claim markers and token buckets live in Redis, so any number of
//! processes sharing a prefix share the same counters and rate limits. Expired buffer
//! entries are reported through Redis keyspace notifications.
//!
//! # Examples
//!
//! ```ignore
//! use tallyman::{RedisFastStore, RedisFastStoreOptions, TallymanRedisClient};
//!
//! let client = redis::Client::open("redis://127.0.0.1:6379/")?;
//! let client = TallymanRedisClient::from_client(client, 4).await?;
//!
//! let fast = RedisFastStore::new(
//!     client,
//!     RedisFastStoreOptions {
//!         configure_keyspace_events: true,
//!         ..Default::default()
//!     },
//! )
//! .await?;
//! ```

mod common;
pub use common::*;

mod redis_fast_store;
pub use redis_fast_store::*;

mod redis_expiration_listener;
pub(crate) use redis_expiration_listener::*;
