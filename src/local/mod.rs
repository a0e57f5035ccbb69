//! In-process store implementations.
//!
//! [`LocalFastStore`] and [`LocalSumStore`] keep all state inside the current process
//! using a mutex-guarded map and a [`DashMap`](dashmap::DashMap).
//!
//! # Key Characteristics
//!
//! - **Zero external dependencies:** No network or database required
//! - **Process-scoped:** State is not shared across processes and does not survive restarts
//! - **Same semantics:** TTLs, atomic window primitives, expiration events and token
//!   buckets behave like the Redis-backed store
//!
//! # When to Use
//!
//! - Single-process deployments and tests
//! - Embedding the write-behind pipeline in front of a durable store you already own
//!
//! Use the `redis` provider when several processes must share windows and buckets.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use tallyman::{
//!     IncrementRequest, LocalFastStore, LocalFastStoreOptions, LocalSumStore, Tallyman,
//!     TallymanOptions,
//! };
//!
//! # async fn run() -> Result<(), tallyman::TallymanError> {
//! let fast = LocalFastStore::new(LocalFastStoreOptions::default());
//! let durable = Arc::new(LocalSumStore::new());
//!
//! let tallyman = Tallyman::new(fast, durable, TallymanOptions::default());
//! let _workers = tallyman.start_flush_workers(2).await?;
//!
//! tallyman
//!     .apply(&IncrementRequest {
//!         caller_id: "10.0.0.1".to_string(),
//!         path: "/api/increment".to_string(),
//!         key: "page_views".to_string(),
//!         value: 1,
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod local_fast_store;
pub use local_fast_store::*;

mod local_sum_store;
pub use local_sum_store::*;
