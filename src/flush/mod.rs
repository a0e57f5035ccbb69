//! Moving closed windows from the fast store to the durable store.
//!
//! When a buffer entry expires, [`FlushHandler`] commits its shadow entry's sum to the
//! [`DurableStore`](crate::DurableStore) under a claim:
//!
//! 1. read the shadow entry; if it is gone, the window was already flushed
//! 2. claim it, conditioned on the shadow still holding the value just read; the shadow
//!    entry takes the claim TTL
//! 3. add the value to the durable sum
//! 4. delete the shadow entry, only if the claim is still ours
//!
//! A claim that is never released takes its shadow entry with it, so a committed value
//! is never committed again. A failed durable write clears the shadow entry's TTL
//! instead. Its claim marker lapses after the claim TTL, and that expiry triggers the
//! next attempt. [`ShadowSweeper`] picks up anything whose expiration event was lost.
//!
//! Keep the claim TTL well above the durable write latency: a write that outlives its
//! claim and then fails can only merge its value back while no other flush owns the key.
//!
//! [`FlushWorkers`] drive the handler from an expiration subscription.

mod flush_handler;
pub use flush_handler::*;

mod flush_workers;
pub use flush_workers::*;

mod shadow_sweeper;
pub use shadow_sweeper::*;
