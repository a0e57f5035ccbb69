use std::time::Duration;

use crate::{
    FastStore, LocalFastStore, LocalFastStoreOptions, OpenWindow, ShadowClaim, ShadowRestore,
    StorePrefix, TallymanError,
};

use super::runtime::{async_sleep, block_on_paused};
use super::support::{key, keygen, local_store};

fn window_keys(k: &str) -> crate::WindowKeys {
    keygen(&StorePrefix::default()).window_keys(&key(k))
}

#[test]
fn set_if_absent_only_creates_once_and_expires() {
    block_on_paused(async {
        let store = local_store();

        assert!(store.set_if_absent("k", 1, Duration::from_secs(1)).await.unwrap());
        assert!(!store.set_if_absent("k", 2, Duration::from_secs(1)).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some(1));

        async_sleep(Duration::from_millis(1_001)).await;

        assert!(!store.exists("k").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.set_if_absent("k", 3, Duration::from_secs(1)).await.unwrap());
    });
}

#[test]
fn incr_by_keeps_ttl_and_never_creates() {
    block_on_paused(async {
        let store = local_store();

        let err = store.incr_by("missing", 1).await.unwrap_err();
        assert!(matches!(err, TallymanError::NotFound(k) if k == "missing"));
        assert!(!store.exists("missing").await.unwrap());

        store.set_if_absent("k", 10, Duration::from_secs(10)).await.unwrap();
        async_sleep(Duration::from_secs(4)).await;

        assert_eq!(store.incr_by("k", 5).await.unwrap(), 15);

        let ttl = store.ttl("k").unwrap();
        assert!(ttl <= Duration::from_secs(6), "ttl was refreshed: {ttl:?}");
        assert!(ttl > Duration::from_millis(5_900), "ttl: {ttl:?}");
    });
}

#[test]
fn delete_reports_whether_key_existed() {
    block_on_paused(async {
        let store = local_store();

        store.set_if_absent("k", 1, Duration::from_secs(1)).await.unwrap();
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
    });
}

#[test]
fn reading_a_bucket_as_an_integer_is_a_type_error() {
    block_on_paused(async {
        let store = local_store();

        store
            .take_tokens("bucket", 1, Duration::from_secs(1), 1)
            .await
            .unwrap();

        let err = store.get("bucket").await.unwrap_err();
        assert!(matches!(err, TallymanError::WrongType(_)));
    });
}

#[test]
fn scan_prefix_lists_only_live_matching_keys() {
    block_on_paused(async {
        let store = local_store();

        store.set_if_absent("a:1", 1, Duration::from_secs(10)).await.unwrap();
        store.set_if_absent("a:2", 1, Duration::from_millis(10)).await.unwrap();
        store.set_if_absent("b:1", 1, Duration::from_secs(10)).await.unwrap();

        async_sleep(Duration::from_millis(50)).await;

        let keys = store.scan_prefix("a:").await.unwrap();
        assert_eq!(keys, vec!["a:1".to_string()]);
    });
}

#[test]
fn expired_keys_are_published_to_every_subscriber() {
    block_on_paused(async {
        let store = local_store();
        let first = store.subscribe_expirations().await.unwrap();
        let second = store.subscribe_expirations().await.unwrap();

        store.set_if_absent("k", 1, Duration::from_millis(500)).await.unwrap();

        // Nobody touches the key; the reaper has to find it.
        assert_eq!(first.recv().await.as_deref(), Some("k"));
        assert_eq!(second.recv().await.as_deref(), Some("k"));
        assert!(store.is_empty());
    });
}

#[test]
fn full_subscription_drops_events() {
    block_on_paused(async {
        let store = LocalFastStore::new(LocalFastStoreOptions {
            expiration_channel_capacity: 1,
            ..Default::default()
        });
        let subscription = store.subscribe_expirations().await.unwrap();

        for k in ["k1", "k2", "k3"] {
            store.set_if_absent(k, 1, Duration::from_millis(10)).await.unwrap();
        }

        async_sleep(Duration::from_millis(300)).await;

        assert_eq!(subscription.len(), 1);
        assert!(store.is_empty());
    });
}

#[test]
fn closed_subscription_stops_receiving() {
    block_on_paused(async {
        let store = local_store();
        let subscription = store.subscribe_expirations().await.unwrap();

        assert!(subscription.close());
        assert!(subscription.is_closed());

        store.set_if_absent("k", 1, Duration::from_millis(10)).await.unwrap();
        async_sleep(Duration::from_millis(300)).await;

        assert_eq!(subscription.recv().await, None);
    });
}

#[test]
fn open_window_creates_buffer_and_shadow_once() {
    block_on_paused(async {
        let store = local_store();
        let keys = window_keys("a");

        let opened = store
            .open_window(&keys, 10, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(opened, OpenWindow::Opened { displaced: None });

        let again = store
            .open_window(&keys, 99, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(again, OpenWindow::AlreadyOpen);

        assert_eq!(store.get(&keys.buffer).await.unwrap(), Some(10));
        assert_eq!(store.get(&keys.shadow).await.unwrap(), Some(10));
        assert_eq!(store.ttl(&keys.buffer), Some(Duration::from_secs(10)));
        assert_eq!(store.ttl(&keys.shadow), None);
    });
}

#[test]
fn open_window_overwrites_stale_shadow_and_drops_claim() {
    block_on_paused(async {
        let store = local_store();
        let keys = window_keys("a");

        store.open_window(&keys, 15, Duration::from_secs(1)).await.unwrap();
        async_sleep(Duration::from_millis(1_100)).await;

        let claim = store
            .claim_shadow(&keys, 15, "t1", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(claim, ShadowClaim::Claimed);

        let opened = store
            .open_window(&keys, 4, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(opened, OpenWindow::Opened { displaced: Some(15) });

        assert_eq!(store.get(&keys.shadow).await.unwrap(), Some(4));
        assert_eq!(store.ttl(&keys.shadow), None);
        assert!(!store.exists(&keys.claim).await.unwrap());

        // The displaced flush can no longer delete the new window's shadow.
        assert!(!store.release_shadow(&keys, "t1").await.unwrap());
        assert_eq!(store.get(&keys.shadow).await.unwrap(), Some(4));
    });
}

#[test]
fn add_to_window_needs_an_open_window_and_keeps_ttl() {
    block_on_paused(async {
        let store = local_store();
        let keys = window_keys("a");

        assert_eq!(store.add_to_window(&keys, 5).await.unwrap(), None);
        assert!(!store.exists(&keys.shadow).await.unwrap());

        store.open_window(&keys, 10, Duration::from_secs(10)).await.unwrap();
        async_sleep(Duration::from_secs(3)).await;

        assert_eq!(store.add_to_window(&keys, 5).await.unwrap(), Some(15));
        assert_eq!(store.get(&keys.buffer).await.unwrap(), Some(15));

        let ttl = store.ttl(&keys.buffer).unwrap();
        assert!(ttl <= Duration::from_secs(7), "ttl was refreshed: {ttl:?}");
    });
}

#[test]
fn add_to_window_recreates_a_missing_shadow() {
    block_on_paused(async {
        let store = local_store();
        let keys = window_keys("a");

        store.open_window(&keys, 10, Duration::from_secs(10)).await.unwrap();
        store.delete(&keys.shadow).await.unwrap();

        assert_eq!(store.add_to_window(&keys, 3).await.unwrap(), Some(3));
        assert_eq!(store.get(&keys.buffer).await.unwrap(), Some(13));
    });
}

#[test]
fn claim_shadow_outcomes() {
    block_on_paused(async {
        let store = local_store();
        let keys = window_keys("a");
        let ttl = Duration::from_secs(5);

        store.open_window(&keys, 10, Duration::from_secs(1)).await.unwrap();
        assert_eq!(
            store.claim_shadow(&keys, 10, "t1", ttl).await.unwrap(),
            ShadowClaim::WindowOpen
        );

        async_sleep(Duration::from_millis(1_100)).await;

        assert_eq!(
            store.claim_shadow(&keys, 9, "t1", ttl).await.unwrap(),
            ShadowClaim::Lost
        );
        assert_eq!(
            store.claim_shadow(&keys, 10, "t1", ttl).await.unwrap(),
            ShadowClaim::Claimed
        );
        assert_eq!(
            store.claim_shadow(&keys, 10, "t2", ttl).await.unwrap(),
            ShadowClaim::Lost
        );

        assert!(!store.release_shadow(&keys, "t2").await.unwrap());
        assert_eq!(store.get(&keys.shadow).await.unwrap(), Some(10));

        assert!(store.release_shadow(&keys, "t1").await.unwrap());
        assert!(!store.exists(&keys.shadow).await.unwrap());
        assert!(!store.exists(&keys.claim).await.unwrap());

        assert_eq!(
            store.claim_shadow(&keys, 10, "t3", ttl).await.unwrap(),
            ShadowClaim::Lost
        );
    });
}

#[test]
fn claim_puts_its_ttl_on_the_shadow_and_both_lapse_together() {
    block_on_paused(async {
        let store = local_store();
        let keys = window_keys("a");

        store.open_window(&keys, 10, Duration::from_millis(100)).await.unwrap();
        async_sleep(Duration::from_millis(200)).await;
        assert_eq!(store.ttl(&keys.shadow), None);

        store
            .claim_shadow(&keys, 10, "t1", Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(store.ttl(&keys.shadow), Some(Duration::from_millis(500)));

        async_sleep(Duration::from_millis(600)).await;

        assert!(!store.exists(&keys.shadow).await.unwrap());
        assert!(!store.exists(&keys.claim).await.unwrap());
        assert_eq!(
            store
                .claim_shadow(&keys, 10, "t2", Duration::from_millis(500))
                .await
                .unwrap(),
            ShadowClaim::Lost
        );
        assert!(!store.release_shadow(&keys, "t1").await.unwrap());
    });
}

#[test]
fn restore_shadow_keeps_a_claimed_shadow_until_the_claim_lapses() {
    block_on_paused(async {
        let store = local_store();
        let keys = window_keys("a");

        store.open_window(&keys, 10, Duration::from_millis(100)).await.unwrap();
        async_sleep(Duration::from_millis(200)).await;
        store
            .claim_shadow(&keys, 10, "t1", Duration::from_millis(500))
            .await
            .unwrap();

        assert_eq!(
            store.restore_shadow(&keys, "t1", 10).await.unwrap(),
            ShadowRestore::Retained
        );
        assert_eq!(store.ttl(&keys.shadow), None);
        assert!(store.exists(&keys.claim).await.unwrap());

        async_sleep(Duration::from_millis(600)).await;

        assert!(!store.exists(&keys.claim).await.unwrap());
        assert_eq!(store.get(&keys.shadow).await.unwrap(), Some(10));
    });
}

#[test]
fn restore_shadow_merges_unless_another_claim_owns_the_shadow() {
    block_on_paused(async {
        let store = local_store();

        // Shadow and claim lapsed together: the value comes back.
        let lapsed = window_keys("lapsed");
        assert_eq!(
            store.restore_shadow(&lapsed, "t1", 6).await.unwrap(),
            ShadowRestore::Merged
        );
        assert_eq!(store.get(&lapsed.shadow).await.unwrap(), Some(6));
        assert_eq!(store.ttl(&lapsed.shadow), None);

        // A new window is open: the value joins it.
        let reopened = window_keys("reopened");
        store
            .open_window(&reopened, 4, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(
            store.restore_shadow(&reopened, "t1", 6).await.unwrap(),
            ShadowRestore::Merged
        );
        assert_eq!(store.get(&reopened.shadow).await.unwrap(), Some(10));
        assert_eq!(store.get(&reopened.buffer).await.unwrap(), Some(4));

        // A closed window claimed by someone else is left alone.
        let claimed = window_keys("claimed");
        store
            .open_window(&claimed, 4, Duration::from_millis(100))
            .await
            .unwrap();
        async_sleep(Duration::from_millis(200)).await;
        store
            .claim_shadow(&claimed, 4, "t2", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(
            store.restore_shadow(&claimed, "t1", 6).await.unwrap(),
            ShadowRestore::Conflict
        );
        assert_eq!(store.get(&claimed.shadow).await.unwrap(), Some(4));
    });
}

#[test]
fn incr_by_overflow_is_an_error_and_writes_nothing() {
    block_on_paused(async {
        let store = local_store();

        store
            .set_if_absent("k", i64::MAX - 1, Duration::from_secs(10))
            .await
            .unwrap();

        let err = store.incr_by("k", 2).await.unwrap_err();
        assert!(matches!(err, TallymanError::Overflow(k) if k == "k"));
        assert_eq!(store.get("k").await.unwrap(), Some(i64::MAX - 1));
    });
}

#[test]
fn add_to_window_overflow_leaves_buffer_and_shadow_untouched() {
    block_on_paused(async {
        let store = local_store();
        let keys = window_keys("a");

        store.open_window(&keys, 1, Duration::from_secs(10)).await.unwrap();
        store
            .restore_shadow(&keys, "t1", i64::MAX - 1)
            .await
            .unwrap();
        assert_eq!(store.get(&keys.shadow).await.unwrap(), Some(i64::MAX));

        let err = store.add_to_window(&keys, 1).await.unwrap_err();
        assert!(matches!(err, TallymanError::Overflow(_)));

        assert_eq!(store.get(&keys.buffer).await.unwrap(), Some(1));
        assert_eq!(store.get(&keys.shadow).await.unwrap(), Some(i64::MAX));
    });
}

#[test]
fn take_tokens_starts_full_and_refills_continuously() {
    block_on_paused(async {
        let store = local_store();
        let period = Duration::from_millis(1_000);

        for expected_remaining in [3, 2, 1, 0] {
            let state = store.take_tokens("bucket", 4, period, 1).await.unwrap();
            assert!(state.admitted);
            assert_eq!(state.remaining, expected_remaining);
            assert_eq!(state.retry_after_ms, 0);
        }

        let state = store.take_tokens("bucket", 4, period, 1).await.unwrap();
        assert!(!state.admitted);
        assert_eq!(state.remaining, 0);
        assert_eq!(state.retry_after_ms, 250);

        // A quarter period brings back one token.
        async_sleep(Duration::from_millis(250)).await;

        let state = store.take_tokens("bucket", 4, period, 1).await.unwrap();
        assert!(state.admitted);
        assert_eq!(state.remaining, 0);
    });
}

#[test]
fn idle_bucket_expires_after_one_refill_period() {
    block_on_paused(async {
        let store = local_store();
        let period = Duration::from_millis(1_000);

        store.take_tokens("bucket", 2, period, 2).await.unwrap();
        assert_eq!(store.ttl("bucket"), Some(period));

        async_sleep(Duration::from_millis(1_001)).await;
        assert!(!store.exists("bucket").await.unwrap());

        let state = store.take_tokens("bucket", 2, period, 1).await.unwrap();
        assert!(state.admitted);
        assert_eq!(state.remaining, 1);
    });
}
