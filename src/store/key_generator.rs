use std::sync::Arc;

use crate::{StorePrefix, TallyKey, store::WindowKeys};

/// Builds and parses the fast store key names for one prefix.
///
/// Layout: `<prefix>:<kind>:<key>` where kind is one of `buffer`, `shadow`, `claim`,
/// `bucket`. Caller keys sit last, so they may contain colons.
#[derive(Clone, Debug)]
pub(crate) struct KeyGenerator {
    buffer_prefix: Arc<str>,
    shadow_prefix: Arc<str>,
    claim_prefix: Arc<str>,
    bucket_prefix: Arc<str>,
    sweep_lease_key: Arc<str>,
}

impl KeyGenerator {
    pub(crate) fn new(prefix: StorePrefix) -> Self {
        let kind_prefix = |kind: &str| -> Arc<str> { Arc::from(format!("{}:{kind}:", &*prefix)) };

        Self {
            buffer_prefix: kind_prefix("buffer"),
            shadow_prefix: kind_prefix("shadow"),
            claim_prefix: kind_prefix("claim"),
            bucket_prefix: kind_prefix("bucket"),
            sweep_lease_key: Arc::from(format!("{}:sweep-lease", &*prefix)),
        }
    }

    pub(crate) fn window_keys(&self, key: &TallyKey) -> WindowKeys {
        WindowKeys {
            buffer: Arc::from(format!("{}{}", self.buffer_prefix, key.as_str())),
            shadow: Arc::from(format!("{}{}", self.shadow_prefix, key.as_str())),
            claim: Arc::from(format!("{}{}", self.claim_prefix, key.as_str())),
        }
    }

    pub(crate) fn bucket_key(&self, caller_id: &str) -> String {
        format!("{}{caller_id}", self.bucket_prefix)
    }

    pub(crate) fn shadow_prefix(&self) -> &str {
        &self.shadow_prefix
    }

    pub(crate) fn sweep_lease_key(&self) -> &str {
        &self.sweep_lease_key
    }

    /// The caller key of an expired buffer entry.
    pub(crate) fn parse_buffer_key(&self, raw: &str) -> Option<TallyKey> {
        Self::strip(raw, &self.buffer_prefix)
    }

    /// The caller key of an expired claim marker.
    pub(crate) fn parse_claim_key(&self, raw: &str) -> Option<TallyKey> {
        Self::strip(raw, &self.claim_prefix)
    }

    pub(crate) fn parse_shadow_key(&self, raw: &str) -> Option<TallyKey> {
        Self::strip(raw, &self.shadow_prefix)
    }

    fn strip(raw: &str, kind_prefix: &str) -> Option<TallyKey> {
        raw.strip_prefix(kind_prefix)
            .and_then(|key| TallyKey::try_from(key).ok())
    }
}
