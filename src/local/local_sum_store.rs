use async_trait::async_trait;
use dashmap::DashMap;

use crate::{
    TallyKey, TallymanError,
    store::{DurableStore, SumRecord},
};

/// In-process [`DurableStore`].
///
/// Sums live in a [`DashMap`]; each upsert holds the key's shard lock, so concurrent
/// upserts to one key never lose an update. Contents do not survive the process.
#[derive(Debug, Default)]
pub struct LocalSumStore {
    sums: DashMap<TallyKey, i64>,
}

impl LocalSumStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.sums.len()
    }

    /// Whether no record has been written yet.
    pub fn is_empty(&self) -> bool {
        self.sums.is_empty()
    }
}

#[async_trait]
impl DurableStore for LocalSumStore {
    async fn upsert_add(&self, key: &TallyKey, delta: i64) -> Result<i64, TallymanError> {
        let mut sum = self.sums.entry(key.clone()).or_insert(0);
        *sum = sum
            .checked_add(delta)
            .ok_or_else(|| TallymanError::Overflow(key.to_string()))?;

        Ok(*sum)
    }

    async fn get(&self, key: &TallyKey) -> Result<Option<SumRecord>, TallymanError> {
        Ok(self.sums.get(key).map(|sum| SumRecord {
            key: key.to_string(),
            sum: *sum,
        }))
    }
}
