//! Find-then-create-or-update for one upstream record.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use statline_adapters::{AdapterError, EntityAdapter};
use statline_core::Clock;
use statline_storage::{EntityStore, StoreError};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};

/// Which write a reconciliation performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Created,
    Updated,
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("lookup of {key} failed: {source}")]
    Lookup {
        key: String,
        #[source]
        source: StoreError,
    },
    #[error("transform of {key} failed: {source}")]
    Transform {
        key: String,
        #[source]
        source: AdapterError,
    },
    #[error("{op} of {key} failed: {source}")]
    Persist {
        key: String,
        op: &'static str,
        #[source]
        source: StoreError,
    },
}

impl ReconcileError {
    pub fn key(&self) -> &str {
        match self {
            ReconcileError::Lookup { key, .. }
            | ReconcileError::Transform { key, .. }
            | ReconcileError::Persist { key, .. } => key,
        }
    }
}

/// Fixed set of mutexes; a key always maps to the same shard, so two
/// reconciliations of one key never interleave.
#[derive(Debug)]
pub struct KeyLocks {
    shards: Vec<Mutex<()>>,
}

impl KeyLocks {
    pub fn new(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn shard_for<K: Hash>(&self, key: &K) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    pub async fn lock<K: Hash>(&self, key: &K) -> MutexGuard<'_, ()> {
        self.shards[self.shard_for(key)].lock().await
    }
}

pub struct Reconciler<A: EntityAdapter> {
    adapter: Arc<A>,
    store: Arc<dyn EntityStore<A::Record>>,
    clock: Arc<dyn Clock>,
    locks: KeyLocks,
}

impl<A: EntityAdapter> Reconciler<A> {
    pub fn new(
        adapter: Arc<A>,
        store: Arc<dyn EntityStore<A::Record>>,
        clock: Arc<dyn Clock>,
        lock_shards: usize,
    ) -> Self {
        Self {
            adapter,
            store,
            clock,
            locks: KeyLocks::new(lock_shards),
        }
    }

    /// Exactly one of `insert` or `update` reaches the store per call.
    pub async fn reconcile(&self, upstream: &A::Upstream) -> Result<Outcome, ReconcileError> {
        let key = self.adapter.natural_key(upstream);
        let _guard = self.locks.lock(&key).await;

        let existing = self
            .store
            .find(&key)
            .await
            .map_err(|source| ReconcileError::Lookup {
                key: key.to_string(),
                source,
            })?;
        let now = self.clock.now();

        match existing {
            None => {
                let record = self
                    .adapter
                    .create(upstream, now)
                    .map_err(|source| transform_error(&key, source))?;
                self.store
                    .insert(&record)
                    .await
                    .map_err(|source| persist_error(&key, "insert", source))?;
                Ok(Outcome::Created)
            }
            Some(existing) => {
                let record = self
                    .adapter
                    .update(upstream, existing, now)
                    .map_err(|source| transform_error(&key, source))?;
                self.store
                    .update(&record)
                    .await
                    .map_err(|source| persist_error(&key, "update", source))?;
                Ok(Outcome::Updated)
            }
        }
    }
}

fn transform_error<K: std::fmt::Display>(key: &K, source: AdapterError) -> ReconcileError {
    ReconcileError::Transform {
        key: key.to_string(),
        source,
    }
}

fn persist_error<K: std::fmt::Display>(
    key: &K,
    op: &'static str,
    source: StoreError,
) -> ReconcileError {
    ReconcileError::Persist {
        key: key.to_string(),
        op,
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use statline_adapters::{CompetitionAdapter, CompetitionUpstream, FixtureAdapter, FixtureUpstream};
    use statline_core::{Competition, FixedClock, Fixture};
    use statline_storage::MemoryStore;

    fn serie_a(is_cup: bool) -> CompetitionUpstream {
        CompetitionUpstream {
            id: 564,
            name: "Serie A".into(),
            country_id: 32,
            is_cup: Some(is_cup),
        }
    }

    #[tokio::test]
    async fn miss_creates_then_hit_updates() {
        let t0 = Utc.with_ymd_and_hms(2026, 3, 14, 9, 0, 0).single().unwrap();
        let clock = Arc::new(FixedClock::new(t0));
        let store = Arc::new(MemoryStore::<Competition>::new());
        let reconciler = Reconciler::<CompetitionAdapter>::new(
            Arc::new(CompetitionAdapter),
            store.clone(),
            clock.clone(),
            4,
        );

        assert_eq!(reconciler.reconcile(&serie_a(false)).await.unwrap(), Outcome::Created);
        assert_eq!((store.insert_calls(), store.update_calls()), (1, 0));

        clock.advance(Duration::minutes(30));
        assert_eq!(reconciler.reconcile(&serie_a(true)).await.unwrap(), Outcome::Updated);
        assert_eq!((store.insert_calls(), store.update_calls()), (1, 1));

        let stored = store.get(&564).await.unwrap();
        assert!(stored.is_cup);
        assert_eq!(stored.audit.created_at, t0);
        assert_eq!(stored.audit.updated_at, t0 + Duration::minutes(30));
    }

    #[tokio::test]
    async fn transform_failure_is_reported_with_key_and_skips_the_store() {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let store = Arc::new(MemoryStore::<Fixture>::new());
        let reconciler =
            Reconciler::<FixtureAdapter>::new(Arc::new(FixtureAdapter), store.clone(), clock, 4);
        let upstream: FixtureUpstream = serde_json::from_value(serde_json::json!({
            "id": 11867285, "season_id": 16036, "localteam_id": 1, "visitorteam_id": 2
        }))
        .unwrap();

        let err = reconciler.reconcile(&upstream).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Transform { .. }));
        assert_eq!(err.key(), "11867285");
        assert_eq!(store.insert_calls(), 0);
    }

    #[test]
    fn equal_keys_share_a_shard() {
        let locks = KeyLocks::new(8);
        assert_eq!(locks.shard_for(&564u64), locks.shard_for(&564u64));
        assert!(locks.shard_for(&"16036:1") < 8);
        assert_eq!(KeyLocks::new(0).shard_for(&1u64), 0);
    }
}
