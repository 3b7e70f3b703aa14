//! Último valor bom conhecido por chave, usado quando o upstream falha ou o
//! cliente é limitado.

use tokio::time::{Duration, Instant};

use freshcache_cache::{CacheConfig, TtlCache};
use freshcache_common::ConfigError;

#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot<V> {
    pub value: V,
    pub captured_at: Instant,
}

impl<V> Snapshot<V> {
    pub fn age(&self) -> Duration {
        self.captured_at.elapsed()
    }
}

/// Armazenamento de fallback. A versão em memória basta para um processo
/// só; uma implementação durável fica a cargo da camada de storage.
pub trait SnapshotStore<V>: Send + Sync {
    fn load(&self, key: &str) -> Option<Snapshot<V>>;
    fn store(&self, key: &str, value: V);
}

/// Snapshots em memória, limitados em quantidade e em idade.
pub struct MemorySnapshots<V> {
    entries: TtlCache<Snapshot<V>>,
    retention: Duration,
}

impl<V> MemorySnapshots<V>
where
    V: Clone + Send + 'static,
{
    pub fn new(capacity: usize, retention: Duration) -> Result<Self, ConfigError> {
        let config = CacheConfig::with_capacity(capacity).named("snapshots");
        Ok(Self {
            entries: TtlCache::new(config)?,
            retention,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<V> SnapshotStore<V> for MemorySnapshots<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn load(&self, key: &str) -> Option<Snapshot<V>> {
        self.entries.get(key)
    }

    fn store(&self, key: &str, value: V) {
        let snapshot = Snapshot {
            value,
            captured_at: Instant::now(),
        };
        self.entries.set(key, snapshot, self.retention);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn store_and_load() {
        let snapshots = MemorySnapshots::new(10, Duration::from_secs(60)).unwrap();
        snapshots.store("k", 5u32);
        tokio::time::advance(Duration::from_secs(7)).await;

        let snapshot = snapshots.load("k").unwrap();
        assert_eq!(snapshot.value, 5);
        assert_eq!(snapshot.age(), Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn retention_bounds_age() {
        let snapshots = MemorySnapshots::new(10, Duration::from_secs(60)).unwrap();
        snapshots.store("k", 5u32);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(snapshots.load("k").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_bounds_count() {
        let snapshots = MemorySnapshots::new(2, Duration::from_secs(60)).unwrap();
        snapshots.store("a", 1u32);
        snapshots.store("b", 2);
        snapshots.store("c", 3);
        assert_eq!(snapshots.len(), 2);
        assert!(snapshots.load("a").is_none());
    }

    #[test]
    fn zero_capacity_rejected() {
        assert!(MemorySnapshots::<u32>::new(0, Duration::from_secs(1)).is_err());
    }
}
