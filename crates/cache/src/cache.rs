use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior, interval};
use tracing::debug;

use freshcache_common::{ConfigError, DEFAULT_CAPACITY, UpstreamError};

use crate::entry::Entry;
use crate::flight::{self, Claim, Flights};
use crate::stats::{CacheStats, Counters};

/// Configuração de uma instância de cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Nome usado nos logs (normalmente o namespace do recurso).
    pub name: String,
    pub capacity: usize,
}

impl CacheConfig {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            ..Default::default()
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        Ok(())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: "cache".into(),
            capacity: DEFAULT_CAPACITY,
        }
    }
}

/// Mapa chave → entrada + ordem de inserção para o limite de capacidade.
struct Store<V> {
    entries: HashMap<String, Entry<V>>,
    order: BTreeMap<u64, String>,
    next_seq: u64,
}

impl<V> Store<V> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_seq: 0,
        }
    }

    fn remove(&mut self, key: &str) -> Option<Entry<V>> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.seq);
        Some(entry)
    }

    /// Insere (ou substitui) a entrada. Retorna a chave despejada, se houver.
    fn insert(&mut self, key: String, value: V, ttl: Duration, capacity: usize) -> Option<String> {
        // Entrada montada antes de mexer no mapa e na ordem
        let seq = self.next_seq;
        let entry = Entry::new(value, ttl, seq);
        self.next_seq += 1;

        let evicted = if self.remove(&key).is_some() {
            None
        } else if self.entries.len() >= capacity {
            self.pop_oldest()
        } else {
            None
        };

        self.order.insert(seq, key.clone());
        self.entries.insert(key, entry);
        evicted
    }

    fn pop_oldest(&mut self) -> Option<String> {
        let (_, key) = self.order.pop_first()?;
        self.entries.remove(&key);
        Some(key)
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired_at(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }
}

/// Estado compartilhado entre todos os handles do cache.
struct Shared<V, E> {
    name: String,
    capacity: usize,
    store: Mutex<Store<V>>,
    flights: Flights<V, E>,
    counters: Counters,
}

impl<V, E> Shared<V, E> {
    // O lock nunca atravessa um `.await`; um panic com o lock não deixa o
    // mapa inconsistente, então o poison é ignorado.
    fn store(&self) -> MutexGuard<'_, Store<V>> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn purge_expired(&self) -> usize {
        let purged = self.store().purge_expired(Instant::now());
        if purged > 0 {
            Counters::add(&self.counters.expirations, purged as u64);
            debug!("{}: {purged} entradas expiradas removidas", self.name);
        }
        purged
    }
}

/// Cache em memória com TTL por entrada, limite de capacidade e
/// coalescência de cálculos concorrentes para a mesma chave.
///
/// O handle é barato de clonar; todos os clones enxergam o mesmo estado.
/// `E` é o erro da função de cálculo, entregue a todos os callers que
/// aguardavam o mesmo cálculo (por isso precisa ser `Clone`).
pub struct TtlCache<V, E = UpstreamError> {
    shared: Arc<Shared<V, E>>,
}

impl<V, E> Clone for TtlCache<V, E> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<V, E> TtlCache<V, E>
where
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    pub fn new(config: CacheConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(TtlCache {
            shared: Arc::new(Shared {
                name: config.name,
                capacity: config.capacity,
                store: Mutex::new(Store::new()),
                flights: Flights::new(),
                counters: Counters::default(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    // --- Leitura ---

    /// Retorna o valor se ainda estiver fresco. Entradas vencidas são
    /// removidas na hora.
    pub fn get(&self, key: &str) -> Option<V> {
        let value = self.fresh(key);
        let counters = &self.shared.counters;
        if value.is_some() {
            Counters::bump(&counters.hits);
        } else {
            Counters::bump(&counters.misses);
        }
        value
    }

    /// Igual ao `get`, mas sem mexer nos contadores de hit/miss.
    fn fresh(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut store = self.shared.store();
        match store.entries.get(key) {
            Some(entry) if !entry.is_expired_at(now) => return Some(entry.value.clone()),
            Some(_) => {}
            None => return None,
        }

        store.remove(key);
        drop(store);
        Counters::bump(&self.shared.counters.expirations);
        debug!("{}: chave expirada removida: {key}", self.shared.name);
        None
    }

    /// Há um cálculo em andamento para a chave.
    pub fn is_computing(&self, key: &str) -> bool {
        self.shared.flights.contains_key(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        let now = Instant::now();
        self.shared
            .store()
            .entries
            .get(key)
            .is_some_and(|e| !e.is_expired_at(now))
    }

    /// Tempo de vida restante da entrada, se ainda fresca.
    pub fn ttl_remaining(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.shared
            .store()
            .entries
            .get(key)
            .and_then(|e| e.remaining_at(now))
    }

    /// Idade da entrada, se ainda fresca.
    pub fn age(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.shared
            .store()
            .entries
            .get(key)
            .filter(|e| !e.is_expired_at(now))
            .map(|e| now.duration_since(e.stored_at))
    }

    // --- Escrita ---

    /// Insere ou substitui a entrada com `expires_at = agora + ttl`.
    /// Com o cache cheio e uma chave nova, despeja a entrada mais antiga.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let evicted = self
            .shared
            .store()
            .insert(key.into(), value, ttl, self.shared.capacity);

        if let Some(evicted) = evicted {
            Counters::bump(&self.shared.counters.evictions);
            debug!("{}: capacidade atingida, chave despejada: {evicted}", self.shared.name);
        }
    }

    /// Retorna o valor fresco ou calcula um novo com `compute`.
    ///
    /// Chamadas concorrentes para a mesma chave executam `compute` uma única
    /// vez: o primeiro caller calcula e os demais recebem o mesmo resultado,
    /// inclusive o erro. Falhas não são armazenadas. Se o caller que está
    /// calculando for cancelado, um dos que aguardavam assume o cálculo.
    pub async fn get_or_compute<F, Fut>(&self, key: &str, ttl: Duration, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }
        self.fill(key, ttl, compute).await
    }

    /// Metade "miss" do `get_or_compute`, para quem já fez o `get` e precisa
    /// decidir algo antes de ir ao upstream (ex.: rate limit). Não conta
    /// hit/miss; entra no cálculo em andamento se houver um.
    pub async fn fill<F, Fut>(&self, key: &str, ttl: Duration, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let mut coalesced = false;
        let guard = loop {
            match flight::claim(&self.shared.flights, key) {
                Claim::Leader(guard) => break guard,
                Claim::Follower(mut rx) => {
                    if !coalesced {
                        coalesced = true;
                        Counters::bump(&self.shared.counters.coalesced);
                    }
                    if let Ok(result) = rx.recv().await {
                        return result;
                    }
                    // Líder cancelado antes de publicar: tentar de novo
                    if let Some(value) = self.fresh(key) {
                        return Ok(value);
                    }
                }
            }
        };

        // Outro líder pode ter terminado entre o miss e o claim
        if let Some(value) = self.fresh(key) {
            let result = Ok(value);
            guard.complete(&result);
            return result;
        }

        Counters::bump(&self.shared.counters.computations);
        debug!("{}: calculando valor para {key}", self.shared.name);

        let result = compute().await;
        match &result {
            Ok(value) => self.set(key, value.clone(), ttl),
            Err(_) => debug!("{}: cálculo falhou para {key}, nada armazenado", self.shared.name),
        }

        guard.complete(&result);
        result
    }

    // --- Remoção ---

    /// Remove a entrada incondicionalmente. Retorna se existia.
    pub fn invalidate(&self, key: &str) -> bool {
        self.shared.store().remove(key).is_some()
    }

    /// Remove todas as chaves de um namespace (ex.: `"crypto-list:"`).
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut store = self.shared.store();
        let keys: Vec<String> = store
            .entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        for key in &keys {
            store.remove(key);
        }
        keys.len()
    }

    pub fn clear(&self) {
        let mut store = self.shared.store();
        store.entries.clear();
        store.order.clear();
    }

    /// Remove agora todas as entradas vencidas.
    pub fn purge_expired(&self) -> usize {
        self.shared.purge_expired()
    }

    /// Task de fundo que purga entradas vencidas a cada `every`.
    /// Encerra sozinha quando o último handle do cache é descartado.
    pub fn spawn_purger(&self, every: Duration) -> JoinHandle<()> {
        let shared = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            let mut tick = interval(every);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tick.tick().await;

            loop {
                tick.tick().await;
                let Some(state) = shared.upgrade() else {
                    break;
                };
                state.purge_expired();
            }
        })
    }

    // --- Observabilidade ---

    /// Número de entradas armazenadas (pode incluir vencidas ainda não purgadas).
    pub fn len(&self) -> usize {
        self.shared.store().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.shared
            .counters
            .snapshot(self.len(), self.shared.flights.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type TestCache = TtlCache<u64, String>;

    fn cache(capacity: usize) -> TestCache {
        TtlCache::new(CacheConfig::with_capacity(capacity).named("test")).unwrap()
    }

    #[test]
    fn zero_capacity_rejected() {
        let result = TestCache::new(CacheConfig::with_capacity(0));
        assert!(matches!(result, Err(ConfigError::ZeroCapacity)));
    }

    #[tokio::test(start_paused = true)]
    async fn get_set_basic() {
        let cache = cache(10);
        cache.set("key", 1, Duration::from_secs(60));
        assert_eq!(cache.get("key"), Some(1));
        assert_eq!(cache.get("missing"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn value_expires_at_ttl() {
        let cache = cache(10);
        cache.set("btc", 50_000, Duration::from_millis(30_000));

        tokio::time::advance(Duration::from_millis(29_999)).await;
        assert_eq!(cache.get("btc"), Some(50_000));

        tokio::time::advance(Duration::from_millis(2)).await;
        assert_eq!(cache.get("btc"), None);
        // Remoção preguiçosa
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.stats().expirations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_exactly_at_deadline() {
        let cache = cache(10);
        cache.set("k", 1, Duration::from_millis(100));
        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(cache.get("k"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn overwrite_restarts_ttl() {
        let cache = cache(10);
        cache.set("k", 1, Duration::from_millis(100));
        tokio::time::advance(Duration::from_millis(80)).await;
        cache.set("k", 2, Duration::from_millis(100));
        tokio::time::advance(Duration::from_millis(80)).await;
        assert_eq!(cache.get("k"), Some(2));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_is_immediate() {
        let cache = cache(10);
        cache.set("k", 1, Duration::from_secs(3600));
        assert!(cache.invalidate("k"));
        assert_eq!(cache.get("k"), None);
        assert!(!cache.invalidate("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_evicts_oldest_insert() {
        let cache = cache(2);
        let ttl = Duration::from_secs(60);
        cache.set("a", 1, ttl);
        cache.set("b", 2, ttl);
        cache.set("c", 3, ttl);

        let stats = cache.stats();
        assert_eq!(stats.size, 2);
        assert_eq!(stats.evictions, 1);
        assert!(!cache.contains_key("a"));
        assert!(cache.contains_key("b"));
        assert!(cache.contains_key("c"));
    }

    #[tokio::test(start_paused = true)]
    async fn overwrite_does_not_evict() {
        let cache = cache(2);
        let ttl = Duration::from_secs(60);
        cache.set("a", 1, ttl);
        cache.set("b", 2, ttl);
        cache.set("a", 10, ttl);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions, 0);

        // "a" foi reinserido, então "b" passa a ser o mais antigo
        cache.set("c", 3, ttl);
        assert_eq!(cache.get("a"), Some(10));
        assert_eq!(cache.get("b"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_plus_one_keeps_capacity() {
        let cache = cache(50);
        for i in 0..51u64 {
            cache.set(format!("key:{i}"), i, Duration::from_secs(60));
        }
        assert_eq!(cache.len(), 50);
        assert!(!cache.contains_key("key:0"));
        assert!(cache.contains_key("key:50"));
    }

    #[tokio::test(start_paused = true)]
    async fn get_or_compute_caches_result() {
        let cache = cache(10);
        let calls = &AtomicUsize::new(0);
        let compute = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(7)
        };

        assert_eq!(cache.get_or_compute("k", Duration::from_secs(60), compute).await, Ok(7));
        assert_eq!(cache.get_or_compute("k", Duration::from_secs(60), compute).await, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.computations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_misses_compute_once() {
        let cache = cache(10);
        let calls = &AtomicUsize::new(0);
        let fetch_list = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, String>(42)
        };

        let start = Instant::now();
        let ttl = Duration::from_millis(60_000);
        let (a, b) = tokio::join!(
            cache.get_or_compute("list", ttl, fetch_list),
            cache.get_or_compute("list", ttl, fetch_list),
        );

        assert_eq!(a, Ok(42));
        assert_eq!(b, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() < Duration::from_millis(400));

        let stats = cache.stats();
        assert_eq!(stats.coalesced, 1);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn many_concurrent_callers_share_one_computation() {
        let cache = cache(10);
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute("k", Duration::from_secs(60), || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<_, String>(99)
                    })
                    .await
            }));
        }

        for h in handles {
            assert_eq!(h.await.unwrap(), Ok(99));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_reaches_every_waiter_and_does_not_poison() {
        let cache = cache(10);
        let failing = || async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err::<u64, _>("upstream fora".to_string())
        };

        let ttl = Duration::from_secs(60);
        let (a, b) = tokio::join!(
            cache.get_or_compute("k", ttl, failing),
            cache.get_or_compute("k", ttl, failing),
        );
        assert_eq!(a, Err("upstream fora".to_string()));
        assert_eq!(b, Err("upstream fora".to_string()));
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.stats().in_flight, 0);

        let value = cache
            .get_or_compute("k", ttl, || async { Ok::<_, String>(5) })
            .await;
        assert_eq!(value, Ok(5));
        assert_eq!(cache.get("k"), Some(5));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_leader_releases_key() {
        let cache = cache(10);

        let leader = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_compute("k", Duration::from_secs(60), || {
                        std::future::pending::<Result<u64, String>>()
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(cache.stats().in_flight, 1);

        let follower = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_compute("k", Duration::from_secs(60), || async { Ok::<_, String>(3) })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;

        leader.abort();
        assert_eq!(follower.await.unwrap(), Ok(3));
        assert_eq!(cache.get("k"), Some(3));
        assert_eq!(cache.stats().in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn different_keys_are_independent() {
        let cache = cache(10);
        let ttl = Duration::from_secs(60);
        let (a, b) = tokio::join!(
            cache.get_or_compute("a", ttl, || async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok::<_, String>(1)
            }),
            cache.get_or_compute("b", ttl, || async { Ok::<_, String>(2) }),
        );
        assert_eq!((a, b), (Ok(1), Ok(2)));
        assert_eq!(cache.stats().computations, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_prefix_removes_namespace() {
        let cache = cache(10);
        let ttl = Duration::from_secs(60);
        cache.set("crypto-list:page=1", 1, ttl);
        cache.set("crypto-list:page=2", 2, ttl);
        cache.set("fear-greed:", 3, ttl);

        assert_eq!(cache.invalidate_prefix("crypto-list:"), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("fear-greed:"), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_remaining_counts_down() {
        let cache = cache(10);
        cache.set("k", 1, Duration::from_secs(10));
        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(cache.ttl_remaining("k"), Some(Duration::from_secs(6)));
        assert_eq!(cache.ttl_remaining("missing"), None);
        assert_eq!(cache.age("k"), Some(Duration::from_secs(4)));
    }

    #[tokio::test(start_paused = true)]
    async fn purge_expired_removes_only_stale() {
        let cache = cache(10);
        cache.set("short", 1, Duration::from_millis(10));
        cache.set("long", 2, Duration::from_secs(60));
        tokio::time::advance(Duration::from_millis(20)).await;

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains_key("long"));
    }

    #[tokio::test(start_paused = true)]
    async fn background_purger_removes_expired() {
        let cache = cache(10);
        cache.set("k", 1, Duration::from_millis(10));
        let handle = cache.spawn_purger(Duration::from_millis(5));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cache.is_empty());

        drop(cache);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(handle.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn max_ttl_never_expires_and_respects_capacity() {
        let cache = cache(2);
        cache.set("forever", 1, Duration::MAX);
        assert_eq!(cache.get("forever"), Some(1));

        tokio::time::advance(Duration::from_secs(365 * 24 * 3600)).await;
        assert_eq!(cache.get("forever"), Some(1));
        assert!(cache.ttl_remaining("forever").is_some());

        cache.set("a", 2, Duration::MAX);
        cache.set("b", 3, Duration::MAX);
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains_key("forever"));
        assert_eq!(cache.stats().evictions, 1);

        let value = cache
            .get_or_compute("c", Duration::MAX, || async { Ok(4) })
            .await
            .unwrap();
        assert_eq!(value, 4);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_empties_cache() {
        let cache = cache(10);
        cache.set("a", 1, Duration::from_secs(1));
        cache.set("b", 2, Duration::from_secs(1));
        cache.clear();
        assert!(cache.is_empty());
        cache.set("c", 3, Duration::from_secs(1));
        assert_eq!(cache.len(), 1);
    }
}
