use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use tokio::time::Duration;
use tracing::{debug, warn};

use freshcache_cache::{CacheConfig, CacheStats, SlidingWindowLimiter, TtlCache};
use freshcache_common::{
    ConfigError, DEFAULT_CAPACITY, DEFAULT_SNAPSHOT_CAPACITY, DEFAULT_SNAPSHOT_RETENTION,
    FetchError, FetchResult, UpstreamError,
};

use crate::snapshot::{MemorySnapshots, Snapshot, SnapshotStore};
use crate::{Query, ResourceKind};

/// Configuração de um gateway (um por recurso).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    pub capacity: usize,
    /// Substitui o TTL padrão do recurso.
    pub ttl: Option<Duration>,
    /// Em falha do upstream ou rate limit, servir o último valor conhecido.
    pub serve_stale: bool,
    /// Com o valor vencido, servir o snapshot e atualizar em segundo plano.
    pub stale_while_revalidate: bool,
    pub snapshot_capacity: usize,
    pub snapshot_retention: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            ttl: None,
            serve_stale: true,
            stale_while_revalidate: false,
            snapshot_capacity: DEFAULT_SNAPSHOT_CAPACITY,
            snapshot_retention: DEFAULT_SNAPSHOT_RETENTION,
        }
    }
}

/// De onde veio o valor servido.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Hit no cache.
    Cached,
    /// Buscado no upstream agora (ou junto com outra requisição idêntica).
    Fresh,
    /// Último valor conhecido, já vencido.
    Stale { age: Duration },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Served<V> {
    pub value: V,
    pub freshness: Freshness,
}

impl<V> Served<V> {
    pub fn is_stale(&self) -> bool {
        matches!(self.freshness, Freshness::Stale { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GatewayStats {
    pub cache: CacheStats,
    pub served_cached: u64,
    pub served_fresh: u64,
    pub served_stale: u64,
    pub rate_limited: u64,
    pub upstream_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    cached: AtomicU64,
    fresh: AtomicU64,
    stale: AtomicU64,
    rate_limited: AtomicU64,
    upstream_failures: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Fachada de um recurso externo: cache com TTL, rate limit por cliente e
/// fallback para o último valor conhecido.
///
/// Construído uma vez na inicialização e repassado a quem precisa; clones
/// compartilham o mesmo estado.
pub struct Gateway<V> {
    kind: ResourceKind,
    ttl: Duration,
    config: GatewayConfig,
    cache: TtlCache<V>,
    limiter: Arc<SlidingWindowLimiter>,
    snapshots: Arc<dyn SnapshotStore<V>>,
    counters: Arc<Counters>,
    /// Chaves com revalidação em segundo plano já agendada.
    revalidating: Arc<DashMap<String, ()>>,
}

/// Libera a chave em `revalidating` quando a task termina (ou é abortada).
struct Revalidation {
    pending: Arc<DashMap<String, ()>>,
    key: String,
}

impl Drop for Revalidation {
    fn drop(&mut self) {
        self.pending.remove(&self.key);
    }
}

impl<V> Clone for Gateway<V> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            ttl: self.ttl,
            config: self.config.clone(),
            cache: self.cache.clone(),
            limiter: self.limiter.clone(),
            snapshots: self.snapshots.clone(),
            counters: self.counters.clone(),
            revalidating: self.revalidating.clone(),
        }
    }
}

impl<V> Gateway<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(
        kind: ResourceKind,
        config: GatewayConfig,
        limiter: Arc<SlidingWindowLimiter>,
    ) -> Result<Self, ConfigError> {
        let snapshots = MemorySnapshots::new(config.snapshot_capacity, config.snapshot_retention)?;
        Self::with_snapshots(kind, config, limiter, Arc::new(snapshots))
    }

    pub fn with_snapshots(
        kind: ResourceKind,
        config: GatewayConfig,
        limiter: Arc<SlidingWindowLimiter>,
        snapshots: Arc<dyn SnapshotStore<V>>,
    ) -> Result<Self, ConfigError> {
        let cache = TtlCache::new(CacheConfig::with_capacity(config.capacity).named(kind.namespace()))?;
        Ok(Self {
            kind,
            ttl: config.ttl.unwrap_or_else(|| kind.ttl()),
            config,
            cache,
            limiter,
            snapshots,
            counters: Arc::new(Counters::default()),
            revalidating: Arc::new(DashMap::new()),
        })
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn cache(&self) -> &TtlCache<V> {
        &self.cache
    }

    /// Busca o valor da consulta, indo ao upstream só quando necessário.
    ///
    /// Ordem: cache fresco → (stale-while-revalidate) → rate limit →
    /// upstream com single-flight → último valor conhecido → erro.
    pub async fn fetch<F, Fut>(&self, client: &str, query: &Query, upstream: F) -> FetchResult<Served<V>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, UpstreamError>> + Send + 'static,
    {
        if query.kind() != self.kind {
            return Err(ConfigError::ResourceMismatch {
                expected: self.kind.to_string(),
                got: query.kind().to_string(),
            }
            .into());
        }
        let key = query.key();

        if query.is_bust() {
            self.cache.invalidate(&key);
            debug!("{}: cache ignorado para {key}", self.kind);
        } else if let Some(value) = self.cache.get(&key) {
            Counters::bump(&self.counters.cached);
            return Ok(Served {
                value,
                freshness: Freshness::Cached,
            });
        } else if self.config.stale_while_revalidate
            && let Some(snapshot) = self.snapshots.load(&key)
        {
            self.revalidate(client, key, upstream);
            return Ok(self.stale(snapshot));
        }

        if let Err(denied) = self.limiter.check(client) {
            Counters::bump(&self.counters.rate_limited);
            return self.fallback(&key, denied.into());
        }

        let result = refresh(
            self.cache.clone(),
            self.snapshots.clone(),
            self.ttl,
            key.clone(),
            upstream,
        )
        .await;

        match result {
            Ok(value) => {
                Counters::bump(&self.counters.fresh);
                Ok(Served {
                    value,
                    freshness: Freshness::Fresh,
                })
            }
            Err(err) => {
                Counters::bump(&self.counters.upstream_failures);
                warn!("{}: upstream falhou para {key}: {err}", self.kind);
                self.fallback(&key, err.into())
            }
        }
    }

    pub fn invalidate(&self, query: &Query) -> bool {
        self.cache.invalidate(&query.key())
    }

    pub fn invalidate_all(&self) {
        self.cache.clear();
    }

    pub fn stats(&self) -> GatewayStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        GatewayStats {
            cache: self.cache.stats(),
            served_cached: load(&self.counters.cached),
            served_fresh: load(&self.counters.fresh),
            served_stale: load(&self.counters.stale),
            rate_limited: load(&self.counters.rate_limited),
            upstream_failures: load(&self.counters.upstream_failures),
        }
    }

    /// Atualiza a chave em segundo plano, respeitando o rate limit do cliente.
    ///
    /// Se já existe atualização (ou busca) em andamento para a chave, não faz
    /// nada: o caller não gasta cota nem dispara outra chamada ao upstream.
    fn revalidate<F, Fut>(&self, client: &str, key: String, upstream: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, UpstreamError>> + Send + 'static,
    {
        if self.cache.is_computing(&key) {
            return;
        }
        let pending = match self.revalidating.entry(key.clone()) {
            MapEntry::Occupied(_) => return,
            MapEntry::Vacant(slot) => {
                slot.insert(());
                Revalidation {
                    pending: self.revalidating.clone(),
                    key: key.clone(),
                }
            }
        };

        if let Err(denied) = self.limiter.check(client) {
            Counters::bump(&self.counters.rate_limited);
            debug!(
                "{}: revalidação de {key} adiada, retry em {:?}",
                self.kind, denied.retry_after
            );
            return;
        }

        let kind = self.kind;
        let cache = self.cache.clone();
        let snapshots = self.snapshots.clone();
        let ttl = self.ttl;
        let counters = self.counters.clone();
        tokio::spawn(async move {
            let _pending = pending;
            if let Err(err) = refresh(cache, snapshots, ttl, key.clone(), upstream).await {
                Counters::bump(&counters.upstream_failures);
                warn!("{kind}: revalidação em segundo plano falhou para {key}: {err}");
            }
        });
    }

    fn fallback(&self, key: &str, err: FetchError) -> FetchResult<Served<V>> {
        if self.config.serve_stale
            && let Some(snapshot) = self.snapshots.load(key)
        {
            warn!("{}: servindo valor antigo para {key} ({err})", self.kind);
            return Ok(self.stale(snapshot));
        }
        Err(err)
    }

    fn stale(&self, snapshot: Snapshot<V>) -> Served<V> {
        Counters::bump(&self.counters.stale);
        let age = snapshot.age();
        Served {
            value: snapshot.value,
            freshness: Freshness::Stale { age },
        }
    }
}

/// Preenche a chave pelo single-flight do cache; quem calcula também grava
/// o snapshot de fallback.
async fn refresh<V, F, Fut>(
    cache: TtlCache<V>,
    snapshots: Arc<dyn SnapshotStore<V>>,
    ttl: Duration,
    key: String,
    upstream: F,
) -> Result<V, UpstreamError>
where
    V: Clone + Send + Sync + 'static,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<V, UpstreamError>>,
{
    let snapshots = &snapshots;
    let snapshot_key = key.as_str();
    cache
        .fill(&key, ttl, move || async move {
            let value = upstream().await?;
            snapshots.store(snapshot_key, value.clone());
            Ok(value)
        })
        .await
}
