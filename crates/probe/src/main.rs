mod upstream;

use std::sync::Arc;

use clap::Parser;
use tokio::time::{Duration, Instant};
use tracing::info;

use freshcache_cache::{RateLimitConfig, SlidingWindowLimiter};
use freshcache_common::{DEFAULT_CAPACITY, DEFAULT_PURGE_INTERVAL, FetchResult};
use freshcache_gateway::{Freshness, Gateway, GatewayConfig, GatewayStats, Query, ResourceKind, Served};

use upstream::{Quote, SimulatedUpstream};

const SYMBOLS: &[&str] = &["btc", "eth", "sol", "aapl", "doge", "xrp", "ada", "tsla"];

#[derive(Parser, Debug)]
#[command(
    name = "freshcache-probe",
    about = "Dispara clientes concorrentes contra um gateway com upstream simulado"
)]
struct Args {
    /// Recurso simulado (define o TTL padrão)
    #[arg(long, default_value = "live-price")]
    resource: ResourceKind,
    #[arg(long, default_value_t = 8)]
    clients: usize,
    /// Requisições por cliente
    #[arg(long, default_value_t = 50)]
    requests: usize,
    /// Quantidade de chaves distintas consultadas
    #[arg(long, default_value_t = 4, value_parser = clap::value_parser!(u64).range(1..=8))]
    keys: u64,
    #[arg(long, default_value_t = 200)]
    latency_ms: u64,
    /// Intervalo entre requisições de um mesmo cliente
    #[arg(long, default_value_t = 50)]
    interval_ms: u64,
    /// Upstream falha a cada N chamadas (0 = nunca)
    #[arg(long, default_value_t = 0)]
    fail_every: u64,
    #[arg(long)]
    ttl_ms: Option<u64>,
    #[arg(long, default_value_t = DEFAULT_CAPACITY)]
    capacity: usize,
    /// Requisições ao upstream por cliente dentro da janela
    #[arg(long, default_value_t = 60)]
    rate_limit: u32,
    #[arg(long, default_value_t = 60)]
    window_secs: u64,
    #[arg(long)]
    stale_while_revalidate: bool,
    /// Não servir valores antigos em falha/rate limit
    #[arg(long)]
    no_stale: bool,
}

impl Args {
    fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            capacity: self.capacity,
            ttl: self.ttl_ms.map(Duration::from_millis),
            serve_stale: !self.no_stale,
            stale_while_revalidate: self.stale_while_revalidate,
            ..Default::default()
        }
    }

    fn rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig::new(self.rate_limit, Duration::from_secs(self.window_secs))
    }
}

/// Contagem de resultados vistos pelos clientes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Tally {
    fresh: u64,
    cached: u64,
    stale: u64,
    rate_limited: u64,
    failed: u64,
}

impl Tally {
    fn record<V>(&mut self, result: &FetchResult<Served<V>>) {
        match result {
            Ok(served) => match served.freshness {
                Freshness::Fresh => self.fresh += 1,
                Freshness::Cached => self.cached += 1,
                Freshness::Stale { .. } => self.stale += 1,
            },
            Err(e) if e.retry_after().is_some() => self.rate_limited += 1,
            Err(_) => self.failed += 1,
        }
    }

    fn merge(&mut self, other: Tally) {
        self.fresh += other.fresh;
        self.cached += other.cached;
        self.stale += other.stale;
        self.rate_limited += other.rate_limited;
        self.failed += other.failed;
    }

    fn total(&self) -> u64 {
        self.fresh + self.cached + self.stale + self.rate_limited + self.failed
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "freshcache_probe=info,freshcache_gateway=info".into()),
        )
        .init();

    let args = Args::parse();

    let limiter = Arc::new(SlidingWindowLimiter::new(args.rate_limit_config())?);
    let pruner = limiter.spawn_pruner(args.rate_limit_config().window);
    let gateway: Gateway<Quote> = Gateway::new(args.resource, args.gateway_config(), limiter)?;
    let purger = gateway.cache().spawn_purger(DEFAULT_PURGE_INTERVAL);

    let fail_every = (args.fail_every > 0).then_some(args.fail_every);
    let upstream = Arc::new(SimulatedUpstream::new(
        Duration::from_millis(args.latency_ms),
        fail_every,
    ));

    info!(
        "{} clientes x {} requisições contra {} (ttl {:?})",
        args.clients,
        args.requests,
        args.resource,
        gateway.ttl()
    );

    let started = Instant::now();
    let mut handles = Vec::with_capacity(args.clients);
    for client in 0..args.clients {
        let gateway = gateway.clone();
        let upstream = upstream.clone();
        let requests = args.requests;
        let keys = args.keys as usize;
        let interval = Duration::from_millis(args.interval_ms);

        handles.push(tokio::spawn(async move {
            run_client(client, gateway, upstream, requests, keys, interval).await
        }));
    }

    let mut tally = Tally::default();
    for handle in handles {
        tally.merge(handle.await?);
    }
    purger.abort();
    pruner.abort();

    println!("{}", format_report(&tally, &gateway.stats(), upstream.calls(), started.elapsed()));
    Ok(())
}

async fn run_client(
    client: usize,
    gateway: Gateway<Quote>,
    upstream: Arc<SimulatedUpstream>,
    requests: usize,
    keys: usize,
    interval: Duration,
) -> Tally {
    let client_id = format!("client-{client}");
    let mut tally = Tally::default();

    for i in 0..requests {
        let symbol = SYMBOLS[(client + i) % keys];
        let query = Query::new(gateway.kind()).param("symbol", symbol);
        let upstream = upstream.clone();
        let result = gateway
            .fetch(&client_id, &query, move || upstream.quote(symbol.to_string()))
            .await;
        tally.record(&result);

        if !interval.is_zero() {
            tokio::time::sleep(interval).await;
        }
    }

    tally
}

fn format_report(tally: &Tally, stats: &GatewayStats, upstream_calls: u64, elapsed: Duration) -> String {
    let cache = &stats.cache;
    [
        format!("requisições:        {}", tally.total()),
        format!("  do cache:         {}", tally.cached),
        format!("  do upstream:      {}", tally.fresh),
        format!("  valores antigos:  {}", tally.stale),
        format!("  rate limited:     {}", tally.rate_limited),
        format!("  falhas:           {}", tally.failed),
        format!("chamadas upstream:  {upstream_calls}"),
        format!(
            "cache:              {} entradas, hit ratio {:.1}%",
            cache.size,
            cache.hit_ratio() * 100.0
        ),
        format!(
            "  coalescidas:      {} (cálculos: {})",
            cache.coalesced, cache.computations
        ),
        format!(
            "  expiradas:        {} / despejadas: {}",
            cache.expirations, cache.evictions
        ),
        format!("tempo total:        {elapsed:.2?}"),
    ]
    .join("\n")
}
