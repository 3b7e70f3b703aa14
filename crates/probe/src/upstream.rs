use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::time::Duration;
use tracing::debug;

use freshcache_common::UpstreamError;

/// Cotação devolvida pelo upstream simulado.
#[derive(Debug, Clone, PartialEq)]
pub struct Quote {
    pub symbol: String,
    pub price: f64,
    /// Número da chamada ao upstream que produziu esta cotação.
    pub sequence: u64,
}

/// API de preços simulada: latência fixa e falha a cada N chamadas.
#[derive(Debug)]
pub struct SimulatedUpstream {
    latency: Duration,
    fail_every: Option<u64>,
    calls: AtomicU64,
}

impl SimulatedUpstream {
    pub fn new(latency: Duration, fail_every: Option<u64>) -> Self {
        Self {
            latency,
            fail_every: fail_every.filter(|n| *n > 0),
            calls: AtomicU64::new(0),
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub async fn quote(self: Arc<Self>, symbol: String) -> Result<Quote, UpstreamError> {
        let sequence = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        tokio::time::sleep(self.latency).await;

        if self.fail_every.is_some_and(|n| sequence % n == 0) {
            debug!("upstream simulado falhando na chamada {sequence}");
            return Err(UpstreamError::Status(503));
        }

        Ok(Quote {
            price: base_price(&symbol) * (1.0 + (sequence % 100) as f64 / 10_000.0),
            symbol,
            sequence,
        })
    }
}

fn base_price(symbol: &str) -> f64 {
    match symbol {
        "btc" => 65_000.0,
        "eth" => 3_400.0,
        "sol" => 150.0,
        "aapl" => 190.0,
        _ => 1.0 + symbol.bytes().map(f64::from).sum::<f64>(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn quote_counts_calls() {
        let upstream = Arc::new(SimulatedUpstream::new(Duration::from_millis(10), None));
        let quote = upstream.clone().quote("btc".into()).await.unwrap();
        assert_eq!(quote.symbol, "btc");
        assert_eq!(quote.sequence, 1);
        assert_eq!(upstream.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fails_every_nth_call() {
        let upstream = Arc::new(SimulatedUpstream::new(Duration::ZERO, Some(2)));
        assert!(upstream.clone().quote("eth".into()).await.is_ok());
        assert_eq!(
            upstream.clone().quote("eth".into()).await,
            Err(UpstreamError::Status(503))
        );
        assert!(upstream.clone().quote("eth".into()).await.is_ok());
    }

    #[test]
    fn fail_every_zero_disables_failures() {
        let upstream = SimulatedUpstream::new(Duration::ZERO, Some(0));
        assert_eq!(upstream.fail_every, None);
    }
}
