use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use freshcache_common::ConfigError;

/// Famílias de dados vindas de APIs externas, cada uma com sua política de TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Cotação ao vivo de um ativo.
    LivePrice,
    /// Listagem paginada de criptomoedas.
    CryptoList,
    StockQuote,
    /// Resumo de mercado (índices, dominância, market cap global).
    MarketOverview,
    PredictionMarkets,
    /// Índice Fear & Greed.
    FearGreed,
    NewsFeed,
    HistoricalChart,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 8] = [
        ResourceKind::LivePrice,
        ResourceKind::CryptoList,
        ResourceKind::StockQuote,
        ResourceKind::MarketOverview,
        ResourceKind::PredictionMarkets,
        ResourceKind::FearGreed,
        ResourceKind::NewsFeed,
        ResourceKind::HistoricalChart,
    ];

    /// Prefixo das chaves de cache deste recurso.
    pub fn namespace(self) -> &'static str {
        match self {
            ResourceKind::LivePrice => "live-price",
            ResourceKind::CryptoList => "crypto-list",
            ResourceKind::StockQuote => "stock-quote",
            ResourceKind::MarketOverview => "market-overview",
            ResourceKind::PredictionMarkets => "prediction-markets",
            ResourceKind::FearGreed => "fear-greed",
            ResourceKind::NewsFeed => "news-feed",
            ResourceKind::HistoricalChart => "historical-chart",
        }
    }

    /// TTL padrão: curto para preços, longo para dados quase estáticos.
    pub fn ttl(self) -> Duration {
        match self {
            ResourceKind::LivePrice => Duration::from_secs(30),
            ResourceKind::CryptoList | ResourceKind::StockQuote => Duration::from_secs(60),
            ResourceKind::MarketOverview | ResourceKind::PredictionMarkets => {
                Duration::from_secs(2 * 60)
            }
            ResourceKind::NewsFeed => Duration::from_secs(5 * 60),
            ResourceKind::FearGreed => Duration::from_secs(10 * 60),
            ResourceKind::HistoricalChart => Duration::from_secs(60 * 60),
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.namespace())
    }
}

impl FromStr for ResourceKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        ResourceKind::ALL
            .into_iter()
            .find(|kind| kind.namespace() == wanted)
            .ok_or_else(|| ConfigError::UnknownResource(s.to_string()))
    }
}
