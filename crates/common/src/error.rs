use std::time::Duration;

/// Falha do upstream (API de preços, feed, etc.) ao produzir um valor.
///
/// É `Clone` porque o mesmo erro é entregue a todos os callers que
/// aguardavam o mesmo cálculo.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    #[error("falha de rede: {0}")]
    Network(String),
    #[error("upstream respondeu com status {0}")]
    Status(u16),
    #[error("payload malformado: {0}")]
    Malformed(String),
    #[error("tempo esgotado após {0:?}")]
    Timeout(Duration),
}

/// Requisição negada pelo rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("limite de requisições excedido, tente novamente em {retry_after:?}")]
pub struct RateLimited {
    pub retry_after: Duration,
}

/// Erros de configuração.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("capacidade deve ser maior que zero")]
    ZeroCapacity,
    #[error("limite de requisições deve ser maior que zero")]
    ZeroRateLimit,
    #[error("janela do rate limiter deve ser maior que zero")]
    ZeroWindow,
    #[error("recurso desconhecido: {0}")]
    UnknownResource(String),
    #[error("consulta de {got} enviada ao gateway de {expected}")]
    ResourceMismatch { expected: String, got: String },
}

/// Erro top-level de uma busca através do gateway.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error(transparent)]
    RateLimited(#[from] RateLimited),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl FetchError {
    /// Indica se vale a pena o cliente tentar de novo mais tarde.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::RateLimited(_) => true,
            FetchError::Upstream(UpstreamError::Malformed(_)) => false,
            FetchError::Upstream(_) => true,
            FetchError::Config(_) => false,
        }
    }

    /// Tempo sugerido de espera (só existe para negações do rate limiter).
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            FetchError::RateLimited(rl) => Some(rl.retry_after),
            FetchError::Upstream(_) | FetchError::Config(_) => None,
        }
    }
}

/// Result type alias.
pub type FetchResult<T> = Result<T, FetchError>;
