//! Rate limiter de janela deslizante, por identidade de cliente.
//!
//! Consultado antes de um miss do cache chegar ao upstream: uma negação
//! vira `RateLimited`, que a camada HTTP traduz para um 429.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior, interval};
use tracing::debug;

use freshcache_common::{ConfigError, DEFAULT_RATE_LIMIT, DEFAULT_RATE_WINDOW, RateLimited};

use crate::entry::deadline;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
}

impl RateLimitConfig {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_requests == 0 {
            return Err(ConfigError::ZeroRateLimit);
        }
        if self.window.is_zero() {
            return Err(ConfigError::ZeroWindow);
        }
        Ok(())
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::new(DEFAULT_RATE_LIMIT, DEFAULT_RATE_WINDOW)
    }
}

/// Log deslizante de instantes de requisição por cliente.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    config: RateLimitConfig,
    clients: DashMap<String, VecDeque<Instant>>,
    denied: AtomicU64,
}

impl SlidingWindowLimiter {
    pub fn new(config: RateLimitConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            clients: DashMap::new(),
            denied: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Registra e permite a requisição, ou nega com o tempo até a próxima vaga.
    pub fn check(&self, client: &str) -> Result<(), RateLimited> {
        let now = Instant::now();
        let mut log = self.clients.entry(client.to_string()).or_default();
        self.slide(&mut log, now);

        if log.len() < self.config.max_requests as usize {
            log.push_back(now);
            return Ok(());
        }

        // Janela cheia: a vaga abre quando o mais antigo sair da janela
        let retry_after = log
            .front()
            .map(|oldest| deadline(*oldest, self.config.window).saturating_duration_since(now))
            .unwrap_or(self.config.window);
        drop(log);

        self.denied.fetch_add(1, Ordering::Relaxed);
        debug!("rate limit: cliente {client} negado, retry em {retry_after:?}");
        Err(RateLimited { retry_after })
    }

    /// Requisições ainda disponíveis na janela atual.
    pub fn remaining(&self, client: &str) -> u32 {
        let now = Instant::now();
        let used = match self.clients.get_mut(client) {
            Some(mut log) => {
                self.slide(&mut log, now);
                log.len()
            }
            None => 0,
        };
        self.config.max_requests.saturating_sub(used as u32)
    }

    pub fn reset(&self, client: &str) {
        self.clients.remove(client);
    }

    /// Esquece clientes sem requisições dentro da janela.
    pub fn prune_idle(&self) -> usize {
        let now = Instant::now();
        let before = self.clients.len();
        self.clients.retain(|_, log| {
            self.slide(log, now);
            !log.is_empty()
        });
        before.saturating_sub(self.clients.len())
    }

    /// Task de fundo que chama `prune_idle` a cada `every`.
    /// Encerra sozinha quando o último `Arc` do limiter é descartado.
    pub fn spawn_pruner(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut tick = interval(every);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tick.tick().await;

            loop {
                tick.tick().await;
                let Some(state) = weak.upgrade() else {
                    break;
                };
                let pruned = state.prune_idle();
                if pruned > 0 {
                    debug!("rate limit: {pruned} clientes ociosos esquecidos");
                }
            }
        })
    }

    pub fn tracked_clients(&self) -> usize {
        self.clients.len()
    }

    pub fn denied(&self) -> u64 {
        self.denied.load(Ordering::Relaxed)
    }

    fn slide(&self, log: &mut VecDeque<Instant>, now: Instant) {
        while let Some(oldest) = log.front() {
            if now.saturating_duration_since(*oldest) >= self.config.window {
                log.pop_front();
            } else {
                break;
            }
        }
    }
}
