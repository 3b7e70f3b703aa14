use tokio::time::{Duration, Instant};

/// Teto para prazos "nunca expira" (ex.: `Duration::MAX`), que não cabem
/// num `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// `start + after`, saturando num instante distante em vez de estourar.
pub(crate) fn deadline(start: Instant, after: Duration) -> Instant {
    start
        .checked_add(after)
        .or_else(|| start.checked_add(FAR_FUTURE))
        .unwrap_or(start)
}

/// Entrada no cache: valor + instante de expiração fixo.
#[derive(Debug, Clone)]
pub(crate) struct Entry<V> {
    pub value: V,
    pub stored_at: Instant,
    pub expires_at: Instant,
    /// Ordem de inserção, usada pelo limite de capacidade.
    pub seq: u64,
}

impl<V> Entry<V> {
    pub fn new(value: V, ttl: Duration, seq: u64) -> Self {
        let stored_at = Instant::now();
        Self {
            value,
            stored_at,
            expires_at: deadline(stored_at, ttl),
            seq,
        }
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    pub fn remaining_at(&self, now: Instant) -> Option<Duration> {
        self.expires_at.checked_duration_since(now).filter(|d| !d.is_zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn expires_exactly_at_deadline() {
        let entry = Entry::new(1u32, Duration::from_millis(100), 0);
        assert_eq!(entry.expires_at - entry.stored_at, Duration::from_millis(100));
        assert!(!entry.is_expired_at(entry.stored_at + Duration::from_millis(99)));
        assert!(entry.is_expired_at(entry.stored_at + Duration::from_millis(100)));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_ttl_is_born_expired() {
        let entry = Entry::new("x", Duration::ZERO, 0);
        assert!(entry.is_expired_at(Instant::now()));
        assert_eq!(entry.remaining_at(Instant::now()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn huge_ttl_saturates() {
        let entry = Entry::new(1u8, Duration::MAX, 0);
        assert!(entry.expires_at >= entry.stored_at + FAR_FUTURE);
        assert!(!entry.is_expired_at(entry.stored_at + Duration::from_secs(10 * 365 * 24 * 3600)));
    }
}
