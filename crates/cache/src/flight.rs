use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use tokio::sync::broadcast;
use tracing::debug;

/// Cálculos em andamento, um canal de resultado por chave.
pub(crate) type Flights<V, E> = DashMap<String, broadcast::Sender<Result<V, E>>>;

/// Papel do caller numa chave sem valor fresco.
pub(crate) enum Claim<'a, V, E> {
    /// Primeiro a chegar: executa o cálculo e publica o resultado.
    Leader(FlightGuard<'a, V, E>),
    /// Já existe cálculo em andamento: só aguarda.
    Follower(broadcast::Receiver<Result<V, E>>),
}

/// Reivindica a chave. A decisão é atômica porque acontece sob o lock do
/// shard do DashMap.
pub(crate) fn claim<'a, V, E>(flights: &'a Flights<V, E>, key: &str) -> Claim<'a, V, E>
where
    V: Clone,
    E: Clone,
{
    match flights.entry(key.to_owned()) {
        MapEntry::Occupied(entry) => Claim::Follower(entry.get().subscribe()),
        MapEntry::Vacant(entry) => {
            let (tx, _) = broadcast::channel(1);
            entry.insert(tx.clone());
            Claim::Leader(FlightGuard {
                flights,
                key: key.to_owned(),
                tx: Some(tx),
            })
        }
    }
}

/// Marcador de cálculo em andamento. Sempre limpa o marcador: em
/// `complete` ou, se o líder for cancelado, no `Drop` (os followers veem
/// o canal fechado e tentam de novo).
pub(crate) struct FlightGuard<'a, V, E> {
    flights: &'a Flights<V, E>,
    key: String,
    tx: Option<broadcast::Sender<Result<V, E>>>,
}

impl<V, E> FlightGuard<'_, V, E>
where
    V: Clone,
    E: Clone,
{
    /// Remove o marcador e entrega o resultado a todos os followers.
    pub fn complete(mut self, result: &Result<V, E>) {
        if let Some(tx) = self.tx.take() {
            self.release(&tx);
            // Err aqui só significa que ninguém estava esperando
            let _ = tx.send(result.clone());
        }
    }
}

impl<V, E> FlightGuard<'_, V, E> {
    fn release(&self, tx: &broadcast::Sender<Result<V, E>>) {
        self.flights
            .remove_if(&self.key, |_, current| current.same_channel(tx));
    }
}

impl<V, E> Drop for FlightGuard<'_, V, E> {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            self.release(&tx);
            debug!("cálculo abandonado para a chave {}", self.key);
        }
    }
}
