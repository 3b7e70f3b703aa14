use std::collections::BTreeMap;
use std::fmt::Write;

use crate::ResourceKind;

/// Parâmetros que só servem para furar o cache; nunca entram na chave.
pub const BUST_PARAMS: &[&str] = &["_", "_t", "nocache", "bust"];

/// Requisição lógica a um recurso. Gera chaves determinísticas:
/// `"{namespace}:{p1}={v1}:{p2}={v2}"` com os parâmetros ordenados por nome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    kind: ResourceKind,
    params: BTreeMap<String, String>,
    bust: bool,
}

impl Query {
    pub fn new(kind: ResourceKind) -> Self {
        Self {
            kind,
            params: BTreeMap::new(),
            bust: false,
        }
    }

    /// A partir dos pares crus da requisição (query string, por exemplo).
    pub fn from_pairs<I, K, V>(kind: ResourceKind, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: ToString,
    {
        pairs
            .into_iter()
            .fold(Query::new(kind), |query, (name, value)| query.param(name, value))
    }

    pub fn param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        let name = name.into();
        if BUST_PARAMS.contains(&name.as_str()) {
            self.bust = true;
        } else {
            self.params.insert(name, value.to_string());
        }
        self
    }

    /// Força ignorar o cache nesta requisição.
    pub fn busted(mut self) -> Self {
        self.bust = true;
        self
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn is_bust(&self) -> bool {
        self.bust
    }

    pub fn key(&self) -> String {
        let mut key = String::from(self.kind.namespace());
        for (name, value) in &self.params {
            key.push(':');
            escape_into(&mut key, name);
            key.push('=');
            escape_into(&mut key, value);
        }
        key
    }
}

// Escapa os separadores para que valores diferentes nunca gerem a mesma chave
fn escape_into(out: &mut String, part: &str) {
    for c in part.chars() {
        match c {
            ':' | '=' | '%' => {
                let _ = write!(out, "%{:02X}", c as u32);
            }
            _ => out.push(c),
        }
    }
}
