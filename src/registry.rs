//! Process-wide registry of store clients
//!
//! Every distinct connect string and namespace pair gets exactly one client,
//! created on first use and kept for the life of the process. Resources built
//! from the same key therefore share one connection.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use lazy_static::lazy_static;
use tracing::info;

use crate::source::memory::MemoryStore;
use crate::Result;

/// Identity of a store client
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey {
    pub connect_string: String,
    pub namespace: Option<String>,
}

impl ClientKey {
    pub fn new(
        connect_string: impl Into<String>,
        namespace: Option<&str>,
    ) -> Self {
        Self {
            connect_string: connect_string.into(),
            namespace: namespace.map(str::to_string),
        }
    }
}

impl fmt::Display for ClientKey {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{}/{}", self.connect_string, namespace),
            None => write!(f, "{}", self.connect_string),
        }
    }
}

/// Lazily populated, never evicted map of clients
pub struct ClientRegistry<C> {
    clients: DashMap<ClientKey, Arc<C>>,
}

impl<C> Default for ClientRegistry<C> {
    fn default() -> Self {
        Self {
            clients: DashMap::new(),
        }
    }
}

impl<C> ClientRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Client for `key`, created with `init` when missing.
    ///
    /// `init` runs at most once per key, even under concurrent callers. A
    /// failed `init` leaves no entry behind.
    pub fn get_or_init(
        &self,
        key: &ClientKey,
        init: impl FnOnce(&ClientKey) -> Result<C>,
    ) -> Result<Arc<C>> {
        if let Some(client) = self.clients.get(key) {
            return Ok(client.clone());
        }

        let entry = self.clients.entry(key.clone()).or_try_insert_with(|| {
            info!(client = %key, "Creating store client");
            init(key).map(Arc::new)
        })?;
        Ok(entry.clone())
    }

    /// Infallible variant of [`get_or_init`](Self::get_or_init)
    pub fn get_or_insert_with(
        &self,
        key: &ClientKey,
        init: impl FnOnce(&ClientKey) -> C,
    ) -> Arc<C> {
        if let Some(client) = self.clients.get(key) {
            return client.clone();
        }
        self.clients
            .entry(key.clone())
            .or_insert_with(|| {
                info!(client = %key, "Creating store client");
                Arc::new(init(key))
            })
            .clone()
    }

    pub fn get(
        &self,
        key: &ClientKey,
    ) -> Option<Arc<C>> {
        self.clients.get(key).map(|client| client.clone())
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

lazy_static! {
    static ref MEMORY_STORES: ClientRegistry<MemoryStore> = ClientRegistry::new();
}

/// Shared in-process store for `connect_string` and `namespace`
pub fn memory_store(
    connect_string: &str,
    namespace: Option<&str>,
) -> Arc<MemoryStore> {
    let key = ClientKey::new(connect_string, namespace);
    MEMORY_STORES.get_or_insert_with(&key, |key| MemoryStore::new(key.to_string()))
}
