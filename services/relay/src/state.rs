use std::collections::HashMap;
use std::sync::Arc;

use herald_protocol::TunnelMessage;
use redis::aio::ConnectionManager;
use sqlx::PgPool;
use tokio::sync::{mpsc, Notify, OnceCell, RwLock};

use crate::config::RelayConfig;

/// A live tunnel connection as seen by the rest of the process.
///
/// `tx` is the bounded outbound channel (saturation = slow consumer);
/// `displaced` fires when a newer connection for the same subscriber
/// replaces this one.
#[derive(Clone)]
pub struct AgentHandle {
    pub connection_id: String,
    pub tx: mpsc::Sender<TunnelMessage>,
    pub displaced: Arc<Notify>,
}

impl AgentHandle {
    pub fn new(connection_id: String, tx: mpsc::Sender<TunnelMessage>) -> Self {
        AgentHandle {
            connection_id,
            tx,
            displaced: Arc::new(Notify::new()),
        }
    }
}

/// In-memory registry of live agent connections, keyed by subscriber id.
///
/// Lookups are the worker hot path and take the read lock; register and
/// unregister take the write lock only long enough to mutate the map entry.
#[derive(Clone, Default)]
pub struct TunnelRegistry {
    agents: Arc<RwLock<HashMap<String, AgentHandle>>>,
}

impl TunnelRegistry {
    pub async fn lookup(&self, subscriber_id: &str) -> Option<AgentHandle> {
        self.agents.read().await.get(subscriber_id).cloned()
    }

    /// Register a connection.  If a prior live connection exists for the
    /// subscriber, it is replaced and returned so the caller can displace it.
    pub async fn register(&self, subscriber_id: &str, handle: AgentHandle) -> Option<AgentHandle> {
        self.agents
            .write()
            .await
            .insert(subscriber_id.to_owned(), handle)
    }

    /// Remove the entry only if the current value is still the closing
    /// connection.  Returns whether the entry was removed; a `false` return
    /// means a replacement won the slot and must be left alone.
    pub async fn remove_if(&self, subscriber_id: &str, connection_id: &str) -> bool {
        let mut map = self.agents.write().await;
        match map.get(subscriber_id) {
            Some(current) if current.connection_id == connection_id => {
                map.remove(subscriber_id);
                true
            }
            _ => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.agents.read().await.len()
    }
}

/// Lazily-initialized shared Redis connection.
///
/// `redis::Client::open` only parses the URL; the multiplexed connection is
/// established on first use and shared afterwards.
pub struct RedisHandle {
    client: redis::Client,
    manager: OnceCell<ConnectionManager>,
}

impl RedisHandle {
    pub fn new(client: redis::Client) -> Self {
        RedisHandle {
            client,
            manager: OnceCell::new(),
        }
    }

    pub async fn manager(&self) -> Result<ConnectionManager, redis::RedisError> {
        self.manager
            .get_or_try_init(|| ConnectionManager::new(self.client.clone()))
            .await
            .cloned()
    }

    pub fn client(&self) -> &redis::Client {
        &self.client
    }
}

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub redis: Arc<RedisHandle>,
    pub config: Arc<RelayConfig>,
    pub agents: TunnelRegistry,
}

impl AppState {
    pub fn new(pool: PgPool, redis: redis::Client, config: RelayConfig) -> Self {
        AppState {
            pool,
            redis: Arc::new(RedisHandle::new(redis)),
            config: Arc::new(config),
            agents: TunnelRegistry::default(),
        }
    }
}
