//! Database handle.
//!
//! [`Pool`] ties the connection pool, the notification channel and the
//! channel registry together. Read-only queries go to a standby when one is
//! configured; everything else runs on the primary.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::config::DbConfig;
use crate::error::Result;
use crate::executor::{Queryable, Transactable};
use crate::notify::{MainChannel, Notification, SubscriptionId};
use crate::pg::connection::{Connection, Target};
use crate::pg::pool::{ConnectionPool, PoolStats, Role};
use crate::pg::session::Expect;
use crate::query::Query;
use crate::result::QueryResult;
use crate::schema::SchemaRegistry;
use crate::transaction::{self, LockGuard};

struct Shared {
    connections: ConnectionPool,
    channel: MainChannel,
}

/// A PostgreSQL database: pooled connections plus LISTEN/NOTIFY.
///
/// Cheap to clone. Connections are opened on demand, so creating a pool does
/// no I/O. Must be used from within a Tokio runtime.
#[derive(Clone)]
pub struct Pool {
    shared: Arc<Shared>,
}

impl Pool {
    pub fn new(config: DbConfig, schema: Arc<SchemaRegistry>) -> Self {
        let connections = ConnectionPool::new(config, schema);
        let channel = MainChannel::new(
            Target::primary(connections.config()),
            connections.options(),
            connections.schema(),
        );
        debug!(host = connections.config().host(), "pool created");
        Self {
            shared: Arc::new(Shared {
                connections,
                channel,
            }),
        }
    }

    /// Pool for a connection URL with a default channel registry.
    pub fn from_url(url: &str) -> Result<Self> {
        let config = DbConfig::from_url(url)?;
        Ok(Self::new(config, Arc::new(SchemaRegistry::new())))
    }

    pub fn config(&self) -> &DbConfig {
        self.shared.connections.config()
    }

    pub fn schema(&self) -> Arc<SchemaRegistry> {
        self.shared.connections.schema()
    }

    /// Get a connection directly.
    ///
    /// A handle taken without `lock` is only safe for a query submitted right
    /// away: held across other awaits it can go idle and be handed to a
    /// transaction. With `lock` the caller must call
    /// [`Connection::release_lock`] when done.
    pub(crate) async fn acquire(&self, role: Role, lock: bool) -> Connection {
        self.shared.connections.acquire(role, lock).await
    }

    pub fn stats(&self) -> PoolStats {
        self.shared.connections.stats()
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.connections.is_destroyed()
    }

    /// Subscribe to `channel`.
    pub fn on<F>(&self, channel: &str, f: F) -> Result<SubscriptionId>
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.shared.channel.on(channel, f)
    }

    /// Subscribe to the next notification on `channel`.
    pub fn once<F>(&self, channel: &str, f: F) -> Result<SubscriptionId>
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.shared.channel.once(channel, f)
    }

    pub fn off(&self, id: SubscriptionId) -> bool {
        self.shared.channel.off(id)
    }

    /// Notify `channel` with a JSON payload.
    pub async fn publish(&self, channel: &str, payload: &Value) -> QueryResult {
        self.shared.channel.publish(channel, payload).await
    }

    /// Wait for the notification connection, or for the pool to be destroyed.
    pub async fn wait_connected(&self) {
        self.shared.channel.wait_connected().await
    }

    /// Close every connection. Later queries resolve as connection-closed.
    pub fn destroy(&self) {
        self.shared.channel.destroy();
        self.shared.connections.destroy();
    }
}

#[async_trait]
impl Queryable for Pool {
    async fn query(&self, query: Query, expect: Expect) -> QueryResult {
        let role = if query.is_read_only() {
            Role::Standby
        } else {
            Role::Primary
        };
        let conn = self.acquire(role, false).await;
        conn.query(query, expect).await
    }
}

#[async_trait]
impl Transactable for Pool {
    async fn begin<F, Fut>(&self, f: F) -> QueryResult
    where
        F: FnOnce(Connection) -> Fut + Send,
        Fut: Future<Output = QueryResult> + Send,
    {
        let conn = self.acquire(Role::Primary, true).await;
        transaction::transaction(LockGuard::new(conn), f).await
    }

    async fn lock<F, Fut>(&self, f: F) -> QueryResult
    where
        F: FnOnce(Connection) -> Fut + Send,
        Fut: Future<Output = QueryResult> + Send,
    {
        let conn = self.acquire(Role::Primary, true).await;
        transaction::locked(LockGuard::new(conn), f).await
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("host", &self.config().host())
            .field("database", &self.config().database())
            .field("stats", &self.stats())
            .finish()
    }
}
