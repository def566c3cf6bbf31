//! PostgreSQL connection pool.
//!
//! Primary connections are tracked in three sets:
//! - `idle`: connected, nothing in flight, no lock held; an idle timer runs
//! - `active`: handed out for ordinary queries; may be shared round-robin
//! - `locked`: held exclusively by a `begin`/`lock` callback
//!
//! Standby connections (read-only queries) are tracked per resolved address
//! of the standby host and are never locked.
//!
//! [`ConnectionPool::acquire`] never fails: when nothing is reachable it
//! returns a destroyed connection whose queries resolve as connection-closed.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::connection::{
    ConnectOptions, Connection, ConnectionKind, ConnectionObserver, Target,
};
use super::protocol::TransactionStatus;
use crate::config::DbConfig;
use crate::schema::SchemaRegistry;

/// Which server a query should run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    /// A standby if one is configured, else the primary.
    Standby,
}

// ============================================================================
// Statistics
// ============================================================================

/// Connection counts of one class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassStats {
    pub idle: usize,
    pub active: usize,
    pub locked: usize,
}

impl ClassStats {
    pub fn total(&self) -> usize {
        self.idle + self.active + self.locked
    }
}

/// Snapshot of the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub primary: ClassStats,
    pub standby: ClassStats,
}

// ============================================================================
// Pool state
// ============================================================================

#[derive(Default)]
struct Sets {
    idle: Vec<Connection>,
    active: Vec<Connection>,
    locked: Vec<Connection>,
    /// Round-robin cursor over `active`
    cursor: usize,
}

impl Sets {
    fn total(&self) -> usize {
        self.idle.len() + self.active.len() + self.locked.len()
    }

    fn remove(&mut self, conn: &Connection) -> bool {
        for set in [&mut self.idle, &mut self.active, &mut self.locked] {
            if let Some(pos) = set.iter().position(|c| c == conn) {
                set.swap_remove(pos);
                return true;
            }
        }
        false
    }

    fn next_active(&mut self) -> Option<Connection> {
        if self.active.is_empty() {
            return None;
        }
        self.cursor = (self.cursor + 1) % self.active.len();
        Some(self.active[self.cursor].clone())
    }

    fn stats(&self) -> ClassStats {
        ClassStats {
            idle: self.idle.len(),
            active: self.active.len(),
            locked: self.locked.len(),
        }
    }

    fn drain(&mut self) -> Vec<Connection> {
        let mut all = std::mem::take(&mut self.idle);
        all.append(&mut self.active);
        all.append(&mut self.locked);
        all
    }
}

/// A pending idle timeout. `token` tells a timer that has already woken
/// whether it still owns the entry.
struct IdleTimer {
    token: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct PoolState {
    destroyed: bool,
    primary: Sets,
    standby: Sets,
    /// Standby connections per resolved address
    per_addr: HashMap<SocketAddr, usize>,
    /// Cached standby host resolution
    standby_addrs: Option<Vec<SocketAddr>>,
    /// Idle timers by connection id
    timers: HashMap<u64, IdleTimer>,
    next_timer: u64,
    /// Returned when nothing is reachable
    dead: Option<Connection>,
}

impl PoolState {
    fn dead(&mut self) -> Connection {
        self.dead.get_or_insert_with(Connection::destroyed).clone()
    }

    fn cancel_timer(&mut self, conn: &Connection) {
        if let Some(timer) = self.timers.remove(&conn.id()) {
            timer.handle.abort();
        }
    }

    fn sets(&mut self, kind: ConnectionKind) -> &mut Sets {
        match kind {
            ConnectionKind::Standby(_) => &mut self.standby,
            _ => &mut self.primary,
        }
    }
}

/// Outcome of one acquisition attempt under the pool lock.
enum Step {
    Done(Connection),
    /// Wait for the pool signal and retry.
    Wait,
    /// Resolve the standby host and retry.
    Resolve,
}

struct PoolInner {
    config: DbConfig,
    options: Arc<ConnectOptions>,
    schema: Arc<SchemaRegistry>,
    state: Mutex<PoolState>,
    /// Woken whenever a connection goes idle or away
    signal: Notify,
    weak: Weak<PoolInner>,
}

// ============================================================================
// Pool
// ============================================================================

/// Pool of primary and standby connections.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(config: DbConfig, schema: Arc<SchemaRegistry>) -> Self {
        let options = Arc::new(ConnectOptions::from_config(&config));
        let inner = Arc::new_cyclic(|weak| PoolInner {
            config,
            options,
            schema,
            state: Mutex::new(PoolState::default()),
            signal: Notify::new(),
            weak: weak.clone(),
        });
        Self { inner }
    }

    pub fn config(&self) -> &DbConfig {
        &self.inner.config
    }

    pub(crate) fn options(&self) -> Arc<ConnectOptions> {
        Arc::clone(&self.inner.options)
    }

    pub(crate) fn schema(&self) -> Arc<SchemaRegistry> {
        Arc::clone(&self.inner.schema)
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.state.lock().destroyed
    }

    /// Get a connection for `role`.
    ///
    /// With `lock`, the connection is held exclusively (its lock counter is
    /// incremented) until the caller calls [`Connection::release_lock`].
    /// Without it, submit right away: a handle held across other awaits can go
    /// idle and be handed to a lock request.
    pub async fn acquire(&self, role: Role, lock: bool) -> Connection {
        let role = match role {
            Role::Standby if self.inner.config.standby_host().is_some() && !lock => Role::Standby,
            _ => Role::Primary,
        };

        loop {
            let notified = self.inner.signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let step = {
                let mut state = self.inner.state.lock();
                match role {
                    _ if state.destroyed => Step::Done(state.dead()),
                    Role::Primary => self.inner.try_primary(&mut state, lock),
                    Role::Standby => self.inner.try_standby(&mut state),
                }
            };

            match step {
                Step::Done(conn) => return conn,
                Step::Wait => {
                    trace!("waiting for a primary connection");
                    notified.await;
                }
                Step::Resolve => {
                    let addrs = self.inner.resolve_standby().await;
                    let mut state = self.inner.state.lock();
                    if !addrs.is_empty() {
                        state.standby_addrs = Some(addrs);
                        continue;
                    }
                    return match state.standby.next_active() {
                        Some(conn) => conn,
                        None => state.dead(),
                    };
                }
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            primary: state.primary.stats(),
            standby: state.standby.stats(),
        }
    }

    /// Destroy every connection and release all waiters.
    pub fn destroy(&self) {
        self.inner.teardown();
    }
}

impl PoolInner {
    fn observer(&self) -> Weak<dyn ConnectionObserver> {
        self.weak.clone()
    }

    fn spawn(&self, kind: ConnectionKind, target: Target) -> Connection {
        let conn = Connection::spawn(
            kind,
            target,
            Arc::clone(&self.options),
            Arc::clone(&self.schema),
            Some(self.observer()),
        );
        debug!(conn = conn.id(), ?kind, "opening connection");
        conn
    }

    fn try_primary(&self, state: &mut PoolState, lock: bool) -> Step {
        let max = self.config.max_connections();
        let total = state.primary.total();
        let unlocked = state.primary.idle.len() + state.primary.active.len();

        if lock {
            if !state.primary.idle.is_empty() {
                // Never take the last unlocked connection while another
                // could be created or someone else holds a lock
                let last = unlocked == 1;
                if !last || (total >= max && state.primary.locked.is_empty()) {
                    let conn = self.take_idle(state, ConnectionKind::Primary);
                    conn.acquire_lock();
                    state.primary.locked.push(conn.clone());
                    return Step::Done(conn);
                }
            }
            if total < max {
                let conn = self.spawn(ConnectionKind::Primary, Target::primary(&self.config));
                conn.acquire_lock();
                state.primary.locked.push(conn.clone());
                return Step::Done(conn);
            }
            return Step::Wait;
        }

        if !state.primary.idle.is_empty() {
            let conn = self.take_idle(state, ConnectionKind::Primary);
            state.primary.active.push(conn.clone());
            return Step::Done(conn);
        }
        if total < max {
            let conn = self.spawn(ConnectionKind::Primary, Target::primary(&self.config));
            state.primary.active.push(conn.clone());
            return Step::Done(conn);
        }
        if let Some(conn) = state.primary.next_active() {
            return Step::Done(conn);
        }

        // Every connection is locked: open one headroom connection so a lock
        // holder's nested queries cannot starve
        debug!(total, "all primary connections locked; opening headroom connection");
        let conn = self.spawn(ConnectionKind::Primary, Target::primary(&self.config));
        state.primary.active.push(conn.clone());
        Step::Done(conn)
    }

    fn try_standby(&self, state: &mut PoolState) -> Step {
        if let Some(conn) = state.standby.idle.last().cloned() {
            let conn_kind = conn.kind();
            let conn = self.take_idle(state, conn_kind);
            state.standby.active.push(conn.clone());
            return Step::Done(conn);
        }

        let addrs = match &state.standby_addrs {
            Some(addrs) => addrs.clone(),
            None => return Step::Resolve,
        };

        let cap = self.config.max_connections_per_standby();
        let least_loaded = addrs
            .iter()
            .map(|addr| (*addr, state.per_addr.get(addr).copied().unwrap_or(0)))
            .filter(|(_, count)| *count < cap)
            .min_by_key(|(_, count)| *count);

        if let Some((addr, _)) = least_loaded {
            let conn = self.spawn(
                ConnectionKind::Standby(addr),
                Target::standby(&self.config, addr),
            );
            *state.per_addr.entry(addr).or_default() += 1;
            state.standby.active.push(conn.clone());
            return Step::Done(conn);
        }

        match state.standby.next_active() {
            Some(conn) => Step::Done(conn),
            None => Step::Wait,
        }
    }

    /// Remove the most recently idled connection of a class and stop its timer.
    fn take_idle(&self, state: &mut PoolState, kind: ConnectionKind) -> Connection {
        let sets = state.sets(kind);
        let conn = match sets.idle.pop() {
            Some(conn) => conn,
            None => return state.dead(),
        };
        state.cancel_timer(&conn);
        conn.mark_busy();
        trace!(conn = conn.id(), "reusing idle connection");
        conn
    }

    /// Close an idle connection whose timer `token` ran out.
    ///
    /// Does nothing if the connection was reused or re-idled with a newer
    /// timer since.
    fn expire_idle(&self, conn: &Connection, token: u64) {
        {
            let mut state = self.state.lock();
            match state.timers.get(&conn.id()) {
                Some(timer) if timer.token == token => {}
                _ => return,
            }
            state.timers.remove(&conn.id());
            let idle = &mut state.sets(conn.kind()).idle;
            match idle.iter().position(|c| c == conn) {
                Some(pos) => {
                    idle.remove(pos);
                }
                None => return,
            }
        }

        trace!(conn = conn.id(), "idle timeout");
        conn.destroy();
        self.signal.notify_waiters();
    }

    async fn resolve_standby(&self) -> Vec<SocketAddr> {
        let Some(host) = self.config.standby_host() else {
            return Vec::new();
        };
        let port = self.config.standby_port();

        match tokio::net::lookup_host((host, port)).await {
            Ok(found) => {
                let mut addrs: Vec<SocketAddr> = Vec::new();
                for addr in found {
                    if !addrs.contains(&addr) {
                        addrs.push(addr);
                    }
                }
                debug!(host, count = addrs.len(), "resolved standby host");
                addrs
            }
            Err(e) => {
                warn!(host, "standby lookup failed: {}", e);
                Vec::new()
            }
        }
    }

    fn teardown(&self) {
        let conns = {
            let mut state = self.state.lock();
            state.destroyed = true;
            for (_, timer) in state.timers.drain() {
                timer.handle.abort();
            }
            let mut conns = state.primary.drain();
            conns.append(&mut state.standby.drain());
            state.per_addr.clear();
            conns
        };

        debug!(count = conns.len(), "destroying pool");
        for conn in conns {
            conn.destroy();
        }
        self.signal.notify_waiters();
    }
}

impl ConnectionObserver for PoolInner {
    fn on_connect(&self, conn: &Connection) {
        trace!(conn = conn.id(), "connection ready");
    }

    fn on_idle(&self, conn: &Connection) {
        let mut state = self.state.lock();

        // A reused connection may have been handed out again already
        if conn.in_flight() > 0 || conn.lock_count() > 0 || conn.is_destroyed() {
            return;
        }

        let kind = conn.kind();
        let sets = state.sets(kind);
        if !sets.remove(conn) {
            return;
        }

        if state.destroyed || conn.tx_status() != TransactionStatus::Idle {
            if !state.destroyed {
                warn!(
                    conn = conn.id(),
                    status = ?conn.tx_status(),
                    "connection went idle inside a transaction; closing"
                );
            }
            drop(state);
            conn.destroy();
            self.signal.notify_waiters();
            return;
        }

        state.sets(kind).idle.push(conn.clone());
        state.cancel_timer(conn);

        state.next_timer += 1;
        let token = state.next_timer;
        let timeout = self.config.idle_timeout();
        let pool = self.weak.clone();
        let idle_conn = conn.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(pool) = pool.upgrade() {
                pool.expire_idle(&idle_conn, token);
            }
        });
        state.timers.insert(conn.id(), IdleTimer { token, handle });
        drop(state);

        self.signal.notify_waiters();
    }

    fn on_destroy(&self, conn: &Connection) {
        {
            let mut state = self.state.lock();
            let kind = conn.kind();
            state.sets(kind).remove(conn);
            state.cancel_timer(conn);

            if let ConnectionKind::Standby(addr) = kind {
                if let Some(count) = state.per_addr.get_mut(&addr) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        state.per_addr.remove(&addr);
                    }
                }
                // Force a fresh lookup on the next standby acquisition
                state.standby_addrs = None;
            }
        }
        self.signal.notify_waiters();
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        if !self.state.get_mut().destroyed {
            self.teardown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pg::mock::{eventually, MockServer, Reply};
    use crate::pg::session::Expect;
    use crate::query::Query;

    fn timer_token(pool: &ConnectionPool, conn: &Connection) -> Option<u64> {
        pool.inner.state.lock().timers.get(&conn.id()).map(|t| t.token)
    }

    #[tokio::test]
    async fn test_stale_idle_timer_spares_reused_connection() {
        let server = MockServer::start(|_, _| Reply::command("UPDATE 1")).await;
        let pool = ConnectionPool::new(server.config(), Arc::new(SchemaRegistry::new()));

        let conn = pool.acquire(Role::Primary, false).await;
        assert!(conn.query(Query::new("UPDATE t SET x = 1"), Expect::Any).await.ok);
        eventually("idle", || pool.stats().primary.idle == 1).await;
        let stale = timer_token(&pool, &conn).unwrap();

        // Reused while its timer was already firing
        let again = pool.acquire(Role::Primary, false).await;
        assert_eq!(again, conn);
        pool.inner.expire_idle(&conn, stale);
        assert!(!conn.is_destroyed());
        assert_eq!(pool.stats().primary.active, 1);

        assert!(again.query(Query::new("UPDATE t SET x = 2"), Expect::Any).await.ok);
        eventually("idle", || pool.stats().primary.idle == 1).await;
        let current = timer_token(&pool, &conn).unwrap();
        assert_ne!(current, stale);

        // Idle again under a newer timer
        pool.inner.expire_idle(&conn, stale);
        assert!(!conn.is_destroyed());
        assert_eq!(pool.stats().primary.idle, 1);

        pool.inner.expire_idle(&conn, current);
        assert!(conn.is_destroyed());
        assert_eq!(pool.stats().primary.total(), 0);
        assert_eq!(timer_token(&pool, &conn), None);
    }
}
