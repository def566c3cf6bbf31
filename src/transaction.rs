//! Transactions and exclusive connection use.
//!
//! Both helpers take a [`LockGuard`] for a lock that is already held. The
//! guard releases one level of it when dropped, so the connection can go idle
//! again once the outermost holder is done, even if the caller stops polling.
//! A guard dropped while a transaction level is still open destroys the
//! connection, since its transaction state is unknown.

use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::pg::connection::Connection;
use crate::pg::session::Expect;
use crate::query::Query;
use crate::result::QueryResult;

/// How one transaction level starts and ends.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Level {
    Top,
    Savepoint(String),
}

impl Level {
    fn for_connection(conn: &Connection) -> Self {
        if conn.tx_status().in_transaction() {
            Level::Savepoint(format!("\"{}\"", Uuid::new_v4()))
        } else {
            Level::Top
        }
    }

    fn begin(&self) -> String {
        match self {
            Level::Top => "BEGIN".to_string(),
            Level::Savepoint(name) => format!("SAVEPOINT {}", name),
        }
    }

    fn commit(&self) -> String {
        match self {
            Level::Top => "COMMIT".to_string(),
            Level::Savepoint(name) => format!("RELEASE SAVEPOINT {}", name),
        }
    }

    fn rollback(&self) -> String {
        match self {
            Level::Top => "ROLLBACK".to_string(),
            Level::Savepoint(name) => format!("ROLLBACK TO SAVEPOINT {}", name),
        }
    }
}

/// One held level of a connection's lock.
///
/// Created right after the lock is taken, with no await in between.
pub(crate) struct LockGuard {
    conn: Connection,
    open: bool,
}

impl LockGuard {
    pub(crate) fn new(conn: Connection) -> Self {
        Self { conn, open: false }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.open {
            warn!(conn = self.conn.id(), "transaction abandoned, closing connection");
            self.conn.destroy();
        }
        self.conn.release_lock();
    }
}

/// Run `f` inside a transaction (or a savepoint when one is already open).
///
/// Commits when `f` returns an ok result and rolls back otherwise.
pub(crate) async fn transaction<F, Fut>(mut guard: LockGuard, f: F) -> QueryResult
where
    F: FnOnce(Connection) -> Fut + Send,
    Fut: Future<Output = QueryResult> + Send,
{
    let conn = guard.conn.clone();
    let level = Level::for_connection(&conn);

    guard.open = true;
    let begun = conn.query(Query::new(level.begin()), Expect::Any).await;
    if !begun.ok {
        guard.open = false;
        return begun;
    }

    let result = guarded(f(conn.clone())).await;

    if result.ok {
        let committed = conn.query(Query::new(level.commit()), Expect::Any).await;
        guard.open = false;
        if !committed.ok {
            return committed;
        }
        if level == Level::Top && committed.meta.command.as_deref() == Some("ROLLBACK") {
            return QueryResult::internal_error("Transaction was rolled back by the server");
        }
        return result;
    }

    debug!(conn = conn.id(), status = result.status, "rolling back");
    let rolled_back = conn.query(Query::new(level.rollback()), Expect::Any).await;
    guard.open = false;
    if !rolled_back.ok {
        warn!(
            conn = conn.id(),
            "rollback failed: {}",
            rolled_back.message.as_deref().unwrap_or("unknown error")
        );
    }
    result
}

/// Run `f` with exclusive use of the guarded connection and no transaction.
pub(crate) async fn locked<F, Fut>(guard: LockGuard, f: F) -> QueryResult
where
    F: FnOnce(Connection) -> Fut + Send,
    Fut: Future<Output = QueryResult> + Send,
{
    guarded(f(guard.conn.clone())).await
}

/// Turn a panic in a callback into an error result.
async fn guarded<Fut>(fut: Fut) -> QueryResult
where
    Fut: Future<Output = QueryResult> + Send,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(_) => {
            warn!("transaction callback panicked");
            QueryResult::internal_error("Callback panicked")
        }
    }
}
