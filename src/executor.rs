//! Query capabilities shared by pools and connections.
//!
//! Every operation resolves to a [`QueryResult`]; failures are reported in the
//! result, never as a panic or `Err`.

use std::future::Future;

use async_trait::async_trait;

use crate::pg::connection::Connection;
use crate::pg::session::Expect;
use crate::query::Query;
use crate::read::{self, ReadOptions};
use crate::result::QueryResult;
use crate::transaction::{self, LockGuard};

/// Something queries can run on.
#[async_trait]
pub trait Queryable: Send + Sync {
    /// Run a query and check its result shape.
    async fn query(&self, query: Query, expect: Expect) -> QueryResult;

    /// Run a statement; rows are returned when it produces any.
    async fn exec<Q>(&self, query: Q) -> QueryResult
    where
        Q: Into<Query> + Send,
    {
        self.query(query.into(), Expect::Any).await
    }

    /// Run a statement that must not return rows.
    async fn run<Q>(&self, query: Q) -> QueryResult
    where
        Q: Into<Query> + Send,
    {
        self.query(query.into(), Expect::NoRows).await
    }

    /// Run a query that returns rows.
    async fn select<Q>(&self, query: Q) -> QueryResult
    where
        Q: Into<Query> + Send,
    {
        self.query(query.into(), Expect::Rows).await
    }

    /// Run a query and keep its first row; no row gives `data = null`.
    async fn select_row<Q>(&self, query: Q) -> QueryResult
    where
        Q: Into<Query> + Send,
    {
        self.query(query.into(), Expect::Row).await
    }

    /// Read one page of a query. See [`ReadOptions`].
    async fn read<Q>(&self, query: Q, options: ReadOptions) -> QueryResult
    where
        Q: Into<Query> + Send,
    {
        read::read(self, query.into(), options).await
    }
}

/// Something that can hand out exclusive connections.
#[async_trait]
pub trait Transactable: Queryable {
    /// Run `f` in a transaction on an exclusive connection.
    ///
    /// `f` gets the connection; an ok result commits, anything else rolls
    /// back. Nested calls on that connection use savepoints.
    async fn begin<F, Fut>(&self, f: F) -> QueryResult
    where
        F: FnOnce(Connection) -> Fut + Send,
        Fut: Future<Output = QueryResult> + Send;

    /// Run `f` on an exclusive connection without a transaction.
    async fn lock<F, Fut>(&self, f: F) -> QueryResult
    where
        F: FnOnce(Connection) -> Fut + Send,
        Fut: Future<Output = QueryResult> + Send;
}

#[async_trait]
impl Queryable for Connection {
    async fn query(&self, query: Query, expect: Expect) -> QueryResult {
        Connection::query(self, query, expect).await
    }
}

#[async_trait]
impl Transactable for Connection {
    async fn begin<F, Fut>(&self, f: F) -> QueryResult
    where
        F: FnOnce(Connection) -> Fut + Send,
        Fut: Future<Output = QueryResult> + Send,
    {
        self.acquire_lock();
        let guard = LockGuard::new(self.clone());
        transaction::transaction(guard, f).await
    }

    async fn lock<F, Fut>(&self, f: F) -> QueryResult
    where
        F: FnOnce(Connection) -> Fut + Send,
        Fut: Future<Output = QueryResult> + Send,
    {
        self.acquire_lock();
        let guard = LockGuard::new(self.clone());
        transaction::locked(guard, f).await
    }
}
