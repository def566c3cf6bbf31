//! PostgreSQL wire protocol client.
//!
//! Architecture:
//! - `codec`: framing and primitive encoding
//! - `protocol`: frontend and backend messages
//! - `types`: parameter text encoding and column decoders
//! - `scram`: SCRAM-SHA-256 authentication
//! - `statement`: per-connection prepared statement cache
//! - `session`: protocol state machine, no I/O
//! - `connection`: socket, TLS and the driver task around a session
//! - `pool`: primary and standby connection pool

pub mod codec;
pub mod connection;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod scram;
pub mod session;
pub mod statement;
pub mod tls;
pub mod types;

#[cfg(test)]
pub(crate) mod mock;

pub use connection::Connection;
pub use error::{PgError, PgResult, ServerError};
pub use pool::{ConnectionPool, PoolStats, Role};
pub use session::{Expect, Session};
pub use types::{Oid, Param};
