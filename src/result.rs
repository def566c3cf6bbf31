//! The value every query operation resolves to.
//!
//! A [`QueryResult`] carries either data or an error, never both, along with
//! an HTTP-like status code:
//!
//! - `200` success
//! - `400` invalid input (SQLSTATE classes 22, 23, 42) or a result-shape mismatch
//! - `409` unique violation (SQLSTATE 23505)
//! - `500` any other server or internal error
//! - `503` the connection was closed before the query completed

use serde::Serialize;
use serde_json::{Map, Value};

use crate::pg::error::ServerError;

/// One result row, keyed by column name.
pub type Row = Map<String, Value>;

pub const STATUS_OK: u16 = 200;
pub const STATUS_BAD_REQUEST: u16 = 400;
pub const STATUS_CONFLICT: u16 = 409;
pub const STATUS_INTERNAL: u16 = 500;
pub const STATUS_UNAVAILABLE: u16 = 503;

/// Payload of a result.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Data {
    /// No data (errors, statements without rows, empty pages).
    #[default]
    None,
    Rows(Vec<Row>),
    Row(Row),
}

/// Result metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    /// Rows affected, from the command tag.
    pub rows: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Total row count reported by a read summary.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    pub next_page: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<Row>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ServerError>,
}

/// Outcome of a query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub ok: bool,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub data: Data,
    pub meta: Meta,
}

impl QueryResult {
    pub fn ok(data: Data, meta: Meta) -> Self {
        Self {
            ok: true,
            status: STATUS_OK,
            message: None,
            data,
            meta,
        }
    }

    /// Successful result without data.
    pub fn empty() -> Self {
        Self::ok(Data::None, Meta::default())
    }

    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            status,
            message: Some(message.into()),
            data: Data::None,
            meta: Meta::default(),
        }
    }

    /// Result for a query that failed on the server.
    pub fn from_server_error(err: ServerError) -> Self {
        let mut result = Self::error(status_for_sqlstate(&err.code), err.message.clone());
        result.meta.error = Some(err);
        result
    }

    /// Result for a query whose connection was closed or never opened.
    pub fn connection_closed() -> Self {
        Self::error(STATUS_UNAVAILABLE, "Connection is closed")
    }

    /// Result for a query whose shape did not match what the caller asked for.
    pub fn usage_error(message: impl Into<String>) -> Self {
        Self::error(STATUS_BAD_REQUEST, message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::error(STATUS_INTERNAL, message)
    }

    pub fn is_connection_closed(&self) -> bool {
        self.status == STATUS_UNAVAILABLE
    }

    /// SQLSTATE of a server error, if this result carries one.
    pub fn sqlstate(&self) -> Option<&str> {
        self.meta.error.as_ref().map(|e| e.code.as_str())
    }

    /// Rows of the result; a single row is returned as a one-element slice.
    pub fn rows(&self) -> &[Row] {
        match &self.data {
            Data::Rows(rows) => rows,
            Data::Row(row) => std::slice::from_ref(row),
            Data::None => &[],
        }
    }

    /// First row of the result.
    pub fn row(&self) -> Option<&Row> {
        self.rows().first()
    }

    pub fn into_rows(self) -> Vec<Row> {
        match self.data {
            Data::Rows(rows) => rows,
            Data::Row(row) => vec![row],
            Data::None => Vec::new(),
        }
    }
}

/// Status code for a SQLSTATE.
pub fn status_for_sqlstate(code: &str) -> u16 {
    match code {
        "23505" => STATUS_CONFLICT,
        c if c.starts_with("22") || c.starts_with("23") || c.starts_with("42") => {
            STATUS_BAD_REQUEST
        }
        _ => STATUS_INTERNAL,
    }
}
