//! Query descriptors.
//!
//! A [`Query`] is built once and submitted as many times as needed. Cloning is
//! cheap: the SQL text, id and decoders are shared.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use serde_json::Value;

use crate::pg::types::{DecodeFn, Param};

/// Statements that modify data even when they start with a read keyword.
const WRITE_MARKERS: &[&str] = &[
    "for update",
    "for no key update",
    "for share",
    "for key share",
    "nextval(",
    "setval(",
    " into ",
];

/// An SQL statement with its parameters and decoding options.
#[derive(Clone)]
pub struct Query {
    sql: Arc<str>,
    id: Option<Arc<str>>,
    params: Vec<Param>,
    decoders: Option<Arc<HashMap<String, DecodeFn>>>,
    max_rows: Option<u32>,
    read_only: Arc<OnceCell<bool>>,
}

impl Query {
    pub fn new(sql: impl Into<Arc<str>>) -> Self {
        Self {
            sql: sql.into(),
            id: None,
            params: Vec::new(),
            decoders: None,
            max_rows: None,
            read_only: Arc::new(OnceCell::new()),
        }
    }

    /// Prepare this statement under `id`.
    ///
    /// Each connection parses and describes a prepared statement once and
    /// reuses it for every later query with the same id.
    pub fn id(mut self, id: impl Into<Arc<str>>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Append one parameter (`$1`, `$2`, ... in order).
    pub fn bind(mut self, param: impl Into<Param>) -> Self {
        self.params.push(param.into());
        self
    }

    /// Replace the parameter list.
    pub fn params<I, P>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Param>,
    {
        self.params = params.into_iter().map(Into::into).collect();
        self
    }

    /// Decode the column named `column` with `f` instead of its type's default.
    pub fn decode<F>(mut self, column: impl Into<String>, f: F) -> Self
    where
        F: Fn(&[u8]) -> Value + Send + Sync + 'static,
    {
        let mut decoders = self
            .decoders
            .as_deref()
            .cloned()
            .unwrap_or_default();
        decoders.insert(column.into(), Arc::new(f));
        self.decoders = Some(Arc::new(decoders));
        self
    }

    /// Fetch at most `n` rows.
    pub fn max_rows(mut self, n: u32) -> Self {
        self.max_rows = Some(n);
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn prepared_id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn param_list(&self) -> &[Param] {
        &self.params
    }

    pub fn row_limit(&self) -> Option<u32> {
        self.max_rows
    }

    /// Custom decoder for a column name.
    pub fn decoder_for(&self, column: &str) -> Option<&DecodeFn> {
        self.decoders.as_ref().and_then(|d| d.get(column))
    }

    /// Whether the simple query protocol can run this query.
    pub fn is_simple(&self) -> bool {
        self.params.is_empty() && self.id.is_none() && self.max_rows.is_none()
    }

    /// Whether the statement only reads data and may run on a standby.
    ///
    /// Decided from the leading keyword and cached.
    pub fn is_read_only(&self) -> bool {
        *self.read_only.get_or_init(|| detect_read_only(&self.sql))
    }

    /// Derive a new query with different SQL, keeping decoders.
    ///
    /// The id gets `suffix` appended; the read-only flag is recomputed.
    pub(crate) fn rewrite(&self, sql: String, suffix: &str, params: Vec<Param>) -> Self {
        Self {
            sql: sql.into(),
            id: self
                .id
                .as_ref()
                .map(|id| Arc::from(format!("{}{}", id, suffix))),
            params,
            decoders: self.decoders.clone(),
            max_rows: self.max_rows,
            read_only: Arc::new(OnceCell::new()),
        }
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("sql", &self.sql)
            .field("id", &self.id)
            .field("params", &self.params)
            .field("max_rows", &self.max_rows)
            .finish_non_exhaustive()
    }
}

impl From<&str> for Query {
    fn from(sql: &str) -> Self {
        Query::new(sql)
    }
}

impl From<String> for Query {
    fn from(sql: String) -> Self {
        Query::new(sql)
    }
}

fn detect_read_only(sql: &str) -> bool {
    let body = skip_comments(sql).trim_start_matches(|c: char| c == '(' || c.is_whitespace());
    let keyword: String = body
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_lowercase();

    if !matches!(keyword.as_str(), "select" | "show" | "values" | "table") {
        return false;
    }

    let lower = body.to_ascii_lowercase();
    !WRITE_MARKERS.iter().any(|m| lower.contains(m))
}

/// Strip leading whitespace and SQL comments.
fn skip_comments(mut sql: &str) -> &str {
    loop {
        sql = sql.trim_start();
        if let Some(rest) = sql.strip_prefix("--") {
            sql = rest.split_once('\n').map(|(_, r)| r).unwrap_or("");
        } else if let Some(rest) = sql.strip_prefix("/*") {
            sql = rest.split_once("*/").map(|(_, r)| r).unwrap_or("");
        } else {
            return sql;
        }
    }
}
