//! Paginated reads.
//!
//! A "next page" is detected by fetching one row more than requested, so a
//! COUNT is only needed when the caller asks for a total through a summary
//! query.

use serde_json::Value;
use tracing::trace;

use crate::executor::Queryable;
use crate::pg::types::Param;
use crate::query::Query;
use crate::result::{Data, Meta, QueryResult, Row};

pub const DEFAULT_LIMIT: u64 = 100;
pub const MAX_LIMIT: u64 = 1000;

/// Pagination options for [`Queryable::read`].
#[derive(Debug, Clone)]
pub struct ReadOptions {
    /// Runs first; its row becomes `meta.summary`. A `total` field enables
    /// short-circuiting and exact page detection.
    pub summary_query: Option<Query>,
    pub order_by: Option<String>,
    pub offset: Option<u64>,
    pub limit: Option<u64>,
    pub default_limit: u64,
    pub max_limit: u64,
    /// Fetch everything up to this many rows, ignoring `limit`.
    pub max_results: Option<u64>,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            summary_query: None,
            order_by: None,
            offset: None,
            limit: None,
            default_limit: DEFAULT_LIMIT,
            max_limit: MAX_LIMIT,
            max_results: None,
        }
    }
}

impl ReadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn summary(mut self, query: impl Into<Query>) -> Self {
        self.summary_query = Some(query.into());
        self
    }

    pub fn order_by(mut self, order_by: impl Into<String>) -> Self {
        self.order_by = Some(order_by.into());
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn max_results(mut self, max: u64) -> Self {
        self.max_results = Some(max);
        self
    }

    /// Effective offset and limit.
    fn window(&self) -> (u64, u64) {
        let offset = self.offset.unwrap_or(0);
        let limit = match self.max_results {
            Some(max) => max,
            None => self
                .limit
                .unwrap_or(self.default_limit)
                .min(self.max_limit),
        };
        (offset, limit)
    }
}

/// Run `query` one page at a time. See [`ReadOptions`].
pub async fn read<Q>(db: &Q, query: Query, options: ReadOptions) -> QueryResult
where
    Q: Queryable + ?Sized,
{
    let (offset, limit) = options.window();
    if limit == 0 {
        return empty_page(None, None);
    }

    let mut summary = None;
    let mut total = None;
    if let Some(summary_query) = options.summary_query.clone() {
        let result = db.select_row(summary_query).await;
        if !result.ok {
            return result;
        }
        if let Some(row) = result.row() {
            total = row.get("total").and_then(parse_total);
            summary = Some(row.clone());
        }
        if let Some(total) = total {
            if total == 0 || offset >= total {
                trace!(total, offset, "read short-circuited by summary total");
                return empty_page(Some(total), summary);
            }
        }
    }

    let look_ahead = total.is_none() && options.max_results.is_none();
    let fetch = if look_ahead { limit.saturating_add(1) } else { limit };

    let result = db
        .select(paginate(&query, options.order_by.as_deref(), offset, fetch))
        .await;
    if !result.ok {
        return result;
    }

    let mut rows = result.into_rows();
    let next_page = if look_ahead {
        let more = rows.len() as u64 > limit;
        rows.truncate(limit as usize);
        more
    } else {
        match total {
            Some(total) => offset + (rows.len() as u64) < total,
            None => false,
        }
    };

    let meta = Meta {
        rows: rows.len() as u64,
        total,
        next_page,
        summary,
        ..Default::default()
    };
    QueryResult::ok(Data::Rows(rows), meta)
}

fn empty_page(total: Option<u64>, summary: Option<Row>) -> QueryResult {
    QueryResult::ok(
        Data::None,
        Meta {
            total,
            summary,
            ..Default::default()
        },
    )
}

/// `<sql> [ORDER BY ..] OFFSET $n LIMIT $n+1`, keeping the query preparable.
fn paginate(query: &Query, order_by: Option<&str>, offset: u64, limit: u64) -> Query {
    let mut params: Vec<Param> = query.param_list().to_vec();
    let sql = query.sql().trim_end().trim_end_matches(';');

    let mut wrapped = sql.to_string();
    // A trailing line comment would swallow the appended clauses
    if sql.lines().last().map_or(false, |line| line.contains("--")) {
        wrapped.push('\n');
    }
    if let Some(order_by) = order_by {
        wrapped.push_str(" ORDER BY ");
        wrapped.push_str(order_by);
    }
    wrapped.push_str(&format!(
        " OFFSET ${} LIMIT ${}",
        params.len() + 1,
        params.len() + 2
    ));

    params.push(Param::from(offset));
    params.push(Param::from(limit));
    query.rewrite(wrapped, ":read", params)
}

/// A total from a number or a numeric string (`count(*)` is int8).
fn parse_total(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_i64().map(|v| v.max(0) as u64))
            .or_else(|| n.as_f64().map(|v| v.max(0.0) as u64)),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }
}
