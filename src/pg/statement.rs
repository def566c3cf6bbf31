//! Prepared statement management and caching.
//!
//! This module provides:
//! - `PreparedStatement`: a server-side statement parsed for a query id
//! - `StatementCache`: per-connection O(1) LRU of statements keyed by query id
//!
//! A statement is *parsed* once it is in the cache, and *described* once its
//! result columns are known. Columns are filled in from the first
//! statement-describe response and shared with every later request through
//! the `Arc`.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use once_cell::sync::OnceCell;

use super::protocol::FieldDescription;

/// Shared column descriptions - wrapped in Arc to avoid cloning on every query.
pub type SharedColumns = Arc<Vec<FieldDescription>>;

/// Default number of statements kept per connection.
pub const DEFAULT_CAPACITY: usize = 100;

// ============================================================================
// Prepared Statement
// ============================================================================

/// A prepared statement that has been sent to PostgreSQL with a Parse message.
#[derive(Debug)]
pub struct PreparedStatement {
    /// Server-side name for this statement (e.g., "__pgkit_1")
    pub name: String,
    /// Result columns, set once the statement has been described.
    columns: OnceCell<SharedColumns>,
}

impl PreparedStatement {
    pub fn new(name: String) -> Self {
        Self {
            name,
            columns: OnceCell::new(),
        }
    }

    /// Result columns, if the statement has been described.
    pub fn columns(&self) -> Option<&SharedColumns> {
        self.columns.get()
    }

    /// Record the columns of a statement describe. Later calls are ignored.
    pub fn set_columns(&self, columns: SharedColumns) {
        let _ = self.columns.set(columns);
    }

    pub fn is_described(&self) -> bool {
        self.columns.get().is_some()
    }
}

// ============================================================================
// Statement Cache (O(1) LRU)
// ============================================================================

/// O(1) LRU cache of prepared statements, keyed by query id.
///
/// Statements are stored as `Arc<PreparedStatement>` so in-flight requests
/// keep theirs alive even after eviction.
pub struct StatementCache {
    cache: LruCache<String, Arc<PreparedStatement>>,
    /// Counter for generating unique statement names
    next_id: u32,
}

impl StatementCache {
    /// Create a new statement cache with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(cap),
            next_id: 0,
        }
    }

    /// Look up a statement and mark it recently used.
    pub fn get(&mut self, id: &str) -> Option<Arc<PreparedStatement>> {
        self.cache.get(id).map(Arc::clone)
    }

    /// Look up a statement without touching LRU order.
    pub fn peek(&self, id: &str) -> Option<Arc<PreparedStatement>> {
        self.cache.peek(id).map(Arc::clone)
    }

    #[inline]
    pub fn contains(&self, id: &str) -> bool {
        self.cache.contains(id)
    }

    /// Create and cache a statement for `id` under a fresh server name.
    ///
    /// Returns the new statement and the server name of the statement it
    /// displaced (LRU eviction or same id), if any. The caller closes it.
    pub fn prepare(&mut self, id: &str) -> (Arc<PreparedStatement>, Option<String>) {
        let statement = Arc::new(PreparedStatement::new(self.next_statement_name()));
        let evicted = self
            .cache
            .push(id.to_string(), Arc::clone(&statement))
            .map(|(_, old)| old.name.clone());
        (statement, evicted)
    }

    /// Remove `id` if it still maps to `statement`.
    ///
    /// Used when the Parse for a statement failed: a newer statement cached
    /// under the same id in the meantime is left alone.
    pub fn discard(&mut self, id: &str, statement: &Arc<PreparedStatement>) -> bool {
        match self.cache.peek(id) {
            Some(current) if Arc::ptr_eq(current, statement) => {
                self.cache.pop(id);
                true
            }
            _ => false,
        }
    }

    /// Generate a unique statement name for this connection.
    pub fn next_statement_name(&mut self) -> String {
        self.next_id = self.next_id.wrapping_add(1);
        format!("__pgkit_{}", self.next_id)
    }

    /// Get the number of cached statements.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.cache.cap().get()
    }
}

impl Default for StatementCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pg::protocol::Format;
    use crate::pg::types::Oid;

    fn column(name: &str) -> FieldDescription {
        FieldDescription {
            name: name.to_string(),
            table_oid: 0,
            column_attr: 0,
            type_oid: Oid::INT4,
            type_size: 4,
            type_modifier: -1,
            format: Format::Text,
        }
    }

    #[test]
    fn test_statement_described_once() {
        let stmt = PreparedStatement::new("s1".to_string());
        assert!(!stmt.is_described());

        stmt.set_columns(Arc::new(vec![column("a")]));
        stmt.set_columns(Arc::new(vec![column("b"), column("c")]));

        assert!(stmt.is_described());
        assert_eq!(stmt.columns().unwrap()[0].name, "a");
    }

    #[test]
    fn test_cache_lru_eviction() {
        let mut cache = StatementCache::new(2);

        let (s1, evicted) = cache.prepare("q1");
        assert!(evicted.is_none());
        cache.prepare("q2");

        // Access q1 to make it recently used
        cache.get("q1");

        // Insert q3, should evict q2 (now least recently used)
        let (_, evicted) = cache.prepare("q3");
        assert_eq!(evicted.as_deref(), Some("__pgkit_2"));
        assert_eq!(cache.peek("q1").unwrap().name, s1.name);
        assert!(!cache.contains("q2"));
        assert!(cache.contains("q3"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_discard_only_matching_statement() {
        let mut cache = StatementCache::new(10);
        let (old, _) = cache.prepare("q1");
        let (new, evicted) = cache.prepare("q1");

        assert_eq!(evicted.as_deref(), Some(old.name.as_str()));
        assert!(!cache.discard("q1", &old));
        assert!(cache.contains("q1"));
        assert!(cache.discard("q1", &new));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_unique_statement_names() {
        let mut cache = StatementCache::new(10);

        let names: Vec<String> = (0..10).map(|_| cache.next_statement_name()).collect();
        let unique: std::collections::HashSet<_> = names.iter().collect();
        assert_eq!(unique.len(), 10);
        assert!(names.iter().all(|n| n.starts_with("__pgkit_")));
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        assert_eq!(StatementCache::new(0).capacity(), 1);
    }
}
