//! Per-(database, table) column cache populated by the multi-table metadata
//! operation and consulted by the merge engine. Entries are evicted when
//! they no longer correspond to any table of the current metadata request,
//! not on a timer.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

/// Cache key shared with error messages: `('db', 'table')`.
pub fn table_key(db: &str, table: &str) -> String {
    format!("('{}', '{}')", db, table)
}

#[derive(Debug, Default)]
pub struct SchemaCache {
    inner: RwLock<HashMap<String, Vec<String>>>,
}

impl SchemaCache {
    pub fn get(&self, key: &str) -> Option<Vec<String>> {
        self.inner.read().get(key).cloned()
    }

    pub fn insert(&self, key: String, columns: Vec<String>) {
        self.inner.write().insert(key, columns);
    }

    /// Drop every entry whose key is absent from the current request.
    pub fn retain_requested(&self, requested: &HashSet<String>) {
        self.inner.write().retain(|k, _| requested.contains(k));
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_entries_are_evicted_by_request_contents() {
        let cache = SchemaCache::default();
        cache.insert(table_key("a.db3", "T1"), vec!["ID".into(), "Flow".into()]);
        cache.insert(table_key("b.db3", "T2"), vec!["ID".into(), "Baseflow".into()]);
        assert_eq!(cache.len(), 2);

        let requested: HashSet<String> = [table_key("a.db3", "T1")].into_iter().collect();
        cache.retain_requested(&requested);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&table_key("a.db3", "T1")).is_some());
        assert!(cache.get(&table_key("b.db3", "T2")).is_none());
    }
}
