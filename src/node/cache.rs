//! Per-instance memo of resolved references and derived values.
//!
//! Keys are attribute names. Invalidating a stream drops every entry that is
//! not a declared stream (derived values and reverse accessors may depend on
//! anything) and then the entry for the stream itself.

use super::Node;
use crate::schema::NodeSchema;
use crate::store::Value;
use std::collections::HashMap;

/// One memoized attribute
#[derive(Debug, Clone)]
pub enum Cached {
    Node(Node),
    Value(Value),
    /// A nullable reference that is unset
    Absent,
}

#[derive(Debug, Default)]
pub struct NodeCache {
    entries: HashMap<String, Cached>,
}

impl NodeCache {
    pub fn get(&self, key: &str) -> Option<&Cached> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn insert(&mut self, key: &str, value: Cached) -> Option<Cached> {
        self.entries.insert(key.to_string(), value)
    }

    /// Drop derived entries and `stream`. Evicted entries are handed back so
    /// the caller can release node handles outside any borrow.
    #[must_use]
    pub fn invalidate(&mut self, stream: &str, schema: &NodeSchema) -> Vec<Cached> {
        let derived: Vec<String> = self
            .entries
            .keys()
            .filter(|k| !schema.has_stream(k))
            .cloned()
            .collect();
        let mut evicted: Vec<Cached> = derived
            .iter()
            .filter_map(|k| self.entries.remove(k))
            .collect();
        evicted.extend(self.entries.remove(stream));
        evicted
    }

    #[must_use]
    pub fn clear(&mut self) -> Vec<Cached> {
        self.entries.drain().map(|(_, v)| v).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Stream;

    fn schema() -> NodeSchema {
        NodeSchema::builder("Widget")
            .stream(Stream::text("name"))
            .stream(Stream::reference("owner", "Owner"))
            .stream(Stream::reference("maker", "Owner"))
            .build()
            .unwrap()
    }

    #[test]
    fn invalidating_a_stream_keeps_sibling_references() {
        let schema = schema();
        let mut cache = NodeCache::default();
        cache.insert("owner", Cached::Value(Value::Integer(1)));
        cache.insert("maker", Cached::Value(Value::Integer(2)));
        let evicted = cache.invalidate("owner", &schema);
        assert_eq!(evicted.len(), 1);
        assert_eq!(cache.keys(), vec!["maker".to_string()]);
    }

    #[test]
    fn any_invalidation_drops_derived_entries() {
        let schema = schema();
        let mut cache = NodeCache::default();
        cache.insert("maker", Cached::Absent);
        cache.insert("label", Cached::Value(Value::from("w")));
        cache.insert("widgets", Cached::Absent);
        // `name` is not cached at all; derived entries still go
        let evicted = cache.invalidate("name", &schema);
        assert_eq!(evicted.len(), 2);
        assert_eq!(cache.keys(), vec!["maker".to_string()]);
    }
}
