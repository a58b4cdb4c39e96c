//! Flat property view of the merged configuration.

use std::collections::BTreeMap;

use serde_json::Value;

/// Dotted key/value view of the configuration (`mqtt.topic.kitchen.qos = "1"`).
///
/// Keys are kept in sorted order so scans over the map are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyMap {
    entries: BTreeMap<String, String>,
}

impl PropertyMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flatten a configuration tree. Nested tables join their keys with `.`,
    /// array elements use their index as the key segment, nulls are dropped.
    pub fn from_tree(tree: &Value) -> Self {
        let mut map = Self::new();
        map.flatten(String::new(), tree);
        map
    }

    fn flatten(&mut self, prefix: String, value: &Value) {
        match value {
            Value::Null => {}
            Value::Object(table) => {
                for (key, child) in table {
                    self.flatten(join_key(&prefix, key), child);
                }
            }
            Value::Array(items) => {
                for (index, child) in items.iter().enumerate() {
                    self.flatten(join_key(&prefix, &index.to_string()), child);
                }
            }
            Value::String(s) => {
                self.entries.insert(prefix, s.clone());
            }
            Value::Bool(b) => {
                self.entries.insert(prefix, b.to_string());
            }
            Value::Number(n) => {
                self.entries.insert(prefix, n.to_string());
            }
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn join_key(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", prefix, key)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for PropertyMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (key, value) in iter {
            map.insert(key, value);
        }
        map
    }
}
