use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

/// Persistent key/value store used by state-backed file backends.
///
/// Keys live inside a namespace (e.g. `["fs", "assistant-1"]`). Implementations may be
/// in-memory, Redis, a database, ...
#[async_trait]
pub trait ToolStore: Send + Sync {
    /// Get a value by namespace and key.
    async fn get(&self, namespace: &[&str], key: &str) -> Option<Value>;

    /// Insert or replace a value.
    async fn put(&self, namespace: &[&str], key: &str, value: Value);

    /// Remove a value; missing keys are ignored.
    async fn delete(&self, namespace: &[&str], key: &str);

    /// All keys in a namespace, sorted.
    async fn list(&self, namespace: &[&str]) -> Vec<String>;

    /// Insert only if the key is absent. Returns `false` when the key already existed.
    ///
    /// The default is get-then-put and therefore not atomic; stores that can do better
    /// should override it.
    async fn put_if_absent(&self, namespace: &[&str], key: &str, value: Value) -> bool {
        if self.get(namespace, key).await.is_some() {
            return false;
        }
        self.put(namespace, key, value).await;
        true
    }
}

type NamespaceKey = Vec<String>;

fn namespace_key(namespace: &[&str]) -> NamespaceKey {
    namespace.iter().map(|s| s.to_string()).collect()
}

/// In-memory store for tests and single-process use.
#[derive(Clone, Debug, Default)]
pub struct InMemoryStore {
    data: Arc<RwLock<BTreeMap<NamespaceKey, BTreeMap<String, Value>>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ToolStore for InMemoryStore {
    async fn get(&self, namespace: &[&str], key: &str) -> Option<Value> {
        let data = self.data.read().await;
        data.get(&namespace_key(namespace))
            .and_then(|entries| entries.get(key))
            .cloned()
    }

    async fn put(&self, namespace: &[&str], key: &str, value: Value) {
        let mut data = self.data.write().await;
        data.entry(namespace_key(namespace))
            .or_default()
            .insert(key.to_string(), value);
    }

    async fn delete(&self, namespace: &[&str], key: &str) {
        let mut data = self.data.write().await;
        if let Some(entries) = data.get_mut(&namespace_key(namespace)) {
            entries.remove(key);
        }
    }

    async fn list(&self, namespace: &[&str]) -> Vec<String> {
        let data = self.data.read().await;
        data.get(&namespace_key(namespace))
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default()
    }

    async fn put_if_absent(&self, namespace: &[&str], key: &str, value: Value) -> bool {
        let mut data = self.data.write().await;
        let entries = data.entry(namespace_key(namespace)).or_default();
        if entries.contains_key(key) {
            return false;
        }
        entries.insert(key.to_string(), value);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryStore::new();

        store
            .put(&["fs"], "/notes.md", serde_json::json!({"content": ["hi"]}))
            .await;
        let value = store.get(&["fs"], "/notes.md").await;
        assert_eq!(value, Some(serde_json::json!({"content": ["hi"]})));

        store.delete(&["fs"], "/notes.md").await;
        assert_eq!(store.get(&["fs"], "/notes.md").await, None);
    }

    #[tokio::test]
    async fn test_store_namespaces_are_isolated() {
        let store = InMemoryStore::new();

        store.put(&["fs", "a"], "/x", serde_json::json!("1")).await;
        store.put(&["fs", "b"], "/x", serde_json::json!("2")).await;

        assert_eq!(
            store.get(&["fs", "a"], "/x").await,
            Some(serde_json::json!("1"))
        );
        assert_eq!(
            store.get(&["fs", "b"], "/x").await,
            Some(serde_json::json!("2"))
        );
        assert!(store.list(&["fs"]).await.is_empty());
    }

    #[tokio::test]
    async fn test_store_list_sorted() {
        let store = InMemoryStore::new();

        store.put(&["fs"], "/b", serde_json::json!("b")).await;
        store.put(&["fs"], "/a", serde_json::json!("a")).await;

        assert_eq!(store.list(&["fs"]).await, vec!["/a", "/b"]);
    }

    #[tokio::test]
    async fn test_put_if_absent() {
        let store = InMemoryStore::new();

        assert!(store.put_if_absent(&["fs"], "/a", serde_json::json!(1)).await);
        assert!(!store.put_if_absent(&["fs"], "/a", serde_json::json!(2)).await);
        assert_eq!(store.get(&["fs"], "/a").await, Some(serde_json::json!(1)));
    }
}
