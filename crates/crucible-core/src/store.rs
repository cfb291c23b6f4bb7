//! Step state storage trait
//!
//! State is stored as JSON values keyed by step key and scope. Backends
//! only move bytes around; typed access goes through [`load`] and
//! [`save`].

use crate::error::{Result, StepError};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;

/// Partition of the state store a step reads and writes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StateScope {
    /// Private to one step instance
    Step,
    /// Shared by every step in the named group
    Group(String),
}

impl StateScope {
    /// Prefix used by backends to namespace keys
    pub fn namespace(&self) -> String {
        match self {
            StateScope::Step => "step".to_string(),
            StateScope::Group(group) => format!("group/{}", group),
        }
    }
}

impl std::fmt::Display for StateScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.namespace())
    }
}

/// Trait for step state persistence
///
/// Writes are last-writer-wins. The scheduler guarantees a step instance
/// is never ticked concurrently with itself.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str, scope: &StateScope) -> Result<Option<Value>>;

    async fn set(&self, key: &str, scope: &StateScope, value: Value) -> Result<()>;
}

/// Read and deserialize a value
pub async fn load<T: DeserializeOwned>(
    store: &dyn StateStore,
    key: &str,
    scope: &StateScope,
) -> Result<Option<T>> {
    match store.get(key, scope).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Serialize and write a value
pub async fn save<T: Serialize>(
    store: &dyn StateStore,
    key: &str,
    scope: &StateScope,
    value: &T,
) -> Result<()> {
    store.set(key, scope, serde_json::to_value(value)?).await
}

/// In-memory state store for testing
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    entries: RwLock<HashMap<String, Value>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry_key(key: &str, scope: &StateScope) -> String {
        format!("{}/{}", scope.namespace(), key)
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str, scope: &StateScope) -> Result<Option<Value>> {
        let entries = self
            .entries
            .read()
            .map_err(|e| StepError::Store(format!("lock poisoned: {}", e)))?;
        Ok(entries.get(&Self::entry_key(key, scope)).cloned())
    }

    async fn set(&self, key: &str, scope: &StateScope, value: Value) -> Result<()> {
        self.entries
            .write()
            .map_err(|e| StepError::Store(format!("lock poisoned: {}", e)))?
            .insert(Self::entry_key(key, scope), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_store_get_set() {
        let store = MemoryStateStore::new();
        assert!(store.is_empty());

        assert!(store.get("exp/s1", &StateScope::Step).await.unwrap().is_none());

        store
            .set("exp/s1", &StateScope::Step, json!({"requested": true}))
            .await
            .unwrap();

        let value = store.get("exp/s1", &StateScope::Step).await.unwrap().unwrap();
        assert_eq!(value["requested"], true);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_scopes_are_disjoint() {
        let store = MemoryStateStore::new();
        let group = StateScope::Group("power".to_string());

        store.set("k", &StateScope::Step, json!(1)).await.unwrap();
        store.set("k", &group, json!(2)).await.unwrap();

        assert_eq!(store.get("k", &StateScope::Step).await.unwrap(), Some(json!(1)));
        assert_eq!(store.get("k", &group).await.unwrap(), Some(json!(2)));
        assert!(store
            .get("k", &StateScope::Group("other".into()))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_typed_helpers() {
        let store = MemoryStateStore::new();
        save(&store, "k", &StateScope::Step, &vec![1u32, 2, 3]).await.unwrap();

        let back: Option<Vec<u32>> = load(&store, "k", &StateScope::Step).await.unwrap();
        assert_eq!(back, Some(vec![1, 2, 3]));

        let wrong: Result<Option<String>> = load(&store, "k", &StateScope::Step).await;
        assert!(matches!(wrong, Err(StepError::Serialization(_))));
    }

    #[test]
    fn test_scope_namespace() {
        assert_eq!(StateScope::Step.to_string(), "step");
        assert_eq!(StateScope::Group("g1".into()).to_string(), "group/g1");
    }
}
