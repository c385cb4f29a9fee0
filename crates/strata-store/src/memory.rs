//! In-memory backend
//!
//! Holds records directly, with no serialization pass. Partitions persist
//! for the lifetime of the factory, so repeated passes against the same
//! factory observe earlier state - which is what reconciliation tests need.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use strata_core::{ResourceId, ScopeChain, StateRecord, StateStore, StoreFactory, StrataResult};

/// One in-memory partition.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<ResourceId, StateRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn list(&self) -> StrataResult<Vec<ResourceId>> {
        let mut ids: Vec<_> = self.records.lock().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn count(&self) -> StrataResult<usize> {
        Ok(self.records.lock().len())
    }

    async fn get(&self, id: &ResourceId) -> StrataResult<Option<StateRecord>> {
        Ok(self.records.lock().get(id).cloned())
    }

    async fn all(&self) -> StrataResult<HashMap<ResourceId, StateRecord>> {
        Ok(self.records.lock().clone())
    }

    async fn set(&self, id: &ResourceId, record: &StateRecord) -> StrataResult<()> {
        self.records.lock().insert(id.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, id: &ResourceId) -> StrataResult<()> {
        self.records.lock().remove(id);
        Ok(())
    }
}

/// Factory handing out shared in-memory partitions keyed by chain.
#[derive(Default)]
pub struct MemoryStoreFactory {
    partitions: Mutex<HashMap<String, Arc<MemoryStore>>>,
}

impl MemoryStoreFactory {
    pub fn new() -> Self {
        MemoryStoreFactory::default()
    }

    /// Direct handle to a partition, for test assertions.
    pub fn partition(&self, chain: &ScopeChain) -> Arc<MemoryStore> {
        self.partitions
            .lock()
            .entry(chain.key())
            .or_default()
            .clone()
    }
}

#[async_trait]
impl StoreFactory for MemoryStoreFactory {
    async fn open(&self, chain: &ScopeChain) -> StrataResult<Arc<dyn StateStore>> {
        Ok(self.partition(chain))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use strata_core::{Kind, Value};

    #[tokio::test]
    async fn test_contract_basics() {
        let store = MemoryStore::new();
        let id = ResourceId::new("db");

        assert_eq!(store.get(&id).await.unwrap(), None);

        let record = StateRecord::creating(
            Kind::new("test::db"),
            id.clone(),
            "app/db".to_string(),
            vec![],
            Value::Null,
        );
        store.set(&id, &record).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(store.get(&id).await.unwrap(), Some(record));
        assert_eq!(store.all().await.unwrap().len(), 1);

        store.delete(&id).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_partitions_are_stable_across_opens() {
        let factory = MemoryStoreFactory::new();
        let chain = ScopeChain::root("app").child("dev");

        let first = factory.open(&chain).await.unwrap();
        let id = ResourceId::new("db");
        let record = StateRecord::creating(
            Kind::new("test::db"),
            id.clone(),
            chain.fqn(&id),
            vec![],
            Value::Null,
        );
        first.set(&id, &record).await.unwrap();

        // A second open of the same chain sees the same partition.
        let second = factory.open(&chain).await.unwrap();
        assert!(second.get(&id).await.unwrap().is_some());

        // A different chain does not.
        let other = factory.open(&ScopeChain::root("app").child("prod")).await.unwrap();
        assert!(other.get(&id).await.unwrap().is_none());
    }
}
