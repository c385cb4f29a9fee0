//! Pluggable state store contract
//!
//! A store maps resource ids to their last persisted lifecycle state within
//! one scope partition. The contract is a flat, strongly-consistent
//! key-value interface; backends that can only offer eventual consistency
//! must document that deviation explicitly rather than hide it. A partition
//! assumes a single concurrent writer per scope chain - there is no
//! distributed lock.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::{ResourceId, ScopeChain, StateRecord, StrataResult};

/// Async state store for one scope partition.
///
/// `get` returns `Ok(None)` when the id is unknown - absence is never an
/// error. All other I/O failures propagate as [`StrataError::Store`].
///
/// [`StrataError::Store`]: crate::StrataError::Store
#[async_trait]
pub trait StateStore: Send + Sync {
    /// One-time setup (create directories, tables). Defaults to a no-op.
    async fn init(&self) -> StrataResult<()> {
        Ok(())
    }

    /// Teardown hook. Defaults to a no-op.
    async fn deinit(&self) -> StrataResult<()> {
        Ok(())
    }

    /// All persisted ids in this partition.
    async fn list(&self) -> StrataResult<Vec<ResourceId>>;

    /// Number of persisted records.
    async fn count(&self) -> StrataResult<usize> {
        Ok(self.list().await?.len())
    }

    /// Fetch one record, `None` if absent.
    async fn get(&self, id: &ResourceId) -> StrataResult<Option<StateRecord>>;

    /// Fetch several records; absent ids are simply missing from the result.
    async fn get_batch(&self, ids: &[ResourceId]) -> StrataResult<HashMap<ResourceId, StateRecord>> {
        let mut out = HashMap::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.get(id).await? {
                out.insert(id.clone(), record);
            }
        }
        Ok(out)
    }

    /// Every record in the partition.
    async fn all(&self) -> StrataResult<HashMap<ResourceId, StateRecord>> {
        let ids = self.list().await?;
        self.get_batch(&ids).await
    }

    /// Insert or replace a record.
    async fn set(&self, id: &ResourceId, record: &StateRecord) -> StrataResult<()>;

    /// Remove a record. Removing an absent id is a no-op.
    async fn delete(&self, id: &ResourceId) -> StrataResult<()>;
}

/// Opens the store partition for a scope chain.
///
/// Scopes construct their store lazily from an inherited factory, so one
/// factory instance serves a whole scope tree.
#[async_trait]
pub trait StoreFactory: Send + Sync {
    async fn open(&self, chain: &ScopeChain) -> StrataResult<std::sync::Arc<dyn StateStore>>;
}
