//! Orphan pruning in dependency-safe order
//!
//! An orphan is a persisted record no resource touched this pass. Orphans
//! are deleted dependents-first: a record is eligible only once every
//! orphan that depends on it has been deleted. Each orphan's dependents
//! are counted up-front; deleting a record decrements the count of each of
//! its orphaned dependencies and cascades into the ones that reach zero.
//! Failures stop the cascade below the failed record, so anything a broken
//! delete still depends on survives for the next pass.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;

use strata_core::{
    require_provider, ResourceId, StateRecord, StateStore, StrataError, StrataResult,
};

type SharedDelete = Shared<BoxFuture<'static, Result<(), StrataError>>>;

struct PruneInner {
    store: Arc<dyn StateStore>,
    orphans: HashMap<ResourceId, StateRecord>,
    /// Per orphan, how many orphans still depend on it.
    remaining: parking_lot::Mutex<HashMap<ResourceId, usize>>,
    /// One shared delete future per id, so converging cascades await the
    /// same deletion instead of racing a second provider call.
    memo: parking_lot::Mutex<HashMap<ResourceId, SharedDelete>>,
}

/// Deletes one pass's orphans, dependents-first.
#[derive(Clone)]
pub struct Pruner {
    inner: Arc<PruneInner>,
}

impl Pruner {
    pub fn new(store: Arc<dyn StateStore>, orphans: Vec<StateRecord>) -> Self {
        let orphans: HashMap<ResourceId, StateRecord> = orphans
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect();

        let mut remaining: HashMap<ResourceId, usize> =
            orphans.keys().map(|id| (id.clone(), 0)).collect();
        for (id, record) in &orphans {
            for dep in &record.deps {
                if dep != id {
                    if let Some(count) = remaining.get_mut(dep) {
                        *count += 1;
                    }
                }
            }
        }

        Pruner {
            inner: Arc::new(PruneInner {
                store,
                orphans,
                remaining: parking_lot::Mutex::new(remaining),
                memo: parking_lot::Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Delete every orphan. Independent subtrees proceed even when a
    /// sibling fails; the first failure is reported once all are settled.
    pub async fn run(self) -> StrataResult<()> {
        let seeds: Vec<ResourceId> = {
            let remaining = self.inner.remaining.lock();
            remaining
                .iter()
                .filter(|(_, count)| **count == 0)
                .map(|(id, _)| id.clone())
                .collect()
        };

        let results =
            futures::future::join_all(seeds.into_iter().map(|id| self.delete_orphan(id))).await;
        for result in results {
            result?;
        }
        Ok(())
    }

    fn delete_orphan(&self, id: ResourceId) -> SharedDelete {
        let mut memo = self.inner.memo.lock();
        match memo.get(&id) {
            Some(existing) => existing.clone(),
            None => {
                let this = self.clone();
                let key = id.clone();
                let fut = async move { this.delete_inner(id).await }.boxed().shared();
                memo.insert(key, fut.clone());
                fut
            }
        }
    }

    async fn delete_inner(self, id: ResourceId) -> Result<(), StrataError> {
        let record = match self.inner.orphans.get(&id) {
            Some(record) => record.clone(),
            None => return Ok(()),
        };

        let provider = require_provider(&record.kind)?;
        tracing::info!(id = %id, kind = %record.kind, "deleting orphan");
        provider
            .delete(&record, self.inner.store.as_ref())
            .await
            .map_err(|e| StrataError::ProviderDelete {
                id: id.clone(),
                message: e.to_string(),
            })?;
        self.inner.store.delete(&id).await?;

        // This record no longer pins its dependencies; cascade into the
        // ones with no dependents left.
        let ready: Vec<ResourceId> = {
            let mut remaining = self.inner.remaining.lock();
            record
                .deps
                .iter()
                .filter(|dep| **dep != id)
                .filter_map(|dep| {
                    let count = remaining.get_mut(dep)?;
                    *count -= 1;
                    (*count == 0).then(|| dep.clone())
                })
                .collect()
        };

        let results =
            futures::future::join_all(ready.into_iter().map(|dep| self.delete_orphan(dep))).await;
        for result in results {
            result?;
        }
        Ok(())
    }
}
