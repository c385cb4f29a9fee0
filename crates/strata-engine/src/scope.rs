//! Scope lifecycle
//!
//! A scope is a hierarchical execution context owning one state partition.
//! It tracks the resources touched by the current apply pass, carries a
//! mutex-guarded metadata bag, collects deferred tasks, and drives
//! finalization: reconciling persisted state against touched resources and
//! pruning orphans. Any uncaught apply error makes the scope sticky-errored
//! and finalization never prunes for it - a broken pass must never delete
//! surviving resources.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{oneshot, OnceCell};

use strata_core::{
    require_provider, Kind, Phase, ResourceId, ScopeChain, StateRecord, StateStore, StoreFactory,
    StrataError, StrataResult, Value,
};

use crate::prune::Pruner;

const TELEMETRY: &str = "strata::telemetry";

struct DeferredTask {
    fut: BoxFuture<'static, StrataResult<()>>,
    tx: oneshot::Sender<StrataResult<()>>,
}

/// Handle to a task registered with [`Scope::defer`].
///
/// Deferred tasks run only during finalization; resolving the handle
/// before the scope finalizes yields [`StrataError::NotFinalized`].
pub struct DeferHandle {
    rx: oneshot::Receiver<StrataResult<()>>,
}

impl DeferHandle {
    /// The task's result if finalization has already run it.
    pub fn try_result(&mut self) -> StrataResult<()> {
        match self.rx.try_recv() {
            Ok(result) => result,
            Err(_) => Err(StrataError::NotFinalized),
        }
    }

    /// Wait for finalization to run the task.
    pub async fn wait(self) -> StrataResult<()> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(StrataError::NotFinalized),
        }
    }
}

pub(crate) struct ScopeInner {
    chain: ScopeChain,
    stage: String,
    phase: Phase,
    /// Explicit structural flag: a stage root is force-finalized by its
    /// parent even when its own pass already finalized it.
    is_stage_root: bool,
    parent: Option<Weak<ScopeInner>>,
    factory: Arc<dyn StoreFactory>,
    store: OnceCell<Arc<dyn StateStore>>,
    children: parking_lot::Mutex<Vec<Scope>>,
    /// Ids declared this pass, for per-scope uniqueness.
    declared: parking_lot::Mutex<HashSet<ResourceId>>,
    /// Resources the evaluator visited this pass.
    touched: parking_lot::Mutex<HashMap<ResourceId, Kind>>,
    /// Opaque per-scope metadata, FIFO-serialized by the tokio mutex so
    /// concurrent applies cannot race a read-modify-write cycle.
    data: tokio::sync::Mutex<BTreeMap<String, Value>>,
    /// Records queued for deletion when the scope is force-finalized,
    /// e.g. the old half of a replacement.
    replaced: parking_lot::Mutex<Vec<StateRecord>>,
    deferred: parking_lot::Mutex<Vec<DeferredTask>>,
    error: parking_lot::Mutex<Option<StrataError>>,
    finalized: AtomicBool,
    started: Instant,
}

/// Hierarchical execution context. Cheap to clone.
#[derive(Clone)]
pub struct Scope {
    pub(crate) inner: Arc<ScopeInner>,
}

impl Scope {
    /// The application root scope. Its chain is `<name>/<stage>`.
    pub fn root(
        name: impl Into<String>,
        stage: impl Into<String>,
        phase: Phase,
        factory: Arc<dyn StoreFactory>,
    ) -> Scope {
        let stage = stage.into();
        let chain = ScopeChain::root(name).child(stage.clone());
        Scope {
            inner: Arc::new(ScopeInner {
                chain,
                stage,
                phase,
                is_stage_root: false,
                parent: None,
                factory,
                store: OnceCell::new(),
                children: parking_lot::Mutex::new(Vec::new()),
                declared: parking_lot::Mutex::new(HashSet::new()),
                touched: parking_lot::Mutex::new(HashMap::new()),
                data: tokio::sync::Mutex::new(BTreeMap::new()),
                replaced: parking_lot::Mutex::new(Vec::new()),
                deferred: parking_lot::Mutex::new(Vec::new()),
                error: parking_lot::Mutex::new(None),
                finalized: AtomicBool::new(false),
                started: Instant::now(),
            }),
        }
    }

    /// Create and register a child scope.
    pub fn child(&self, name: impl Into<String>, is_stage_root: bool) -> Scope {
        let child = Scope {
            inner: Arc::new(ScopeInner {
                chain: self.inner.chain.child(name),
                stage: self.inner.stage.clone(),
                phase: self.inner.phase,
                is_stage_root,
                parent: Some(Arc::downgrade(&self.inner)),
                factory: Arc::clone(&self.inner.factory),
                store: OnceCell::new(),
                children: parking_lot::Mutex::new(Vec::new()),
                declared: parking_lot::Mutex::new(HashSet::new()),
                touched: parking_lot::Mutex::new(HashMap::new()),
                data: tokio::sync::Mutex::new(BTreeMap::new()),
                replaced: parking_lot::Mutex::new(Vec::new()),
                deferred: parking_lot::Mutex::new(Vec::new()),
                error: parking_lot::Mutex::new(None),
                finalized: AtomicBool::new(false),
                started: Instant::now(),
            }),
        };
        self.inner.children.lock().push(child.clone());
        child
    }

    pub fn chain(&self) -> &ScopeChain {
        &self.inner.chain
    }

    pub fn name(&self) -> &str {
        self.inner.chain.name()
    }

    pub fn stage(&self) -> &str {
        &self.inner.stage
    }

    pub fn phase(&self) -> Phase {
        self.inner.phase
    }

    pub fn is_root(&self) -> bool {
        self.inner.parent.is_none()
    }

    pub fn is_stage_root(&self) -> bool {
        self.inner.is_stage_root
    }

    /// The scope's state partition, opened lazily from the inherited
    /// factory. The first open in an `up` pass writes the scope's own
    /// marker record.
    pub async fn store(&self) -> StrataResult<Arc<dyn StateStore>> {
        self.inner
            .store
            .get_or_try_init(|| async {
                let store = self.inner.factory.open(&self.inner.chain).await?;
                if self.inner.phase == Phase::Up {
                    let marker = StateRecord::scope_marker(self.inner.chain.key());
                    store.set(&marker.id, &marker).await?;
                }
                Ok(store)
            })
            .await
            .cloned()
    }

    /// Register a declared id, enforcing per-scope uniqueness.
    pub(crate) fn declare(&self, id: &ResourceId) -> StrataResult<()> {
        if self.inner.finalized.load(Ordering::SeqCst) {
            return Err(StrataError::AlreadyFinalized(self.inner.chain.key()));
        }
        if !self.inner.declared.lock().insert(id.clone()) {
            return Err(StrataError::DuplicateResource(id.clone()));
        }
        Ok(())
    }

    /// Record that the evaluator visited a resource this pass.
    pub(crate) fn touch(&self, id: ResourceId, kind: Kind) {
        self.inner.touched.lock().insert(id, kind);
    }

    /// Ids touched this pass.
    pub fn touched(&self) -> Vec<ResourceId> {
        let mut ids: Vec<_> = self.inner.touched.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn ensure_not_root(&self) -> StrataResult<()> {
        if self.is_root() {
            return Err(StrataError::RootScopeState);
        }
        Ok(())
    }

    /// Read a metadata entry.
    pub async fn data_get(&self, key: &str) -> StrataResult<Option<Value>> {
        self.ensure_not_root()?;
        Ok(self.inner.data.lock().await.get(key).cloned())
    }

    /// Write a metadata entry.
    pub async fn data_set(&self, key: impl Into<String>, value: Value) -> StrataResult<()> {
        self.ensure_not_root()?;
        self.inner.data.lock().await.insert(key.into(), value);
        Ok(())
    }

    /// Remove a metadata entry, returning whether it existed.
    pub async fn data_delete(&self, key: &str) -> StrataResult<bool> {
        self.ensure_not_root()?;
        Ok(self.inner.data.lock().await.remove(key).is_some())
    }

    /// Run a read-modify-write cycle against the metadata bag under one
    /// mutex hold. Waiters acquire strictly in FIFO order.
    pub async fn data_update<F, T>(&self, f: F) -> StrataResult<T>
    where
        F: FnOnce(&mut BTreeMap<String, Value>) -> T,
    {
        self.ensure_not_root()?;
        let mut bag = self.inner.data.lock().await;
        Ok(f(&mut bag))
    }

    /// Queue a previously persisted record for deletion at force-finalize,
    /// e.g. the old resource of a replacement.
    pub fn defer_replacement(&self, record: StateRecord) {
        self.inner.replaced.lock().push(record);
    }

    /// Register a task that runs only during finalization.
    pub fn defer<F>(&self, fut: F) -> DeferHandle
    where
        F: std::future::Future<Output = StrataResult<()>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.inner.deferred.lock().push(DeferredTask {
            fut: fut.boxed(),
            tx,
        });
        DeferHandle { rx }
    }

    /// Mark the scope sticky-errored; finalization will never prune.
    pub fn mark_errored(&self, err: &StrataError) {
        let mut slot = self.inner.error.lock();
        if slot.is_none() {
            *slot = Some(err.clone());
        }
    }

    pub fn is_errored(&self) -> bool {
        self.inner.error.lock().is_some()
    }

    pub fn error(&self) -> Option<StrataError> {
        self.inner.error.lock().clone()
    }

    /// Finalize the scope: run deferred tasks, then reconcile the state
    /// partition against the resources touched this pass, deleting orphans
    /// bottom-up.
    ///
    /// Idempotent terminal state unless `force`. `force` additionally
    /// flushes queued replacement deletions and recursively finalizes
    /// child scopes (stage roots forcibly). A `read` pass or an errored
    /// scope records telemetry and prunes nothing.
    pub fn finalize(&self, force: bool) -> BoxFuture<'_, StrataResult<()>> {
        Box::pin(async move {
            if self.inner.finalized.swap(true, Ordering::SeqCst) && !force {
                return Ok(());
            }

            let elapsed_ms = self.inner.started.elapsed().as_millis() as u64;
            if self.inner.phase == Phase::Read {
                tracing::info!(target: TELEMETRY, elapsed_ms, "app.success");
                return Ok(());
            }

            let tasks: Vec<DeferredTask> = self.inner.deferred.lock().drain(..).collect();
            for task in tasks {
                let result = task.fut.await;
                if let Err(err) = &result {
                    tracing::warn!(scope = %self.inner.chain, "deferred task failed: {err}");
                }
                let _ = task.tx.send(result);
            }

            if let Some(err) = self.error() {
                tracing::error!(target: TELEMETRY, error = %err, elapsed_ms, "app.error");
                return Ok(());
            }

            match self.reconcile(force).await {
                Ok(()) => {
                    tracing::info!(target: TELEMETRY, elapsed_ms, "app.success");
                    Ok(())
                }
                Err(err) => {
                    tracing::error!(target: TELEMETRY, error = %err, elapsed_ms, "app.error");
                    Err(err)
                }
            }
        })
    }

    /// The destructive half of finalization.
    async fn reconcile(&self, force: bool) -> StrataResult<()> {
        let store = self.store().await?;

        if force {
            self.flush_replacements(store.as_ref()).await?;

            let children: Vec<Scope> = self.inner.children.lock().clone();
            for child in children {
                child.finalize(child.inner.is_stage_root).await?;
            }
        }

        let persisted = store.list().await?;
        let touched = self.inner.touched.lock().clone();
        // Queued replacements are deleted by a later force-finalize, not
        // by this pass's orphan sweep.
        let replaced: HashSet<ResourceId> = self
            .inner
            .replaced
            .lock()
            .iter()
            .map(|r| r.id.clone())
            .collect();
        let orphan_ids: Vec<ResourceId> = persisted
            .into_iter()
            .filter(|id| {
                !touched.contains_key(id) && !replaced.contains(id) && !id.is_scope_marker()
            })
            .collect();

        let orphans: Vec<StateRecord> = store
            .get_batch(&orphan_ids)
            .await?
            .into_values()
            .collect();
        tracing::debug!(
            scope = %self.inner.chain,
            orphans = orphans.len(),
            alive = touched.len(),
            "pruning orphans"
        );
        Pruner::new(Arc::clone(&store), orphans).run().await?;

        // A destroy pass leaves nothing behind, including the marker.
        if self.inner.phase == Phase::Destroy {
            store.delete(&ResourceId::scope_marker()).await?;
        }
        Ok(())
    }

    async fn flush_replacements(&self, store: &dyn StateStore) -> StrataResult<()> {
        let replaced: Vec<StateRecord> = self.inner.replaced.lock().drain(..).collect();
        for record in replaced {
            let provider = require_provider(&record.kind)?;
            provider
                .delete(&record, store)
                .await
                .map_err(|e| StrataError::ProviderDelete {
                    id: record.id.clone(),
                    message: e.to_string(),
                })?;
            store.delete(&record.id).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("chain", &self.inner.chain.key())
            .field("phase", &self.inner.phase)
            .field("is_stage_root", &self.inner.is_stage_root)
            .finish()
    }
}
