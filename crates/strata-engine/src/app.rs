//! Application entry point
//!
//! An [`Application`] owns the root scope for one `<name>/<stage>` pair and
//! drives apply passes through an explicit handle - a pass begins when
//! [`Application::run`] is called and ends when it returns, with the root
//! scope force-finalized. No teardown is hooked to process exit; whoever
//! holds the handle decides when reconciliation happens.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use strata_core::{
    Kind, Phase, ResourceId, ScopeChain, StateRecord, StoreFactory, StrataResult, Value,
};

use crate::eval::{Evaluated, Evaluator};
use crate::input::{Input, Resource};
use crate::scope::{DeferHandle, Scope};

/// Identity and phase of an application pass.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub name: String,
    pub stage: String,
    pub phase: Phase,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            name: "app".to_string(),
            stage: "dev".to_string(),
            phase: Phase::Up,
        }
    }
}

impl AppConfig {
    pub fn new(name: impl Into<String>, stage: impl Into<String>) -> Self {
        AppConfig {
            name: name.into(),
            stage: stage.into(),
            phase: Phase::Up,
        }
    }

    pub fn phase(mut self, phase: Phase) -> Self {
        self.phase = phase;
        self
    }
}

/// Handle over one application's root scope.
pub struct Application {
    root: Scope,
}

impl Application {
    pub fn new(config: AppConfig, factory: Arc<dyn StoreFactory>) -> Self {
        Application {
            root: Scope::root(config.name, config.stage, config.phase, factory),
        }
    }

    pub fn scope(&self) -> &Scope {
        &self.root
    }

    /// Run one apply pass: execute the program, auto-apply anything
    /// declared but never evaluated, then force-finalize the root scope
    /// (which recursively finalizes stage roots and prunes orphans).
    pub async fn run<F, Fut, T>(&self, f: F) -> StrataResult<T>
    where
        F: FnOnce(PassContext) -> Fut,
        Fut: Future<Output = StrataResult<T>>,
    {
        let ctx = PassContext::new(self.root.clone());
        let result = ctx.execute(f).await;
        let finalized = self.root.finalize(true).await;
        combine(result, finalized)
    }

    /// Tear the application down: nothing is touched, so every persisted
    /// record - the scope markers included - is orphaned and deleted.
    /// Meaningful only when the config's phase is [`Phase::Destroy`].
    pub async fn destroy(&self) -> StrataResult<()> {
        self.root.finalize(true).await
    }
}

/// The API a pass's program runs against: declare resources, apply input
/// graphs, open child scopes, and access scope metadata.
#[derive(Clone)]
pub struct PassContext {
    scope: Scope,
    eval: Evaluator,
    /// Resources declared this pass, applied at pass end if the program
    /// never evaluated them itself.
    declared: Arc<parking_lot::Mutex<Vec<Resource>>>,
}

impl PassContext {
    fn new(scope: Scope) -> Self {
        PassContext {
            eval: Evaluator::new(scope.clone()),
            scope,
            declared: Arc::new(parking_lot::Mutex::new(Vec::new())),
        }
    }

    /// Context for a child scope in the same pass: own declaration list,
    /// shared apply arena.
    fn nested(&self, scope: Scope) -> Self {
        PassContext {
            eval: self.eval.for_scope(scope.clone()),
            scope,
            declared: Arc::new(parking_lot::Mutex::new(Vec::new())),
        }
    }

    pub fn phase(&self) -> Phase {
        self.scope.phase()
    }

    pub fn chain(&self) -> &ScopeChain {
        self.scope.chain()
    }

    /// Declare a resource in this scope. Ids are unique per scope;
    /// redeclaring one fails.
    pub fn resource(
        &self,
        id: impl Into<ResourceId>,
        kind: impl Into<Kind>,
        inputs: impl Into<Input>,
    ) -> StrataResult<Resource> {
        let id = id.into();
        self.scope.declare(&id)?;
        let resource = Resource::new(id, kind.into(), inputs.into(), self.scope.clone());
        self.declared.lock().push(resource.clone());
        Ok(resource)
    }

    /// Evaluate an input graph now, applying any resources in it.
    pub async fn apply(&self, input: impl Into<Input>) -> StrataResult<Evaluated> {
        let input = input.into();
        self.eval.evaluate(&input).await
    }

    /// Run a program against a child scope; the child finalizes and prunes
    /// its own partition when the program returns.
    pub async fn scope<F, Fut, T>(&self, name: &str, f: F) -> StrataResult<T>
    where
        F: FnOnce(PassContext) -> Fut,
        Fut: Future<Output = StrataResult<T>>,
    {
        self.child_pass(name, false, f).await
    }

    /// Like [`PassContext::scope`], but the child is a stage root: the
    /// application re-finalizes it forcibly at the end of the pass,
    /// flushing queued replacement deletions.
    pub async fn stage<F, Fut, T>(&self, name: &str, f: F) -> StrataResult<T>
    where
        F: FnOnce(PassContext) -> Fut,
        Fut: Future<Output = StrataResult<T>>,
    {
        self.child_pass(name, true, f).await
    }

    async fn child_pass<F, Fut, T>(&self, name: &str, is_stage_root: bool, f: F) -> StrataResult<T>
    where
        F: FnOnce(PassContext) -> Fut,
        Fut: Future<Output = StrataResult<T>>,
    {
        let child = self.scope.child(name, is_stage_root);
        let ctx = self.nested(child.clone());
        let result = ctx.execute(f).await;
        let finalized = child.finalize(false).await;
        combine(result, finalized)
    }

    /// Read a metadata entry from this scope's bag.
    pub async fn get(&self, key: &str) -> StrataResult<Option<Value>> {
        self.scope.data_get(key).await
    }

    /// Write a metadata entry.
    pub async fn set(&self, key: impl Into<String>, value: impl Into<Value>) -> StrataResult<()> {
        self.scope.data_set(key, value.into()).await
    }

    /// Remove a metadata entry, returning whether it existed.
    pub async fn delete(&self, key: &str) -> StrataResult<bool> {
        self.scope.data_delete(key).await
    }

    /// Atomically read-modify-write the metadata bag.
    pub async fn update<F, T>(&self, f: F) -> StrataResult<T>
    where
        F: FnOnce(&mut BTreeMap<String, Value>) -> T,
    {
        self.scope.data_update(f).await
    }

    /// Register a task to run at scope finalization.
    pub fn defer<F>(&self, fut: F) -> DeferHandle
    where
        F: Future<Output = StrataResult<()>> + Send + 'static,
    {
        self.scope.defer(fut)
    }

    /// Queue an old record for deletion when this scope force-finalizes,
    /// completing a create-before-delete replacement.
    pub fn defer_replacement(&self, record: StateRecord) {
        self.scope.defer_replacement(record)
    }

    async fn execute<F, Fut, T>(&self, f: F) -> StrataResult<T>
    where
        F: FnOnce(PassContext) -> Fut,
        Fut: Future<Output = StrataResult<T>>,
    {
        match f(self.clone()).await {
            Ok(value) => {
                if self.scope.phase() == Phase::Up {
                    self.apply_declared().await?;
                }
                Ok(value)
            }
            Err(err) => {
                self.scope.mark_errored(&err);
                Err(err)
            }
        }
    }

    /// Apply declared-but-unevaluated resources. The memo table makes this
    /// a no-op for anything the program already applied.
    async fn apply_declared(&self) -> StrataResult<()> {
        let pending: Vec<Input> = {
            let mut declared = self.declared.lock();
            declared.drain(..).map(|r| r.output()).collect()
        };
        let results =
            futures::future::join_all(pending.iter().map(|input| self.eval.evaluate(input))).await;
        for result in results {
            result?;
        }
        Ok(())
    }
}

fn combine<T>(result: StrataResult<T>, finalized: StrataResult<()>) -> StrataResult<T> {
    match (result, finalized) {
        (Ok(value), Ok(())) => Ok(value),
        (Err(err), _) => Err(err),
        (Ok(_), Err(err)) => Err(err),
    }
}
