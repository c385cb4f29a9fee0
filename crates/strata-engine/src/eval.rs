//! Graph evaluation with apply-memoization
//!
//! The evaluator walks an [`Input`] tree bottom-up, resolving every node to
//! a concrete value plus the set of resource ids read along the way. Each
//! resource applies at most once per pass: the first arrival installs a
//! shared future under the resource's fqn before anything is awaited, and
//! every later arrival - including the diamond case where two branches
//! reach the same node concurrently, and references crossing scope
//! boundaries - awaits that same future and observes the identical output.
//! The memo arena belongs to the pass, not to any one scope: child-scope
//! evaluators share their parent's arena, and keys are scope-qualified so
//! equal ids in different scopes never alias.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;

use strata_core::{
    require_provider, ApplyRequest, ResourceId, StrataError, StrataResult, Value,
};

use crate::input::{DeferredParent, Input, Resource};
use crate::scope::Scope;

/// A fully resolved input: the concrete value and every resource id whose
/// output flowed into it.
#[derive(Clone, Debug, PartialEq)]
pub struct Evaluated {
    pub value: Value,
    pub deps: Vec<ResourceId>,
}

impl Evaluated {
    fn pure(value: Value) -> Self {
        Evaluated {
            value,
            deps: Vec::new(),
        }
    }
}

type SharedApply = Shared<BoxFuture<'static, Result<Evaluated, StrataError>>>;

/// One shared apply future per resource fqn, installed synchronously
/// before the first poll so concurrent arrivals cannot race a second
/// provider call in. Created once per pass and shared by every scope's
/// evaluator in that pass.
type ApplyArena = Arc<parking_lot::Mutex<HashMap<String, SharedApply>>>;

struct EvalInner {
    scope: Scope,
    memo: ApplyArena,
}

/// Per-pass graph evaluator. Cheap to clone; clones share the memo arena.
#[derive(Clone)]
pub struct Evaluator {
    inner: Arc<EvalInner>,
}

impl Evaluator {
    /// Root evaluator for a new pass, with a fresh apply arena.
    pub fn new(scope: Scope) -> Self {
        Evaluator {
            inner: Arc::new(EvalInner {
                scope,
                memo: Arc::new(parking_lot::Mutex::new(HashMap::new())),
            }),
        }
    }

    /// Evaluator for a child scope within the same pass. The apply arena
    /// is shared, so a resource referenced from both sides of the scope
    /// boundary still applies exactly once.
    pub(crate) fn for_scope(&self, scope: Scope) -> Evaluator {
        Evaluator {
            inner: Arc::new(EvalInner {
                scope,
                memo: Arc::clone(&self.inner.memo),
            }),
        }
    }

    pub fn scope(&self) -> &Scope {
        &self.inner.scope
    }

    /// Resolve an input tree to a concrete value and its dependency set.
    ///
    /// Sibling branches evaluate concurrently; list order and map keys are
    /// preserved in the result.
    pub fn evaluate<'a>(&'a self, input: &'a Input) -> BoxFuture<'a, StrataResult<Evaluated>> {
        Box::pin(async move {
            match input {
                Input::Value(v) => Ok(Evaluated::pure(v.clone())),
                Input::Resource(resource) => self.apply_resource(resource).await,
                Input::Deferred(deferred) => {
                    let parent = match &deferred.inner.parent {
                        DeferredParent::Resource(r) => self.apply_resource(r).await?,
                        DeferredParent::Deferred(d) => {
                            self.evaluate_deferred(d).await?
                        }
                    };
                    let derived = (deferred.inner.f)(parent.value);
                    let mut resolved = self.evaluate(&derived).await?;
                    let mut deps = parent.deps;
                    union_deps(&mut deps, resolved.deps);
                    resolved.deps = deps;
                    Ok(resolved)
                }
                Input::List(items) => {
                    let results =
                        futures::future::try_join_all(items.iter().map(|i| self.evaluate(i)))
                            .await?;
                    let mut values = Vec::with_capacity(results.len());
                    let mut deps = Vec::new();
                    for result in results {
                        values.push(result.value);
                        union_deps(&mut deps, result.deps);
                    }
                    Ok(Evaluated {
                        value: Value::List(values),
                        deps,
                    })
                }
                Input::Map(entries) => {
                    let results = futures::future::try_join_all(
                        entries.iter().map(|(k, v)| async move {
                            self.evaluate(v).await.map(|r| (k.clone(), r))
                        }),
                    )
                    .await?;
                    let mut map = BTreeMap::new();
                    let mut deps = Vec::new();
                    for (key, result) in results {
                        map.insert(key, result.value);
                        union_deps(&mut deps, result.deps);
                    }
                    Ok(Evaluated {
                        value: Value::Map(map),
                        deps,
                    })
                }
            }
        })
    }

    async fn evaluate_deferred(&self, deferred: &crate::input::Deferred) -> StrataResult<Evaluated> {
        self.evaluate(&Input::Deferred(deferred.clone())).await
    }

    /// Apply a resource through the pass's memo arena. Keys are
    /// scope-qualified, so equal ids in sibling scopes stay distinct.
    async fn apply_resource(&self, resource: &Resource) -> StrataResult<Evaluated> {
        let key = resource.scope().chain().fqn(resource.id());
        let shared = {
            let mut memo = self.inner.memo.lock();
            match memo.get(&key) {
                Some(existing) => existing.clone(),
                None => {
                    let this = self.clone();
                    let owned = resource.clone();
                    let fut = async move { this.run_provider(owned).await }.boxed().shared();
                    memo.insert(key, fut.clone());
                    fut
                }
            }
        };
        shared.await
    }

    async fn run_provider(self, resource: Resource) -> Result<Evaluated, StrataError> {
        let result = self.run_provider_inner(&resource).await;
        if let Err(err) = &result {
            resource.scope().mark_errored(err);
        }
        result
    }

    async fn run_provider_inner(&self, resource: &Resource) -> StrataResult<Evaluated> {
        let inputs = self.evaluate(&resource.inner.inputs).await?;

        let scope = resource.scope();
        let store = scope.store().await?;
        scope.touch(resource.id().clone(), resource.kind().clone());

        let provider = require_provider(resource.kind())?;
        let fqn = scope.chain().fqn(resource.id());
        tracing::debug!(id = %resource.id(), kind = %resource.kind(), "applying resource");

        let output = provider
            .apply(ApplyRequest {
                phase: scope.phase(),
                id: resource.id(),
                fqn: &fqn,
                deps: &inputs.deps,
                inputs: &inputs.value,
                store: store.as_ref(),
            })
            .await
            .map_err(|e| StrataError::ProviderApply {
                id: resource.id().clone(),
                message: e.to_string(),
            })?;

        let mut deps = vec![resource.id().clone()];
        union_deps(&mut deps, inputs.deps);
        Ok(Evaluated {
            value: output,
            deps,
        })
    }
}

/// Append `from` into `into`, preserving first-seen order without
/// duplicates. Dependency sets are small; linear scans beat allocating a
/// set per node.
fn union_deps(into: &mut Vec<ResourceId>, from: Vec<ResourceId>) {
    for id in from {
        if !into.contains(&id) {
            into.push(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use strata_core::{register_provider, Kind, Phase, Provider, StateRecord, StateStore};
    use strata_store::MemoryStoreFactory;

    struct CountingProvider {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Provider for CountingProvider {
        async fn apply(&self, req: ApplyRequest<'_>) -> StrataResult<Value> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Value::from(format!("{}#{n}", req.id)))
        }

        async fn delete(&self, _record: &StateRecord, _store: &dyn StateStore) -> StrataResult<()> {
            Ok(())
        }
    }

    fn evaluator() -> Evaluator {
        let factory = Arc::new(MemoryStoreFactory::new());
        Evaluator::new(Scope::root("app", "dev", Phase::Up, factory))
    }

    #[tokio::test]
    async fn test_pure_values_resolve_to_themselves() {
        let eval = evaluator();

        let input = Input::map_of([
            ("name", Input::from("db")),
            ("replicas", Input::from(3i64)),
            ("nested", Input::list_of([Input::from(true), Input::from("x")])),
        ]);
        let result = eval.evaluate(&input).await.unwrap();

        assert!(result.deps.is_empty());
        assert_eq!(result.value.get("replicas"), Some(&Value::from(3i64)));
        assert_eq!(
            result.value.get("nested").and_then(|v| v.index(1)),
            Some(&Value::from("x"))
        );
    }

    #[tokio::test]
    async fn test_secret_inputs_survive_evaluation() {
        let eval = evaluator();

        let result = eval.evaluate(&Input::secret("hunter2")).await.unwrap();
        assert_eq!(result.value, Value::secret("hunter2"));
        assert!(result.value.contains_secret());
    }

    #[tokio::test]
    async fn test_diamond_applies_provider_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        register_provider(
            "eval-test::diamond",
            Arc::new(CountingProvider {
                calls: calls.clone(),
            }),
        );

        let eval = evaluator();
        let base = Resource::new(
            ResourceId::new("base"),
            Kind::new("eval-test::diamond"),
            Input::from("seed"),
            eval.scope().clone(),
        );

        // Two branches converge on the same resource.
        let diamond = Input::list_of([base.output(), base.field("missing").into()]);
        let result = eval.evaluate(&diamond).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.value.index(0), Some(&Value::from("base#0")));
        assert_eq!(result.deps, vec![ResourceId::new("base")]);
    }

    #[tokio::test]
    async fn test_same_id_in_sibling_scopes_applies_separately() {
        let calls = Arc::new(AtomicUsize::new(0));
        register_provider(
            "eval-test::siblings",
            Arc::new(CountingProvider {
                calls: calls.clone(),
            }),
        );

        let factory = Arc::new(MemoryStoreFactory::new());
        let root = Scope::root("app", "dev", Phase::Up, factory);
        let eval = Evaluator::new(root.clone());

        // Equal ids under different scopes are distinct resources; the
        // arena keys by fqn, not bare id.
        let left = Resource::new(
            ResourceId::new("db"),
            Kind::new("eval-test::siblings"),
            Input::Value(Value::Null),
            root.child("left", false),
        );
        let right = Resource::new(
            ResourceId::new("db"),
            Kind::new("eval-test::siblings"),
            Input::Value(Value::Null),
            root.child("right", false),
        );

        let both = Input::list_of([left.output(), right.output()]);
        let result = eval.evaluate(&both).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_ne!(result.value.index(0), result.value.index(1));
    }

    #[tokio::test]
    async fn test_child_scope_evaluator_shares_the_arena() {
        let calls = Arc::new(AtomicUsize::new(0));
        register_provider(
            "eval-test::shared-arena",
            Arc::new(CountingProvider {
                calls: calls.clone(),
            }),
        );

        let factory = Arc::new(MemoryStoreFactory::new());
        let root = Scope::root("app", "dev", Phase::Up, factory);
        let root_eval = Evaluator::new(root.clone());
        let child_eval = root_eval.for_scope(root.child("api", false));

        let base = Resource::new(
            ResourceId::new("base"),
            Kind::new("eval-test::shared-arena"),
            Input::from("seed"),
            root,
        );

        // The child-scope evaluator applies it first; the root evaluator
        // must join that apply, not run a second one.
        let first = child_eval.evaluate(&base.output()).await.unwrap();
        let second = root_eval.evaluate(&base.output()).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.value, second.value);
    }

    #[tokio::test]
    async fn test_deferred_chain_records_parent_dependency() {
        register_provider(
            "eval-test::chain",
            Arc::new(CountingProvider {
                calls: Arc::new(AtomicUsize::new(0)),
            }),
        );

        let eval = evaluator();
        let base = Resource::new(
            ResourceId::new("origin"),
            Kind::new("eval-test::chain"),
            Input::Value(Value::Null),
            eval.scope().clone(),
        );

        let doubled = base
            .map(|v| Input::from(format!("{}!", v.as_str().unwrap_or_default())))
            .map(|v| Input::from(format!("<{}>", v.as_str().unwrap_or_default())));
        let result = eval.evaluate(&Input::from(doubled)).await.unwrap();

        assert_eq!(result.value, Value::from("<origin#0!>"));
        assert_eq!(result.deps, vec![ResourceId::new("origin")]);
    }

    #[tokio::test]
    async fn test_apply_failure_marks_scope_errored() {
        struct FailingProvider;

        #[async_trait]
        impl Provider for FailingProvider {
            async fn apply(&self, _req: ApplyRequest<'_>) -> StrataResult<Value> {
                Err(StrataError::Store("quota exceeded".into()))
            }

            async fn delete(
                &self,
                _record: &StateRecord,
                _store: &dyn StateStore,
            ) -> StrataResult<()> {
                Ok(())
            }
        }

        register_provider("eval-test::failing", Arc::new(FailingProvider));

        let eval = evaluator();
        let doomed = Resource::new(
            ResourceId::new("doomed"),
            Kind::new("eval-test::failing"),
            Input::Value(Value::Null),
            eval.scope().clone(),
        );

        let err = eval.evaluate(&doomed.output()).await.unwrap_err();
        assert!(matches!(err, StrataError::ProviderApply { .. }));
        assert!(err.to_string().contains("quota exceeded"));
        assert!(eval.scope().is_errored());
    }
}
