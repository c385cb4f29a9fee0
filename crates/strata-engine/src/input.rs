//! Declared input graphs
//!
//! An [`Input`] is what user code hands the evaluator: a tree of concrete
//! values, resource nodes whose outputs exist only after their provider
//! applies, and deferred transformations chained off them.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use strata_core::{Kind, ResourceId, Value};

use crate::scope::Scope;

/// A node in a declared resource graph.
#[derive(Clone)]
pub enum Input {
    /// A concrete value, resolved to itself.
    Value(Value),
    /// A resource; resolves to its provider's output.
    Resource(Resource),
    /// A lazy transformation of an upstream resource's output.
    Deferred(Deferred),
    List(Vec<Input>),
    Map(BTreeMap<String, Input>),
}

impl Input {
    /// Build a map input from key/input pairs.
    pub fn map_of<K: Into<String>>(entries: impl IntoIterator<Item = (K, Input)>) -> Input {
        Input::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Build a list input.
    pub fn list_of(items: impl IntoIterator<Item = Input>) -> Input {
        Input::List(items.into_iter().collect())
    }

    /// A secret leaf value.
    pub fn secret(inner: impl Into<Value>) -> Input {
        Input::Value(Value::secret(inner))
    }
}

impl fmt::Debug for Input {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Input::Value(v) => write!(f, "Value({v:?})"),
            Input::Resource(r) => write!(f, "Resource({})", r.id()),
            Input::Deferred(_) => write!(f, "Deferred(..)"),
            Input::List(items) => f.debug_list().entries(items).finish(),
            Input::Map(map) => f.debug_map().entries(map).finish(),
        }
    }
}

impl From<Value> for Input {
    fn from(v: Value) -> Self {
        Input::Value(v)
    }
}

impl From<&str> for Input {
    fn from(s: &str) -> Self {
        Input::Value(Value::from(s))
    }
}

impl From<String> for Input {
    fn from(s: String) -> Self {
        Input::Value(Value::from(s))
    }
}

impl From<i64> for Input {
    fn from(n: i64) -> Self {
        Input::Value(Value::from(n))
    }
}

impl From<bool> for Input {
    fn from(b: bool) -> Self {
        Input::Value(Value::from(b))
    }
}

impl From<Resource> for Input {
    fn from(r: Resource) -> Self {
        Input::Resource(r)
    }
}

impl From<&Resource> for Input {
    fn from(r: &Resource) -> Self {
        Input::Resource(r.clone())
    }
}

impl From<Deferred> for Input {
    fn from(d: Deferred) -> Self {
        Input::Deferred(d)
    }
}

pub(crate) struct ResourceInner {
    pub(crate) id: ResourceId,
    pub(crate) kind: Kind,
    pub(crate) inputs: Input,
    /// Back-reference to the declaring scope: a lookup handle, not a
    /// participating pointer - the scope tracks resources by id only.
    pub(crate) scope: Scope,
}

/// A declared desired-state unit.
///
/// Cheap to clone; all clones refer to the same declaration. The evaluated
/// output is cached per apply pass only, keyed by id - it is never
/// persisted by the evaluator itself.
#[derive(Clone)]
pub struct Resource {
    pub(crate) inner: Arc<ResourceInner>,
}

impl Resource {
    pub(crate) fn new(id: ResourceId, kind: Kind, inputs: Input, scope: Scope) -> Self {
        Resource {
            inner: Arc::new(ResourceInner {
                id,
                kind,
                inputs,
                scope,
            }),
        }
    }

    pub fn id(&self) -> &ResourceId {
        &self.inner.id
    }

    pub fn kind(&self) -> &Kind {
        &self.inner.kind
    }

    pub(crate) fn scope(&self) -> &Scope {
        &self.inner.scope
    }

    /// This resource's output as an input to another declaration.
    pub fn output(&self) -> Input {
        Input::Resource(self.clone())
    }

    /// Chain a lazy transformation of this resource's output.
    pub fn map<F>(&self, f: F) -> Deferred
    where
        F: Fn(Value) -> Input + Send + Sync + 'static,
    {
        Deferred {
            inner: Arc::new(DeferredInner {
                parent: DeferredParent::Resource(self.clone()),
                f: Box::new(f),
            }),
        }
    }

    /// Lazily select a key out of this resource's map output.
    pub fn field(&self, key: impl Into<String>) -> Deferred {
        let key = key.into();
        self.map(move |value| {
            Input::Value(value.get(&key).cloned().unwrap_or(Value::Null))
        })
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Resource({} [{}])", self.inner.id, self.inner.kind)
    }
}

pub(crate) enum DeferredParent {
    Resource(Resource),
    Deferred(Deferred),
}

pub(crate) struct DeferredInner {
    pub(crate) parent: DeferredParent,
    pub(crate) f: Box<dyn Fn(Value) -> Input + Send + Sync>,
}

/// A lazy, chainable handle to a value that exists only after upstream
/// resources apply. Holds no ownership over resources.
#[derive(Clone)]
pub struct Deferred {
    pub(crate) inner: Arc<DeferredInner>,
}

impl Deferred {
    /// Chain another transformation; dependency sets union transitively.
    pub fn map<F>(&self, f: F) -> Deferred
    where
        F: Fn(Value) -> Input + Send + Sync + 'static,
    {
        Deferred {
            inner: Arc::new(DeferredInner {
                parent: DeferredParent::Deferred(self.clone()),
                f: Box::new(f),
            }),
        }
    }

    /// Lazily select a key out of the resolved map value.
    pub fn field(&self, key: impl Into<String>) -> Deferred {
        let key = key.into();
        self.map(move |value| {
            Input::Value(value.get(&key).cloned().unwrap_or(Value::Null))
        })
    }
}
