//! Provider contract and kind registry
//!
//! A provider is the create/update/delete implementation for one resource
//! kind. Providers are registered process-wide under their kind string so
//! the orphan pruner can look them up with no live resource object - a
//! removed resource exists only as a persisted record naming its kind.
//!
//! Registration is explicit: provider modules call [`register_provider`] at
//! load and anything referencing an unregistered kind fails loudly with
//! [`StrataError::MissingProvider`].
//!
//! [`StrataError::MissingProvider`]: crate::StrataError::MissingProvider

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::{Kind, ResourceId, StateStore, StateRecord, StrataError, StrataResult, Value};

/// Which direction a pass is running in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Phase {
    /// Create or update resources toward the desired graph.
    #[default]
    Up,
    /// Tear down: nothing is applied, everything persisted is orphaned.
    Destroy,
    /// Inspect only: providers may read, finalize never prunes.
    Read,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Up => "up",
            Phase::Destroy => "destroy",
            Phase::Read => "read",
        })
    }
}

/// Everything a provider receives for one apply.
pub struct ApplyRequest<'a> {
    pub phase: Phase,
    pub id: &'a ResourceId,
    /// Scope-qualified name, `<chain>/<id>`.
    pub fqn: &'a str,
    /// Transitive resource ids read while resolving the inputs.
    pub deps: &'a [ResourceId],
    /// Fully resolved inputs.
    pub inputs: &'a Value,
    /// The scope partition the provider persists its record into.
    pub store: &'a dyn StateStore,
}

/// Create/update/delete implementation for one resource kind.
///
/// `apply` is expected to persist its resulting [`StateRecord`] into the
/// request's store; the engine only caches the returned output for the
/// duration of the pass.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Create or update the resource, returning its output.
    async fn apply(&self, req: ApplyRequest<'_>) -> StrataResult<Value>;

    /// Delete the resource described by a previously persisted record.
    async fn delete(&self, record: &StateRecord, store: &dyn StateStore) -> StrataResult<()>;
}

fn registry() -> &'static RwLock<HashMap<Kind, Arc<dyn Provider>>> {
    static REGISTRY: OnceLock<RwLock<HashMap<Kind, Arc<dyn Provider>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Register a provider under a kind. Re-registering a kind replaces the
/// previous provider.
pub fn register_provider(kind: impl Into<Kind>, provider: Arc<dyn Provider>) {
    registry().write().insert(kind.into(), provider);
}

/// Look up a provider, `None` if the kind is unregistered.
pub fn provider_for(kind: &Kind) -> Option<Arc<dyn Provider>> {
    registry().read().get(kind).cloned()
}

/// Look up a provider, failing descriptively if the kind is unregistered.
pub fn require_provider(kind: &Kind) -> StrataResult<Arc<dyn Provider>> {
    provider_for(kind).ok_or_else(|| StrataError::MissingProvider { kind: kind.clone() })
}
