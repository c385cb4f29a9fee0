//! Identity types for the strata engine
//!
//! Resource ids are plain strings, unique within a scope. A scope chain is
//! the list of scope names from the application root down to the current
//! scope and is used verbatim as the partition key by every store backend.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Reserved id under which a scope persists its own marker record.
pub const SCOPE_MARKER: &str = "::scope";

/// Kind string of scope marker records.
pub const SCOPE_KIND: &str = "strata::scope";

/// Resource identity - unique within a scope
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(pub String);

impl ResourceId {
    #[inline]
    pub fn new(id: impl Into<String>) -> Self {
        ResourceId(id.into())
    }

    /// The marker id a scope writes for itself.
    #[inline]
    pub fn scope_marker() -> Self {
        ResourceId(SCOPE_MARKER.to_string())
    }

    #[inline]
    pub fn is_scope_marker(&self) -> bool {
        self.0 == SCOPE_MARKER
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ResourceId {
    fn from(s: &str) -> Self {
        ResourceId(s.to_string())
    }
}

impl fmt::Debug for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Resource({})", self.0)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resource kind - the key providers register under
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Kind(pub String);

impl Kind {
    #[inline]
    pub fn new(kind: impl Into<String>) -> Self {
        Kind(kind.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Kind {
    fn from(s: &str) -> Self {
        Kind(s.to_string())
    }
}

impl fmt::Debug for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Kind({})", self.0)
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Scope chain - names from the application root to the current scope.
///
/// Used verbatim as the state partition key: directory path for the
/// filesystem backend, composite key for SQL backends, query parameters
/// for remote backends.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct ScopeChain(pub Vec<String>);

impl ScopeChain {
    #[inline]
    pub fn root(app: impl Into<String>) -> Self {
        ScopeChain(vec![app.into()])
    }

    /// Extend the chain with a child scope name.
    pub fn child(&self, name: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(name.into());
        ScopeChain(segments)
    }

    #[inline]
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// The scope's own name (last segment).
    pub fn name(&self) -> &str {
        self.0.last().map(String::as_str).unwrap_or("")
    }

    /// The chain joined with `/`, used as a flat partition key.
    pub fn key(&self) -> String {
        self.0.join("/")
    }

    /// Fully qualified name of a resource under this scope.
    pub fn fqn(&self, id: &ResourceId) -> String {
        format!("{}/{}", self.key(), id)
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for ScopeChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}
