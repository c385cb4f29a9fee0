//! Persisted state records
//!
//! One record is stored per resource, holding the last observed lifecycle
//! state. Records round-trip through every store backend, including secret
//! envelopes nested anywhere inside `props` or `output`, so they are
//! converted to and from JSON by the secret-aware serializer rather than
//! deriving `Serialize` directly.

use std::fmt;

use crate::{Kind, ResourceId, Value};

/// Lifecycle status of a persisted resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    Creating,
    Created,
    Updating,
    Updated,
    Deleting,
    Deleted,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Creating => "creating",
            Status::Created => "created",
            Status::Updating => "updating",
            Status::Updated => "updated",
            Status::Deleting => "deleting",
            Status::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "creating" => Status::Creating,
            "created" => Status::Created,
            "updating" => Status::Updating,
            "updated" => Status::Updated,
            "deleting" => Status::Deleting,
            "deleted" => Status::Deleted,
            _ => return None,
        })
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The persisted state of one resource.
#[derive(Clone, Debug, PartialEq)]
pub struct StateRecord {
    pub status: Status,
    pub kind: Kind,
    pub id: ResourceId,
    /// Scope-chain-qualified name.
    pub fqn: String,
    /// Update sequence number, starting at 0 on create.
    pub seq: u64,
    /// Resource ids read while applying this resource. The orphan pruner
    /// inverts these edges to delete dependents before dependencies.
    pub deps: Vec<ResourceId>,
    /// Provider-private scratch data.
    pub data: Value,
    /// Resolved inputs the resource was last applied with.
    pub props: Value,
    /// Previous props while an update is in flight.
    pub old_props: Option<Value>,
    /// The provider's output from the last apply.
    pub output: Value,
}

impl StateRecord {
    /// A fresh record for a resource being created.
    pub fn creating(kind: Kind, id: ResourceId, fqn: String, deps: Vec<ResourceId>, props: Value) -> Self {
        StateRecord {
            status: Status::Creating,
            kind,
            id,
            fqn,
            seq: 0,
            deps,
            data: Value::Null,
            props,
            old_props: None,
            output: Value::Null,
        }
    }

    /// Transition an existing record into an update with new props.
    pub fn updating(mut self, deps: Vec<ResourceId>, props: Value) -> Self {
        self.status = Status::Updating;
        self.seq += 1;
        self.old_props = Some(std::mem::replace(&mut self.props, props));
        self.deps = deps;
        self
    }

    /// Mark the record settled with the given output.
    pub fn settled(mut self, output: Value) -> Self {
        self.status = if self.seq == 0 { Status::Created } else { Status::Updated };
        self.old_props = None;
        self.output = output;
        self
    }

    /// The marker record a scope writes for itself on first use.
    pub fn scope_marker(fqn: String) -> Self {
        StateRecord {
            status: Status::Created,
            kind: Kind::new(crate::SCOPE_KIND),
            id: ResourceId::scope_marker(),
            fqn,
            seq: 0,
            deps: Vec::new(),
            data: Value::Null,
            props: Value::Null,
            old_props: None,
            output: Value::Null,
        }
    }
}
