//! Strata Core - Fundamental types for the reconciliation engine
//!
//! This crate defines the types shared by every other strata crate:
//! - Identifiers (ResourceId, Kind, ScopeChain)
//! - The engine value tree and the Secret marker
//! - Persisted state records and lifecycle status
//! - The provider contract and the process-wide kind registry
//! - The pluggable state store contract

pub mod error;
pub mod id;
pub mod provider;
pub mod record;
pub mod store;
pub mod value;

pub use error::*;
pub use id::*;
pub use provider::*;
pub use record::*;
pub use store::*;
pub use value::*;
