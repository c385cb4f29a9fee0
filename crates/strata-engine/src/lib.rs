//! Strata Engine - Graph reconciliation
//!
//! User programs declare a graph of desired resources as [`Input`] trees
//! mixing concrete values, [`Resource`] nodes, and lazy [`Deferred`]
//! handles. An [`Application`] runs one apply pass against a [`Scope`]:
//! the [`Evaluator`] resolves the graph, invoking each resource's provider
//! at most once per pass, and finalization prunes orphaned resources from
//! the scope's state partition in dependency-safe order.

pub mod app;
pub mod eval;
pub mod input;
pub mod prune;
pub mod scope;

pub use app::{AppConfig, Application, PassContext};
pub use eval::{Evaluated, Evaluator};
pub use input::{Deferred, Input, Resource};
pub use prune::Pruner;
pub use scope::{DeferHandle, Scope};
