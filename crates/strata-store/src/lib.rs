//! Strata Store - State persistence backends
//!
//! Implementations of the [`StateStore`] contract from `strata-core`:
//! - [`FsStore`]: one JSON file per resource, the reference backend
//! - [`MemoryStore`]: in-process map, used by tests
//! - [`SqliteStore`]: rows keyed by `(scope chain, id)`
//! - [`RemoteStore`]: HTTP proxy with retry and exponential backoff
//!
//! All backends persist records through the secret-aware serializer in
//! [`serial`], so secret envelopes round-trip identically everywhere.
//!
//! [`StateStore`]: strata_core::StateStore

pub mod fs;
pub mod memory;
pub mod remote;
pub mod retry;
pub mod serial;
pub mod sqlite;

pub use fs::{FsStore, FsStoreFactory};
pub use memory::{MemoryStore, MemoryStoreFactory};
pub use remote::{RemoteStore, RemoteStoreFactory};
pub use retry::{with_backoff, RetryConfig};
pub use sqlite::{SqliteStore, SqliteStoreFactory};
