//! Error types for the strata engine

use thiserror::Error;

use crate::{Kind, ResourceId};

/// Engine-wide errors.
///
/// The enum is `Clone` so a memoized shared future can fan the same
/// failure out to every referrer of an in-flight apply or delete.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StrataError {
    // Provider errors
    #[error("provider apply failed for '{id}': {message}")]
    ProviderApply { id: ResourceId, message: String },

    #[error("provider delete failed for '{id}': {message}")]
    ProviderDelete { id: ResourceId, message: String },

    #[error("no provider registered for kind '{kind}' - is the provider module imported?")]
    MissingProvider { kind: Kind },

    // Store errors
    #[error("state store error: {0}")]
    Store(String),

    // Serialization and secret errors
    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("secret encountered but no password is set on this scope")]
    MissingPassword,

    #[error("failed to decrypt secret: wrong password or corrupt envelope")]
    DecryptionFailed,

    #[error("malformed secret envelope: {0}")]
    Envelope(String),

    // Scope errors
    #[error("scope metadata cannot be accessed on the application root")]
    RootScopeState,

    #[error("duplicate resource id '{0}' in scope")]
    DuplicateResource(ResourceId),

    #[error("scope '{0}' has already been finalized")]
    AlreadyFinalized(String),

    #[error("deferred task resolved before scope finalization")]
    NotFinalized,
}

/// Result type for strata operations
pub type StrataResult<T> = Result<T, StrataError>;

impl StrataError {
    /// Wrap an arbitrary I/O or backend failure as a store error.
    pub fn store(err: impl std::fmt::Display) -> Self {
        StrataError::Store(err.to_string())
    }
}
