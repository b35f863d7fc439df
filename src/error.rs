//! Error type shared across the loader.

use thiserror::Error;

/// Errors produced by the loader, its repositories and object factories.
///
/// The variants are `Clone` because a single load failure is observed by
/// every caller waiting on that object: the dispatcher stores the error once
/// and hands out shared copies through [`LoadResult`](crate::LoadResult).
#[derive(Debug, Clone, Error)]
pub enum LoaderError {
    /// The name is not present in the current configuration.
    #[error("{type_name} '{name}' not found")]
    NotFound { type_name: String, name: String },

    /// A synchronous accessor was called while the object is still loading.
    #[error("{type_name} '{name}' is still loading")]
    StillLoading { type_name: String, name: String },

    /// The object is known but no load was ever attempted for it.
    #[error("{type_name} '{name}' was never tried to load")]
    NeverTried { type_name: String, name: String },

    /// The object factory failed to produce an instance.
    #[error("failed to load '{name}': {message}")]
    LoadFailed { name: String, message: String },

    /// A configuration repository could not serve a path.
    #[error("repository error at '{path}': {message}")]
    Repository { path: String, message: String },

    /// A loaded object could not report whether its source changed.
    #[error("modification check for '{name}' failed: {message}")]
    ModificationCheck { name: String, message: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl LoaderError {
    /// Shorthand used by factories to wrap an arbitrary failure message.
    pub fn load_failed(name: impl Into<String>, message: impl ToString) -> Self {
        LoaderError::LoadFailed {
            name: name.into(),
            message: message.to_string(),
        }
    }

    /// Shorthand for repository-side failures.
    pub fn repository(path: impl Into<String>, message: impl ToString) -> Self {
        LoaderError::Repository {
            path: path.into(),
            message: message.to_string(),
        }
    }
}
