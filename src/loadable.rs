//! Capability traits for loaded objects and their factories.

use std::sync::Arc;

use crate::config::ObjectConfig;
use crate::error::LoaderError;

/// Freshness window of a loaded object, in seconds.
///
/// After a successful load the next reload is scheduled at a uniformly
/// sampled instant inside `[min_secs, max_secs]` from now. A `(0, 0)` window
/// means the object is never reloaded on a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lifetime {
    pub min_secs: u64,
    pub max_secs: u64,
}

impl Lifetime {
    pub fn new(min_secs: u64, max_secs: u64) -> Self {
        Self { min_secs, max_secs }
    }

    /// Whether this window disables timed reloads.
    pub fn is_never(&self) -> bool {
        self.min_secs == 0 && self.max_secs == 0
    }
}

/// A live domain object managed by the loader.
///
/// Implementations are long-lived, shared behind `Arc` and queried from many
/// tasks at once, hence the `Send + Sync` bound.
pub trait Loadable: std::fmt::Debug + Send + Sync + 'static {
    /// Stable name used in diagnostics.
    fn name(&self) -> &str;

    /// Whether the object participates in periodic reloading at all.
    fn support_updates(&self) -> bool;

    /// Freshness window consulted after every successful load.
    fn lifetime(&self) -> Lifetime;

    /// Hint whether the underlying source changed since the object was
    /// built. Errors are treated by the dispatcher as "modified".
    fn is_modified(&self) -> Result<bool, LoaderError>;

    /// Independent copy handed to the factory as the previous version of an
    /// incremental reload.
    fn clone_loadable(&self) -> Arc<dyn Loadable>;
}

/// Builds [`Loadable`] instances from object definitions.
///
/// `create` is the only required method. The loading machinery calls
/// `create_object`, which by default clones the previous version when one is
/// usable (the definition did not change and no full reload was forced) and
/// falls back to `create` otherwise.
pub trait LoadableFactory: Send + Sync + 'static {
    /// Build a fresh object from its parsed definition.
    fn create(
        &self,
        name: &str,
        config: &serde_json::Value,
        key_in_config: &str,
    ) -> Result<Arc<dyn Loadable>, LoaderError>;

    /// Build an object, possibly reusing the previous version.
    ///
    /// The factory runs with the dispatcher lock released and may block for
    /// as long as it needs; the dispatcher never interrupts it.
    fn create_object(
        &self,
        name: &str,
        config: &ObjectConfig,
        previous_version: Option<&Arc<dyn Loadable>>,
    ) -> Result<Arc<dyn Loadable>, LoaderError> {
        if let Some(previous) = previous_version {
            return Ok(previous.clone_loadable());
        }
        self.create(name, &config.config, &config.key_in_config)
    }
}
