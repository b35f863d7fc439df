//! Public load status and result types.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::LoaderError;
use crate::loadable::Loadable;

/// Externally visible state of one object.
///
/// Discriminants and string names are stable: consumers register them in
/// their own enum types via [`Status::all_possible_values`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum Status {
    /// The object is known but no load was attempted yet.
    NotLoaded = 0,
    /// The object is live.
    Loaded,
    /// Every attempt so far failed; there is no live instance.
    Failed,
    /// The first load attempt is in flight.
    Loading,
    /// A live instance exists and a reload is in flight.
    LoadedAndReloading,
    /// All attempts failed and another one is in flight.
    FailedAndReloading,
    /// The name is absent from the current configuration.
    NotExist,
}

impl Status {
    pub fn name(&self) -> &'static str {
        match self {
            Status::NotLoaded => "NOT_LOADED",
            Status::Loaded => "LOADED",
            Status::Failed => "FAILED",
            Status::Loading => "LOADING",
            Status::LoadedAndReloading => "LOADED_AND_RELOADING",
            Status::FailedAndReloading => "FAILED_AND_RELOADING",
            Status::NotExist => "NOT_EXIST",
        }
    }

    /// (name, discriminant) pairs for consumers that register the enum.
    pub fn all_possible_values() -> Vec<(&'static str, i8)> {
        [
            Status::NotLoaded,
            Status::Loaded,
            Status::Failed,
            Status::Loading,
            Status::LoadedAndReloading,
            Status::FailedAndReloading,
            Status::NotExist,
        ]
        .into_iter()
        .map(|status| (status.name(), status as i8))
        .collect()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Snapshot of one object's load state, as observed under the dispatcher
/// lock. Cheap to clone: the object and error are shared.
#[derive(Clone)]
pub struct LoadResult {
    pub name: String,
    pub status: Status,
    pub object: Option<Arc<dyn Loadable>>,
    pub exception: Option<Arc<LoaderError>>,
    pub loading_start_time: Option<Instant>,
    pub loading_duration: Duration,
    /// Path of the definition file the object came from.
    pub origin: String,
    pub repository_name: String,
}

impl LoadResult {
    /// Result shape for names absent from the configuration.
    pub fn not_exists(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: Status::NotExist,
            object: None,
            exception: None,
            loading_start_time: None,
            loading_duration: Duration::ZERO,
            origin: String::new(),
            repository_name: String::new(),
        }
    }
}

impl fmt::Debug for LoadResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadResult")
            .field("name", &self.name)
            .field("status", &self.status)
            .field("has_object", &self.object.is_some())
            .field("exception", &self.exception)
            .field("loading_duration", &self.loading_duration)
            .field("origin", &self.origin)
            .field("repository_name", &self.repository_name)
            .finish()
    }
}
