//! Repository capability and object definition records.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use serde_json::Value;

use crate::error::LoaderError;

/// Repositories whose registered name starts with this prefix may shadow
/// (and be shadowed by) other repositories without a collision warning.
pub const INTERNAL_REPOSITORY_PREFIX: &str = "_internal_";

/// A source of object definition files.
///
/// Implementations wrap a filesystem directory, a database table or an
/// in-memory map; the reader only ever talks to them through this interface.
pub trait ConfigRepository: Send + Sync + 'static {
    /// Paths of every definition file currently present.
    fn list_paths(&self) -> Vec<String>;

    /// Whether `path` currently exists in the repository.
    fn exists(&self, path: &str) -> bool;

    /// Last modification time of `path`.
    fn update_time(&self, path: &str) -> Result<SystemTime, LoaderError>;

    /// Parse the file at `path` into an opaque configuration blob.
    fn load(&self, path: &str) -> Result<Arc<Value>, LoaderError>;
}

/// One object definition extracted from a repository file.
#[derive(Debug, Clone)]
pub struct ObjectConfig {
    /// Parsed contents of the whole definition file.
    pub config: Arc<Value>,

    /// Top-level key under which this object is defined.
    pub key_in_config: String,

    /// Repository the definition came from.
    pub repository_name: String,

    /// Path of the definition file within that repository.
    pub path: String,
}

/// Immutable unified snapshot of all known definitions, keyed by object name.
pub type ObjectConfigs = Arc<HashMap<String, Arc<ObjectConfig>>>;

/// Look up a dotted path (`"a.b.c"`) inside a configuration blob.
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for part in path.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Structural equality of two object definitions.
///
/// Only the keyed subtrees are compared; surrounding file contents (other
/// objects, comments) do not count as a change.
pub fn is_same_configuration(a: &ObjectConfig, b: &ObjectConfig) -> bool {
    lookup_path(&a.config, &a.key_in_config) == lookup_path(&b.config, &b.key_in_config)
}
