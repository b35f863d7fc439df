//! Settings schema definitions.
//!
//! All types derive Serde traits so embedders can deserialize them straight
//! from their own configuration files. Every field has a default to allow
//! minimal configs.

use serde::{Deserialize, Serialize};

/// Per-repository parsing settings: how object definitions are recognised
/// inside a definition file.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObjectConfigSettings {
    /// Top-level keys starting with this prefix denote object definitions.
    pub object_config_prefix: String,

    /// Child key holding the object's name, looked up as
    /// `<top-level key>.<object_name_key>`.
    pub object_name_key: String,
}

impl Default for ObjectConfigSettings {
    fn default() -> Self {
        Self {
            object_config_prefix: "object".to_string(),
            object_name_key: "name".to_string(),
        }
    }
}

/// Reload scheduling settings shared by all objects of one loader.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(default)]
pub struct UpdateSettings {
    /// Base delay before retrying a failed load, in seconds.
    #[serde(default = "default_backoff_initial_secs")]
    pub backoff_initial_secs: u64,

    /// Upper bound for the retry delay, in seconds.
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,
}

fn default_backoff_initial_secs() -> u64 {
    5
}

fn default_backoff_max_secs() -> u64 {
    10 * 60
}

impl Default for UpdateSettings {
    fn default() -> Self {
        Self {
            backoff_initial_secs: default_backoff_initial_secs(),
            backoff_max_secs: default_backoff_max_secs(),
        }
    }
}
