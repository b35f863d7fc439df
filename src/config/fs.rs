//! Filesystem configuration repository.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use serde_json::Value;

use crate::config::repository::ConfigRepository;
use crate::error::LoaderError;

const DEFINITION_EXTENSION: &str = "toml";

/// A repository reading `*.toml` definition files from one directory.
///
/// Paths handed to the reader are absolute; update times come from file
/// metadata, so touching a file is enough to trigger a re-parse on the next
/// rescan.
#[derive(Debug)]
pub struct FsRepository {
    root: PathBuf,
}

impl FsRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ConfigRepository for FsRepository {
    fn list_paths(&self) -> Vec<String> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(
                    "cannot list definition directory '{}': {}",
                    self.root.display(),
                    e
                );
                return Vec::new();
            }
        };

        let mut paths: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.is_file()
                    && path
                        .extension()
                        .is_some_and(|ext| ext == DEFINITION_EXTENSION)
            })
            .map(|path| path.to_string_lossy().into_owned())
            .collect();
        paths.sort();
        paths
    }

    fn exists(&self, path: &str) -> bool {
        Path::new(path).is_file()
    }

    fn update_time(&self, path: &str) -> Result<SystemTime, LoaderError> {
        let metadata = fs::metadata(path).map_err(|e| LoaderError::repository(path, e))?;
        metadata
            .modified()
            .map_err(|e| LoaderError::repository(path, e))
    }

    fn load(&self, path: &str) -> Result<Arc<Value>, LoaderError> {
        let contents = fs::read_to_string(path).map_err(|e| LoaderError::repository(path, e))?;
        let parsed: toml::Value =
            toml::from_str(&contents).map_err(|e| LoaderError::repository(path, e))?;
        let value = serde_json::to_value(parsed).map_err(|e| LoaderError::repository(path, e))?;
        Ok(Arc::new(value))
    }
}
