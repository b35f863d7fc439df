//! In-memory configuration repository.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde_json::Value;

use crate::config::repository::ConfigRepository;
use crate::error::LoaderError;

#[derive(Debug, Clone)]
struct MemoryEntry {
    contents: Arc<Value>,
    update_time: SystemTime,
}

/// A repository backed by a concurrent map, for embedders that manage
/// definitions programmatically and for tests.
///
/// Every `set` bumps the entry's update time by a full tick so the reader's
/// strictly-greater mtime check always notices the change, regardless of
/// clock resolution.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    entries: DashMap<String, MemoryEntry>,
    ticks: AtomicU64,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a definition file.
    pub fn set(&self, path: impl Into<String>, contents: Value) {
        let tick = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
        self.entries.insert(
            path.into(),
            MemoryEntry {
                contents: Arc::new(contents),
                update_time: UNIX_EPOCH + Duration::from_secs(tick),
            },
        );
    }

    /// Remove a definition file. Returns true if it existed.
    pub fn remove(&self, path: &str) -> bool {
        self.entries.remove(path).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ConfigRepository for MemoryRepository {
    fn list_paths(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    fn exists(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    fn update_time(&self, path: &str) -> Result<SystemTime, LoaderError> {
        self.entries
            .get(path)
            .map(|entry| entry.update_time)
            .ok_or_else(|| LoaderError::repository(path, "no such path"))
    }

    fn load(&self, path: &str) -> Result<Arc<Value>, LoaderError> {
        self.entries
            .get(path)
            .map(|entry| Arc::clone(&entry.contents))
            .ok_or_else(|| LoaderError::repository(path, "no such path"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_update_time_strictly_increases() {
        let repo = MemoryRepository::new();
        repo.set("a.toml", json!({"object_a": {"name": "a"}}));
        let first = repo.update_time("a.toml").unwrap();

        repo.set("a.toml", json!({"object_a": {"name": "a", "rev": 2}}));
        let second = repo.update_time("a.toml").unwrap();

        assert!(second > first);
    }

    #[test]
    fn test_missing_path_is_an_error() {
        let repo = MemoryRepository::new();
        assert!(!repo.exists("a.toml"));
        assert!(repo.update_time("a.toml").is_err());
        assert!(repo.load("a.toml").is_err());
    }
}
