//! Aggregation of object definitions from all registered repositories.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

use serde_json::Value;

use crate::config::repository::{
    lookup_path, ConfigRepository, ObjectConfig, ObjectConfigs, INTERNAL_REPOSITORY_PREFIX,
};
use crate::config::settings::ObjectConfigSettings;

/// One definition parsed out of a file, before repository name and path are
/// attached during aggregation.
#[derive(Debug, Clone)]
struct ParsedObject {
    name: String,
    config: Arc<Value>,
    key_in_config: String,
}

/// Cached per-file parse state. Dropped when the file disappears.
#[derive(Debug, Default)]
struct FileRecord {
    last_update_time: Option<SystemTime>,
    objects: Vec<ParsedObject>,
    in_use: bool,
}

struct RepositoryEntry {
    name: String,
    repository: Arc<dyn ConfigRepository>,
    settings: ObjectConfigSettings,
    files: HashMap<String, FileRecord>,
}

struct ReaderState {
    /// Registration order decides the winner on name collisions.
    repositories: Vec<RepositoryEntry>,
    object_configs: ObjectConfigs,
    need_collect: bool,
}

/// Reads definition files from every registered repository and publishes the
/// unified `name -> ObjectConfig` snapshot.
///
/// Files are re-parsed only when the repository reports a strictly newer
/// update time; unchanged rescans hand back the previously published
/// snapshot (same `Arc`), which lets the dispatcher skip the diff entirely.
pub struct ConfigReader {
    type_name: String,
    state: Mutex<ReaderState>,
}

impl ConfigReader {
    /// `type_name` names the kind of object ("dictionary", "model", ...) in
    /// log messages.
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            state: Mutex::new(ReaderState {
                repositories: Vec::new(),
                object_configs: Arc::new(HashMap::new()),
                need_collect: false,
            }),
        }
    }

    /// Register a repository. Registering the same name twice is a caller
    /// error; the second registration is ignored with a warning.
    pub fn add_repository(
        &self,
        name: impl Into<String>,
        repository: Arc<dyn ConfigRepository>,
        settings: ObjectConfigSettings,
    ) {
        let name = name.into();
        let mut state = self.lock_state();
        if state.repositories.iter().any(|entry| entry.name == name) {
            tracing::warn!(
                repository = %name,
                "repository is already registered, ignoring the duplicate"
            );
            return;
        }
        state.repositories.push(RepositoryEntry {
            name,
            repository,
            settings,
            files: HashMap::new(),
        });
        state.need_collect = true;
    }

    /// Deregister a repository and return ownership of it.
    pub fn remove_repository(&self, name: &str) -> Option<Arc<dyn ConfigRepository>> {
        let mut state = self.lock_state();
        let index = state.repositories.iter().position(|entry| entry.name == name)?;
        let entry = state.repositories.remove(index);
        state.need_collect = true;
        Some(entry.repository)
    }

    /// Rescan all repositories and return the unified snapshot.
    pub fn read(&self) -> ObjectConfigs {
        let mut state = self.lock_state();
        self.read_repositories(&mut state, None, None);
        self.collect_object_configs(&mut state);
        Arc::clone(&state.object_configs)
    }

    /// Rescan only the named repository; the returned snapshot still covers
    /// all repositories.
    pub fn read_repository(&self, repository_name: &str) -> ObjectConfigs {
        let mut state = self.lock_state();
        self.read_repositories(&mut state, Some(repository_name), None);
        self.collect_object_configs(&mut state);
        Arc::clone(&state.object_configs)
    }

    /// Rescan only one path of the named repository.
    pub fn read_path(&self, repository_name: &str, path: &str) -> ObjectConfigs {
        let mut state = self.lock_state();
        self.read_repositories(&mut state, Some(repository_name), Some(path));
        self.collect_object_configs(&mut state);
        Arc::clone(&state.object_configs)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ReaderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check update times and re-parse files which are new or changed.
    fn read_repositories(
        &self,
        state: &mut ReaderState,
        only_repository: Option<&str>,
        only_path: Option<&str>,
    ) {
        let mut changed = false;

        for entry in &mut state.repositories {
            if only_repository.is_some_and(|name| name != entry.name) {
                continue;
            }

            for record in entry.files.values_mut() {
                record.in_use = false;
            }

            let existing_paths = match only_path {
                Some(path) => {
                    if entry.repository.exists(path) {
                        vec![path.to_string()]
                    } else {
                        Vec::new()
                    }
                }
                None => entry.repository.list_paths(),
            };

            for path in existing_paths {
                match entry.files.entry(path.clone()) {
                    Entry::Occupied(mut occupied) => {
                        if read_file(
                            occupied.get_mut(),
                            entry.repository.as_ref(),
                            &path,
                            &entry.settings,
                            &self.type_name,
                        ) {
                            changed = true;
                        }
                    }
                    Entry::Vacant(vacant) => {
                        let mut record = FileRecord::default();
                        if read_file(
                            &mut record,
                            entry.repository.as_ref(),
                            &path,
                            &entry.settings,
                            &self.type_name,
                        ) {
                            vacant.insert(record);
                            changed = true;
                        }
                    }
                }
            }

            // Files no longer reported by the repository were deleted.
            let deleted_paths: Vec<String> = entry
                .files
                .iter()
                .filter(|(path, record)| {
                    !record.in_use && only_path.map_or(true, |only| only == path.as_str())
                })
                .map(|(path, _)| path.clone())
                .collect();

            if !deleted_paths.is_empty() {
                for path in &deleted_paths {
                    entry.files.remove(path);
                }
                changed = true;
            }
        }

        if changed {
            state.need_collect = true;
        }
    }

    /// Rebuild the published snapshot if anything changed since the last
    /// collection pass.
    fn collect_object_configs(&self, state: &mut ReaderState) {
        if !state.need_collect {
            return;
        }
        state.need_collect = false;

        let mut new_configs: HashMap<String, Arc<ObjectConfig>> = HashMap::new();

        for entry in &state.repositories {
            for (path, record) in &entry.files {
                for parsed in &record.objects {
                    match new_configs.entry(parsed.name.clone()) {
                        Entry::Vacant(vacant) => {
                            vacant.insert(Arc::new(ObjectConfig {
                                config: Arc::clone(&parsed.config),
                                key_in_config: parsed.key_in_config.clone(),
                                repository_name: entry.name.clone(),
                                path: path.clone(),
                            }));
                        }
                        Entry::Occupied(occupied) => {
                            let already_added = occupied.get();
                            let internal = entry.name.starts_with(INTERNAL_REPOSITORY_PREFIX)
                                || already_added
                                    .repository_name
                                    .starts_with(INTERNAL_REPOSITORY_PREFIX);
                            if !internal {
                                if already_added.path == *path
                                    && already_added.repository_name == entry.name
                                {
                                    tracing::warn!(
                                        "{} '{}' is found twice in the same file '{}'",
                                        self.type_name,
                                        parsed.name,
                                        path
                                    );
                                } else {
                                    tracing::warn!(
                                        "{} '{}' is found both in file '{}' and '{}'",
                                        self.type_name,
                                        parsed.name,
                                        already_added.path,
                                        path
                                    );
                                }
                            }
                        }
                    }
                }
            }
        }

        state.object_configs = Arc::new(new_configs);
    }
}

/// Read one file if it is new or changed. Returns true when the record's
/// contents were replaced. All failures are isolated to this file: the
/// previous parse survives until a later successful one.
fn read_file(
    record: &mut FileRecord,
    repository: &dyn ConfigRepository,
    path: &str,
    settings: &ObjectConfigSettings,
    type_name: &str,
) -> bool {
    if path.is_empty() || !repository.exists(path) {
        tracing::warn!("config file '{}' does not exist", path);
        return false;
    }

    // The path is live: whatever happens below, the record must survive the
    // deletion sweep. Only paths the repository no longer reports are swept.
    record.in_use = true;

    let update_time = match repository.update_time(path) {
        Ok(time) => time,
        Err(e) => {
            tracing::warn!("cannot read update time of config file '{}': {}", path, e);
            return false;
        }
    };

    if record
        .last_update_time
        .is_some_and(|last| update_time <= last)
    {
        return false;
    }

    let contents = match repository.load(path) {
        Ok(contents) => contents,
        Err(e) => {
            tracing::error!("failed to load config file '{}': {}", path, e);
            return false;
        }
    };

    let Some(table) = contents.as_object() else {
        tracing::error!(
            "failed to load config file '{}': top level is not a table",
            path
        );
        return false;
    };

    let mut objects = Vec::new();
    for key in table.keys() {
        if !key.starts_with(&settings.object_config_prefix) {
            if !key.starts_with("comment") && !key.starts_with("include_from") {
                tracing::warn!(
                    "{}: file contains unknown node '{}', expected '{}'",
                    path,
                    key,
                    settings.object_config_prefix
                );
            }
            continue;
        }

        let name_path = format!("{}.{}", key, settings.object_name_key);
        let Some(object_name) = lookup_path(&contents, &name_path).and_then(Value::as_str) else {
            tracing::error!(
                "failed to load config file '{}': node '{}' has no '{}' key",
                path,
                key,
                settings.object_name_key
            );
            return false;
        };

        if object_name.is_empty() {
            tracing::warn!(
                "{}: node '{}' defines {} with an empty name, skipping it",
                path,
                key,
                type_name
            );
            continue;
        }

        objects.push(ParsedObject {
            name: object_name.to_string(),
            config: Arc::clone(&contents),
            key_in_config: key.clone(),
        });
    }

    record.objects = objects;
    record.last_update_time = Some(update_time);
    true
}
