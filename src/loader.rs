//! The public loader facade.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{
    ConfigReader, ConfigRepository, ObjectConfigSettings, UpdateSettings,
};
use crate::dispatcher::{LoadResult, LoadingDispatcher, Status};
use crate::error::LoaderError;
use crate::loadable::{Loadable, LoadableFactory};
use crate::updater::PeriodicUpdater;

/// Hot-reloading loader for named, long-lived domain objects.
///
/// Wires the configuration reader, the loading dispatcher and the periodic
/// updater, and converts wait results into caller-facing errors. `type_name`
/// names the kind of object in messages ("dictionary", "model", ...).
pub struct Loader {
    reader: Arc<ConfigReader>,
    dispatcher: Arc<LoadingDispatcher>,
    updater: PeriodicUpdater,
    type_name: String,
}

impl Loader {
    pub fn new(type_name: impl Into<String>, factory: Arc<dyn LoadableFactory>) -> Self {
        Self::with_settings(type_name, factory, UpdateSettings::default())
    }

    pub fn with_settings(
        type_name: impl Into<String>,
        factory: Arc<dyn LoadableFactory>,
        settings: UpdateSettings,
    ) -> Self {
        let type_name = type_name.into();
        let reader = Arc::new(ConfigReader::new(type_name.clone()));
        let dispatcher = Arc::new(LoadingDispatcher::new(
            factory,
            type_name.clone(),
            settings,
        ));
        let updater = PeriodicUpdater::new(Arc::clone(&reader), Arc::clone(&dispatcher));
        Self {
            reader,
            dispatcher,
            updater,
            type_name,
        }
    }

    /// Register a repository and immediately pick up its definitions.
    pub fn add_repository(
        &self,
        name: impl Into<String>,
        repository: Arc<dyn ConfigRepository>,
        settings: ObjectConfigSettings,
    ) {
        let name = name.into();
        self.reader.add_repository(name.clone(), repository, settings);
        self.reload_config_repository(&name);
    }

    /// Deregister a repository; its definitions disappear from the
    /// namespace on the spot.
    pub fn remove_repository(&self, name: &str) -> Option<Arc<dyn ConfigRepository>> {
        let repository = self.reader.remove_repository(name);
        self.reload_config_repository(name);
        repository
    }

    /// Rescan every repository and apply the result.
    pub fn reload_config(&self) {
        self.dispatcher.set_configuration(self.reader.read());
    }

    /// Rescan one repository and apply the (still unified) result.
    pub fn reload_config_repository(&self, repository_name: &str) {
        self.dispatcher
            .set_configuration(self.reader.read_repository(repository_name));
    }

    /// Rescan a single path of one repository and apply the result.
    pub fn reload_config_path(&self, repository_name: &str, path: &str) {
        self.dispatcher
            .set_configuration(self.reader.read_path(repository_name, path));
    }

    pub fn enable_always_load_everything(&self, enable: bool) {
        self.dispatcher.enable_always_load_everything(enable);
    }

    pub fn enable_async_loading(&self, enable: bool) {
        self.dispatcher.enable_async_loading(enable);
    }

    pub async fn enable_periodic_updates(&self, enable: bool) {
        self.updater.enable(enable).await;
    }

    pub fn get_current_status(&self, name: &str) -> Status {
        self.dispatcher.get_current_status(name)
    }

    pub fn get_current_load_result(&self, name: &str) -> LoadResult {
        self.dispatcher.get_current_load_result(name)
    }

    pub fn get_current_load_results(
        &self,
        filter: impl Fn(&str) -> bool,
    ) -> Vec<LoadResult> {
        self.dispatcher.get_current_load_results(filter)
    }

    /// Bare-object projection of every currently loaded object.
    pub fn get_currently_loaded_objects(&self) -> Vec<Arc<dyn Loadable>> {
        self.get_currently_loaded_objects_matching(|_| true)
    }

    pub fn get_currently_loaded_objects_matching(
        &self,
        filter: impl Fn(&str) -> bool,
    ) -> Vec<Arc<dyn Loadable>> {
        self.dispatcher
            .get_current_load_results(filter)
            .into_iter()
            .filter_map(|result| result.object)
            .collect()
    }

    pub fn get_number_of_currently_loaded_objects(&self) -> usize {
        self.dispatcher.get_number_of_currently_loaded_objects()
    }

    pub fn has_currently_loaded_objects(&self) -> bool {
        self.dispatcher.has_currently_loaded_objects()
    }

    pub fn get_all_tried_to_load_names(&self) -> Vec<String> {
        self.dispatcher.get_all_tried_to_load_names()
    }

    /// Wait up to `timeout` (`None` = indefinitely) for the object to become
    /// ready; returns whatever is current when the wait ends.
    pub async fn try_load(&self, name: &str, timeout: Option<Duration>) -> LoadResult {
        self.dispatcher.try_load(name, timeout).await
    }

    pub async fn try_load_matching(
        &self,
        filter: impl Fn(&str) -> bool,
        timeout: Option<Duration>,
    ) -> Vec<LoadResult> {
        self.dispatcher.try_load_matching(filter, timeout).await
    }

    /// Load the object, waiting indefinitely, and fail loudly if it could
    /// not be loaded.
    pub async fn load(&self, name: &str) -> Result<Arc<dyn Loadable>, LoaderError> {
        let result = self.dispatcher.try_load(name, None).await;
        self.check_loaded(&result, false)
    }

    /// Load every matching object; the first failure is returned, the rest
    /// are logged.
    pub async fn load_matching(
        &self,
        filter: impl Fn(&str) -> bool,
    ) -> Result<Vec<Arc<dyn Loadable>>, LoaderError> {
        let results = self.dispatcher.try_load_matching(filter, None).await;
        self.check_all_loaded(&results, false)
    }

    /// Refresh the configuration, then force a fresh load of the object.
    pub async fn load_or_reload(&self, name: &str) -> Result<Arc<dyn Loadable>, LoaderError> {
        self.reload_config();
        let result = self.dispatcher.try_load_or_reload(name, None).await;
        self.check_loaded(&result, true)
    }

    /// Refresh the configuration, then force a fresh load of every matching
    /// object.
    pub async fn load_or_reload_matching(
        &self,
        filter: impl Fn(&str) -> bool,
    ) -> Result<Vec<Arc<dyn Loadable>>, LoaderError> {
        self.reload_config();
        let results = self.dispatcher.try_load_or_reload_matching(filter, None).await;
        self.check_all_loaded(&results, true)
    }

    /// Force a fresh load of everything that was ever attempted.
    pub async fn reload_all_tried_to_load(
        &self,
    ) -> Result<Vec<Arc<dyn Loadable>>, LoaderError> {
        let names: HashSet<String> = self.get_all_tried_to_load_names().into_iter().collect();
        self.load_or_reload_matching(move |name| names.contains(name)).await
    }

    /// Gate between wait results and callers: returns the object or the
    /// distinct error for its state. With `check_no_errors`, a live object
    /// carrying a reload failure is reported as that failure.
    pub fn check_loaded(
        &self,
        result: &LoadResult,
        check_no_errors: bool,
    ) -> Result<Arc<dyn Loadable>, LoaderError> {
        if let Some(object) = &result.object {
            if !check_no_errors || result.exception.is_none() {
                return Ok(Arc::clone(object));
            }
        }
        if result.status == Status::Loading {
            return Err(LoaderError::StillLoading {
                type_name: self.type_name.clone(),
                name: result.name.clone(),
            });
        }
        if let Some(exception) = &result.exception {
            return Err((**exception).clone());
        }
        if result.status == Status::NotExist {
            return Err(LoaderError::NotFound {
                type_name: self.type_name.clone(),
                name: result.name.clone(),
            });
        }
        Err(LoaderError::NeverTried {
            type_name: self.type_name.clone(),
            name: result.name.clone(),
        })
    }

    fn check_all_loaded(
        &self,
        results: &[LoadResult],
        check_no_errors: bool,
    ) -> Result<Vec<Arc<dyn Loadable>>, LoaderError> {
        let mut first_error = None;
        let mut objects = Vec::with_capacity(results.len());

        for result in results {
            match self.check_loaded(result, check_no_errors) {
                Ok(object) => objects.push(object),
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    } else {
                        tracing::error!("{}", e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(objects),
        }
    }

    /// Stop periodic updates and join all outstanding loads. Late
    /// completions after this point are discarded.
    pub async fn shutdown(&self) {
        self.updater.enable(false).await;
        self.dispatcher.shutdown().await;
    }
}
