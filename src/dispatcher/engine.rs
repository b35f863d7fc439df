//! The per-object loading state machine.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::config::{is_same_configuration, ObjectConfig, ObjectConfigs, UpdateSettings};
use crate::dispatcher::status::{LoadResult, Status};
use crate::error::LoaderError;
use crate::loadable::{Loadable, LoadableFactory};
use crate::resilience::backoff::reload_backoff;

/// Everything the dispatcher knows about one object name.
struct ObjectInfo {
    name: String,
    config: Arc<ObjectConfig>,
    object: Option<Arc<dyn Loadable>>,
    exception: Option<Arc<LoaderError>>,
    /// Non-zero while a load attempt is in flight; the token a completion
    /// must still match to publish its result.
    loading_id: u64,
    loading_start_time: Option<Instant>,
    loading_end_time: Option<Instant>,
    /// Consecutive failures since the last successful load.
    error_count: u64,
    /// `None` means "never".
    next_update_time: Option<Instant>,
    config_changed: bool,
    forced_to_reload: bool,
}

impl ObjectInfo {
    fn new(name: String, config: Arc<ObjectConfig>) -> Self {
        Self {
            name,
            config,
            object: None,
            exception: None,
            loading_id: 0,
            loading_start_time: None,
            loading_end_time: None,
            error_count: 0,
            next_update_time: None,
            config_changed: false,
            forced_to_reload: false,
        }
    }

    fn loaded(&self) -> bool {
        self.object.is_some()
    }

    fn failed(&self) -> bool {
        self.object.is_none() && self.exception.is_some()
    }

    fn loading(&self) -> bool {
        self.loading_id != 0
    }

    fn tried_to_load(&self) -> bool {
        self.loaded() || self.failed() || self.loading()
    }

    fn ready(&self) -> bool {
        (self.loaded() || self.failed()) && !self.forced_to_reload
    }

    fn failed_to_reload(&self) -> bool {
        self.loaded() && self.exception.is_some()
    }

    fn is_outdated(&self, now: Instant) -> bool {
        self.next_update_time.is_some_and(|at| now >= at)
    }

    fn status(&self) -> Status {
        if self.object.is_some() {
            if self.loading() {
                Status::LoadedAndReloading
            } else {
                Status::Loaded
            }
        } else if self.exception.is_some() {
            if self.loading() {
                Status::FailedAndReloading
            } else {
                Status::Failed
            }
        } else if self.loading() {
            Status::Loading
        } else {
            Status::NotLoaded
        }
    }

    fn loading_duration(&self) -> Duration {
        let Some(start) = self.loading_start_time else {
            return Duration::ZERO;
        };
        if self.loading() {
            return start.elapsed();
        }
        match self.loading_end_time {
            Some(end) => end.saturating_duration_since(start),
            None => Duration::ZERO,
        }
    }

    fn load_result(&self) -> LoadResult {
        LoadResult {
            name: self.name.clone(),
            status: self.status(),
            object: self.object.clone(),
            exception: self.exception.clone(),
            loading_start_time: self.loading_start_time,
            loading_duration: self.loading_duration(),
            origin: self.config.path.clone(),
            repository_name: self.config.repository_name.clone(),
        }
    }
}

/// A load scheduled while async loading is disabled. Lock-holding paths
/// collect these and run them after releasing the guard, so the factory is
/// always invoked unlocked.
struct SyncLoad {
    name: String,
    loading_id: u64,
}

struct State {
    /// Last applied snapshot; compared by pointer identity so re-applying
    /// the same snapshot is free.
    configs: Option<ObjectConfigs>,
    infos: HashMap<String, ObjectInfo>,
    always_load_everything: bool,
    async_loading: bool,
    /// Handles of in-flight async loads, keyed by `loading_id`. Entries are
    /// removed (detached) when their task finishes; whatever remains is
    /// joined by `shutdown`.
    loading_handles: HashMap<u64, JoinHandle<()>>,
    next_loading_id: u64,
    rng: StdRng,
}

impl State {
    /// Assign a fresh loading id and either spawn a worker task or queue the
    /// load for inline execution after the lock is dropped.
    fn start_loading(&mut self, shared: &Arc<Shared>, name: &str, pending: &mut Vec<SyncLoad>) {
        if self.infos.get(name).map_or(true, |info| info.loading()) {
            return;
        }

        let loading_id = self.next_loading_id;
        self.next_loading_id += 1;

        let Some(info) = self.infos.get_mut(name) else {
            return;
        };
        info.loading_id = loading_id;
        info.loading_start_time = Some(Instant::now());
        info.loading_end_time = None;

        if self.async_loading {
            let shared = Arc::clone(shared);
            let task_name = name.to_string();
            let handle =
                tokio::task::spawn_blocking(move || do_loading(&shared, &task_name, loading_id));
            self.loading_handles.insert(loading_id, handle);
        } else {
            pending.push(SyncLoad {
                name: name.to_string(),
                loading_id,
            });
        }
    }

    /// Forget an in-flight load. The worker is not interrupted; its
    /// completion will observe the token mismatch and discard itself.
    fn cancel_loading(&mut self, name: &str) {
        if let Some(info) = self.infos.get_mut(name) {
            if info.loading() {
                info.loading_id = 0;
                info.loading_end_time = Some(Instant::now());
            }
        }
    }

    /// Wait-predicate body for a single name. Returns the final result once
    /// the name is absent or ready, scheduling a load first if none was
    /// attempted.
    fn ensure_single(
        &mut self,
        shared: &Arc<Shared>,
        name: &str,
        pending: &mut Vec<SyncLoad>,
    ) -> Option<LoadResult> {
        let (done, needs_start) = match self.infos.get(name) {
            None => (Some(LoadResult::not_exists(name)), false),
            Some(info) if info.ready() => (Some(info.load_result()), false),
            Some(info) => (None, !info.loading()),
        };
        if needs_start {
            self.start_loading(shared, name, pending);
        }
        done
    }

    /// Wait-predicate body for a filter: schedules loads for every matching
    /// name that was never attempted and reports whether all are ready.
    fn ensure_matching(
        &mut self,
        shared: &Arc<Shared>,
        filter: &dyn Fn(&str) -> bool,
        pending: &mut Vec<SyncLoad>,
    ) -> bool {
        let mut to_start = Vec::new();
        let mut all_ready = true;
        for (name, info) in &self.infos {
            if !filter(name) || info.ready() {
                continue;
            }
            if !info.loading() {
                to_start.push(name.clone());
            }
            all_ready = false;
        }
        for name in &to_start {
            self.start_loading(shared, name, pending);
        }
        all_ready
    }

    fn snapshot_single(&self, name: &str) -> LoadResult {
        self.infos
            .get(name)
            .map(ObjectInfo::load_result)
            .unwrap_or_else(|| LoadResult::not_exists(name))
    }

    fn snapshot_matching(&self, filter: &dyn Fn(&str) -> bool) -> Vec<LoadResult> {
        self.infos
            .iter()
            .filter(|(name, _)| filter(name))
            .map(|(_, info)| info.load_result())
            .collect()
    }
}

struct Shared {
    state: Mutex<State>,
    /// Condition variable bound to `state`: signalled on every change a
    /// waiter could care about.
    notify: Notify,
    factory: Arc<dyn LoadableFactory>,
    type_name: String,
    settings: UpdateSettings,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Drives every object through its load lifecycle.
///
/// One mutex guards all state; the heavy work (the factory call, the
/// `is_modified` probe) always runs with the lock released. A load attempt
/// is identified by its `loading_id`: completions whose token no longer
/// matches publish nothing, which is the sole cancellation mechanism.
pub struct LoadingDispatcher {
    shared: Arc<Shared>,
}

impl LoadingDispatcher {
    pub fn new(
        factory: Arc<dyn LoadableFactory>,
        type_name: impl Into<String>,
        settings: UpdateSettings,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    configs: None,
                    infos: HashMap::new(),
                    always_load_everything: false,
                    async_loading: false,
                    loading_handles: HashMap::new(),
                    next_loading_id: 1,
                    rng: StdRng::from_entropy(),
                }),
                notify: Notify::new(),
                factory,
                type_name: type_name.into(),
                settings,
            }),
        }
    }

    /// Apply a new unified snapshot: drop removed names, pick up changed
    /// definitions (restarting loads for objects already in use), insert new
    /// names.
    pub fn set_configuration(&self, new_configs: ObjectConfigs) {
        let mut pending = Vec::new();
        {
            let mut state = self.shared.lock_state();
            if state
                .configs
                .as_ref()
                .is_some_and(|configs| Arc::ptr_eq(configs, &new_configs))
            {
                return;
            }
            state.configs = Some(Arc::clone(&new_configs));

            let mut removed_names = Vec::new();
            let mut restart_names = Vec::new();
            for (name, info) in state.infos.iter_mut() {
                match new_configs.get(name) {
                    None => removed_names.push(name.clone()),
                    Some(new_config) => {
                        let config_is_same = is_same_configuration(&info.config, new_config);
                        info.config = Arc::clone(new_config);
                        if !config_is_same {
                            info.config_changed = true;
                            if info.tried_to_load() {
                                // The object is or was in use; reload it with
                                // the new definition.
                                restart_names.push(name.clone());
                            }
                        }
                    }
                }
            }
            for name in &restart_names {
                state.cancel_loading(name);
                state.start_loading(&self.shared, name, &mut pending);
            }

            let mut new_names = Vec::new();
            for (name, config) in new_configs.iter() {
                if !state.infos.contains_key(name) {
                    state
                        .infos
                        .insert(name.clone(), ObjectInfo::new(name.clone(), Arc::clone(config)));
                    if state.always_load_everything {
                        new_names.push(name.clone());
                    }
                }
            }
            for name in &new_names {
                state.start_loading(&self.shared, name, &mut pending);
            }

            for name in &removed_names {
                state.infos.remove(name);
            }

            // Names appeared or disappeared: waiters must recheck.
            self.shared.notify.notify_waiters();
        }
        self.run_pending(pending);
    }

    /// When enabled, every known object is loaded even if nobody asked for
    /// it yet.
    pub fn enable_always_load_everything(&self, enable: bool) {
        let mut pending = Vec::new();
        {
            let mut state = self.shared.lock_state();
            if state.always_load_everything == enable {
                return;
            }
            state.always_load_everything = enable;

            if enable {
                let untried: Vec<String> = state
                    .infos
                    .values()
                    .filter(|info| !info.tried_to_load())
                    .map(|info| info.name.clone())
                    .collect();
                for name in &untried {
                    state.start_loading(&self.shared, name, &mut pending);
                }
            }
        }
        self.run_pending(pending);
    }

    /// Toggle between worker-task loads and inline loads in the caller's
    /// context.
    pub fn enable_async_loading(&self, enable: bool) {
        self.shared.lock_state().async_loading = enable;
    }

    pub fn get_current_status(&self, name: &str) -> Status {
        let state = self.shared.lock_state();
        state
            .infos
            .get(name)
            .map(ObjectInfo::status)
            .unwrap_or(Status::NotExist)
    }

    /// Snapshot query; never triggers a load.
    pub fn get_current_load_result(&self, name: &str) -> LoadResult {
        self.shared.lock_state().snapshot_single(name)
    }

    /// Snapshot query over all names accepted by the filter.
    pub fn get_current_load_results(&self, filter: impl Fn(&str) -> bool) -> Vec<LoadResult> {
        self.shared.lock_state().snapshot_matching(&filter)
    }

    pub fn get_number_of_currently_loaded_objects(&self) -> usize {
        let state = self.shared.lock_state();
        state.infos.values().filter(|info| info.loaded()).count()
    }

    pub fn has_currently_loaded_objects(&self) -> bool {
        let state = self.shared.lock_state();
        state.infos.values().any(|info| info.loaded())
    }

    pub fn get_all_tried_to_load_names(&self) -> Vec<String> {
        let state = self.shared.lock_state();
        state
            .infos
            .values()
            .filter(|info| info.tried_to_load())
            .map(|info| info.name.clone())
            .collect()
    }

    /// Ensure the object has at least been attempted and wait up to
    /// `timeout` (`None` = indefinitely) for it to become ready. Returns
    /// whatever is current when the wait ends.
    pub async fn try_load(&self, name: &str, timeout: Option<Duration>) -> LoadResult {
        let deadline = timeout.map(|timeout| tokio::time::Instant::now() + timeout);
        loop {
            let notified = self.shared.notify.notified();

            let mut pending = Vec::new();
            let done = {
                let mut state = self.shared.lock_state();
                state.ensure_single(&self.shared, name, &mut pending)
            };
            if let Some(result) = done {
                return result;
            }
            if !pending.is_empty() {
                self.run_pending(pending);
                if deadline.is_some_and(|deadline| tokio::time::Instant::now() >= deadline) {
                    return self.shared.lock_state().snapshot_single(name);
                }
                continue;
            }

            match deadline {
                None => notified.await,
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return self.shared.lock_state().snapshot_single(name);
                    }
                }
            }
        }
    }

    /// Filter form of [`try_load`](Self::try_load): waits for every matching
    /// name to become ready.
    pub async fn try_load_matching(
        &self,
        filter: impl Fn(&str) -> bool,
        timeout: Option<Duration>,
    ) -> Vec<LoadResult> {
        let deadline = timeout.map(|timeout| tokio::time::Instant::now() + timeout);
        loop {
            let notified = self.shared.notify.notified();

            let mut pending = Vec::new();
            let done = {
                let mut state = self.shared.lock_state();
                if state.ensure_matching(&self.shared, &filter, &mut pending) {
                    Some(state.snapshot_matching(&filter))
                } else {
                    None
                }
            };
            if let Some(results) = done {
                return results;
            }
            if !pending.is_empty() {
                self.run_pending(pending);
                if deadline.is_some_and(|deadline| tokio::time::Instant::now() >= deadline) {
                    return self.shared.lock_state().snapshot_matching(&filter);
                }
                continue;
            }

            match deadline {
                None => notified.await,
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return self.shared.lock_state().snapshot_matching(&filter);
                    }
                }
            }
        }
    }

    /// Like [`try_load`](Self::try_load), but first discards any in-flight
    /// attempt and forces a fresh load even if the object is ready.
    pub async fn try_load_or_reload(&self, name: &str, timeout: Option<Duration>) -> LoadResult {
        {
            let mut state = self.shared.lock_state();
            if !state.infos.contains_key(name) {
                return LoadResult::not_exists(name);
            }
            state.cancel_loading(name);
            if let Some(info) = state.infos.get_mut(name) {
                info.forced_to_reload = true;
            }
        }
        self.try_load(name, timeout).await
    }

    /// Filter form of [`try_load_or_reload`](Self::try_load_or_reload).
    pub async fn try_load_or_reload_matching(
        &self,
        filter: impl Fn(&str) -> bool,
        timeout: Option<Duration>,
    ) -> Vec<LoadResult> {
        {
            let mut state = self.shared.lock_state();
            let matching: Vec<String> = state
                .infos
                .keys()
                .filter(|name| filter(name))
                .cloned()
                .collect();
            for name in &matching {
                state.cancel_loading(name);
                if let Some(info) = state.infos.get_mut(name) {
                    info.forced_to_reload = true;
                }
            }
        }
        self.try_load_matching(filter, timeout).await
    }

    /// Reload objects whose freshness window elapsed.
    ///
    /// Three phases keep the `is_modified` probe outside the lock: collect
    /// candidates, probe them unlocked, then start loads (or just advance
    /// the schedule) for those still due.
    pub fn reload_outdated(&self) {
        struct Candidate {
            name: String,
            object: Arc<dyn Loadable>,
            should_update: bool,
        }

        let mut candidates: Vec<Candidate> = {
            let state = self.shared.lock_state();
            let now = Instant::now();
            state
                .infos
                .values()
                .filter(|info| info.is_outdated(now) && !info.loading() && info.loaded())
                .filter_map(|info| {
                    info.object.as_ref().map(|object| Candidate {
                        name: info.name.clone(),
                        object: Arc::clone(object),
                        // A failed reload forces the next attempt without
                        // asking the object.
                        should_update: info.failed_to_reload(),
                    })
                })
                .collect()
        };

        for candidate in &mut candidates {
            if candidate.should_update {
                continue;
            }
            match candidate.object.is_modified() {
                Ok(modified) => candidate.should_update = modified,
                Err(e) => {
                    tracing::warn!(
                        "could not check if {} '{}' was modified: {}",
                        self.shared.type_name,
                        candidate.name,
                        e
                    );
                    // Cannot check, so reload.
                    candidate.should_update = true;
                }
            }
        }

        let mut pending = Vec::new();
        {
            let mut state = self.shared.lock_state();
            let now = Instant::now();

            enum Action {
                Start(String),
                Advance(String),
            }

            let mut actions = Vec::new();
            for (name, info) in &state.infos {
                if !info.is_outdated(now) || info.loading() {
                    continue;
                }
                if let Some(object) = &info.object {
                    let verdict = candidates
                        .iter()
                        .find(|c| c.name == *name && Arc::ptr_eq(&c.object, object));
                    match verdict {
                        // The object was replaced while the lock was
                        // released; leave it to the next pass.
                        None => continue,
                        Some(candidate) if candidate.should_update => {
                            actions.push(Action::Start(name.clone()));
                        }
                        Some(_) => actions.push(Action::Advance(name.clone())),
                    }
                } else if info.failed() {
                    actions.push(Action::Start(name.clone()));
                }
            }

            for action in actions {
                match action {
                    Action::Start(name) => state.start_loading(&self.shared, &name, &mut pending),
                    Action::Advance(name) => {
                        let snapshot = state
                            .infos
                            .get(&name)
                            .map(|info| (info.object.clone(), info.error_count));
                        if let Some((object, error_count)) = snapshot {
                            let next = calculate_next_update_time(
                                &mut state.rng,
                                &self.shared.settings,
                                object.as_ref(),
                                error_count,
                            );
                            if let Some(info) = state.infos.get_mut(&name) {
                                info.next_update_time = next;
                            }
                        }
                    }
                }
            }
        }
        self.run_pending(pending);
    }

    /// Tear down: clear the info map so late completions find no target,
    /// then wake and join every outstanding worker.
    pub async fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut state = self.shared.lock_state();
            state.infos.clear();
            state.loading_handles.drain().map(|(_, handle)| handle).collect()
        };
        self.shared.notify.notify_waiters();
        for handle in handles {
            let _ = handle.await;
        }
    }

    fn run_pending(&self, pending: Vec<SyncLoad>) {
        for load in pending {
            do_loading(&self.shared, &load.name, load.loading_id);
        }
    }
}

/// One load attempt, identified by `loading_id`. Runs on a worker thread
/// (async mode) or inline in the scheduling task (sync mode); either way the
/// factory is called with the lock released.
fn do_loading(shared: &Arc<Shared>, name: &str, loading_id: u64) {
    // Re-check that this is still the attempt we planned: the object could
    // have been removed or rescheduled before this point.
    let snapshot = {
        let state = shared.lock_state();
        match state.infos.get(name) {
            Some(info) if info.loading() && info.loading_id == loading_id => Some((
                Arc::clone(&info.config),
                info.object.clone(),
                info.config_changed || info.forced_to_reload,
                info.error_count,
            )),
            _ => None,
        }
    };

    let Some((config, previous_version, complete_reload, error_count)) = snapshot else {
        shared.lock_state().loading_handles.remove(&loading_id);
        return;
    };

    // On a complete reload the factory must not mutate the previous
    // version, so it gets none.
    let previous_to_use = if complete_reload {
        None
    } else {
        previous_version.clone()
    };

    // A panicking factory must not leave the object stuck in `loading`;
    // treat the panic as a failed attempt.
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        shared
            .factory
            .create_object(name, &config, previous_to_use.as_ref())
    }))
    .unwrap_or_else(|_| {
        Err(LoaderError::Internal(format!(
            "factory panicked while loading '{name}'"
        )))
    });

    {
        let mut state = shared.lock_state();
        process_load_result(
            &mut state,
            shared,
            name,
            loading_id,
            previous_version,
            result,
            error_count,
        );
        state.loading_handles.remove(&loading_id);
    }
    shared.notify.notify_waiters();
}

/// Publish a completed attempt, unless its token went stale meanwhile.
fn process_load_result(
    state: &mut State,
    shared: &Shared,
    name: &str,
    loading_id: u64,
    previous_version: Option<Arc<dyn Loadable>>,
    result: Result<Arc<dyn Loadable>, LoaderError>,
    previous_error_count: u64,
) {
    let (new_object, new_exception) = match result {
        Ok(object) => (Some(object), None),
        Err(e) => (None, Some(Arc::new(e))),
    };

    let error_count = if new_exception.is_some() {
        previous_error_count + 1
    } else {
        0
    };

    let policy_object = new_object.as_ref().or(previous_version.as_ref());
    let next_update_time = calculate_next_update_time(
        &mut state.rng,
        &shared.settings,
        policy_object,
        error_count,
    );

    let Some(info) = state.infos.get_mut(name) else {
        return;
    };
    // The object could have been removed or rescheduled with another config
    // while the lock was released; a stale attempt publishes nothing.
    if !info.loading() || info.loading_id != loading_id {
        return;
    }

    if let Some(exception) = &new_exception {
        let schedule = match next_update_time {
            Some(at) => format!(
                ", next update is scheduled in {}s",
                at.saturating_duration_since(Instant::now()).as_secs()
            ),
            None => String::new(),
        };
        if previous_version.is_some() {
            tracing::error!(
                "could not update {} '{}', leaving the previous version{}: {}",
                shared.type_name,
                name,
                schedule,
                exception
            );
        } else {
            tracing::error!(
                "could not load {} '{}'{}: {}",
                shared.type_name,
                name,
                schedule,
                exception
            );
        }
    }

    if let Some(object) = new_object {
        info.object = Some(object);
        info.config_changed = false;
        // A forced reload stays forced until an attempt succeeds.
        info.forced_to_reload = false;
    }
    info.exception = new_exception;
    info.error_count = error_count;
    info.loading_end_time = Some(Instant::now());
    info.loading_id = 0;
    info.next_update_time = next_update_time;
}

/// When the object should be reloaded next. `None` means never: the object
/// rejects updates or its lifetime window is `(0, 0)`. Failures reschedule
/// on the backoff curve even when a previous version is still live.
fn calculate_next_update_time(
    rng: &mut StdRng,
    settings: &UpdateSettings,
    object: Option<&Arc<dyn Loadable>>,
    error_count: u64,
) -> Option<Instant> {
    if let Some(object) = object {
        if !object.support_updates() {
            return None;
        }

        let lifetime = object.lifetime();
        if lifetime.is_never() {
            return None;
        }

        if error_count == 0 {
            let upper = lifetime.max_secs.max(lifetime.min_secs);
            let secs = rng.gen_range(lifetime.min_secs..=upper);
            return Some(Instant::now() + Duration::from_secs(secs));
        }
    }

    let backoff = reload_backoff(
        rng,
        error_count,
        settings.backoff_initial_secs,
        settings.backoff_max_secs,
    );
    Some(Instant::now() + backoff)
}
