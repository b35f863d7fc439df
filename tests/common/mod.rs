//! Shared fakes for the loader integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

use hotload::{Lifetime, Loadable, LoadableFactory, LoaderError, ObjectConfig};

/// Opt-in tracing output for debugging test runs (RUST_LOG=hotload=debug).
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hotload=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// A definition file with a single object named `name`.
pub fn definition(name: &str, rev: u64) -> Value {
    let mut root = serde_json::Map::new();
    root.insert(format!("object_{name}"), json!({"name": name, "rev": rev}));
    Value::Object(root)
}

/// Poll `cond` until it holds or several seconds pass (long enough to span
/// two periodic-updater ticks).
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..1200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// Object produced by [`FakeFactory`]. The version of the load attempt that
/// built it is baked into the diagnostic name ("a-v2"), which is how tests
/// observe which attempt's result got published.
#[derive(Debug)]
pub struct FakeLoadable {
    name: String,
    pub version: u64,
    lifetime: Lifetime,
    supports_updates: bool,
    modified: Arc<AtomicBool>,
}

impl Loadable for FakeLoadable {
    fn name(&self) -> &str {
        &self.name
    }

    fn support_updates(&self) -> bool {
        self.supports_updates
    }

    fn lifetime(&self) -> Lifetime {
        self.lifetime
    }

    fn is_modified(&self) -> Result<bool, LoaderError> {
        Ok(self.modified.load(Ordering::SeqCst))
    }

    fn clone_loadable(&self) -> Arc<dyn Loadable> {
        Arc::new(FakeLoadable {
            name: self.name.clone(),
            version: self.version,
            lifetime: self.lifetime,
            supports_updates: self.supports_updates,
            modified: Arc::clone(&self.modified),
        })
    }
}

/// Programmable factory: failures, delays and a hold gate are steered from
/// the test body while loads run on worker threads.
pub struct FakeFactory {
    attempts: AtomicU64,
    creates: AtomicU64,
    fail_next: AtomicU64,
    fail_names: Mutex<HashSet<String>>,
    delay: Mutex<Duration>,
    hold: AtomicBool,
    lifetime: Mutex<Lifetime>,
    supports_updates: AtomicBool,
    modified: Arc<AtomicBool>,
}

impl FakeFactory {
    pub fn new() -> Self {
        Self {
            attempts: AtomicU64::new(0),
            creates: AtomicU64::new(0),
            fail_next: AtomicU64::new(0),
            fail_names: Mutex::new(HashSet::new()),
            delay: Mutex::new(Duration::ZERO),
            hold: AtomicBool::new(false),
            lifetime: Mutex::new(Lifetime::new(0, 0)),
            supports_updates: AtomicBool::new(true),
            modified: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Number of load attempts handed to the factory.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Number of full builds (attempts that did not reuse a previous
    /// version).
    pub fn creates(&self) -> u64 {
        self.creates.load(Ordering::SeqCst)
    }

    /// Fail the next `n` attempts.
    pub fn fail_times(&self, n: u64) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Fail every attempt for this object until cleared.
    pub fn fail_object(&self, name: &str) {
        self.fail_names.lock().unwrap().insert(name.to_string());
    }

    pub fn clear_failures(&self) {
        self.fail_next.store(0, Ordering::SeqCst);
        self.fail_names.lock().unwrap().clear();
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    /// While set, attempts spin inside the factory until released.
    pub fn set_hold(&self, hold: bool) {
        self.hold.store(hold, Ordering::SeqCst);
    }

    pub fn set_lifetime(&self, lifetime: Lifetime) {
        *self.lifetime.lock().unwrap() = lifetime;
    }

    pub fn set_supports_updates(&self, supports: bool) {
        self.supports_updates.store(supports, Ordering::SeqCst);
    }

    pub fn set_modified(&self, modified: bool) {
        self.modified.store(modified, Ordering::SeqCst);
    }

    fn build(&self, name: &str, version: u64) -> Result<Arc<dyn Loadable>, LoaderError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeLoadable {
            name: format!("{name}-v{version}"),
            version,
            lifetime: *self.lifetime.lock().unwrap(),
            supports_updates: self.supports_updates.load(Ordering::SeqCst),
            modified: Arc::clone(&self.modified),
        }))
    }
}

impl LoadableFactory for FakeFactory {
    fn create(
        &self,
        name: &str,
        _config: &Value,
        _key_in_config: &str,
    ) -> Result<Arc<dyn Loadable>, LoaderError> {
        let version = self.attempts.load(Ordering::SeqCst).max(1);
        self.build(name, version)
    }

    fn create_object(
        &self,
        name: &str,
        _config: &ObjectConfig,
        previous_version: Option<&Arc<dyn Loadable>>,
    ) -> Result<Arc<dyn Loadable>, LoaderError> {
        let version = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        while self.hold.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(2));
        }

        if self.fail_names.lock().unwrap().contains(name) {
            return Err(LoaderError::load_failed(name, "synthetic failure"));
        }
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(LoaderError::load_failed(name, "synthetic failure"));
        }

        if let Some(previous) = previous_version {
            return Ok(previous.clone_loadable());
        }
        self.build(name, version)
    }
}
