//! Reload behavior: config changes, forced reloads, backoff, the outdated
//! sweep and the periodic updater.

use std::sync::Arc;
use std::time::Duration;

use hotload::{
    ConfigReader, Lifetime, Loader, LoaderError, LoadingDispatcher, MemoryRepository,
    ObjectConfigSettings, Status, UpdateSettings,
};

mod common;
use common::{definition, wait_until, FakeFactory};

fn setup() -> (Arc<Loader>, Arc<MemoryRepository>, Arc<FakeFactory>) {
    common::init_tracing();
    let factory = Arc::new(FakeFactory::new());
    let loader = Arc::new(Loader::new("dictionary", factory.clone()));
    let repo = Arc::new(MemoryRepository::new());
    loader.add_repository("r1", repo.clone(), ObjectConfigSettings::default());
    (loader, repo, factory)
}

fn dispatcher_setup() -> (
    Arc<LoadingDispatcher>,
    Arc<ConfigReader>,
    Arc<MemoryRepository>,
    Arc<FakeFactory>,
) {
    common::init_tracing();
    let factory = Arc::new(FakeFactory::new());
    let dispatcher = Arc::new(LoadingDispatcher::new(
        factory.clone(),
        "dictionary",
        UpdateSettings {
            backoff_initial_secs: 0,
            backoff_max_secs: 0,
        },
    ));
    let reader = Arc::new(ConfigReader::new("dictionary"));
    let repo = Arc::new(MemoryRepository::new());
    reader.add_repository("r1", repo.clone(), ObjectConfigSettings::default());
    (dispatcher, reader, repo, factory)
}

#[tokio::test]
async fn test_config_change_triggers_reload() {
    let (loader, repo, factory) = setup();

    repo.set("a.toml", definition("a", 1));
    loader.reload_config();
    let v1 = loader.load("a").await.unwrap();
    assert_eq!(v1.name(), "a-v1");

    repo.set("a.toml", definition("a", 2));
    loader.reload_config();

    // The definition changed, so the reload was a full rebuild.
    let result = loader.get_current_load_result("a");
    assert_eq!(result.status, Status::Loaded);
    assert_eq!(result.object.unwrap().name(), "a-v2");
    assert!(result.exception.is_none());
    assert_eq!(factory.creates(), 2);
}

#[tokio::test]
async fn test_same_configuration_is_idempotent() {
    let (loader, repo, factory) = setup();

    repo.set("a.toml", definition("a", 1));
    loader.reload_config();
    loader.load("a").await.unwrap();
    assert_eq!(factory.attempts(), 1);

    // Unchanged files: the reader hands back the identical snapshot.
    loader.reload_config();
    loader.reload_config();
    assert_eq!(factory.attempts(), 1);

    // Re-written file with identical contents: new snapshot, same subtree,
    // still no reload.
    repo.set("a.toml", definition("a", 1));
    loader.reload_config();
    assert_eq!(factory.attempts(), 1);
}

#[tokio::test]
async fn test_transient_failure_then_forced_recovery() {
    let (loader, repo, factory) = setup();

    repo.set("a.toml", definition("a", 1));
    loader.reload_config();

    factory.fail_times(1);
    let err = loader.load("a").await.unwrap_err();
    assert!(matches!(err, LoaderError::LoadFailed { .. }));
    assert_eq!(loader.get_current_status("a"), Status::Failed);
    assert!(loader.get_current_load_result("a").exception.is_some());

    // A plain load on a failed object reports the stored failure without
    // retrying.
    let err = loader.load("a").await.unwrap_err();
    assert!(matches!(err, LoaderError::LoadFailed { .. }));
    assert_eq!(factory.attempts(), 1);

    // A forced reload keeps attempting until one succeeds.
    factory.fail_times(1);
    let object = loader.load_or_reload("a").await.unwrap();
    assert_eq!(object.name(), "a-v3");
    assert_eq!(loader.get_current_status("a"), Status::Loaded);
    assert!(loader.get_current_load_result("a").exception.is_none());
    assert_eq!(factory.attempts(), 3);
}

#[tokio::test]
async fn test_failed_reload_keeps_previous_object() {
    let (loader, repo, factory) = setup();

    repo.set("a.toml", definition("a", 1));
    loader.reload_config();
    loader.load("a").await.unwrap();

    factory.fail_times(1);
    repo.set("a.toml", definition("a", 2));
    loader.reload_config();

    let result = loader.get_current_load_result("a");
    assert_eq!(result.status, Status::Loaded);
    assert_eq!(result.object.clone().unwrap().name(), "a-v1");
    assert!(result.exception.is_some());

    // A plain query keeps serving the old object; the strict gate reports
    // the reload failure.
    assert!(loader.check_loaded(&result, false).is_ok());
    let err = loader.check_loaded(&result, true).unwrap_err();
    assert!(matches!(err, LoaderError::LoadFailed { .. }));
}

#[tokio::test]
async fn test_disappearance_discards_inflight_load() {
    let (loader, repo, factory) = setup();
    loader.enable_async_loading(true);
    factory.set_delay(Duration::from_millis(100));

    repo.set("a.toml", definition("a", 1));
    loader.reload_config();

    let result = loader.try_load("a", Some(Duration::ZERO)).await;
    assert_eq!(result.status, Status::Loading);

    repo.remove("a.toml");
    loader.reload_config();
    assert_eq!(loader.get_current_status("a"), Status::NotExist);

    // The in-flight attempt completes and its result is dropped on the
    // floor.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(loader.get_current_status("a"), Status::NotExist);
    assert_eq!(factory.attempts(), 1);
}

#[tokio::test]
async fn test_collision_first_registered_repository_wins() {
    common::init_tracing();
    let factory = Arc::new(FakeFactory::new());
    let loader = Loader::new("dictionary", factory.clone());
    let r1 = Arc::new(MemoryRepository::new());
    let r2 = Arc::new(MemoryRepository::new());
    loader.add_repository("r1", r1.clone(), ObjectConfigSettings::default());
    loader.add_repository("r2", r2.clone(), ObjectConfigSettings::default());

    r1.set("one.toml", definition("a", 1));
    r2.set("two.toml", definition("a", 2));
    loader.reload_config();

    let result = loader.try_load("a", None).await;
    assert_eq!(result.status, Status::Loaded);
    assert_eq!(result.repository_name, "r1");
    assert_eq!(result.origin, "one.toml");
}

#[tokio::test]
async fn test_forced_reload_discards_inflight_attempt() {
    let (loader, repo, factory) = setup();
    loader.enable_async_loading(true);

    repo.set("a.toml", definition("a", 1));
    loader.reload_config();

    factory.set_hold(true);
    let result = loader.try_load("a", Some(Duration::ZERO)).await;
    assert_eq!(result.status, Status::Loading);
    wait_until(|| factory.attempts() == 1).await;

    // Force a reload while the first attempt is stuck in the factory.
    let forced = tokio::spawn({
        let loader = Arc::clone(&loader);
        async move { loader.load_or_reload("a").await }
    });
    wait_until(|| factory.attempts() == 2).await;
    factory.set_hold(false);

    let object = forced.await.unwrap().unwrap();

    // Both attempts ran to completion, only the newer one published.
    assert_eq!(factory.attempts(), 2);
    assert_eq!(object.name(), "a-v2");
    let result = loader.get_current_load_result("a");
    assert_eq!(result.object.unwrap().name(), "a-v2");
    assert_eq!(result.status, Status::Loaded);
}

#[tokio::test]
async fn test_reload_outdated_gates_on_modification() {
    let (dispatcher, reader, repo, factory) = dispatcher_setup();
    factory.set_lifetime(Lifetime::new(0, 1));

    repo.set("a.toml", definition("a", 1));
    dispatcher.set_configuration(reader.read());
    dispatcher.try_load("a", None).await;
    assert_eq!(factory.attempts(), 1);

    // Past the freshness window but unmodified: the window just advances.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    dispatcher.reload_outdated();
    assert_eq!(factory.attempts(), 1);
    assert_eq!(dispatcher.get_current_status("a"), Status::Loaded);

    // Modified: the sweep starts a reload, reusing the previous version.
    factory.set_modified(true);
    tokio::time::sleep(Duration::from_millis(1100)).await;
    dispatcher.reload_outdated();
    wait_until(|| factory.attempts() == 2).await;
    assert_eq!(factory.creates(), 1);
    assert_eq!(dispatcher.get_current_status("a"), Status::Loaded);
}

#[tokio::test]
async fn test_objects_without_update_support_are_never_reloaded() {
    let (dispatcher, reader, repo, factory) = dispatcher_setup();
    factory.set_lifetime(Lifetime::new(0, 1));
    factory.set_supports_updates(false);
    factory.set_modified(true);

    repo.set("a.toml", definition("a", 1));
    dispatcher.set_configuration(reader.read());
    dispatcher.try_load("a", None).await;

    tokio::time::sleep(Duration::from_millis(1100)).await;
    dispatcher.reload_outdated();
    assert_eq!(factory.attempts(), 1);
}

#[tokio::test]
async fn test_reload_outdated_retries_failed_objects() {
    let (dispatcher, reader, repo, factory) = dispatcher_setup();

    repo.set("a.toml", definition("a", 1));
    dispatcher.set_configuration(reader.read());

    factory.fail_times(1);
    let result = dispatcher.try_load("a", None).await;
    assert_eq!(result.status, Status::Failed);

    // Zero backoff in this setup: the failed object is due immediately.
    dispatcher.reload_outdated();
    wait_until(|| dispatcher.get_current_status("a") == Status::Loaded).await;
    assert_eq!(factory.attempts(), 2);
}

#[tokio::test]
async fn test_periodic_updater_picks_up_changes() {
    let (loader, repo, _factory) = setup();
    loader.enable_always_load_everything(true);
    loader.enable_periodic_updates(true).await;
    // Enabling twice is a no-op.
    loader.enable_periodic_updates(true).await;

    repo.set("a.toml", definition("a", 1));
    wait_until(|| loader.get_current_status("a") == Status::Loaded).await;
    assert_eq!(loader.get_currently_loaded_objects_matching(|n| n == "a").len(), 1);

    loader.enable_periodic_updates(false).await;
    loader.enable_periodic_updates(false).await;
    loader.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_joins_inflight_loads() {
    let (loader, repo, factory) = setup();
    loader.enable_async_loading(true);
    factory.set_delay(Duration::from_millis(100));

    repo.set("a.toml", definition("a", 1));
    loader.reload_config();
    let result = loader.try_load("a", Some(Duration::ZERO)).await;
    assert_eq!(result.status, Status::Loading);

    loader.shutdown().await;
    assert_eq!(factory.attempts(), 1);
    assert_eq!(loader.get_current_status("a"), Status::NotExist);
}

#[tokio::test]
async fn test_reload_all_tried_to_load() {
    let (loader, repo, factory) = setup();

    repo.set("a.toml", definition("a", 1));
    repo.set("b.toml", definition("b", 1));
    loader.reload_config();
    loader.load("a").await.unwrap();
    assert_eq!(factory.attempts(), 1);

    let objects = loader.reload_all_tried_to_load().await.unwrap();
    assert_eq!(objects.len(), 1);
    // Only "a" was ever attempted; the forced pass rebuilt just it.
    assert_eq!(objects[0].name(), "a-v2");
    assert_eq!(loader.get_current_status("b"), Status::NotLoaded);
}

#[tokio::test]
async fn test_remove_repository_drops_its_objects() {
    let (loader, repo, _factory) = setup();

    repo.set("a.toml", definition("a", 1));
    loader.reload_config();
    loader.load("a").await.unwrap();

    let removed = loader.remove_repository("r1");
    assert!(removed.is_some());
    assert_eq!(loader.get_current_status("a"), Status::NotExist);
}
