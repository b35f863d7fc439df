//! Periodic reconciliation loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use crate::config::ConfigReader;
use crate::dispatcher::LoadingDispatcher;

/// How often the background task rescans repositories and reloads outdated
/// objects.
const CHECK_PERIOD: Duration = Duration::from_secs(5);

struct UpdaterTask {
    stop_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

/// Background task that keeps the dispatcher in sync with the repositories.
///
/// Every tick it rescans all repositories, applies the resulting snapshot
/// and asks the dispatcher to reload whatever became outdated. Enable and
/// disable are idempotent; disabling wakes the sleep immediately and waits
/// for the task to finish.
pub struct PeriodicUpdater {
    reader: Arc<ConfigReader>,
    dispatcher: Arc<LoadingDispatcher>,
    task: Mutex<Option<UpdaterTask>>,
}

impl PeriodicUpdater {
    pub fn new(reader: Arc<ConfigReader>, dispatcher: Arc<LoadingDispatcher>) -> Self {
        Self {
            reader,
            dispatcher,
            task: Mutex::new(None),
        }
    }

    pub async fn enable(&self, enable: bool) {
        let mut task = self.task.lock().await;

        if enable {
            if task.is_some() {
                return;
            }

            let (stop_tx, mut stop_rx) = broadcast::channel(1);
            let reader = Arc::clone(&self.reader);
            let dispatcher = Arc::clone(&self.dispatcher);

            let handle = tokio::spawn(async move {
                tracing::debug!("periodic updates started");
                loop {
                    tokio::select! {
                        _ = stop_rx.recv() => break,
                        _ = tokio::time::sleep(CHECK_PERIOD) => {
                            dispatcher.set_configuration(reader.read());
                            dispatcher.reload_outdated();
                        }
                    }
                }
                tracing::debug!("periodic updates stopped");
            });

            *task = Some(UpdaterTask { stop_tx, handle });
        } else if let Some(task) = task.take() {
            let _ = task.stop_tx.send(());
            let _ = task.handle.await;
        }
    }

    pub async fn is_enabled(&self) -> bool {
        self.task.lock().await.is_some()
    }
}
