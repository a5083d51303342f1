//! Remote storage service
//!
//! Wires the supervisor, the mount orchestrator and the config watcher
//! together and owns the restart routine they share.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::{Config, EngineConfig, WatcherConfig};
use crate::control::{ControlApi, ControlClient, Credentials, Payload};
use crate::error::{Result, StorageError};
use crate::mount::MountOrchestrator;
use crate::stats::{self, EngineStats};
use crate::supervisor::{StopOutcome, Supervisor};
use crate::watcher::{ConfigWatcher, RestartHandler};

/// Probe the engine's version endpoint until it answers.
///
/// Sleeps `interval` between probes and gives up after `attempts` probes.
pub async fn wait_ready(api: &dyn ControlApi, interval: Duration, attempts: u32) -> Result<()> {
    for attempt in 1..=attempts {
        match api.call("/core/version", Payload::Empty).await {
            Ok(_) => return Ok(()),
            Err(e) => debug!(attempt, "Engine not ready yet: {}", e),
        }
        if attempt < attempts {
            tokio::time::sleep(interval).await;
        }
    }
    Err(StorageError::NotReady(attempts))
}

/// Create the engine config file, empty, if it does not exist yet
pub async fn ensure_config_file(path: &Path) -> Result<()> {
    if tokio::fs::try_exists(path).await? {
        return Ok(());
    }

    info!("Creating engine config file {:?}", path);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::File::create(path).await?;
    Ok(())
}

/// The supervised remote storage subsystem
pub struct RemoteStorage {
    engine: EngineConfig,
    watcher: WatcherConfig,
    api: Arc<dyn ControlApi>,
    supervisor: Arc<Supervisor>,
    orchestrator: Arc<MountOrchestrator>,
    watcher_task: Mutex<Option<JoinHandle<()>>>,
}

impl RemoteStorage {
    /// Build the service with fresh credentials and an HTTP control client
    pub fn new(config: &Config) -> Result<Arc<Self>> {
        let credentials = Credentials::generate();
        let api = Arc::new(ControlClient::new(&config.engine, credentials.clone())?);
        Ok(Self::with_api(config, credentials, api))
    }

    /// Build the service around an existing control API transport
    pub fn with_api(config: &Config, credentials: Credentials, api: Arc<dyn ControlApi>) -> Arc<Self> {
        let supervisor = Supervisor::new(config.engine.clone(), credentials, Arc::clone(&api));
        let orchestrator = Arc::new(MountOrchestrator::new(
            Arc::clone(&api),
            config.mounts.clone(),
        ));

        Arc::new(Self {
            engine: config.engine.clone(),
            watcher: config.watcher.clone(),
            api,
            supervisor,
            orchestrator,
            watcher_task: Mutex::new(None),
        })
    }

    /// Start the engine, watch its config and mount every remote once it is ready.
    ///
    /// A failed spawn is logged, not returned: the watcher and the admin
    /// restart stay available to bring the engine up later.
    pub async fn init(self: &Arc<Self>) -> Result<()> {
        let config_file = self.engine.config_file();
        ensure_config_file(&config_file).await?;

        info!("Initializing remote storage");
        self.supervisor.spawn_restart_loop();
        if let Err(e) = self.supervisor.start() {
            error!("Engine did not start, waiting for a config change or restart: {}", e);
        }

        let handler: Arc<dyn RestartHandler> = Arc::clone(self) as Arc<dyn RestartHandler>;
        let watcher = ConfigWatcher::new(config_file, self.watcher.poll_interval, handler);
        if let Some(previous) = self.watcher_task.lock().replace(watcher.spawn()) {
            previous.abort();
        }

        self.spawn_remount();
        Ok(())
    }

    /// Stop the engine, then remount everything once it is back.
    ///
    /// The supervisor's exit monitor brings a stopped engine back up. An
    /// engine that was not running is started here. Readiness polling and
    /// remounting run in the returned task.
    pub async fn restart_cycle(&self) -> JoinHandle<()> {
        let outcome = self.supervisor.stop().await;
        if outcome == StopOutcome::NotRunning && !self.supervisor.is_shutting_down() {
            if let Err(e) = self.supervisor.start() {
                error!("Error starting engine process: {}", e);
            }
        }
        self.spawn_remount()
    }

    fn spawn_remount(&self) -> JoinHandle<()> {
        let api = Arc::clone(&self.api);
        let orchestrator = Arc::clone(&self.orchestrator);
        let interval = self.engine.ready_interval;
        let attempts = self.engine.ready_attempts;
        let port = self.engine.port;

        tokio::spawn(async move {
            if let Err(e) = wait_ready(api.as_ref(), interval, attempts).await {
                error!(
                    fatal = true,
                    "Failed to reach engine, check the port {} is free: {}", port, e
                );
                return;
            }

            info!("Engine started and ready!");
            match orchestrator.remount_all().await {
                Ok(count) => info!("{} remote storage(s) mounted", count),
                Err(e) => debug!("Remount pass ended early: {}", e),
            }
        })
    }

    /// Current engine counters
    pub async fn stats(&self) -> Result<EngineStats> {
        stats::get_stats(self.api.as_ref()).await
    }

    /// Stop watching, unmount and stop the engine without restarting it
    pub async fn shutdown(&self) {
        info!("Shutting down remote storage");
        if let Some(task) = self.watcher_task.lock().take() {
            task.abort();
        }
        self.supervisor.shutdown().await;
    }

    /// Whether the config watcher task is alive
    pub fn is_watching(&self) -> bool {
        self.watcher_task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn orchestrator(&self) -> &Arc<MountOrchestrator> {
        &self.orchestrator
    }
}

#[async_trait]
impl RestartHandler for RemoteStorage {
    async fn restart(&self) {
        let _ = self.restart_cycle().await;
    }
}
