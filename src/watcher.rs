//! Engine configuration file watcher
//!
//! Two detection paths feed one fingerprint:
//! - file-write events from `notify`
//! - a polling loop comparing content hash and modification time
//!
//! Events are taken from the config file's directory, so a save that replaces
//! the file through a rename is seen the same as an in-place write.
//!
//! Whichever path sees a change first updates the fingerprint and invokes the
//! restart handler. A write caught by the event path marks the current polling
//! tick as handled so the poller does not restart a second time.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use notify::event::{AccessKind, AccessMode, ModifyKind};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Something to run when the configuration changed
#[async_trait]
pub trait RestartHandler: Send + Sync {
    async fn restart(&self);
}

/// Snapshot of the config file used purely for change detection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigFingerprint {
    /// Hex SHA-256 of the content, empty if the file could not be read
    pub content_hash: String,
    /// Modification time, `None` if the file could not be stat'ed
    pub modified: Option<SystemTime>,
}

impl ConfigFingerprint {
    /// Fingerprint the file at `path`. Read errors are logged and leave the
    /// affected component empty.
    pub fn read(path: &Path) -> Self {
        let content_hash = match std::fs::read(path) {
            Ok(content) => format!("{:x}", Sha256::digest(&content)),
            Err(e) => {
                error!("Error reading {:?} for hashing: {}", path, e);
                String::new()
            }
        };

        let modified = match std::fs::metadata(path).and_then(|m| m.modified()) {
            Ok(t) => Some(t),
            Err(e) => {
                error!("Error getting file info for {:?}: {}", path, e);
                None
            }
        };

        Self {
            content_hash,
            modified,
        }
    }
}

/// Which path noticed a change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detection {
    Event,
    Poll,
}

struct TrackerState {
    fingerprint: ConfigFingerprint,
    /// The event path fired since the last polling tick
    event_detected: bool,
}

/// Last confirmed fingerprint, shared by both detection paths
pub struct FingerprintTracker {
    path: PathBuf,
    state: Mutex<TrackerState>,
}

impl FingerprintTracker {
    /// Track `path`, taking the current content as the baseline
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let fingerprint = ConfigFingerprint::read(&path);
        Self {
            path,
            state: Mutex::new(TrackerState {
                fingerprint,
                event_detected: false,
            }),
        }
    }

    /// Compare the file against the stored fingerprint and store the new one
    /// if it differs. Returns whether a change was confirmed.
    ///
    /// A polling check right after an event-path change is skipped, and every
    /// polling check clears that mark.
    pub fn check(&self, source: Detection) -> bool {
        let mut state = self.state.lock();

        if source == Detection::Poll && std::mem::take(&mut state.event_detected) {
            return false;
        }

        let current = ConfigFingerprint::read(&self.path);
        if current == state.fingerprint {
            return false;
        }

        state.fingerprint = current;
        if source == Detection::Event {
            state.event_detected = true;
        }
        true
    }

    /// The last confirmed fingerprint
    pub fn fingerprint(&self) -> ConfigFingerprint {
        self.state.lock().fingerprint.clone()
    }
}

/// Quiet period after an event before the file is fingerprinted
const EVENT_SETTLE: Duration = Duration::from_millis(100);

/// Events that may carry a content change: writes, creation, and a file
/// renamed into place
fn is_change_kind(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_)
            | EventKind::Modify(ModifyKind::Data(_))
            | EventKind::Modify(ModifyKind::Name(_))
            | EventKind::Modify(ModifyKind::Any)
            | EventKind::Access(AccessKind::Close(AccessMode::Write))
    )
}

/// Whether a directory event is a change to the file at `path`
fn is_config_change(event: &Event, path: &Path) -> bool {
    is_change_kind(&event.kind)
        && event
            .paths
            .iter()
            .any(|p| p.file_name().is_some() && p.file_name() == path.file_name())
}

/// Watches the engine config file and triggers restarts
pub struct ConfigWatcher {
    tracker: Arc<FingerprintTracker>,
    poll_interval: Duration,
    handler: Arc<dyn RestartHandler>,
}

impl ConfigWatcher {
    pub fn new(
        path: impl Into<PathBuf>,
        poll_interval: Duration,
        handler: Arc<dyn RestartHandler>,
    ) -> Self {
        Self {
            tracker: Arc::new(FingerprintTracker::new(path)),
            poll_interval,
            handler,
        }
    }

    /// Shared fingerprint state
    pub fn tracker(&self) -> Arc<FingerprintTracker> {
        Arc::clone(&self.tracker)
    }

    /// Run the watcher in the background
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Watch forever. Falls back to polling only when file events are unavailable.
    pub async fn run(self) {
        info!("Watching config file {:?} for changes", self.tracker.path);

        // Dropping the watcher ends event delivery, so it lives as long as the loop
        let _watcher = match self.start_event_watcher() {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                error!(
                    "Error creating file watcher, falling back to polling only: {}",
                    e
                );
                None
            }
        };

        self.poll().await;
    }

    fn start_event_watcher(&self) -> notify::Result<RecommendedWatcher> {
        let (tx, mut rx) = mpsc::unbounded_channel::<notify::Result<Event>>();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = tx.send(res);
        })?;
        let dir = match self.tracker.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        let tracker = Arc::clone(&self.tracker);
        let handler = Arc::clone(&self.handler);
        tokio::spawn(async move {
            while let Some(res) = rx.recv().await {
                match res {
                    Ok(event) if is_config_change(&event, &tracker.path) => {
                        // One save fires several events; let them land first
                        tokio::time::sleep(EVENT_SETTLE).await;
                        while rx.try_recv().is_ok() {}

                        if tracker.check(Detection::Event) {
                            info!("Config file modified (detected by watcher). Restarting...");
                            handler.restart().await;
                        }
                    }
                    Ok(event) => debug!("Ignoring config dir event: {:?}", event),
                    Err(e) => error!("Error watching config file: {}", e),
                }
            }
            debug!("Config file event stream closed");
        });

        Ok(watcher)
    }

    async fn poll(&self) {
        loop {
            tokio::time::sleep(self.poll_interval).await;
            if self.tracker.check(Detection::Poll) {
                info!("Config file modified (detected by polling). Restarting...");
                self.handler.restart().await;
            }
        }
    }
}
