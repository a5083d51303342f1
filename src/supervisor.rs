//! Engine process supervision
//!
//! The supervisor owns the single engine subprocess. An exit monitor task
//! waits on the child and feeds every exit through [`ProcessState::record_exit`],
//! which either hands a restart signal to the restart loop or opens the
//! circuit breaker after too many exits in a short window.

use std::ffi::OsString;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::control::{ControlApi, Credentials};
use crate::error::{Result, StorageError};
use crate::mount;

/// Exits closer together than this count towards the same restart window
pub const RESTART_WINDOW: Duration = Duration::from_secs(10);

/// Restarts allowed inside one window before the circuit opens
pub const MAX_RESTARTS: u32 = 3;

/// What the supervisor does after an engine exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDecision {
    /// Hand a restart signal to the restart loop
    Restart,
    /// This exit tripped the breaker; automatic restarts stop here
    CircuitOpened,
    /// The breaker was already open
    CircuitOpen,
}

/// How a call to [`Supervisor::stop`] ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The engine was signalled and has exited
    Stopped,
    /// There was no engine process to stop
    NotRunning,
    /// Another stop was already underway
    InProgress,
}

/// Handle on the running engine
#[derive(Debug)]
struct EngineHandle {
    pid: u32,
    /// Flips to `true` once the exit monitor has reaped the process
    exited: watch::Receiver<bool>,
}

/// Mutable supervisor state, only touched under the supervisor lock
#[derive(Debug, Default)]
pub struct ProcessState {
    handle: Option<EngineHandle>,
    restart_count: u32,
    last_restart: Option<Instant>,
    circuit_open: bool,
}

impl ProcessState {
    /// Account for an engine exit observed at `now`.
    ///
    /// The count grows only while exits stay within [`RESTART_WINDOW`] of the
    /// previous one; a longer gap starts a fresh window at 1.
    pub fn record_exit(&mut self, now: Instant) -> ExitDecision {
        if self.circuit_open {
            return ExitDecision::CircuitOpen;
        }

        match self.last_restart {
            Some(last) if now.saturating_duration_since(last) < RESTART_WINDOW => {
                self.restart_count += 1;
            }
            _ => self.restart_count = 1,
        }
        self.last_restart = Some(now);

        if self.restart_count <= MAX_RESTARTS {
            ExitDecision::Restart
        } else {
            self.circuit_open = true;
            ExitDecision::CircuitOpened
        }
    }

    /// Close the breaker and forget the current window
    pub fn reset_circuit(&mut self) {
        self.restart_count = 0;
        self.last_restart = None;
        self.circuit_open = false;
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    pub fn is_circuit_open(&self) -> bool {
        self.circuit_open
    }
}

/// Owns the engine subprocess and restarts it when it dies
pub struct Supervisor {
    engine: EngineConfig,
    credentials: Credentials,
    api: Arc<dyn ControlApi>,
    state: Mutex<ProcessState>,
    /// Set while a stop is in progress; concurrent stops return immediately
    stopping: AtomicBool,
    /// Set by `shutdown`; exits are no longer restarted
    shutting_down: AtomicBool,
    spawn_count: AtomicU64,
    restart_tx: mpsc::Sender<()>,
    restart_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl Supervisor {
    /// Create a supervisor. Nothing is spawned until [`Supervisor::start`].
    pub fn new(engine: EngineConfig, credentials: Credentials, api: Arc<dyn ControlApi>) -> Arc<Self> {
        // Single slot: one pending restart is all the loop ever needs
        let (restart_tx, restart_rx) = mpsc::channel(1);
        Arc::new(Self {
            engine,
            credentials,
            api,
            state: Mutex::new(ProcessState::default()),
            stopping: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            spawn_count: AtomicU64::new(0),
            restart_tx,
            restart_rx: Mutex::new(Some(restart_rx)),
        })
    }

    /// Arguments passed to the engine binary
    pub fn command_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = self.engine.args.iter().map(OsString::from).collect();
        args.push("rcd".into());
        args.push(format!("--rc-user={}", self.credentials.user).into());
        args.push(format!("--rc-pass={}", self.credentials.password).into());

        let mut config_arg = OsString::from("--config=");
        config_arg.push(self.engine.config_file());
        args.push(config_arg);

        args.push(format!("--rc-baseurl={}", self.engine.base_path).into());
        args.push(format!("--rc-addr=127.0.0.1:{}", self.engine.port).into());
        args
    }

    /// Start consuming restart signals. Returns `None` if the loop already runs.
    pub fn spawn_restart_loop(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut rx = self.restart_rx.lock().take()?;
        let weak: Weak<Self> = Arc::downgrade(self);

        Some(tokio::spawn(async move {
            while rx.recv().await.is_some() {
                let Some(this) = weak.upgrade() else { break };
                if this.shutting_down.load(Ordering::SeqCst) {
                    continue;
                }
                if let Err(e) = this.start() {
                    error!("Error restarting engine process: {}", e);
                }
            }
            debug!("Restart loop finished");
        }))
    }

    /// Spawn the engine and its exit monitor
    pub fn start(self: &Arc<Self>) -> Result<u32> {
        let mut state = self.state.lock();

        if let Some(handle) = &state.handle {
            return Err(StorageError::AlreadyRunning(handle.pid));
        }

        info!("Starting engine process {:?}", self.engine.binary);

        let mut child = Command::new(&self.engine.binary)
            .args(self.command_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                error!("Error starting engine process: {}", e);
                StorageError::Spawn(e)
            })?;

        let pid = child.id().unwrap_or_default();

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, false));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, true));
        }

        let (exit_tx, exit_rx) = watch::channel(false);
        state.handle = Some(EngineHandle {
            pid,
            exited: exit_rx,
        });
        drop(state);

        self.spawn_count.fetch_add(1, Ordering::SeqCst);
        info!(pid, "Engine process started");

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let status = child.wait().await;
            // Clear the handle before waking stop()
            this.on_exit(pid, status);
            let _ = exit_tx.send(true);
        });

        Ok(pid)
    }

    /// Stop the engine: unmount everything, send SIGTERM, wait for the exit.
    ///
    /// Returns immediately if another stop is already in progress.
    pub async fn stop(&self) -> StopOutcome {
        if self.stopping.swap(true, Ordering::SeqCst) {
            debug!("Engine stop already in progress");
            return StopOutcome::InProgress;
        }
        let _guard = scopeguard::guard((), |_| self.stopping.store(false, Ordering::SeqCst));

        let handle = self
            .state
            .lock()
            .handle
            .as_ref()
            .map(|h| (h.pid, h.exited.clone()));

        let Some((pid, mut exited)) = handle else {
            debug!("No engine process to stop");
            return StopOutcome::NotRunning;
        };

        info!(pid, "Stopping engine process");

        if let Err(e) = mount::unmount_all(self.api.as_ref()).await {
            error!("Error unmounting before stop: {}", e);
        }

        if let Err(e) = send_sigterm(pid) {
            error!(pid, "Error stopping engine process: {}", e);
        }

        // No timeout: an engine ignoring SIGTERM keeps us here
        let _ = exited.wait_for(|done| *done).await;
        info!(pid, "Engine process stopped");
        StopOutcome::Stopped
    }

    /// Stop the engine for good; later exits are not restarted
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.stop().await;
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Close the circuit breaker so automatic restarts resume
    pub fn reset_circuit(&self) {
        info!("Resetting engine restart circuit");
        self.state.lock().reset_circuit();
    }

    fn on_exit(&self, pid: u32, status: io::Result<ExitStatus>) {
        match &status {
            Ok(s) if s.success() => info!(pid, "Engine process exited"),
            Ok(s) => error!(pid, "{}", StorageError::ProcessExit(s.to_string())),
            Err(e) => error!(pid, "Error waiting for engine process: {}", e),
        }

        let mut state = self.state.lock();
        if state.handle.as_ref().map(|h| h.pid) == Some(pid) {
            state.handle = None;
        }

        if self.shutting_down.load(Ordering::SeqCst) {
            info!("Supervisor shutting down, engine will not be restarted");
            return;
        }

        match state.record_exit(Instant::now()) {
            ExitDecision::Restart => {
                info!(
                    restarts = state.restart_count(),
                    "Restarting engine process"
                );
                match self.restart_tx.try_send(()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(())) => debug!("Engine restart already pending"),
                    Err(TrySendError::Closed(())) => {
                        warn!("Restart loop is not running, engine stays down")
                    }
                }
            }
            ExitDecision::CircuitOpened => {
                error!(
                    fatal = true,
                    restarts = state.restart_count(),
                    "Engine process restarted too many times in a short period. Stopping automatic restarts."
                );
            }
            ExitDecision::CircuitOpen => {
                debug!("Engine exited with the restart circuit open");
            }
        }
    }

    /// Pid of the running engine, if any
    pub fn pid(&self) -> Option<u32> {
        self.state.lock().handle.as_ref().map(|h| h.pid)
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().handle.is_some()
    }

    pub fn is_circuit_open(&self) -> bool {
        self.state.lock().is_circuit_open()
    }

    /// Number of successful spawns since creation
    pub fn spawn_count(&self) -> u64 {
        self.spawn_count.load(Ordering::SeqCst)
    }
}

/// Log every line the engine writes; stderr is raised to warn
async fn forward_output<R: AsyncRead + Unpin>(reader: R, is_stderr: bool) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if is_stderr => warn!(target: "engine", "{}", line),
            Ok(Some(line)) => debug!(target: "engine", "{}", line),
            Ok(None) => break,
            Err(e) => {
                debug!("Engine output stream closed: {}", e);
                break;
            }
        }
    }
}

fn send_sigterm(pid: u32) -> nix::Result<()> {
    let pid = i32::try_from(pid).map_err(|_| Errno::EINVAL)?;
    signal::kill(Pid::from_raw(pid), Signal::SIGTERM)
}
