//! Engine process supervision e2e tests
//!
//! The engine is a real subprocess (`sh -c ...`), so exits, restarts and the
//! circuit breaker run on actual process lifecycles.


use anyhow::{Context, Result};
use common::*;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::time::Duration;
use tempfile::TempDir;

use storage_supervisor::supervisor::StopOutcome;
use storage_supervisor::StorageError;

/// Keeps running for a second after SIGTERM
const LINGERING_ENGINE: &str = "trap 'sleep 1; exit 0' TERM; while :; do sleep 0.1; done";

// =============================================================================
// Restart and circuit breaker
// =============================================================================

#[tokio::test]
async fn test_crash_loop_opens_circuit() -> Result<()> {
    let harness = TestHarness::with_config(|b| b.engine_script(CRASHING_ENGINE)).await?;
    let supervisor = harness.storage().supervisor();

    wait_until(|| supervisor.is_circuit_open(), DEFAULT_TIMEOUT).await?;

    // Initial spawn plus three restarts; the fourth exit trips the breaker
    assert_eq!(supervisor.spawn_count(), 4);
    assert_stays(
        || supervisor.spawn_count() == 4,
        Duration::from_secs(1),
        "spawn count",
    )
    .await;
    assert!(!supervisor.is_running());

    harness.cleanup().await
}

#[tokio::test]
async fn test_reset_circuit_allows_restarts_again() -> Result<()> {
    let harness = TestHarness::with_config(|b| b.engine_script(CRASHING_ENGINE)).await?;
    let supervisor = harness.storage().supervisor();
    wait_until(|| supervisor.is_circuit_open(), DEFAULT_TIMEOUT).await?;

    supervisor.reset_circuit();
    assert!(!supervisor.is_circuit_open());
    supervisor.start()?;

    wait_until(
        || supervisor.is_circuit_open() && supervisor.spawn_count() == 8,
        DEFAULT_TIMEOUT,
    )
    .await?;

    harness.cleanup().await
}

#[tokio::test]
async fn test_killed_engine_is_restarted() -> Result<()> {
    let harness = TestHarness::new().await?;
    let supervisor = harness.storage().supervisor();
    let first_pid = supervisor.pid().context("engine is not running")?;

    signal::kill(Pid::from_raw(i32::try_from(first_pid)?), Signal::SIGKILL)?;

    harness.wait_for_spawns(2).await?;
    wait_until(
        || matches!(supervisor.pid(), Some(pid) if pid != first_pid),
        DEFAULT_TIMEOUT,
    )
    .await?;
    assert!(!supervisor.is_circuit_open());

    harness.cleanup().await
}

#[tokio::test]
async fn test_start_while_running_is_rejected() -> Result<()> {
    let harness = TestHarness::new().await?;
    let supervisor = harness.storage().supervisor();
    let pid = supervisor.pid().context("engine is not running")?;

    match supervisor.start() {
        Err(StorageError::AlreadyRunning(running)) => assert_eq!(running, pid),
        other => panic!("expected AlreadyRunning, got {:?}", other),
    }
    assert_eq!(supervisor.spawn_count(), 1);

    harness.cleanup().await
}

#[tokio::test]
async fn test_shutdown_stops_engine_for_good() -> Result<()> {
    let harness = TestHarness::new().await?;
    let supervisor = harness.storage().supervisor();
    let pid = supervisor.pid().context("engine is not running")?;

    harness.storage().shutdown().await;

    assert!(!supervisor.is_running());
    assert!(!process_alive(pid));
    assert_stays(
        || supervisor.spawn_count() == 1,
        Duration::from_millis(500),
        "spawn count",
    )
    .await;

    harness.cleanup().await
}

#[tokio::test]
async fn test_second_stop_returns_while_first_waits() -> Result<()> {
    let harness =
        TestHarness::with_config(|b| b.engine_script(LINGERING_ENGINE).remote("backup")).await?;
    harness.wait_for_mounts(1).await?;
    let supervisor = harness.storage().supervisor();
    let pid = supervisor.pid().context("engine is not running")?;
    let listings_before = harness.engine().calls_to("/mount/listmounts").len();

    let first = supervisor.stop();
    let second = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let outcome = supervisor.stop().await;
        (outcome, process_alive(pid))
    };
    let (first, (second, alive_after_second)) = tokio::join!(first, second);

    assert_eq!(first, StopOutcome::Stopped);
    assert_eq!(second, StopOutcome::InProgress);
    assert!(alive_after_second, "second stop waited for the engine to exit");
    assert!(!process_alive(pid));

    // Only the first call unmounted
    let listings = harness.engine().calls_to("/mount/listmounts").len() - listings_before;
    assert_eq!(listings, 1);
    assert_eq!(unmount_requests(harness.engine()), vec![harness.mount_point("backup")]);

    harness.cleanup().await
}

// =============================================================================
// Command line
// =============================================================================

#[tokio::test]
async fn test_engine_receives_control_arguments() -> Result<()> {
    let out = TempDir::new()?;
    let args_file = out.path().join("args");
    let script = format!(
        "printf '%s\\n' \"$0\" \"$@\" > '{}'; exec sleep 300",
        args_file.display()
    );

    let harness = TestHarness::with_config(|b| b.engine_script(&script)).await?;
    wait_until(|| args_file.exists(), DEFAULT_TIMEOUT).await?;
    // Give printf a moment to finish writing
    tokio::time::sleep(Duration::from_millis(100)).await;

    let content = std::fs::read_to_string(&args_file)?;
    let args: Vec<&str> = content.lines().collect();

    assert_eq!(args.len(), 6, "unexpected arguments: {:?}", args);
    assert_eq!(args[0], "rcd");

    let user = args[1].strip_prefix("--rc-user=").context("missing --rc-user")?;
    let password = args[2].strip_prefix("--rc-pass=").context("missing --rc-pass")?;
    assert_eq!(user.len(), 8);
    assert_eq!(password.len(), 16);
    assert!(user.chars().chain(password.chars()).all(|c| c.is_ascii_alphanumeric()));

    assert_eq!(
        args[3],
        format!("--config={}", harness.config_file().display())
    );
    assert_eq!(args[4], "--rc-baseurl=/cosmos/rclone");
    assert_eq!(
        args[5],
        format!("--rc-addr=127.0.0.1:{}", harness.engine().port())
    );

    harness.cleanup().await
}
