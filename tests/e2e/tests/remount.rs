//! Mount reconciliation e2e tests
//!
//! The service reads remotes from the engine's config dump and mounts each
//! one under the mount directory once the engine answers.


use anyhow::Result;
use common::*;
use serde_json::json;

// =============================================================================
// Initial remount
// =============================================================================

#[tokio::test]
async fn test_remotes_mounted_in_name_order() -> Result<()> {
    let harness = TestHarness::with_config(|b| {
        b.remote_with_owner("photos", "1001:1001")
            .remote("backup")
            .dump_entry("install_id", json!("b4c3d2e1"))
    })
    .await?;

    harness.wait_for_mounts(2).await?;

    let mounts = harness.engine().mounts();
    assert_eq!(
        mounts.get(&harness.mount_point("backup")).map(String::as_str),
        Some("backup:")
    );
    assert_eq!(
        mounts.get(&harness.mount_point("photos")).map(String::as_str),
        Some("photos:")
    );

    let requests = mount_requests(harness.engine());
    assert_eq!(requests.len(), 2);

    assert_eq!(requests[0]["fs"], "backup:");
    assert_eq!(requests[0]["vfsOpt"]["UID"], 1000);
    assert_eq!(requests[0]["vfsOpt"]["GID"], 1000);

    assert_eq!(requests[1]["fs"], "photos:");
    assert_eq!(requests[1]["mountPoint"], harness.mount_point("photos"));
    assert_eq!(requests[1]["mountType"], "mount");
    assert_eq!(requests[1]["vfsOpt"]["UID"], 1001);
    assert_eq!(requests[1]["vfsOpt"]["GID"], 1001);
    assert_eq!(requests[1]["vfsOpt"]["CacheMode"], "full");
    assert_eq!(requests[1]["vfsOpt"]["Umask"], 0o077);
    assert_eq!(requests[1]["mountOpt"]["AllowOther"], true);

    assert_dir_exists(&harness.mount_path("backup"));
    assert_dir_exists(&harness.mount_path("photos"));
    assert_not_exists(&harness.mount_path("install_id"));

    harness.cleanup().await
}

#[tokio::test]
async fn test_no_remotes_mounts_nothing() -> Result<()> {
    let harness = TestHarness::new().await?;

    settle_remount_pass(harness.engine()).await?;
    assert!(harness.engine().mounts().is_empty());
    assert!(mount_requests(harness.engine()).is_empty());

    harness.cleanup().await
}

#[tokio::test]
async fn test_non_empty_directory_stops_the_pass() -> Result<()> {
    let harness = TestHarness::with_config(|b| {
        b.remote("alpha")
            .remote("beta")
            .prepare_dir("alpha", Some("keep.txt"))
            .expect("Failed to prepare mount directory")
    })
    .await?;

    settle_remount_pass(harness.engine()).await?;

    // alpha sorts first and fails; beta is never attempted
    assert!(harness.engine().mounts().is_empty());
    assert!(mount_requests(harness.engine()).is_empty());
    assert!(harness.mount_path("alpha").join("keep.txt").exists());
    assert_not_exists(&harness.mount_path("beta"));

    harness.cleanup().await
}

#[tokio::test]
async fn test_invalid_ownership_touches_nothing() -> Result<()> {
    let harness = TestHarness::with_config(|b| {
        b.remote_with_owner("alpha", "abc").remote("beta")
    })
    .await?;

    settle_remount_pass(harness.engine()).await?;

    assert!(harness.engine().mounts().is_empty());
    assert_not_exists(&harness.mount_path("alpha"));
    assert_not_exists(&harness.mount_path("beta"));

    harness.cleanup().await
}

#[tokio::test]
async fn test_stale_mount_released_before_mounting() -> Result<()> {
    let harness = TestHarness::with_config(|b| b.remote("photos").stale_mount("photos")).await?;

    let point = harness.mount_point("photos");
    wait_until(
        || harness.engine().mounts().get(&point).map(String::as_str) == Some("photos:"),
        DEFAULT_TIMEOUT,
    )
    .await?;

    let calls = harness.engine().calls();
    let unmount_at = calls
        .iter()
        .position(|c| c.path == "/mount/unmount" && c.body["mountPoint"] == point.as_str())
        .expect("stale mount was not released");
    let mount_at = calls
        .iter()
        .position(|c| c.path == "/mount/mount")
        .expect("remote was not mounted");
    assert!(unmount_at < mount_at);

    harness.cleanup().await
}

// =============================================================================
// Repeated passes
// =============================================================================

#[tokio::test]
async fn test_remount_is_idempotent() -> Result<()> {
    let harness = TestHarness::with_config(|b| b.remote("backup").remote("photos")).await?;
    harness.wait_for_mounts(2).await?;
    let before = harness.engine().mounts();

    let count = harness.storage().orchestrator().remount_all().await?;
    assert_eq!(count, 2);
    assert_eq!(harness.engine().mounts(), before);
    assert_eq!(mount_requests(harness.engine()).len(), 4);

    assert_dir_empty(&harness.mount_path("backup"));
    harness.cleanup().await
}

// =============================================================================
// Unmount
// =============================================================================

#[tokio::test]
async fn test_unmount_all_continues_past_failures() -> Result<()> {
    let harness =
        TestHarness::with_config(|b| b.remote("a").remote("b").remote("c")).await?;
    harness.wait_for_mounts(3).await?;

    harness.engine().fail_unmount(&harness.mount_point("b"));

    let summary = harness.storage().orchestrator().unmount_all().await?;
    assert_eq!(summary.unmounted, 2);
    assert_eq!(summary.failed, 1);

    let remaining: Vec<String> = harness.engine().mounts().into_keys().collect();
    assert_eq!(remaining, vec![harness.mount_point("b")]);

    let attempted = unmount_requests(harness.engine());
    assert_eq!(
        attempted,
        vec![
            harness.mount_point("a"),
            harness.mount_point("b"),
            harness.mount_point("c"),
        ]
    );

    harness.cleanup().await
}

#[tokio::test]
async fn test_shutdown_unmounts_everything() -> Result<()> {
    let harness = TestHarness::with_config(|b| b.remote("backup").remote("photos")).await?;
    harness.wait_for_mounts(2).await?;

    harness.storage().shutdown().await;

    assert!(harness.engine().mounts().is_empty());
    assert!(!harness.storage().supervisor().is_running());
    harness.cleanup().await
}
