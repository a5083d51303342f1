//! Mount reconciliation
//!
//! Brings the engine's live mounts in line with the remotes defined in its
//! configuration. Remotes are read from the engine's config dump on every
//! pass; mounts are facts held by the engine that we only query and clear.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::config::MountSettings;
use crate::control::{ControlApi, Payload};
use crate::error::{Result, StorageError};

/// Directory name prefix of every mount point
pub const MOUNT_PREFIX: &str = "cosmos-storage-";

/// Config dump keys that are engine bookkeeping, not remotes
const RESERVED_KEYS: &[&str] = &["install_id", "client_id", "client_secret"];

/// Owner applied to mounted files when a remote carries no ownership hint
const DEFAULT_UID: u32 = 1000;
const DEFAULT_GID: u32 = 1000;

/// Owner read/write/execute only
const MOUNT_UMASK: u32 = 0o077;

/// A remote to be mounted, as read from the engine's configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStorageSpec {
    /// Remote name, matching the engine-side definition
    pub name: String,
    /// Optional "uid:gid" owner for the mount point
    pub ownership_hint: Option<String>,
}

impl RemoteStorageSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ownership_hint: None,
        }
    }

    pub fn with_ownership(mut self, hint: impl Into<String>) -> Self {
        self.ownership_hint = Some(hint.into());
        self
    }
}

/// Numeric owner parsed from an ownership hint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ownership {
    pub uid: u32,
    pub gid: u32,
}

impl Default for Ownership {
    fn default() -> Self {
        Self {
            uid: DEFAULT_UID,
            gid: DEFAULT_GID,
        }
    }
}

impl Ownership {
    /// Parse a "uid:gid" hint. Anything but two colon-separated integers is rejected.
    pub fn parse(hint: &str) -> Result<Self> {
        let invalid = || StorageError::Config(format!("invalid chown value: {:?}", hint));

        let mut parts = hint.split(':');
        let (Some(uid), Some(gid), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(invalid());
        };

        Ok(Self {
            uid: uid.parse().map_err(|_| invalid())?,
            gid: gid.parse().map_err(|_| invalid())?,
        })
    }
}

/// A live mount reported by the engine
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MountRecord {
    #[serde(rename = "MountPoint")]
    pub mount_point: String,
    #[serde(rename = "Fs", default)]
    pub remote_name: String,
}

/// Outcome of a best-effort unmount batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnmountSummary {
    pub unmounted: usize,
    pub failed: usize,
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Deserialize)]
struct ListMountsResponse {
    #[serde(rename = "mountPoints", alias = "mounts", default)]
    mount_points: Option<Vec<MountRecord>>,
}

/// One top-level entry of the config dump
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DumpEntry {
    Remote(RemoteSection),
    Other(serde_json::Value),
}

/// The parts of a remote definition we care about; unknown keys are ignored
#[derive(Debug, Deserialize)]
struct RemoteSection {
    #[serde(rename = "cosmos-chown", default)]
    chown: Option<String>,
}

#[derive(Debug, Serialize)]
struct MountRequest<'a> {
    fs: String,
    #[serde(rename = "mountPoint")]
    mount_point: &'a str,
    #[serde(rename = "mountType")]
    mount_type: &'static str,
    #[serde(rename = "vfsOpt")]
    vfs_opt: VfsOptions,
    #[serde(rename = "mountOpt")]
    mount_opt: MountOptions,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct VfsOptions {
    cache_mode: &'static str,
    cache_max_age: &'static str,
    read_chunk_size: &'static str,
    read_chunk_size_limit: &'static str,
    #[serde(rename = "UID")]
    uid: u32,
    #[serde(rename = "GID")]
    gid: u32,
    umask: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct MountOptions {
    allow_other: bool,
}

fn mount_request<'a>(remote: &str, mount_point: &'a str, owner: Ownership) -> MountRequest<'a> {
    MountRequest {
        fs: format!("{}:", remote),
        mount_point,
        mount_type: "mount",
        vfs_opt: VfsOptions {
            cache_mode: "full",
            cache_max_age: "24h",
            read_chunk_size: "10M",
            read_chunk_size_limit: "100M",
            uid: owner.uid,
            gid: owner.gid,
            umask: MOUNT_UMASK,
        },
        mount_opt: MountOptions { allow_other: true },
    }
}

// =============================================================================
// Engine queries shared with the supervisor
// =============================================================================

/// Active mounts as reported by the engine
pub async fn list_mounts(api: &dyn ControlApi) -> Result<Vec<MountRecord>> {
    let body = api.call("/mount/listmounts", Payload::Empty).await?;
    let response: ListMountsResponse = serde_json::from_slice(&body)?;
    Ok(response.mount_points.unwrap_or_default())
}

/// Unmount one mount point through the engine
pub async fn unmount(api: &dyn ControlApi, mount_point: &str) -> Result<()> {
    api.call(
        "/mount/unmount",
        Payload::Json(serde_json::json!({ "mountPoint": mount_point })),
    )
    .await?;
    Ok(())
}

/// Unmount every active mount, continuing past individual failures.
///
/// Only a failure to list the mounts is returned as an error.
pub async fn unmount_all(api: &dyn ControlApi) -> Result<UnmountSummary> {
    info!("Unmounting all remote storages");

    let mounts = list_mounts(api).await?;
    let mut summary = UnmountSummary::default();

    for mount in &mounts {
        info!("Unmounting {}", mount.mount_point);
        match unmount(api, &mount.mount_point).await {
            Ok(()) => {
                info!("Successfully unmounted {}", mount.mount_point);
                summary.unmounted += 1;
            }
            Err(e) => {
                error!("Error unmounting {}: {}", mount.mount_point, e);
                summary.failed += 1;
            }
        }
    }

    Ok(summary)
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Reconciles the engine's remotes into mount points
pub struct MountOrchestrator {
    api: Arc<dyn ControlApi>,
    settings: MountSettings,
}

impl MountOrchestrator {
    pub fn new(api: Arc<dyn ControlApi>, settings: MountSettings) -> Self {
        Self { api, settings }
    }

    /// Deterministic mount point of a remote
    pub fn mount_path(&self, remote: &str) -> PathBuf {
        self.settings
            .effective_base_dir()
            .join(format!("{}{}", MOUNT_PREFIX, remote))
    }

    /// Remotes defined in the engine configuration, sorted by name
    pub async fn list_remotes(&self) -> Result<Vec<RemoteStorageSpec>> {
        let body = self.api.call("/config/dump", Payload::Empty).await?;
        let dump: BTreeMap<String, DumpEntry> = serde_json::from_slice(&body)?;

        let remotes = dump
            .into_iter()
            .filter(|(name, _)| !RESERVED_KEYS.contains(&name.as_str()))
            .map(|(name, entry)| {
                debug!("Found storage: {}", name);
                let ownership_hint = match entry {
                    DumpEntry::Remote(section) => section.chown,
                    DumpEntry::Other(_) => None,
                };
                RemoteStorageSpec {
                    name,
                    ownership_hint,
                }
            })
            .collect();

        Ok(remotes)
    }

    /// Active mounts as reported by the engine
    pub async fn list_mounts(&self) -> Result<Vec<MountRecord>> {
        list_mounts(self.api.as_ref()).await
    }

    /// Mount a single remote at its mount point.
    ///
    /// Any stale mount at the path is released first. The directory must be
    /// empty; existing data is never mounted over.
    pub async fn mount_one(&self, remote: &RemoteStorageSpec) -> Result<PathBuf> {
        let ownership = remote
            .ownership_hint
            .as_deref()
            .map(Ownership::parse)
            .transpose()?;

        let path = self.mount_path(&remote.name);
        let mount_point = path
            .to_str()
            .ok_or_else(|| StorageError::Config(format!("mount path is not UTF-8: {:?}", path)))?
            .to_string();

        match tokio::fs::symlink_metadata(&path).await {
            Ok(_) => self.release_stale_mount(&path, &mount_point).await,
            Err(e) if is_disconnected(&e) => {
                warn!("Found disconnected mount at {:?}", path);
                self.release_stale_mount(&path, &mount_point).await;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if !path.exists() {
            create_mount_dir(&path).await?;
        }

        let mut entries = tokio::fs::read_dir(&path).await?;
        if entries.next_entry().await?.is_some() {
            return Err(StorageError::Config(format!(
                "mount point directory is not empty: {:?}",
                path
            )));
        }

        if let Some(owner) = ownership {
            if self.settings.apply_ownership {
                info!("Chowning {:?} to {}:{}", path, owner.uid, owner.gid);
                std::os::unix::fs::chown(&path, Some(owner.uid), Some(owner.gid))?;
            } else {
                debug!("Ownership changes disabled, leaving {:?} as is", path);
            }
        }

        let request = mount_request(&remote.name, &mount_point, ownership.unwrap_or_default());
        self.api
            .call("/mount/mount", Payload::Json(serde_json::to_value(&request)?))
            .await?;

        info!("Successfully mounted {} to {:?}", remote.name, path);
        Ok(path)
    }

    /// Mount every configured remote, stopping at the first failure
    pub async fn remount_all(&self) -> Result<usize> {
        let remotes = self.list_remotes().await.map_err(|e| {
            error!(
                fatal = true,
                "Error getting remote storage list for mounting: {}", e
            );
            e
        })?;

        for remote in &remotes {
            info!("Mounting {}", remote.name);
            if let Err(e) = self.mount_one(remote).await {
                error!(
                    fatal = true,
                    remote = %remote.name,
                    "Error mounting remote storage: {}", e
                );
                return Err(e);
            }
        }

        Ok(remotes.len())
    }

    /// Unmount every active mount, best-effort
    pub async fn unmount_all(&self) -> Result<UnmountSummary> {
        unmount_all(self.api.as_ref()).await
    }

    /// Make sure nothing is mounted at `path` anymore
    async fn release_stale_mount(&self, path: &Path, mount_point: &str) {
        if let Err(e) = unmount(self.api.as_ref(), mount_point).await {
            debug!("Engine unmount of {:?} before mounting: {}", path, e);
        }

        if is_mount_point(path) {
            detach_mount(path).await;
        }
    }
}

async fn create_mount_dir(path: &Path) -> Result<()> {
    debug!("Creating mount point directory {:?}", path);
    tokio::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(path)
        .await?;
    Ok(())
}

fn is_disconnected(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::ENOTCONN)
}

/// Whether `path` is a kernel mount point: a different device than its
/// parent, or a FUSE mount whose daemon has gone away
fn is_mount_point(path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    let path_meta = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(e) => return is_disconnected(&e),
    };

    let Some(parent) = path.parent() else {
        return false;
    };

    match std::fs::metadata(parent) {
        Ok(parent_meta) => path_meta.dev() != parent_meta.dev(),
        Err(e) => {
            debug!("Failed to stat parent {:?}: {}", parent, e);
            false
        }
    }
}

/// Lazily detach a mount the engine no longer knows about
async fn detach_mount(path: &Path) {
    let attempts: [(&str, &str); 3] = [("fusermount3", "-uz"), ("fusermount", "-uz"), ("umount", "-l")];

    for (program, flag) in attempts {
        match Command::new(program).arg(flag).arg(path).output().await {
            Ok(output) if output.status.success() => {
                info!("Detached stale mount {:?} with {}", path, program);
                return;
            }
            Ok(output) => debug!(
                "{} {} {:?} failed: {}",
                program,
                flag,
                path,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Err(e) => debug!("Could not run {}: {}", program, e),
        }
    }

    warn!("Could not detach stale mount {:?}", path);
}
