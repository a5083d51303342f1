//! storage-supervisor: keeps an external remote-storage mount engine alive
//!
//! The engine (rclone in `rcd` mode) runs as a child process and exposes an
//! authenticated HTTP control API on localhost. This crate supervises that
//! process and keeps every configured remote mounted.
//!
//! # Architecture
//!
//! - **Supervisor**: spawns the engine with fresh credentials, restarts it when
//!   it exits and opens a circuit breaker after repeated rapid exits.
//! - **Control client**: authenticated requests against the engine's API.
//! - **Mount orchestrator**: reads the remotes from the engine's config dump and
//!   mounts each one under a deterministic path, clearing stale mounts first.
//! - **Config watcher**: detects edits to the engine config file by file events
//!   and by polling, and triggers a restart-and-remount cycle.
//! - **Stats**: transfer counters from the engine.
//!
//! # Example
//!
//! ```no_run
//! use storage_supervisor::config::Config;
//! use storage_supervisor::service::RemoteStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::from_file(&"config.yaml".into())?;
//! let storage = RemoteStorage::new(&config)?;
//! storage.init().await?;
//! // ...
//! storage.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod config;
pub mod control;
pub mod env;
pub mod error;
pub mod mount;
pub mod service;
pub mod stats;
pub mod supervisor;
pub mod watcher;

pub use error::{Result, StorageError};
