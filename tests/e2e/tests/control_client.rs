//! Control API transport e2e tests
//!
//! Exercises the HTTP client against the fake engine: basic auth, payload
//! encodings and how failures surface.


use anyhow::Result;
use common::*;
use serde_json::{json, Value};
use std::time::Duration;

use storage_supervisor::control::{ControlApi, ControlClient, Credentials, Payload};
use storage_supervisor::stats;
use storage_supervisor::StorageError;

const TIMEOUT: Duration = Duration::from_secs(5);

async fn engine_and_client() -> Result<(FakeEngine, ControlClient)> {
    init_logging();
    let credentials = Credentials::generate();
    let engine = FakeEngine::start(&credentials).await?;
    let client = ControlClient::with_base_url(engine.base_url(), credentials, TIMEOUT)?;
    Ok((engine, client))
}

#[tokio::test]
async fn test_call_returns_body() -> Result<()> {
    let (_engine, client) = engine_and_client().await?;

    let body = client.call("/core/version", Payload::Empty).await?;
    let version: Value = serde_json::from_slice(&body)?;
    assert_eq!(version["version"], "v1.68.0");
    Ok(())
}

#[tokio::test]
async fn test_wrong_credentials_rejected() -> Result<()> {
    let engine = FakeEngine::start(&Credentials::generate()).await?;
    let client = ControlClient::with_base_url(engine.base_url(), Credentials::generate(), TIMEOUT)?;

    let err = client.call("/core/version", Payload::Empty).await.unwrap_err();
    assert!(matches!(err, StorageError::Status(401)), "got {:?}", err);
    assert!(engine.calls().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_engine_error_message_surfaces() -> Result<()> {
    let (_engine, client) = engine_and_client().await?;

    let err = client.call("/no/such/method", Payload::Empty).await.unwrap_err();
    match err {
        StorageError::ControlApi(msg) => assert_eq!(msg, "couldn't find method"),
        other => panic!("expected ControlApi error, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_json_payload() -> Result<()> {
    let (engine, client) = engine_and_client().await?;

    let params = json!({ "mountPoint": "/mnt/cosmos-storage-backup" });
    let body = client.call("/rc/noop", Payload::Json(params.clone())).await?;

    assert_eq!(serde_json::from_slice::<Value>(&body)?, params);
    assert_eq!(engine.calls_to("/rc/noop")[0].body, params);
    Ok(())
}

#[tokio::test]
async fn test_form_payload() -> Result<()> {
    let (engine, client) = engine_and_client().await?;

    client
        .call("/rc/noop", Payload::form([("group", "sftp"), ("name", "backup")]))
        .await?;

    assert_eq!(engine.calls_to("/rc/noop")[0].raw, "group=sftp&name=backup");
    Ok(())
}

#[tokio::test]
async fn test_unreachable_engine_is_transport_error() -> Result<()> {
    // Grab a free port, then leave it closed
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        listener.local_addr()?.port()
    };
    let client = ControlClient::with_base_url(
        format!("http://127.0.0.1:{}{}", port, DEFAULT_BASE_PATH),
        Credentials::generate(),
        TIMEOUT,
    )?;

    let err = client.call("/core/version", Payload::Empty).await.unwrap_err();
    assert!(matches!(err, StorageError::Transport(_)), "got {:?}", err);
    Ok(())
}

#[tokio::test]
async fn test_stats_through_client() -> Result<()> {
    let (engine, client) = engine_and_client().await?;
    engine.set_stats(json!({ "bytes": 5242880, "errors": 3, "transfers": 12 }));

    let stats = stats::get_stats(&client).await?;
    assert_eq!(stats.bytes_transferred, 5_242_880);
    assert_eq!(stats.error_count, 3);
    Ok(())
}
