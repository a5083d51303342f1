//! Client for the engine's local control API
//!
//! Every call is an authenticated `POST` against the loopback control port.
//! Responses are returned as raw bytes; decoding them into domain types is
//! left to the caller.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Deserialize;
use tracing::debug;

use crate::config::EngineConfig;
use crate::error::{Result, StorageError};

/// Length of the generated control API username
const USER_LEN: usize = 8;
/// Length of the generated control API password
const PASSWORD_LEN: usize = 16;

/// Basic-auth credentials shared between the engine and the client
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    /// Generate a fresh random username/password pair
    pub fn generate() -> Self {
        Self {
            user: random_string(USER_LEN),
            password: random_string(PASSWORD_LEN),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Request body for a control call
#[derive(Debug, Clone)]
pub enum Payload {
    /// No parameters
    Empty,
    /// Structured JSON body
    Json(serde_json::Value),
    /// Flat key/value form encoding
    Form(Vec<(String, String)>),
}

impl Payload {
    /// Build a form payload from borrowed pairs
    pub fn form<K: Into<String>, V: Into<String>>(pairs: impl IntoIterator<Item = (K, V)>) -> Self {
        Payload::Form(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Transport to the engine's control API.
///
/// Implemented by [`ControlClient`] for the real engine and by fakes in tests.
#[async_trait]
pub trait ControlApi: Send + Sync {
    /// Issue a call against `path` (relative to the control base path)
    async fn call(&self, path: &str, payload: Payload) -> Result<Bytes>;
}

/// Structured error body returned by the engine
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: String,
}

/// HTTP client for the engine's control API
pub struct ControlClient {
    base_url: String,
    credentials: Credentials,
    client: reqwest::Client,
}

impl ControlClient {
    /// Create a client for the engine described by `config`
    pub fn new(config: &EngineConfig, credentials: Credentials) -> Result<Self> {
        let base_url = format!(
            "http://127.0.0.1:{}{}",
            config.port,
            config.base_path.trim_end_matches('/')
        );
        Self::with_base_url(base_url, credentials, config.request_timeout)
    }

    /// Create a client against an explicit base URL
    pub fn with_base_url(
        base_url: impl Into<String>,
        credentials: Credentials,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into(),
            credentials,
            client,
        })
    }

    /// Full URL of a control endpoint
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl ControlApi for ControlClient {
    async fn call(&self, path: &str, payload: Payload) -> Result<Bytes> {
        let url = self.endpoint(path);
        debug!("Sending request to engine: {}", url);

        let request = self
            .client
            .post(&url)
            .basic_auth(&self.credentials.user, Some(&self.credentials.password));

        let request = match &payload {
            Payload::Json(body) => {
                debug!("Request payload: {}", body);
                request.json(body)
            }
            Payload::Form(pairs) => {
                debug!("Request payload: {:?}", pairs);
                request.form(pairs)
            }
            Payload::Empty => request.form(&[] as &[(String, String)]),
        };

        let response = request.send().await?;
        let status = response.status();
        let body = response.bytes().await?;

        if !status.is_success() {
            return Err(decode_error(status.as_u16(), &body));
        }

        Ok(body)
    }
}

/// Turn a non-success response into an error, preferring the engine's own message
fn decode_error(status: u16, body: &[u8]) -> StorageError {
    match serde_json::from_slice::<ErrorBody>(body) {
        Ok(ErrorBody { error }) if !error.is_empty() => StorageError::ControlApi(error),
        _ => StorageError::Status(status),
    }
}
