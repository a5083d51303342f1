//! Engine transfer counters

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::control::{ControlApi, Payload};
use crate::error::Result;

/// Counters reported by the engine. Missing, null or non-numeric fields read
/// as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    /// Bytes transferred since the engine started
    #[serde(rename = "bytes", default, deserialize_with = "lenient_count")]
    pub bytes_transferred: u64,
    /// Errors counted since the engine started
    #[serde(rename = "errors", default, deserialize_with = "lenient_count")]
    pub error_count: u64,
}

/// Read any JSON number as a count, truncating fractions; anything else is 0
fn lenient_count<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value
        .and_then(|v| v.as_u64().or_else(|| v.as_f64().map(|f| f as u64)))
        .unwrap_or(0))
}

/// Fetch the engine's core stats
pub async fn get_stats(api: &dyn ControlApi) -> Result<EngineStats> {
    debug!("Getting engine stats");
    let body = api.call("/core/stats", Payload::Empty).await?;
    Ok(serde_json::from_slice(&body)?)
}
