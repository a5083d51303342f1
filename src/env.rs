//! Process environment helpers
//!
//! - `${VAR_NAME}` substitution for configuration text
//! - container detection, which decides the mount base directory

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::env;
use std::path::Path;

use crate::config::ConfigError;

/// Regex pattern for matching environment variable references: ${VAR_NAME}
static ENV_VAR_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

/// Marker files left by common container runtimes
const CONTAINER_MARKERS: &[&str] = &["/.dockerenv", "/run/.containerenv"];

/// Substitute environment variable references in a string.
///
/// Returns an error listing every missing variable, each named once.
pub fn substitute_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut missing: Vec<String> = Vec::new();

    let result = ENV_VAR_PATTERN.replace_all(input, |caps: &Captures<'_>| {
        let name = &caps[1];
        match env::var(name) {
            Ok(value) => value,
            Err(_) => {
                if !missing.iter().any(|m| m == name) {
                    missing.push(name.to_string());
                }
                String::new()
            }
        }
    });

    if !missing.is_empty() {
        return Err(ConfigError::ValidationError(format!(
            "Missing environment variables: {}",
            missing.join(", ")
        )));
    }

    Ok(result.into_owned())
}

/// Whether this process runs inside a container
pub fn is_inside_container() -> bool {
    CONTAINER_MARKERS.iter().any(|m| Path::new(m).exists())
}
