//! Log subscriber setup.
//!
//! Every Warden crate logs through `tracing`. Libraries never install a
//! subscriber; binaries call [`init`] once at startup.

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use crate::WardenError;

/// How the process-wide log subscriber is set up.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Filter used when the environment variable is unset or invalid,
    /// e.g. `"info"` or `"warden_session=debug,info"`.
    pub default_filter: String,
    /// Environment variable that overrides `default_filter`.
    pub env_var: String,
    /// Colored output.
    pub ansi: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            default_filter: "info".to_string(),
            env_var: "RUST_LOG".to_string(),
            ansi: true,
        }
    }
}

impl TelemetryConfig {
    /// Builds the filter: the env var if it parses, else the default.
    pub fn filter(&self) -> Result<EnvFilter, WardenError> {
        match EnvFilter::try_from_env(&self.env_var) {
            Ok(filter) => Ok(filter),
            Err(_) => EnvFilter::try_new(&self.default_filter)
                .map_err(|e| WardenError::Telemetry(format!("bad filter '{}': {e}", self.default_filter))),
        }
    }
}

/// Installs a formatting subscriber for the whole process.
///
/// # Errors
/// [`WardenError::Telemetry`] if the filter does not parse or a global
/// subscriber is already installed.
pub fn init(config: &TelemetryConfig) -> Result<(), WardenError> {
    let filter = config.filter()?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(config.ansi)
        .with_target(true)
        .try_init()
        .map_err(|e| WardenError::Telemetry(e.to_string()))
}
