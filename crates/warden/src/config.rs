//! Process configuration: registry policy plus logging, in one file.

use std::path::Path;

use serde::{Deserialize, Serialize};
use warden_protocol::{Codec, JsonCodec};
use warden_session::RegistryConfig;

use crate::{TelemetryConfig, WardenError};

/// Everything a Warden process reads at startup.
///
/// Every field has a default, so an empty JSON object is a valid config.
///
/// ```rust
/// use warden::WardenConfig;
///
/// let config = WardenConfig::from_json(br#"{ "registry": { "node_id": "heron" } }"#).unwrap();
/// assert_eq!(config.registry.node_id.as_deref(), Some("heron"));
/// assert_eq!(config.telemetry.default_filter, "info");
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WardenConfig {
    pub registry: RegistryConfig,
    pub telemetry: TelemetryConfig,
}

impl WardenConfig {
    /// Parses and validates a JSON config.
    pub fn from_json(bytes: &[u8]) -> Result<Self, WardenError> {
        let config: Self = JsonCodec.decode(bytes)?;
        config.registry.validate()?;
        Ok(config)
    }

    /// Reads and parses a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, WardenError> {
        let bytes = std::fs::read(path.as_ref())?;
        let config = Self::from_json(&bytes)?;
        tracing::debug!(path = %path.as_ref().display(), "config loaded");
        Ok(config)
    }
}
