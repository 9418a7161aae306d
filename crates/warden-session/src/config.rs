//! Registry configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use warden_protocol::validate_node;

use crate::SessionError;

/// Server-side policy for a [`SessionManager`](crate::SessionManager).
///
/// Per-login settings (timeouts, session caps) come from the client's
/// [`ConnectProperties`](warden_protocol::ConnectProperties). This
/// struct holds what only the operator decides.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RegistryConfig {
    /// Node id used to qualify session names. `None` on a single node
    /// that doesn't care about absolute names.
    pub node_id: Option<String>,

    /// Count server-allocated (negative) and client-chosen (positive)
    /// sessions separately against `max_sessions`.
    pub session_limits_pub_session_id_specific: bool,

    /// Keep a blocked subject around after its last session leaves, so
    /// an administrator can still inspect it.
    pub keep_blocked_subjects: bool,

    /// How long to wait for a subject under construction to come alive.
    pub alive_wait: Duration,

    /// Sleep between checks while another connect finishes creating the
    /// same session.
    pub session_poll_interval: Duration,

    /// How many such checks before giving up with a retryable error.
    pub session_poll_attempts: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            session_limits_pub_session_id_specific: false,
            keep_blocked_subjects: false,
            alive_wait: Duration::from_secs(60),
            session_poll_interval: Duration::from_millis(1),
            session_poll_attempts: 10_000,
        }
    }
}

impl RegistryConfig {
    /// A config qualified with a node id.
    pub fn with_node(node_id: impl Into<String>) -> Self {
        Self {
            node_id: Some(node_id.into()),
            ..Self::default()
        }
    }

    /// Rejects a node id that could not appear in an absolute session name.
    pub fn validate(&self) -> Result<(), SessionError> {
        if let Some(node) = &self.node_id {
            validate_node(node)?;
        }
        Ok(())
    }

    /// Upper bound on the create-race poll loop.
    pub fn session_poll_budget(&self) -> Duration {
        self.session_poll_interval * self.session_poll_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_config_default() {
        let config = RegistryConfig::default();
        assert_eq!(config.node_id, None);
        assert!(!config.session_limits_pub_session_id_specific);
        assert!(!config.keep_blocked_subjects);
        assert_eq!(config.alive_wait, Duration::from_secs(60));
        assert_eq!(config.session_poll_budget(), Duration::from_secs(10));
    }

    #[test]
    fn test_with_node_keeps_other_defaults() {
        let config = RegistryConfig::with_node("heron");
        assert_eq!(config.node_id.as_deref(), Some("heron"));
        assert_eq!(config.session_poll_attempts, 10_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_node_with_slash() {
        let config = RegistryConfig::with_node("rack/heron");
        assert!(matches!(config.validate(), Err(SessionError::Protocol(_))));
    }
}
