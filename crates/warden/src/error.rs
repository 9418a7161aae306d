//! Unified error type for Warden.

use warden_protocol::ProtocolError;
use warden_session::SessionError;
use warden_timer::TimerError;

/// Top-level error that wraps all crate-specific errors.
///
/// When using the `warden` facade you deal with this single error type
/// instead of importing errors from each sub-crate. The `#[from]`
/// attributes let `?` convert sub-crate errors automatically.
#[derive(Debug, thiserror::Error)]
pub enum WardenError {
    /// A malformed name or undecodable input.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A login, lookup or logout was refused.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The expiry timer is not running.
    #[error(transparent)]
    Timer(#[from] TimerError),

    /// Reading a configuration file failed.
    #[error("could not read config: {0}")]
    Io(#[from] std::io::Error),

    /// The log subscriber could not be installed.
    #[error("telemetry setup failed: {0}")]
    Telemetry(String),
}
