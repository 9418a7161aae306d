//! Error types for the session layer.

use std::fmt;

use warden_protocol::ProtocolError;

/// Errors that can occur during session management.
///
/// The variants follow how a client should react:
///
/// ```text
///   AuthFailed / UnknownSession   → re-authenticate, never auto-retry
///   Blocked                       → contact an administrator
///   SessionLimitExceeded          → free a session, then retry
///   TemporarilyUnavailable        → retry shortly
/// ```
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The credential was rejected, or identity fields were missing.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The presented token or session name is not known.
    ///
    /// Displays exactly like an authentication failure, so clients can't
    /// tell which tokens ever existed.
    #[error("authentication failed")]
    UnknownSession,

    /// The login or the specific session is administratively blocked.
    #[error("access to '{0}' is blocked, contact the administrator")]
    Blocked(String),

    /// The login already holds its maximum number of sessions.
    #[error("login '{login}' reached its limit of {max} sessions")]
    SessionLimitExceeded { login: String, max: usize },

    /// A concurrent operation on the same name did not finish in time.
    #[error("temporarily unavailable: {0}")]
    TemporarilyUnavailable(String),

    /// The subject was shut down while the caller was working with it.
    #[error("subject '{0}' is no longer alive")]
    SubjectDead(String),

    /// A session name or other protocol value was malformed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Anything unexpected. Never leaves `connect` unnarrowed.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Stable, transport-facing classification of a [`SessionError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Bad credential, unknown session, malformed identity.
    AuthenticationFailed,
    /// Administrative block.
    AccessDenied,
    /// Per-login session limit reached.
    LimitExceeded,
    /// A race or wait timed out. Retrying is expected to work.
    TemporarilyUnavailable,
    /// Internal failure.
    Internal,
}

impl ErrorCode {
    /// The dotted code string transports put on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthenticationFailed => "user.security.authentication.accessDenied",
            Self::AccessDenied => "user.security.authorization.blocked",
            Self::LimitExceeded => "user.configuration.maxSession",
            Self::TemporarilyUnavailable => "resource.temporarilyUnavailable",
            Self::Internal => "internal.unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SessionError {
    /// Classifies the error for the transport layer.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::AuthFailed(_) | Self::UnknownSession | Self::Protocol(_) => {
                ErrorCode::AuthenticationFailed
            }
            Self::Blocked(_) => ErrorCode::AccessDenied,
            Self::SessionLimitExceeded { .. } => ErrorCode::LimitExceeded,
            Self::TemporarilyUnavailable(_) | Self::SubjectDead(_) => {
                ErrorCode::TemporarilyUnavailable
            }
            Self::Internal(_) => ErrorCode::Internal,
        }
    }

    /// `true` if the same request may succeed when simply retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::TemporarilyUnavailable | ErrorCode::LimitExceeded
        )
    }

    /// Narrows an error for a client at the edge of `connect`.
    ///
    /// Internal failures become a generic denial. Domain errors keep
    /// their specific, retry-friendly shape.
    pub(crate) fn narrow_for_client(self) -> Self {
        match self {
            Self::Internal(detail) => {
                tracing::error!(%detail, "internal failure during connect");
                Self::AuthFailed("login denied".into())
            }
            Self::SubjectDead(login) => Self::TemporarilyUnavailable(format!(
                "login '{login}' is being torn down, try again"
            )),
            other => other,
        }
    }
}
