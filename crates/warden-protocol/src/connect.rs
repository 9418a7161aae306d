//! What a client sends to log in, and what it gets back.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::SessionName;

/// Default idle timeout for a session: one day.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Default cap on concurrent sessions per login name.
pub const DEFAULT_MAX_SESSIONS: usize = 10;

// ---------------------------------------------------------------------------
// ConnectProperties
// ---------------------------------------------------------------------------

/// Everything a client supplies when it connects.
///
/// This is deserialized from untrusted input, so it deliberately has no
/// way to skip credential verification. Internally-initiated sessions go
/// through a separate registry entry point instead.
///
/// `#[serde(default)]` lets a client send only the fields it cares about.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConnectProperties {
    /// Who is logging in. May be empty when `session_name` carries it.
    pub login_name: String,

    /// The secret (password, token) handed to the credential checker.
    pub credential: String,

    /// Which credential mechanism the client expects, e.g. `"htpasswd"`.
    /// `None` accepts whatever the server is configured with.
    pub mechanism: Option<String>,

    /// Remote address of the client, as seen by the transport.
    pub client_ip: Option<String>,

    /// Idle time after which the session expires. Zero means forever.
    pub session_timeout: Duration,

    /// Maximum concurrent sessions for this login name.
    pub max_sessions: usize,

    /// Log out every other session of this login before connecting.
    pub clear_sessions: bool,

    /// Only the client that created the session may resume it by name.
    pub reconnect_same_client_only: bool,

    /// A specific session to create or resume. When it has no sequence,
    /// the server allocates one.
    pub session_name: Option<SessionName>,

    /// A secret token from an earlier login, for reconnecting.
    pub secret_session_id: Option<String>,

    /// On a reconnect by session name, issue a fresh secret token.
    pub renew_token_on_reconnect: bool,
}

impl ConnectProperties {
    /// Properties for a plain login with default limits.
    pub fn new(login_name: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            login_name: login_name.into(),
            credential: credential.into(),
            ..Self::default()
        }
    }

    /// Sets the idle timeout (zero = never expire).
    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// Sets the per-login session cap.
    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }

    /// Requests a specific session name.
    pub fn with_session_name(mut self, name: SessionName) -> Self {
        self.session_name = Some(name);
        self
    }

    /// Sets the client address.
    pub fn with_client_ip(mut self, ip: impl Into<String>) -> Self {
        self.client_ip = Some(ip.into());
        self
    }

    /// Asks the server to log out all other sessions of this login first.
    pub fn with_clear_sessions(mut self, clear: bool) -> Self {
        self.clear_sessions = clear;
        self
    }

    /// The login name, taken from `session_name` when not set directly.
    pub fn effective_login(&self) -> Option<&str> {
        if !self.login_name.is_empty() {
            return Some(&self.login_name);
        }
        self.session_name.as_ref().map(SessionName::login)
    }

    /// `true` if the session never expires.
    pub fn lasts_forever(&self) -> bool {
        self.session_timeout.is_zero()
    }
}

impl Default for ConnectProperties {
    fn default() -> Self {
        Self {
            login_name: String::new(),
            credential: String::new(),
            mechanism: None,
            client_ip: None,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            max_sessions: DEFAULT_MAX_SESSIONS,
            clear_sessions: false,
            reconnect_same_client_only: false,
            session_name: None,
            secret_session_id: None,
            renew_token_on_reconnect: false,
        }
    }
}

/// Secrets are never printed, not even at `trace` level.
impl fmt::Debug for ConnectProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectProperties")
            .field("login_name", &self.login_name)
            .field("credential", &"***")
            .field("mechanism", &self.mechanism)
            .field("client_ip", &self.client_ip)
            .field("session_timeout", &self.session_timeout)
            .field("max_sessions", &self.max_sessions)
            .field("clear_sessions", &self.clear_sessions)
            .field("reconnect_same_client_only", &self.reconnect_same_client_only)
            .field("session_name", &self.session_name)
            .field(
                "secret_session_id",
                &self.secret_session_id.as_ref().map(|_| "***"),
            )
            .field("renew_token_on_reconnect", &self.renew_token_on_reconnect)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ConnectReturn
// ---------------------------------------------------------------------------

/// The registry's answer to a successful connect.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectReturn {
    /// The bearer token the client presents on every later call.
    pub secret_session_id: String,
    /// The full name of the session that was created or resumed.
    pub session_name: SessionName,
    /// `true` if an existing session was resumed.
    pub reconnected: bool,
}

impl fmt::Debug for ConnectReturn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectReturn")
            .field("secret_session_id", &"***")
            .field("session_name", &self.session_name)
            .field("reconnected", &self.reconnected)
            .finish()
    }
}
