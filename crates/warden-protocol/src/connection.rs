//! Transport liveness as reported by the connection layer.
//!
//! This is independent of a session's own lifecycle: a session can be
//! perfectly valid while its transport is `Polling` or even `Dead`
//! (the client may come back with its secret token).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ProtocolError;

/// The liveness of a client's transport link.
///
/// ```text
///   Undef ──→ Alive ⇄ Polling
///               │        │
///               ▼        ▼
///              Dead ◄────┘
/// ```
///
/// The numeric values (`-1..=2`) are what transports put on the wire.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnectionState {
    /// Nothing is known about the link yet.
    #[default]
    Undef,
    /// The link is up.
    Alive,
    /// The link is down and the transport is trying to re-establish it.
    Polling,
    /// The link is gone.
    Dead,
}

impl ConnectionState {
    /// All states, in wire order.
    pub const ALL: [Self; 4] = [Self::Undef, Self::Alive, Self::Polling, Self::Dead];

    /// The wire value of this state.
    pub fn as_int(self) -> i32 {
        match self {
            Self::Undef => -1,
            Self::Alive => 0,
            Self::Polling => 1,
            Self::Dead => 2,
        }
    }

    /// Maps a wire value back to a state.
    pub fn from_int(value: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_int() == value)
    }

    /// The canonical upper-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Undef => "UNDEF",
            Self::Alive => "ALIVE",
            Self::Polling => "POLLING",
            Self::Dead => "DEAD",
        }
    }

    /// Lenient parsing: accepts a name (any case) or a wire number.
    ///
    /// Never fails. Unrecognized input falls back to `default` and is
    /// logged, since it usually comes straight from a client.
    pub fn parse(raw: &str, default: Self) -> Self {
        match raw.parse() {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(
                    input = raw,
                    fallback = %default,
                    error = %e,
                    "unrecognized connection state, using fallback"
                );
                default
            }
        }
    }
}

impl FromStr for ConnectionState {
    type Err = ProtocolError;

    /// Strict parsing. Use [`ConnectionState::parse`] for the lenient form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Ok(value) = trimmed.parse::<i32>() {
            return Self::from_int(value)
                .ok_or_else(|| ProtocolError::UnknownConnectionState(s.to_string()));
        }
        Self::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| ProtocolError::UnknownConnectionState(s.to_string()))
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
