//! Error types for the protocol layer.
//!
//! Each crate in Warden defines its own error enum. A `ProtocolError`
//! always means the problem is in the shape of the input (a malformed
//! session name, undecodable bytes), never in session bookkeeping.

/// Errors that can occur in the protocol layer.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed (turning a Rust type into bytes).
    #[cfg(feature = "json")]
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// Deserialization failed (turning bytes into a Rust type).
    ///
    /// Common causes: malformed JSON, missing required fields,
    /// wrong data types, or truncated input.
    #[cfg(feature = "json")]
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// An absolute session name did not start with `/node/<id>/`.
    #[error("malformed root tag in session name '{0}'")]
    MalformedRoot(String),

    /// A node id was empty or contained a `/`.
    #[error("invalid node id '{0}'")]
    InvalidNode(String),

    /// The part after the node prefix was empty or had no login name.
    #[error("session name '{0}' has no relative part")]
    MissingRelative(String),

    /// The login name is shorter than [`MIN_LOGIN_LEN`](crate::MIN_LOGIN_LEN).
    #[error("login name '{0}' is too short")]
    InvalidLogin(String),

    /// The sequence segment is neither a number nor (in patterns) `*`.
    #[error("session name '{name}' has a non-numeric sequence '{segment}'")]
    InvalidSequence { name: String, segment: String },

    /// The relative part has more segments than any accepted layout.
    #[error("unexpected segment layout in session name '{0}'")]
    UnexpectedSegments(String),

    /// A connection state string was neither a known name nor a number.
    #[error("unknown connection state '{0}'")]
    UnknownConnectionState(String),

    /// A pattern used the wildcard in more than one segment.
    #[error("pattern '{0}' may only contain a single wildcard")]
    TooManyWildcards(String),
}
