//! Codec trait and implementations for serializing protocol values.
//!
//! The session core never touches bytes itself. Transports, admin tools
//! and the demo use a [`Codec`] to turn [`ConnectProperties`](crate::ConnectProperties),
//! [`ConnectReturn`](crate::ConnectReturn) and configuration structs
//! into bytes and back. Swapping the format means swapping the codec,
//! nothing else.

use serde::{Serialize, de::DeserializeOwned};

use crate::ProtocolError;

/// Encodes values to bytes and decodes bytes back.
///
/// `DeserializeOwned` means the decoded value owns its data, so the
/// input buffer can be dropped right after decoding.
pub trait Codec: Send + Sync + 'static {
    /// Serializes a value into bytes.
    ///
    /// # Errors
    /// Returns `ProtocolError::Encode` if the value cannot be represented.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError>;

    /// Deserializes bytes back into a value.
    ///
    /// # Errors
    /// Returns `ProtocolError::Decode` if the bytes are malformed or don't
    /// match the expected type. A session name that fails validation is
    /// reported the same way.
    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError>;
}

// ---------------------------------------------------------------------------
// JsonCodec
// ---------------------------------------------------------------------------

/// A [`Codec`] that uses JSON (via `serde_json`).
///
/// Behind the `json` feature flag (enabled by default).
///
/// ## Example
///
/// ```rust
/// use warden_protocol::{Codec, ConnectProperties, JsonCodec};
///
/// let codec = JsonCodec;
/// let props = ConnectProperties::new("alice", "secret");
///
/// let bytes = codec.encode(&props).unwrap();
/// let decoded: ConnectProperties = codec.decode(&bytes).unwrap();
/// assert_eq!(decoded, props);
/// ```
#[cfg(feature = "json")]
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

#[cfg(feature = "json")]
impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(value).map_err(ProtocolError::Encode)
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError> {
        serde_json::from_slice(data).map_err(ProtocolError::Decode)
    }
}
