//! Value types shared by every Warden layer.
//!
//! This crate holds the immutable data that flows between the transport
//! layer and the session core:
//!
//! - **Names** ([`SessionName`], [`SessionPattern`]): who a session
//!   belongs to and which one it is.
//! - **Connection state** ([`ConnectionState`]): transport liveness
//!   reported into the core.
//! - **Connect data** ([`ConnectProperties`], [`ConnectReturn`]): the
//!   login request and its answer.
//! - **Codec** ([`Codec`] trait, [`JsonCodec`]): how those values turn
//!   into bytes.
//!
//! Nothing in here locks or allocates shared state. Everything is plain
//! data that can be cloned and sent across tasks freely.
//!
//! ```text
//! Transport (out of scope) → Protocol (values) → Session (registry)
//! ```

mod codec;
mod connect;
mod connection;
mod error;
mod name;

pub use codec::Codec;
#[cfg(feature = "json")]
pub use codec::JsonCodec;
pub use connect::{
    ConnectProperties, ConnectReturn, DEFAULT_MAX_SESSIONS, DEFAULT_SESSION_TIMEOUT,
};
pub use connection::ConnectionState;
pub use error::ProtocolError;
pub use name::{MIN_LOGIN_LEN, SessionName, SessionPattern, WILDCARD, validate_node};
