//! # Warden
//!
//! Authentication and session core for message servers.
//!
//! Warden keeps track of who is logged in. A deployment plugs in a
//! [`CredentialChecker`] and Warden handles the rest: secret session
//! tokens, per-login session limits, idle expiry, reconnects, admin
//! blocks, and lifecycle notifications.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use warden::prelude::*;
//!
//! struct OpenDoor;
//!
//! impl CredentialChecker for OpenDoor {
//!     fn mechanism(&self) -> &str {
//!         "open"
//!     }
//!
//!     async fn verify(&self, _: &SecurityContext, _: &str, _: &str) -> Result<(), SessionError> {
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> Result<(), WardenError> {
//! let config = WardenConfig::load("warden.json")?;
//! warden::telemetry::init(&config.telemetry)?;
//!
//! let registry = SessionManager::new(config.registry, OpenDoor);
//! let login = registry.connect(ConnectProperties::new("alice", "pw"), None).await?;
//! registry.check(&login.secret_session_id)?;
//! # Ok(())
//! # }
//! ```

#![allow(async_fn_in_trait)]

mod config;
mod error;
pub mod telemetry;

pub use config::WardenConfig;
pub use error::WardenError;
pub use telemetry::TelemetryConfig;

pub use warden_protocol::{
    Codec, ConnectProperties, ConnectReturn, ConnectionState, JsonCodec, ProtocolError,
    SessionName, SessionPattern,
};
pub use warden_session::{
    CredentialChecker, DisconnectOptions, ErrorCode, RegistryConfig, RegistryStats,
    SecurityContext, Session, SessionError, SessionEvent, SessionListener, SessionManager,
    Subject, SubjectState,
};
pub use warden_timer::{ExpiryTimer, TimerConfig, TimerError};

/// Commonly used types, re-exported for convenience.
pub mod prelude {
    pub use crate::{
        ConnectProperties, ConnectReturn, ConnectionState, CredentialChecker, DisconnectOptions,
        RegistryConfig, SecurityContext, Session, SessionError, SessionEvent, SessionListener,
        SessionManager, SessionName, SessionPattern, WardenConfig, WardenError,
    };
}
