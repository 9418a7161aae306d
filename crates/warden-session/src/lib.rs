//! Subject and session lifecycle for Warden.
//!
//! This crate answers three questions for every request a server sees:
//!
//! 1. **Who is this?** Logins are verified through a pluggable
//!    [`CredentialChecker`] and turn into a secret session token.
//! 2. **Is the token still good?** [`SessionManager::check`] resolves a
//!    token to its [`Session`] and pushes its expiry out.
//! 3. **What else does this login have open?** Every login name maps to
//!    one [`Subject`] that owns all of its sessions and enforces the
//!    per-login session limit.
//!
//! # How it fits in the stack
//!
//! ```text
//! Transport (above)   ← turns wire requests into connect/check/disconnect
//!     ↕
//! Session layer (this crate)  ← subjects, sessions, expiry, listeners
//!     ↕
//! Protocol + timer (below)  ← SessionName, ConnectProperties, ExpiryTimer
//! ```

#![allow(async_fn_in_trait)]

mod auth;
mod config;
mod error;
mod event;
mod index;
mod manager;
mod session;
mod subject;

pub use auth::{CredentialChecker, SecurityContext};
pub use config::RegistryConfig;
pub use error::{ErrorCode, SessionError};
pub use event::{SessionEvent, SessionListener};
pub use manager::{DisconnectOptions, RegistryStats, SessionManager};
pub use session::Session;
pub use subject::{Subject, SubjectState};
