//! Credential checking hook and the per-session security context.
//!
//! Warden doesn't verify passwords or tokens itself. Deployments plug in
//! a [`CredentialChecker`] (htpasswd file, LDAP bind, JWT validation, ...)
//! and the registry calls it at the right points of the login flow:
//!
//! ```text
//!   reserve(token) ──→ verify(login, secret) ──→ ... ──→ release()
//!        │                    │
//!        └── on any failure ──┴──→ release()
//! ```
//!
//! A [`SecurityContext`] is what `reserve` hands back. It travels with the
//! session for its whole life and is given back to `release` exactly once.

use std::fmt;
use std::time::SystemTime;

use crate::SessionError;

// ---------------------------------------------------------------------------
// SecurityContext
// ---------------------------------------------------------------------------

/// The security state bound to one session token.
#[derive(Clone)]
pub struct SecurityContext {
    token: String,
    mechanism: String,
    authenticated_login: Option<String>,
    reserved_at: SystemTime,
}

impl SecurityContext {
    /// A fresh, not yet authenticated context for `token`.
    pub fn new(token: impl Into<String>, mechanism: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            mechanism: mechanism.into(),
            authenticated_login: None,
            reserved_at: SystemTime::now(),
        }
    }

    /// The secret session token this context is bound to.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// The credential mechanism that reserved it.
    pub fn mechanism(&self) -> &str {
        &self.mechanism
    }

    /// The login that passed verification, if any.
    ///
    /// `None` for bypass-credential sessions.
    pub fn authenticated_login(&self) -> Option<&str> {
        self.authenticated_login.as_deref()
    }

    /// When the context was reserved.
    pub fn reserved_at(&self) -> SystemTime {
        self.reserved_at
    }

    pub(crate) fn mark_authenticated(&mut self, login: &str) {
        self.authenticated_login = Some(login.to_string());
    }

    pub(crate) fn rebind(&mut self, token: &str) {
        self.token = token.to_string();
    }
}

impl fmt::Debug for SecurityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityContext")
            .field("token", &"***")
            .field("mechanism", &self.mechanism)
            .field("authenticated_login", &self.authenticated_login)
            .field("reserved_at", &self.reserved_at)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// CredentialChecker
// ---------------------------------------------------------------------------

/// Verifies login credentials and answers authorization questions.
///
/// `Send + Sync + 'static` because one checker is shared by every task
/// calling into the registry for the registry's whole life.
///
/// # Example
///
/// ```rust
/// use warden_session::{CredentialChecker, SecurityContext, SessionError};
///
/// /// Accepts any login whose password equals the login name reversed.
/// /// Only for development.
/// struct MirrorChecker;
///
/// impl CredentialChecker for MirrorChecker {
///     fn mechanism(&self) -> &str {
///         "mirror"
///     }
///
///     async fn verify(
///         &self,
///         _context: &SecurityContext,
///         login: &str,
///         credential: &str,
///     ) -> Result<(), SessionError> {
///         let expected: String = login.chars().rev().collect();
///         if credential == expected {
///             Ok(())
///         } else {
///             Err(SessionError::AuthFailed("wrong password".into()))
///         }
///     }
/// }
/// ```
pub trait CredentialChecker: Send + Sync + 'static {
    /// Name of the mechanism, e.g. `"htpasswd"`.
    fn mechanism(&self) -> &str;

    /// Whether this checker serves a client asking for `requested`.
    /// `None` means the client takes whatever the server offers.
    fn supports(&self, requested: Option<&str>) -> bool {
        requested.is_none_or(|m| m.eq_ignore_ascii_case(self.mechanism()))
    }

    /// Reserves a security context for a new token.
    ///
    /// Every context handed out here is given back to [`release`](Self::release)
    /// exactly once, whether the login succeeds or not.
    fn reserve(&self, token: &str) -> Result<SecurityContext, SessionError> {
        Ok(SecurityContext::new(token, self.mechanism()))
    }

    /// Checks `credential` for `login`.
    ///
    /// # Returns
    /// - `Ok(())`: the credential is valid for this login
    /// - `Err(SessionError::AuthFailed)`: rejected
    fn verify(
        &self,
        context: &SecurityContext,
        login: &str,
        credential: &str,
    ) -> impl std::future::Future<Output = Result<(), SessionError>> + Send;

    /// Frees whatever `reserve` allocated.
    fn release(&self, context: &SecurityContext) {
        let _ = context;
    }

    /// Whether the session behind `context` may perform `action` on `key`.
    fn is_authorized(&self, context: &SecurityContext, action: &str, key: &str) -> bool {
        let _ = (context, action, key);
        true
    }
}
