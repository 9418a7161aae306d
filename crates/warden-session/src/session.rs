//! One authenticated login instance.
//!
//! A [`Session`] is what a secret token resolves to. It tracks:
//! - WHO owns it (its [`Subject`]) and WHICH session it is ([`SessionName`])
//! - HOW the client connected ([`ConnectProperties`], transport state)
//! - WHEN it expires (a timer in the registry's [`ExpiryTimer`])
//!
//! # Lifecycle
//!
//! ```text
//!   new() ──→ init() ──→ refresh() … refresh() ──→ shutdown()
//!   (pending)  (usable)                             (terminal)
//! ```
//!
//! A session is only handed out once initialized, and once shut down it
//! never comes back: the registry drops its token before calling
//! [`Session::shutdown`], and nothing re-inserts a shut-down session.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, SystemTime};

use tokio::time::Instant;
use warden_protocol::{ConnectProperties, ConnectionState, SessionName};
use warden_timer::{ExpiryTimer, TimerKey};

use crate::{SecurityContext, SessionError, Subject};

/// The timer type shared by all sessions of one registry.
pub(crate) type SessionTimer = ExpiryTimer<Weak<Session>>;

/// Diagnostic instance counter, process-wide.
static NEXT_SESSION_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// An armed expiry timer.
#[derive(Debug, Clone, Copy)]
struct Expiry {
    key: TimerKey,
    deadline: Instant,
}

/// Mutable part of a session. Guarded by the innermost lock in the
/// registry's lock order: nothing is called out while it is held.
struct SessionState {
    token: String,
    owner: Option<Arc<Subject>>,
    context: Option<SecurityContext>,
    props: ConnectProperties,
    bypass: bool,
    blocked: bool,
    connection_state: ConnectionState,
    started_at: Option<SystemTime>,
    last_access: Option<Instant>,
    timer: Option<SessionTimer>,
    expiry: Option<Expiry>,
}

/// A single authenticated login.
pub struct Session {
    instance_id: u64,
    name: SessionName,
    created_at: SystemTime,
    me: Weak<Session>,
    initialized: AtomicBool,
    shutdown: AtomicBool,
    state: Mutex<SessionState>,
}

impl Session {
    /// Creates an uninitialized session. Only its owning subject does this.
    pub(crate) fn new(name: SessionName) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            instance_id: NEXT_SESSION_INSTANCE.fetch_add(1, Ordering::Relaxed),
            name,
            created_at: SystemTime::now(),
            me: me.clone(),
            initialized: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            state: Mutex::new(SessionState {
                token: String::new(),
                owner: None,
                context: None,
                props: ConnectProperties::default(),
                bypass: false,
                blocked: false,
                connection_state: ConnectionState::Undef,
                started_at: None,
                last_access: None,
                timer: None,
                expiry: None,
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the session usable.
    ///
    /// Takes its token from `context`. Arms the expiry timer unless the
    /// properties ask for a session that lasts forever.
    ///
    /// # Errors
    /// [`SessionError::Internal`] if called twice or after shutdown.
    pub(crate) fn init(
        &self,
        owner: Arc<Subject>,
        context: SecurityContext,
        props: ConnectProperties,
        bypass: bool,
        timer: &SessionTimer,
    ) -> Result<(), SessionError> {
        if self.is_shutdown() {
            return Err(SessionError::Internal(format!(
                "session {} initialized after shutdown",
                self.name
            )));
        }

        let mut state = self.state();
        if self.initialized.load(Ordering::Acquire) {
            return Err(SessionError::Internal(format!(
                "session {} initialized twice",
                self.name
            )));
        }

        state.token = context.token().to_string();
        state.context = Some(context);
        state.owner = Some(owner);
        state.props = scrub(props);
        state.bypass = bypass;
        state.connection_state = ConnectionState::Alive;
        state.started_at = Some(SystemTime::now());
        state.last_access = Some(Instant::now());
        state.timer = Some(timer.clone());
        self.rearm(&mut state);

        self.initialized.store(true, Ordering::Release);
        tracing::debug!(
            session = %self.name,
            instance = self.instance_id,
            timeout_secs = state.props.session_timeout.as_secs(),
            bypass,
            "session initialized"
        );
        Ok(())
    }

    /// Pushes expiry out to now + timeout. A zero timeout cancels expiry.
    ///
    /// Called on every successful registry `check()`, so it costs one
    /// mutex and at most one channel send.
    pub fn refresh(&self) {
        if self.is_shutdown() {
            return;
        }
        let mut state = self.state();
        state.last_access = Some(Instant::now());
        self.rearm(&mut state);
    }

    /// Re-arms, arms or cancels the timer to match the current timeout.
    fn rearm(&self, state: &mut SessionState) {
        let timeout = state.props.session_timeout;
        let Some(timer) = state.timer.clone() else {
            return;
        };

        if timeout.is_zero() {
            if let Some(expiry) = state.expiry.take() {
                let _ = timer.cancel(expiry.key);
            }
            return;
        }

        let deadline = Instant::now() + timeout;
        let result = match state.expiry {
            Some(expiry) => timer.reschedule(expiry.key, timeout).map(|_| expiry.key),
            None => timer.schedule_at(deadline, self.me.clone()),
        };
        match result {
            Ok(key) => state.expiry = Some(Expiry { key, deadline }),
            Err(e) => {
                tracing::warn!(session = %self.name, error = %e, "could not arm expiry timer");
                state.expiry = None;
            }
        }
    }

    /// Called by the registry when the timer for `key` fires.
    ///
    /// Returns the token to disconnect if the session really is past its
    /// deadline. A fire that lost a race with `refresh()` re-arms for the
    /// newer deadline and returns `None`. The caller disconnects with no
    /// session lock held.
    pub(crate) fn timeout_fired(&self, key: TimerKey) -> Option<String> {
        if !self.is_usable() {
            return None;
        }
        let mut state = self.state();
        let expiry = state.expiry?;
        if expiry.key != key {
            return None;
        }
        if Instant::now() < expiry.deadline {
            // The refresh arrived after the timer had already fired.
            let timer = state.timer.clone()?;
            match timer.schedule_at(expiry.deadline, self.me.clone()) {
                Ok(key) => {
                    state.expiry = Some(Expiry {
                        key,
                        deadline: expiry.deadline,
                    })
                }
                Err(_) => state.expiry = None,
            }
            return None;
        }
        state.expiry = None;
        Some(state.token.clone())
    }

    /// Replaces the connection metadata (used on reconnect).
    ///
    /// Re-arms expiry when the timeout changed. The token stays as is.
    pub fn update_connection_properties(&self, props: ConnectProperties) {
        if self.is_shutdown() {
            return;
        }
        let mut state = self.state();
        let timeout_changed = state.props.session_timeout != props.session_timeout;
        state.props = scrub(props);
        state.connection_state = ConnectionState::Alive;
        if timeout_changed {
            self.rearm(&mut state);
        }
    }

    /// Swaps the secret token. The registry calls this inside the same
    /// critical section that moves the index entry.
    pub(crate) fn change_secret_token(&self, token: &str) {
        let mut state = self.state();
        state.token = token.to_string();
        if let Some(context) = state.context.as_mut() {
            context.rebind(token);
        }
    }

    /// Turns a bypass-credential placeholder into a regular session.
    ///
    /// Returns the placeholder's context, which the caller must release.
    pub(crate) fn promote(
        &self,
        context: SecurityContext,
        props: ConnectProperties,
    ) -> Option<SecurityContext> {
        let mut state = self.state();
        state.token = context.token().to_string();
        let old = state.context.replace(context);
        state.bypass = false;
        let timeout_changed = state.props.session_timeout != props.session_timeout;
        state.props = scrub(props);
        if timeout_changed {
            self.rearm(&mut state);
        }
        old
    }

    /// Takes the security context out for release. Returns `None` the
    /// second time, so a context is released at most once.
    pub(crate) fn take_security_context(&self) -> Option<SecurityContext> {
        self.state().context.take()
    }

    /// Records that the transport reported the link as gone.
    pub(crate) fn connection_lost(&self) {
        let mut state = self.state();
        if state.connection_state != ConnectionState::Dead {
            state.connection_state = ConnectionState::Dead;
            tracing::info!(session = %self.name, "transport link lost");
        }
    }

    /// Terminal shutdown. Idempotent: returns `true` only the first time.
    ///
    /// Cancels expiry and detaches from the owning subject.
    pub fn shutdown(&self) -> bool {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return false;
        }
        let owner = {
            let mut state = self.state();
            if let (Some(timer), Some(expiry)) = (state.timer.take(), state.expiry.take()) {
                let _ = timer.cancel(expiry.key);
            }
            state.connection_state = ConnectionState::Dead;
            state.owner.take()
        };
        tracing::debug!(session = %self.name, instance = self.instance_id, "session shut down");
        drop(owner);
        true
    }

    // -- Accessors ---------------------------------------------------------

    /// Diagnostic id, unique within the process.
    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    /// The full session name.
    pub fn name(&self) -> &SessionName {
        &self.name
    }

    /// The login name.
    pub fn login(&self) -> &str {
        self.name.login()
    }

    /// The current secret token. Empty until initialized.
    pub fn token(&self) -> String {
        self.state().token.clone()
    }

    /// The owning subject, until shutdown detaches it.
    pub fn owner(&self) -> Option<Arc<Subject>> {
        self.state().owner.clone()
    }

    /// A copy of the security context, if it has not been released.
    pub fn security_context(&self) -> Option<SecurityContext> {
        self.state().context.clone()
    }

    /// A copy of the connection properties (credential removed).
    pub fn connection_properties(&self) -> ConnectProperties {
        self.state().props.clone()
    }

    /// The client address recorded at the last (re)connect.
    pub fn client_ip(&self) -> Option<String> {
        self.state().props.client_ip.clone()
    }

    /// `true` once `init` has completed.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// `true` once `shutdown` has run.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Initialized and not shut down.
    pub fn is_usable(&self) -> bool {
        self.is_initialized() && !self.is_shutdown()
    }

    /// `true` for sessions created without credential verification.
    pub fn is_bypass(&self) -> bool {
        self.state().bypass
    }

    /// Whether an administrator blocked this session.
    pub fn is_blocked(&self) -> bool {
        self.state().blocked
    }

    /// Blocks or unblocks the session for reconnects.
    pub fn set_blocked(&self, blocked: bool) {
        self.state().blocked = blocked;
    }

    /// Transport liveness as last reported.
    pub fn connection_state(&self) -> ConnectionState {
        self.state().connection_state
    }

    /// When the session object was created.
    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// When `init` ran.
    pub fn started_at(&self) -> Option<SystemTime> {
        self.state().started_at
    }

    /// Time left until expiry. `None` for sessions that last forever.
    pub fn expires_in(&self) -> Option<Duration> {
        self.state()
            .expiry
            .map(|e| e.deadline.saturating_duration_since(Instant::now()))
    }
}

/// Drops the credential before properties are stored.
fn scrub(mut props: ConnectProperties) -> ConnectProperties {
    props.credential.clear();
    props
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("instance_id", &self.instance_id)
            .field("name", &self.name)
            .field("initialized", &self.is_initialized())
            .field("shutdown", &self.is_shutdown())
            .finish_non_exhaustive()
    }
}
