//! The session registry: every login, resume and logout goes through here.
//!
//! [`SessionManager`] owns the token index, the subject index, the expiry
//! timer and the listener set. It is a cheap-to-clone handle; all clones
//! share one registry.
//!
//! # Login flow
//!
//! ```text
//! connect(props, token?)
//!   │
//!   ├─ token known? ─────────────→ refresh, SessionUpdated  (resume)
//!   ├─ blocked login / session? ─────────────────────→ Blocked
//!   ├─ named session exists? ──→ verify, refresh, SessionUpdated  (resume)
//!   │
//!   ├─ reserve context, verify credential
//!   ├─ get-or-create subject, wait until alive, take login lock
//!   ├─ clear_sessions? ─→ disconnect siblings, start over once
//!   └─ get-or-create session, init, index ─→ SessionAdded
//! ```
//!
//! # Concurrency
//!
//! One `std::sync::Mutex` guards both lookup tables (see [`Index`]) and is
//! never held across an `.await`. Logins of the same name are serialized
//! by the subject's async login lock, which is always taken before the
//! index lock. Failures and cancellation at any `.await` are cleaned up by
//! drop guards: a reserved security context is released, a half-built
//! session record is removed, the login lock is let go.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use rand::Rng;
use serde::Serialize;
use tokio::sync::mpsc;
use warden_protocol::{ConnectProperties, ConnectReturn, ConnectionState, SessionName, SessionPattern};
use warden_timer::{ExpiryTimer, Expired, TimerConfig};

use crate::event::Listeners;
use crate::index::Index;
use crate::session::SessionTimer;
use crate::{
    CredentialChecker, RegistryConfig, SecurityContext, Session, SessionError, SessionEvent,
    SessionListener, Subject,
};

/// Server-allocated session sequences count down from -1, so they never
/// collide with the positive sequences clients pick.
static NEXT_INTERNAL_SEQUENCE: AtomicI64 = AtomicI64::new(-1);

/// How often a login restarts after its subject died underneath it.
const SUBJECT_DEAD_RETRIES: usize = 3;

fn next_internal_sequence() -> i64 {
    NEXT_INTERNAL_SEQUENCE.fetch_sub(1, Ordering::Relaxed)
}

/// Generates a random 128-bit token as a 32-char lowercase hex string.
fn generate_token() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// ---------------------------------------------------------------------------
// Public option and report types
// ---------------------------------------------------------------------------

/// Extra behaviour for [`SessionManager::disconnect_with`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisconnectOptions {
    /// Also disconnect every other session of the same login.
    pub clear_sessions: bool,
}

/// Point-in-time registry counters, for admin endpoints and logs.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RegistryStats {
    /// Subjects in the index, blocked placeholders included.
    pub subjects: usize,
    /// Initialized sessions reachable by token.
    pub sessions: usize,
    /// Expiry timers waiting to fire.
    pub pending_timers: usize,
    /// Registered listeners.
    pub listeners: usize,
    /// `true` after [`SessionManager::shutdown`].
    pub halted: bool,
}

/// Whether a login runs the credential checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verification {
    Credential,
    Bypass,
}

/// What one pass through the login flow produced.
enum Step {
    Done(ConnectReturn),
    /// Sibling sessions were cleared; run the login again.
    Cleared,
}

// ---------------------------------------------------------------------------
// Drop guards
// ---------------------------------------------------------------------------

/// A reserved security context that goes back to the checker unless the
/// login commits it.
struct Reservation<'a, C: CredentialChecker> {
    checker: &'a C,
    context: SecurityContext,
    committed: bool,
}

impl<'a, C: CredentialChecker> Reservation<'a, C> {
    fn new(checker: &'a C, context: SecurityContext) -> Self {
        Self {
            checker,
            context,
            committed: false,
        }
    }

    fn context(&self) -> &SecurityContext {
        &self.context
    }

    fn context_mut(&mut self) -> &mut SecurityContext {
        &mut self.context
    }

    /// Ownership of the context moved into a session.
    fn commit(mut self) {
        self.committed = true;
    }
}

impl<C: CredentialChecker> Drop for Reservation<'_, C> {
    fn drop(&mut self) {
        if !self.committed {
            self.checker.release(&self.context);
        }
    }
}

/// A session record created by this login but not yet indexed. Removed
/// again (and its subject reaped if empty) unless disarmed.
struct PendingSession<'a, C: CredentialChecker> {
    shared: &'a Shared<C>,
    subject: &'a Arc<Subject>,
    session: &'a Arc<Session>,
    armed: bool,
}

impl<C: CredentialChecker> PendingSession<'_, C> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<C: CredentialChecker> Drop for PendingSession<'_, C> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::debug!(session = %self.session.name(), "abandoning half-built session");
        let subject_died = self.shared.index().remove_pending(self.subject, self.session);
        self.session.shutdown();
        if subject_died {
            self.shared
                .listeners
                .fire(SessionEvent::SubjectRemoved(Arc::clone(self.subject)));
        }
    }
}

// ---------------------------------------------------------------------------
// SessionManager
// ---------------------------------------------------------------------------

struct Shared<C: CredentialChecker> {
    config: Arc<RegistryConfig>,
    checker: C,
    index: Mutex<Index>,
    listeners: Listeners,
    timer: SessionTimer,
    halted: AtomicBool,
}

impl<C: CredentialChecker> Shared<C> {
    fn index(&self) -> MutexGuard<'_, Index> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session(&self, token: &str) -> Option<Arc<Session>> {
        self.index().session(token)
    }

    fn subject(&self, login: &str) -> Option<Arc<Subject>> {
        self.index().subject(login)
    }

    fn node(&self) -> Option<&str> {
        self.config.node_id.as_deref()
    }

    /// Drops an empty subject and announces it if it had been alive.
    fn reap(&self, subject: &Arc<Subject>) {
        let died = self.index().reap(subject);
        if died {
            self.listeners
                .fire(SessionEvent::SubjectRemoved(Arc::clone(subject)));
        }
    }
}

impl<C: CredentialChecker> Drop for Shared<C> {
    fn drop(&mut self) {
        self.timer.shutdown();
        // Sessions and subjects point at each other; shutting the
        // sessions down breaks the cycle.
        let (sessions, _) = self
            .index
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain();
        for session in sessions {
            session.shutdown();
        }
    }
}

/// The session registry.
///
/// # Panics
///
/// [`SessionManager::new`] spawns the expiry task and so must be called
/// from within a Tokio runtime.
///
/// # Example
///
/// ```rust,no_run
/// use warden_protocol::ConnectProperties;
/// use warden_session::{CredentialChecker, RegistryConfig, SecurityContext, SessionError, SessionManager};
///
/// struct OpenDoor;
///
/// impl CredentialChecker for OpenDoor {
///     fn mechanism(&self) -> &str {
///         "open"
///     }
///
///     async fn verify(&self, _: &SecurityContext, _: &str, _: &str) -> Result<(), SessionError> {
///         Ok(())
///     }
/// }
///
/// # async fn demo() -> Result<(), SessionError> {
/// let registry = SessionManager::new(RegistryConfig::default(), OpenDoor);
/// let login = registry.connect(ConnectProperties::new("alice", "pw"), None).await?;
/// let session = registry.check(&login.secret_session_id)?;
/// assert_eq!(session.login(), "alice");
/// registry.disconnect(&login.secret_session_id)?;
/// # Ok(())
/// # }
/// ```
pub struct SessionManager<C: CredentialChecker> {
    shared: Arc<Shared<C>>,
}

impl<C: CredentialChecker> Clone for SessionManager<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: CredentialChecker> SessionManager<C> {
    /// Creates an empty registry and starts its expiry task.
    pub fn new(config: RegistryConfig, checker: C) -> Self {
        let (timer, expired) = ExpiryTimer::spawn(TimerConfig {
            name: "session-expiry".into(),
            ..TimerConfig::default()
        });
        let shared = Arc::new(Shared {
            config: Arc::new(config),
            checker,
            index: Mutex::new(Index::default()),
            listeners: Listeners::default(),
            timer,
            halted: AtomicBool::new(false),
        });
        tokio::spawn(run_expiry(Arc::downgrade(&shared), expired));
        tracing::info!(node = ?shared.config.node_id, "session registry started");
        Self { shared }
    }

    /// The registry configuration.
    pub fn config(&self) -> &RegistryConfig {
        &self.shared.config
    }

    /// The credential checker.
    pub fn checker(&self) -> &C {
        &self.shared.checker
    }

    // -- Login -------------------------------------------------------------

    /// Logs a client in, or resumes one of its sessions.
    ///
    /// `token` is a previously issued secret session id; it may also come
    /// in `props.secret_session_id`. A known token resumes its session
    /// without a credential check.
    ///
    /// # Errors
    /// - [`SessionError::AuthFailed`]: bad credential, missing login, unsupported mechanism
    /// - [`SessionError::Blocked`]: login or named session is blocked
    /// - [`SessionError::SessionLimitExceeded`]: the login already has `max_sessions`
    /// - [`SessionError::TemporarilyUnavailable`]: a concurrent login or logout
    ///   of the same name did not settle in time
    pub async fn connect(
        &self,
        props: ConnectProperties,
        token: Option<&str>,
    ) -> Result<ConnectReturn, SessionError> {
        self.login(props, token, Verification::Credential).await
    }

    /// Logs in without checking the credential.
    ///
    /// For sessions the server opens on its own behalf (plugins, cluster
    /// links). The resulting session is a placeholder that a later verified
    /// login of the same session name takes over.
    pub async fn connect_internal(
        &self,
        props: ConnectProperties,
    ) -> Result<ConnectReturn, SessionError> {
        self.login(props, None, Verification::Bypass).await
    }

    async fn login(
        &self,
        mut props: ConnectProperties,
        token: Option<&str>,
        verification: Verification,
    ) -> Result<ConnectReturn, SessionError> {
        let mut cleared = false;
        let mut dead_retries = 0;
        let result = loop {
            match self.try_login(&props, token, verification).await {
                Ok(Step::Done(ret)) => break Ok(ret),
                Ok(Step::Cleared) if !cleared => {
                    cleared = true;
                    props.clear_sessions = false;
                }
                Ok(Step::Cleared) => {
                    break Err(SessionError::Internal("sessions cleared twice".into()));
                }
                Err(SessionError::SubjectDead(login)) if dead_retries < SUBJECT_DEAD_RETRIES => {
                    dead_retries += 1;
                    tracing::debug!(%login, attempt = dead_retries, "subject died during login, retrying");
                }
                Err(e) => break Err(e),
            }
        };

        result.map_err(|e| {
            tracing::info!(
                login = props.effective_login().unwrap_or("<none>"),
                code = %e.code(),
                error = %e,
                "login rejected"
            );
            e.narrow_for_client()
        })
    }

    async fn try_login(
        &self,
        props: &ConnectProperties,
        token: Option<&str>,
        verification: Verification,
    ) -> Result<Step, SessionError> {
        let shared = &self.shared;
        if shared.halted.load(Ordering::Acquire) {
            return Err(SessionError::TemporarilyUnavailable(
                "session registry is shutting down".into(),
            ));
        }

        // 1. Resume by token. Possession of a live token is the proof.
        let presented = token
            .map(str::to_string)
            .or_else(|| props.secret_session_id.clone())
            .filter(|t| !t.is_empty());
        let resumable = presented
            .as_deref()
            .and_then(|t| shared.session(t))
            .filter(|s| s.is_usable());
        if let Some(session) = resumable {
            if props.effective_login().is_some_and(|l| l != session.login()) {
                tracing::warn!(session = %session.name(), "token presented for another login");
                return Err(SessionError::UnknownSession);
            }
            if session.owner().is_some_and(|s| s.is_blocked()) {
                tracing::warn!(session = %session.name(), "resume attempt on blocked subject");
                return Err(SessionError::Blocked(session.login().to_string()));
            }
            if session.is_blocked() {
                tracing::warn!(session = %session.name(), "resume attempt on blocked session");
                return Err(SessionError::Blocked(session.name().relative_name()));
            }
            session.update_connection_properties(props.clone());
            session.refresh();
            if !shared.index().is_indexed(&session) {
                return Err(SessionError::UnknownSession);
            }
            tracing::info!(session = %session.name(), "session resumed by token");
            shared
                .listeners
                .fire(SessionEvent::SessionUpdated(Arc::clone(&session)));
            return Ok(Step::Done(connect_return(&session, true)));
        }

        let login = props
            .effective_login()
            .ok_or_else(|| SessionError::AuthFailed("missing login name".into()))?;
        let subject_name = SessionName::subject(shared.node(), login)?;
        let requested = match &props.session_name {
            Some(name) if name.login() != login => {
                return Err(SessionError::AuthFailed(
                    "session name does not belong to the login".into(),
                ));
            }
            Some(name) => Some(name.with_default_node(shared.node())?).filter(|n| n.is_session()),
            None => None,
        };

        // 2. Administrative blocks.
        if let Some(subject) = shared.subject(login) {
            if subject.is_blocked() {
                tracing::warn!(login, "login attempt on blocked subject");
                return Err(SessionError::Blocked(login.to_string()));
            }
            if let Some(name) = &requested {
                let blocked = subject
                    .session_record(&name.absolute_name())
                    .is_some_and(|s| s.is_blocked());
                if blocked {
                    tracing::warn!(session = %name, "login attempt on blocked session");
                    return Err(SessionError::Blocked(name.relative_name()));
                }
            }
        }

        // 3. Resume by session name.
        if verification == Verification::Credential {
            if let Some(existing) = requested.as_ref().and_then(|n| self.session_by_name(n)) {
                if !existing.is_bypass() {
                    return self.resume_by_name(&existing, login, props).await.map(Step::Done);
                }
            }
        }

        // 4. Fresh authentication.
        let checker = &shared.checker;
        if !checker.supports(props.mechanism.as_deref()) {
            return Err(SessionError::AuthFailed(format!(
                "mechanism '{}' is not supported",
                props.mechanism.as_deref().unwrap_or_default()
            )));
        }
        let token = presented.unwrap_or_else(generate_token);
        let mut reservation = Reservation::new(checker, checker.reserve(&token)?);
        match verification {
            Verification::Credential => {
                checker
                    .verify(reservation.context(), login, &props.credential)
                    .await?;
                reservation.context_mut().mark_authenticated(login);
            }
            Verification::Bypass => {
                tracing::debug!(login, "credential check bypassed for internal login");
            }
        }

        // 5. Materialize.
        let (subject, created) = shared
            .index()
            .get_or_create_subject(&subject_name, &shared.config)?;
        if created {
            subject.to_alive(props.max_sessions)?;
            shared
                .listeners
                .fire(SessionEvent::SubjectAdded(Arc::clone(&subject)));
        }
        let outcome = self
            .materialize(&subject, requested, reservation, props, verification)
            .await;
        if outcome.is_err() {
            shared.reap(&subject);
        }
        outcome
    }

    async fn resume_by_name(
        &self,
        session: &Arc<Session>,
        login: &str,
        props: &ConnectProperties,
    ) -> Result<ConnectReturn, SessionError> {
        let previous = session.connection_properties();
        if previous.reconnect_same_client_only && previous.client_ip != props.client_ip {
            tracing::warn!(
                session = %session.name(),
                from = ?props.client_ip,
                "resume from a different client refused"
            );
            return Err(SessionError::AuthFailed(
                "session may only be resumed by the client that opened it".into(),
            ));
        }

        let context = session
            .security_context()
            .ok_or(SessionError::UnknownSession)?;
        self.shared
            .checker
            .verify(&context, login, &props.credential)
            .await?;

        // The session may have been disconnected while we awaited.
        if props.renew_token_on_reconnect {
            let token = generate_token();
            self.shared.index().change_token(session, &token)?;
            tracing::debug!(session = %session.name(), "secret token renewed");
        } else if !self.shared.index().is_indexed(session) {
            return Err(SessionError::UnknownSession);
        }
        session.update_connection_properties(props.clone());
        session.refresh();
        tracing::info!(session = %session.name(), "session resumed by name");
        self.shared
            .listeners
            .fire(SessionEvent::SessionUpdated(Arc::clone(session)));
        Ok(connect_return(session, true))
    }

    /// Creates (or adopts) the session record under the login lock.
    async fn materialize(
        &self,
        subject: &Arc<Subject>,
        requested: Option<SessionName>,
        reservation: Reservation<'_, C>,
        props: &ConnectProperties,
        verification: Verification,
    ) -> Result<Step, SessionError> {
        let shared = &self.shared;
        let guard = subject.wait_until_alive(true).await?;
        if subject.is_blocked() {
            return Err(SessionError::Blocked(subject.login().to_string()));
        }
        subject.to_alive(props.max_sessions)?;

        if props.clear_sessions {
            let siblings = subject.sessions();
            if !siblings.is_empty() {
                drop(guard);
                drop(reservation);
                for sibling in &siblings {
                    if let Err(e) = self.disconnect(&sibling.token()) {
                        tracing::debug!(session = %sibling.name(), error = %e, "sibling already gone");
                    }
                }
                tracing::info!(
                    login = subject.login(),
                    cleared = siblings.len(),
                    "cleared previous sessions"
                );
                return Ok(Step::Cleared);
            }
        }

        let name = match requested {
            Some(name) => name,
            None => SessionName::new(shared.node(), subject.login(), next_internal_sequence())?,
        };
        let (session, created) = subject.get_or_create_session(&name).await?;

        if created {
            let pending = PendingSession {
                shared,
                subject,
                session: &session,
                armed: true,
            };
            session.init(
                Arc::clone(subject),
                reservation.context().clone(),
                props.clone(),
                verification == Verification::Bypass,
                &shared.timer,
            )?;
            shared.index().install(&session, subject)?;
            pending.disarm();
            reservation.commit();

            tracing::info!(
                session = %session.name(),
                instance = session.instance_id(),
                timeout_secs = props.session_timeout.as_secs(),
                "session created"
            );
            shared
                .listeners
                .fire(SessionEvent::SessionAdded(Arc::clone(&session)));
            return Ok(Step::Done(connect_return(&session, false)));
        }

        if session.is_bypass() && verification == Verification::Credential {
            let placeholder = shared
                .index()
                .promote(&session, reservation.context().clone(), props.clone())?;
            reservation.commit();
            if let Some(context) = placeholder {
                shared.checker.release(&context);
            }
            tracing::info!(session = %session.name(), "verified login took over internal session");
            shared
                .listeners
                .fire(SessionEvent::SessionUpdated(Arc::clone(&session)));
            return Ok(Step::Done(connect_return(&session, true)));
        }

        // Another login finished creating this name first.
        drop(reservation);
        session.refresh();
        tracing::debug!(session = %session.name(), "concurrent login won, returning its session");
        shared
            .listeners
            .fire(SessionEvent::SessionUpdated(Arc::clone(&session)));
        Ok(Step::Done(connect_return(&session, true)))
    }

    // -- Logout ------------------------------------------------------------

    /// Logs a session out.
    ///
    /// # Errors
    /// [`SessionError::UnknownSession`] if the token is not (or no longer)
    /// registered.
    pub fn disconnect(&self, token: &str) -> Result<(), SessionError> {
        self.disconnect_with(token, DisconnectOptions::default())
    }

    /// Logs a session out, optionally taking its siblings with it.
    pub fn disconnect_with(
        &self,
        token: &str,
        options: DisconnectOptions,
    ) -> Result<(), SessionError> {
        let shared = &self.shared;
        let session = shared.session(token).ok_or(SessionError::UnknownSession)?;
        shared
            .listeners
            .fire(SessionEvent::SessionPreRemove(Arc::clone(&session)));

        let removed = shared
            .index()
            .remove(token)
            .ok_or(SessionError::UnknownSession)?;

        if let Some(context) = removed.session.take_security_context() {
            shared.checker.release(&context);
        }
        shared
            .listeners
            .fire(SessionEvent::SessionRemoved(Arc::clone(&removed.session)));
        if removed.subject_died {
            if let Some(subject) = &removed.subject {
                shared
                    .listeners
                    .fire(SessionEvent::SubjectRemoved(Arc::clone(subject)));
            }
        }
        removed.session.shutdown();
        tracing::info!(
            session = %removed.session.name(),
            subject_died = removed.subject_died,
            "session disconnected"
        );

        if options.clear_sessions && !removed.subject_died {
            if let Some(subject) = &removed.subject {
                for sibling in subject.sessions() {
                    if let Err(e) = self.disconnect(&sibling.token()) {
                        tracing::debug!(session = %sibling.name(), error = %e, "sibling already gone");
                    }
                }
            }
        }
        Ok(())
    }

    /// Tears the whole registry down: every session is disconnected, the
    /// expiry timer stops, and later logins are refused.
    ///
    /// Failures on individual sessions are logged and skipped. Returns
    /// how many sessions were disconnected.
    pub fn shutdown(&self) -> usize {
        let shared = &self.shared;
        if shared.halted.swap(true, Ordering::AcqRel) {
            return 0;
        }
        shared.index().halt();

        let tokens = shared.index().tokens();
        let mut closed = 0;
        for token in tokens {
            match self.disconnect(&token) {
                Ok(()) => closed += 1,
                Err(e) => tracing::warn!(error = %e, "session teardown failed during shutdown"),
            }
        }

        let (stragglers, subjects) = shared.index().drain();
        for session in stragglers {
            session.shutdown();
        }
        for subject in subjects {
            subject.shutdown(true);
        }
        shared.timer.shutdown();
        tracing::info!(closed, "session registry shut down");
        closed
    }

    // -- Per-request -------------------------------------------------------

    /// Resolves a token to its session and refreshes its expiry.
    ///
    /// This is the hot path: one index lookup and one timer re-arm.
    ///
    /// # Errors
    /// [`SessionError::UnknownSession`] for unknown, expired or
    /// disconnected tokens.
    pub fn check(&self, token: &str) -> Result<Arc<Session>, SessionError> {
        if token.is_empty() {
            return Err(SessionError::UnknownSession);
        }
        let session = self
            .shared
            .session(token)
            .filter(|s| s.is_usable())
            .ok_or(SessionError::UnknownSession)?;
        session.refresh();
        Ok(session)
    }

    /// Records a transport liveness report for a session.
    ///
    /// Only [`ConnectionState::Dead`] has an effect. Sessions outlive
    /// their transport, so the session itself stays valid.
    pub fn connection_state(
        &self,
        token: &str,
        state: ConnectionState,
    ) -> Result<(), SessionError> {
        let session = self
            .shared
            .session(token)
            .ok_or(SessionError::UnknownSession)?;
        match state {
            ConnectionState::Dead => session.connection_lost(),
            other => {
                tracing::warn!(session = %session.name(), state = %other, "ignoring connection state report");
            }
        }
        Ok(())
    }

    /// Asks the checker whether the session may perform `action` on `key`.
    pub fn is_authorized(
        &self,
        token: &str,
        action: &str,
        key: &str,
    ) -> Result<bool, SessionError> {
        let session = self.check(token)?;
        let context = session
            .security_context()
            .ok_or(SessionError::UnknownSession)?;
        Ok(self.shared.checker.is_authorized(&context, action, key))
    }

    // -- Administration ----------------------------------------------------

    /// Blocks or unblocks new logins for `login`.
    ///
    /// Blocking a login that never connected creates a placeholder subject
    /// so the block sticks. Existing sessions are not disconnected.
    pub fn block_login(&self, login: &str, blocked: bool) -> Result<(), SessionError> {
        let shared = &self.shared;
        let name = SessionName::subject(shared.node(), login)?;
        if blocked {
            let (subject, _) = shared.index().get_or_create_subject(&name, &shared.config)?;
            subject.set_blocked(true);
        } else if let Some(subject) = shared.subject(login) {
            subject.set_blocked(false);
            shared.reap(&subject);
        }
        Ok(())
    }

    /// Blocks or unblocks resuming a specific session.
    pub fn block_session(&self, name: &SessionName, blocked: bool) -> Result<(), SessionError> {
        let session = self
            .session_by_name(name)
            .ok_or(SessionError::UnknownSession)?;
        session.set_blocked(blocked);
        tracing::info!(session = %session.name(), blocked, "session block changed");
        Ok(())
    }

    // -- Listeners ---------------------------------------------------------

    /// Registers a listener. Adding the same listener twice is a no-op.
    pub fn add_listener(&self, listener: Arc<dyn SessionListener>) {
        self.shared.listeners.add(listener);
    }

    /// Unregisters a listener. Returns `false` if it was not registered.
    pub fn remove_listener(&self, listener: &Arc<dyn SessionListener>) -> bool {
        self.shared.listeners.remove(listener)
    }

    // -- Queries -----------------------------------------------------------

    /// The subject for a login, if it is known.
    pub fn subject(&self, login: &str) -> Option<Arc<Subject>> {
        self.shared.subject(login)
    }

    /// The initialized session with this name. Relative names are
    /// resolved against this registry's node.
    pub fn session_by_name(&self, name: &SessionName) -> Option<Arc<Session>> {
        let name = name.with_default_node(self.shared.node()).ok()?;
        self.shared
            .subject(name.login())?
            .session(&name.absolute_name())
    }

    /// All indexed sessions whose names match `pattern`.
    pub fn sessions_matching(&self, pattern: &SessionPattern) -> Vec<Arc<Session>> {
        self.shared
            .index()
            .sessions()
            .filter(|s| s.name().matches(pattern))
            .cloned()
            .collect()
    }

    /// Number of indexed sessions.
    pub fn session_count(&self) -> usize {
        self.shared.index().session_count()
    }

    /// Number of indexed subjects.
    pub fn subject_count(&self) -> usize {
        self.shared.index().subject_count()
    }

    /// Counters for diagnostics.
    pub fn snapshot(&self) -> RegistryStats {
        let (subjects, sessions) = {
            let index = self.shared.index();
            (index.subject_count(), index.session_count())
        };
        RegistryStats {
            subjects,
            sessions,
            pending_timers: self.shared.timer.metrics().pending,
            listeners: self.shared.listeners.len(),
            halted: self.shared.halted.load(Ordering::Acquire),
        }
    }
}

fn connect_return(session: &Session, reconnected: bool) -> ConnectReturn {
    ConnectReturn {
        secret_session_id: session.token(),
        session_name: session.name().clone(),
        reconnected,
    }
}

/// Disconnects sessions whose expiry timer fired.
///
/// Holds only a weak reference, so it ends once every manager handle is
/// gone and the timer channel closes.
async fn run_expiry<C: CredentialChecker>(
    shared: Weak<Shared<C>>,
    mut expired: mpsc::UnboundedReceiver<Expired<Weak<Session>>>,
) {
    while let Some(fired) = expired.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        let Some(session) = fired.payload.upgrade() else {
            continue;
        };
        let Some(token) = session.timeout_fired(fired.key) else {
            continue;
        };
        tracing::info!(session = %session.name(), "session expired");
        let manager = SessionManager { shared };
        if let Err(e) = manager.disconnect(&token) {
            tracing::debug!(session = %session.name(), error = %e, "expired session already gone");
        }
    }
    tracing::debug!("expiry task stopped");
}
