//! Per-login identity shared by all of that login's sessions.
//!
//! A [`Subject`] exists while its login has at least one session, or while
//! an administrator holds it blocked. It owns:
//! - the lifecycle state (see [`SubjectState`])
//! - the set of sessions, keyed by absolute session name
//! - the per-login session limit
//! - the login lock that serializes concurrent logins of the same name

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use warden_protocol::{DEFAULT_MAX_SESSIONS, SessionName};

use crate::{RegistryConfig, Session, SessionError};

static NEXT_SUBJECT_INSTANCE: AtomicU64 = AtomicU64::new(1);

// ---------------------------------------------------------------------------
// SubjectState
// ---------------------------------------------------------------------------

/// The lifecycle state of a subject.
///
/// Transitions only move forward:
///
/// ```text
/// Undef → Alive → Dead
/// ```
///
/// - **Undef**: created but not yet usable. Either a login is still
///   setting it up, or an administrator blocked a login that has never
///   connected.
/// - **Alive**: has (or is about to get) sessions.
/// - **Dead**: shut down after its last session left. Never revived; a
///   new login creates a new subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SubjectState {
    Undef,
    Alive,
    Dead,
}

impl SubjectState {
    /// The only state reachable from `self`, if any.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Undef => Some(Self::Alive),
            Self::Alive => Some(Self::Dead),
            Self::Dead => None,
        }
    }

    /// Returns `true` if transitioning to `target` is valid.
    pub fn can_transition_to(self, target: Self) -> bool {
        self.next() == Some(target)
    }
}

impl fmt::Display for SubjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undef => write!(f, "UNDEF"),
            Self::Alive => write!(f, "ALIVE"),
            Self::Dead => write!(f, "DEAD"),
        }
    }
}

// ---------------------------------------------------------------------------
// LoginGuard
// ---------------------------------------------------------------------------

/// Holds a subject's login lock. Released on drop, on every exit path.
pub struct LoginGuard<'a> {
    _lock: tokio::sync::MutexGuard<'a, ()>,
    holders: &'a AtomicUsize,
}

impl<'a> LoginGuard<'a> {
    fn new(lock: tokio::sync::MutexGuard<'a, ()>, holders: &'a AtomicUsize) -> Self {
        let previous = holders.fetch_add(1, Ordering::AcqRel);
        debug_assert_eq!(previous, 0, "login lock held twice");
        Self {
            _lock: lock,
            holders,
        }
    }
}

impl Drop for LoginGuard<'_> {
    fn drop(&mut self) {
        self.holders.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for LoginGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginGuard").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Subject
// ---------------------------------------------------------------------------

struct SubjectInner {
    sessions: HashMap<String, Arc<Session>>,
    max_sessions: usize,
    blocked: bool,
}

/// The identity behind one login name.
pub struct Subject {
    instance_id: u64,
    name: SessionName,
    created_at: SystemTime,
    config: Arc<RegistryConfig>,
    state: watch::Sender<SubjectState>,
    login_lock: tokio::sync::Mutex<()>,
    lock_holders: AtomicUsize,
    inner: Mutex<SubjectInner>,
}

impl Subject {
    /// A new subject in [`SubjectState::Undef`].
    ///
    /// `name` is reduced to its subject form (sequence 0).
    pub(crate) fn new(name: SessionName, config: Arc<RegistryConfig>) -> Self {
        let (state, _) = watch::channel(SubjectState::Undef);
        Self {
            instance_id: NEXT_SUBJECT_INSTANCE.fetch_add(1, Ordering::Relaxed),
            name: name.subject_name(),
            created_at: SystemTime::now(),
            config,
            state,
            login_lock: tokio::sync::Mutex::new(()),
            lock_holders: AtomicUsize::new(0),
            inner: Mutex::new(SubjectInner {
                sessions: HashMap::new(),
                max_sessions: DEFAULT_MAX_SESSIONS,
                blocked: false,
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, SubjectInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -- State machine -----------------------------------------------------

    /// Moves `Undef → Alive` and applies the login's session limit.
    ///
    /// Returns `true` if this call made the transition. Calling it on an
    /// alive subject only updates the limit.
    ///
    /// # Errors
    /// [`SessionError::SubjectDead`] if the subject already shut down.
    pub(crate) fn to_alive(&self, max_sessions: usize) -> Result<bool, SessionError> {
        self.inner().max_sessions = max_sessions;
        let mut transitioned = false;
        let mut dead = false;
        self.state.send_if_modified(|state| match *state {
            SubjectState::Undef => {
                *state = SubjectState::Alive;
                transitioned = true;
                true
            }
            SubjectState::Alive => false,
            SubjectState::Dead => {
                dead = true;
                false
            }
        });
        if dead {
            return Err(SessionError::SubjectDead(self.login().to_string()));
        }
        if transitioned {
            tracing::info!(subject = %self.name, max_sessions, "subject alive");
        }
        Ok(transitioned)
    }

    /// Waits (bounded by `alive_wait`) until the subject leaves `Undef`.
    ///
    /// With `acquire_lock`, also takes the login lock and returns its
    /// guard. The state is re-checked after the lock is taken, since the
    /// subject may have died while we queued.
    ///
    /// # Errors
    /// - [`SessionError::TemporarilyUnavailable`]: still `Undef` after the wait
    /// - [`SessionError::SubjectDead`]: the subject shut down
    pub(crate) async fn wait_until_alive(
        &self,
        acquire_lock: bool,
    ) -> Result<Option<LoginGuard<'_>>, SessionError> {
        let state = {
            let mut rx = self.state.subscribe();
            let waited = tokio::time::timeout(
                self.config.alive_wait,
                rx.wait_for(|state| *state != SubjectState::Undef),
            )
            .await;
            match waited {
                Ok(Ok(state)) => *state,
                // The sender lives as long as `self`.
                Ok(Err(_)) => SubjectState::Dead,
                Err(_) => SubjectState::Undef,
            }
        };
        let state = match state {
            SubjectState::Undef => {
                tracing::warn!(
                    subject = %self.name,
                    waited_ms = self.config.alive_wait.as_millis() as u64,
                    "subject did not come alive in time"
                );
                return Err(SessionError::TemporarilyUnavailable(format!(
                    "login '{}' is still being set up",
                    self.login()
                )));
            }
            other => other,
        };
        if state == SubjectState::Dead {
            return Err(SessionError::SubjectDead(self.login().to_string()));
        }
        if !acquire_lock {
            return Ok(None);
        }

        let guard = self.lock_login().await;
        if self.state() == SubjectState::Dead {
            return Err(SessionError::SubjectDead(self.login().to_string()));
        }
        Ok(Some(guard))
    }

    /// Takes the login lock.
    pub(crate) async fn lock_login(&self) -> LoginGuard<'_> {
        let lock = self.login_lock.lock().await;
        LoginGuard::new(lock, &self.lock_holders)
    }

    /// Whether some task currently holds the login lock.
    pub fn is_login_locked(&self) -> bool {
        self.lock_holders.load(Ordering::Acquire) > 0
    }

    /// Moves `Alive → Dead` once no sessions remain.
    ///
    /// Refuses, with an error log, while sessions are still attached: a
    /// dead subject holding sessions would leak them. A blocked subject
    /// that the registry keeps for inspection is only shut down with
    /// `force`. Returns `true` if the subject is dead afterwards.
    pub(crate) fn shutdown(&self, force: bool) -> bool {
        // Held across the transition so no session can be created in between.
        let inner = self.inner();
        if !inner.sessions.is_empty() {
            tracing::error!(
                subject = %self.name,
                sessions = inner.sessions.len(),
                "refusing to shut down subject with attached sessions"
            );
            return false;
        }
        if !force && self.is_pinned_locked(&inner) {
            tracing::debug!(subject = %self.name, "keeping blocked subject");
            return false;
        }

        let mut dead = false;
        self.state.send_if_modified(|state| {
            if state.can_transition_to(SubjectState::Dead) {
                *state = SubjectState::Dead;
                dead = true;
                true
            } else {
                dead = *state == SubjectState::Dead;
                false
            }
        });
        drop(inner);
        if dead {
            tracing::info!(subject = %self.name, instance = self.instance_id, "subject shut down");
        }
        dead
    }

    // -- Sessions ----------------------------------------------------------

    /// Finds or creates the session record for `name`.
    ///
    /// A record that another connect created but has not initialized yet
    /// is polled (`session_poll_interval` × `session_poll_attempts`) until
    /// it is. Newly created records count against the limit right away,
    /// so two racing connects can't both slip under it.
    ///
    /// Returns the record and whether this call created it.
    pub(crate) async fn get_or_create_session(
        &self,
        name: &SessionName,
    ) -> Result<(Arc<Session>, bool), SessionError> {
        let key = name.absolute_name();
        for attempt in 0..self.config.session_poll_attempts.max(1) {
            {
                let mut inner = self.inner();
                match inner.sessions.get(&key) {
                    Some(existing) if existing.is_initialized() => {
                        return Ok((Arc::clone(existing), false));
                    }
                    Some(existing) if !existing.is_shutdown() => {
                        if attempt == 0 {
                            tracing::debug!(
                                session = %name,
                                "session under construction elsewhere, polling"
                            );
                        }
                    }
                    _ => {
                        if self.state() == SubjectState::Dead {
                            return Err(SessionError::SubjectDead(self.login().to_string()));
                        }
                        inner.sessions.remove(&key);
                        self.check_session_limit_locked(&inner, name)?;
                        let session = Session::new(name.clone());
                        inner.sessions.insert(key, Arc::clone(&session));
                        return Ok((session, true));
                    }
                }
            }
            if self.state() == SubjectState::Dead {
                return Err(SessionError::SubjectDead(self.login().to_string()));
            }
            tokio::time::sleep(self.config.session_poll_interval).await;
        }

        tracing::warn!(
            session = %name,
            budget_ms = self.config.session_poll_budget().as_millis() as u64,
            "gave up waiting for concurrent session creation"
        );
        Err(SessionError::TemporarilyUnavailable(format!(
            "session '{}' is being created by another login",
            name.relative_name()
        )))
    }

    /// Fails if one more session for `name` would exceed the limit.
    pub fn check_session_limit(&self, name: &SessionName) -> Result<(), SessionError> {
        let inner = self.inner();
        self.check_session_limit_locked(&inner, name)
    }

    fn check_session_limit_locked(
        &self,
        inner: &SubjectInner,
        name: &SessionName,
    ) -> Result<(), SessionError> {
        let count = if self.config.session_limits_pub_session_id_specific {
            inner
                .sessions
                .values()
                .filter(|s| s.name().is_internal() == name.is_internal())
                .count()
        } else {
            inner.sessions.len()
        };
        if count >= inner.max_sessions {
            tracing::warn!(
                subject = %self.name,
                count,
                max = inner.max_sessions,
                "session limit reached"
            );
            return Err(SessionError::SessionLimitExceeded {
                login: self.login().to_string(),
                max: inner.max_sessions,
            });
        }
        Ok(())
    }

    /// Records an initialized session. A no-op if it is already recorded.
    pub(crate) fn notify_login(&self, session: &Arc<Session>) {
        let mut inner = self.inner();
        inner
            .sessions
            .entry(session.name().absolute_name())
            .or_insert_with(|| Arc::clone(session));
        tracing::debug!(
            subject = %self.name,
            session = %session.name(),
            sessions = inner.sessions.len(),
            "session attached"
        );
    }

    /// Detaches a session. When it was the last one, shuts the subject
    /// down (a blocked subject kept for inspection survives unless
    /// `force`).
    ///
    /// Returns `true` if the subject is dead afterwards.
    pub(crate) fn notify_logout(&self, absolute_name: &str, force: bool) -> bool {
        let now_empty = {
            let mut inner = self.inner();
            if inner.sessions.remove(absolute_name).is_none() {
                tracing::debug!(subject = %self.name, session = absolute_name, "unknown session on logout");
            }
            inner.sessions.is_empty()
        };
        if now_empty {
            self.shutdown(force)
        } else {
            false
        }
    }

    /// Drops a record that never made it into the registry index. Only
    /// removes the exact record passed in. Returns `true` if the subject
    /// has no sessions left.
    pub(crate) fn remove_pending(&self, session: &Arc<Session>) -> bool {
        let mut inner = self.inner();
        let key = session.name().absolute_name();
        let ours = inner
            .sessions
            .get(&key)
            .is_some_and(|s| Arc::ptr_eq(s, session));
        if ours {
            inner.sessions.remove(&key);
        }
        inner.sessions.is_empty()
    }

    // -- Blocking ----------------------------------------------------------

    /// Blocks or unblocks new logins for this subject.
    pub fn set_blocked(&self, blocked: bool) {
        self.inner().blocked = blocked;
        tracing::info!(subject = %self.name, blocked, "login block changed");
    }

    /// Whether logins are administratively blocked.
    pub fn is_blocked(&self) -> bool {
        self.inner().blocked
    }

    fn is_pinned_locked(&self, inner: &SubjectInner) -> bool {
        inner.blocked && self.config.keep_blocked_subjects
    }

    // -- Accessors ---------------------------------------------------------

    /// Diagnostic id, unique within the process.
    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    /// The subject name (sequence 0).
    pub fn name(&self) -> &SessionName {
        &self.name
    }

    /// The login name.
    pub fn login(&self) -> &str {
        self.name.login()
    }

    /// When the subject was created.
    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SubjectState {
        *self.state.borrow()
    }

    /// A receiver that observes every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<SubjectState> {
        self.state.subscribe()
    }

    /// The session limit applied at the last login.
    pub fn max_sessions(&self) -> usize {
        self.inner().max_sessions
    }

    /// Number of session records, pending ones included.
    pub fn session_count(&self) -> usize {
        self.inner().sessions.len()
    }

    /// A snapshot of the initialized sessions.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.inner()
            .sessions
            .values()
            .filter(|s| s.is_usable())
            .cloned()
            .collect()
    }

    /// The initialized session with the given absolute name.
    pub fn session(&self, absolute_name: &str) -> Option<Arc<Session>> {
        self.inner()
            .sessions
            .get(absolute_name)
            .filter(|s| s.is_usable())
            .cloned()
    }

    /// Any record with the given absolute name, pending ones included.
    pub(crate) fn session_record(&self, absolute_name: &str) -> Option<Arc<Session>> {
        self.inner().sessions.get(absolute_name).cloned()
    }
}

impl fmt::Debug for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subject")
            .field("instance_id", &self.instance_id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
