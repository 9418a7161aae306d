//! The registry's lookup tables.
//!
//! Both maps live behind one mutex in the manager, so every method here
//! is a single critical section: a session is never in the token map
//! without being attached to its subject, and a dead subject is never
//! left in the subject map.
//!
//! Lock order is index → subject → session. Nothing in here awaits.

use std::collections::HashMap;
use std::sync::Arc;

use warden_protocol::{ConnectProperties, SessionName};

use crate::{RegistryConfig, SecurityContext, Session, SessionError, Subject, SubjectState};

/// What [`Index::remove`] took out.
pub(crate) struct Removed {
    pub(crate) session: Arc<Session>,
    pub(crate) subject: Option<Arc<Subject>>,
    pub(crate) subject_died: bool,
}

#[derive(Default)]
pub(crate) struct Index {
    by_token: HashMap<String, Arc<Session>>,
    by_subject: HashMap<String, Arc<Subject>>,
    /// Set once the registry shuts down. Nothing new gets in afterwards.
    halted: bool,
}

impl Index {
    pub(crate) fn session(&self, token: &str) -> Option<Arc<Session>> {
        self.by_token.get(token).cloned()
    }

    pub(crate) fn subject(&self, login: &str) -> Option<Arc<Subject>> {
        self.by_subject.get(login).cloned()
    }

    /// `true` while `session` is the record its current token resolves to.
    ///
    /// A session that was disconnected, even one still being shut down,
    /// is no longer indexed.
    pub(crate) fn is_indexed(&self, session: &Arc<Session>) -> bool {
        session.is_usable()
            && self
                .by_token
                .get(&session.token())
                .is_some_and(|s| Arc::ptr_eq(s, session))
    }

    /// Stops the index from accepting new subjects or sessions.
    pub(crate) fn halt(&mut self) {
        self.halted = true;
    }

    fn check_open(&self) -> Result<(), SessionError> {
        if self.halted {
            return Err(SessionError::TemporarilyUnavailable(
                "session registry is shutting down".into(),
            ));
        }
        Ok(())
    }

    /// Returns the subject for `name`, creating an `Undef` one if needed.
    /// The flag is `true` when this call created it.
    pub(crate) fn get_or_create_subject(
        &mut self,
        name: &SessionName,
        config: &Arc<RegistryConfig>,
    ) -> Result<(Arc<Subject>, bool), SessionError> {
        self.check_open()?;
        if let Some(existing) = self.by_subject.get(name.login()) {
            if existing.state() != SubjectState::Dead {
                return Ok((Arc::clone(existing), false));
            }
            tracing::warn!(subject = %name, "replacing dead subject left in index");
        }
        let subject = Arc::new(Subject::new(name.clone(), Arc::clone(config)));
        self.by_subject
            .insert(name.login().to_string(), Arc::clone(&subject));
        Ok((subject, true))
    }

    /// Makes an initialized session reachable by token and attaches it
    /// to its subject.
    pub(crate) fn install(
        &mut self,
        session: &Arc<Session>,
        subject: &Subject,
    ) -> Result<(), SessionError> {
        self.check_open()?;
        let token = session.token();
        if token.is_empty() || self.by_token.contains_key(&token) {
            return Err(SessionError::Internal(format!(
                "cannot index session {}: token missing or already in use",
                session.name()
            )));
        }
        self.by_token.insert(token, Arc::clone(session));
        subject.notify_login(session);
        Ok(())
    }

    /// Removes a session by token and detaches it from its subject.
    /// Drops the subject too when that was its last session.
    pub(crate) fn remove(&mut self, token: &str) -> Option<Removed> {
        let session = self.by_token.remove(token)?;
        let subject = session.owner();
        let subject_died = match &subject {
            Some(subject) => {
                let died = subject.notify_logout(&session.name().absolute_name(), false);
                if died {
                    self.forget_subject(subject);
                }
                died
            }
            None => false,
        };
        Some(Removed {
            session,
            subject,
            subject_died,
        })
    }

    /// Moves a session to a new token.
    pub(crate) fn change_token(
        &mut self,
        session: &Arc<Session>,
        new_token: &str,
    ) -> Result<(), SessionError> {
        if !self.is_indexed(session) {
            return Err(SessionError::UnknownSession);
        }
        if self.by_token.contains_key(new_token) {
            return Err(SessionError::Internal("renewed token already in use".into()));
        }
        self.by_token.remove(&session.token());
        session.change_secret_token(new_token);
        self.by_token
            .insert(new_token.to_string(), Arc::clone(session));
        Ok(())
    }

    /// Hands a bypass placeholder over to a verified client.
    ///
    /// Returns the placeholder's old context for release.
    pub(crate) fn promote(
        &mut self,
        session: &Arc<Session>,
        context: SecurityContext,
        props: ConnectProperties,
    ) -> Result<Option<SecurityContext>, SessionError> {
        if !self.is_indexed(session) {
            return Err(SessionError::UnknownSession);
        }
        if self.by_token.contains_key(context.token()) {
            return Err(SessionError::Internal("takeover token already in use".into()));
        }
        let new_token = context.token().to_string();
        self.by_token.remove(&session.token());
        let old = session.promote(context, props);
        self.by_token.insert(new_token, Arc::clone(session));
        Ok(old)
    }

    /// Drops a session record that never got indexed, and the subject
    /// with it if nothing else is left. Returns `true` if the subject died.
    pub(crate) fn remove_pending(
        &mut self,
        subject: &Arc<Subject>,
        session: &Arc<Session>,
    ) -> bool {
        if subject.remove_pending(session) {
            self.reap(subject)
        } else {
            false
        }
    }

    /// Removes a subject that has nothing left to hold it.
    ///
    /// An empty `Undef` subject that is not blocked is just forgotten. An
    /// empty `Alive` one is shut down first. Returns `true` only for the
    /// latter, since only alive subjects were ever announced.
    pub(crate) fn reap(&mut self, subject: &Arc<Subject>) -> bool {
        if subject.session_count() > 0 {
            return false;
        }
        match subject.state() {
            SubjectState::Undef => {
                if !subject.is_blocked() {
                    self.forget_subject(subject);
                }
                false
            }
            SubjectState::Alive => {
                let died = subject.shutdown(false);
                if died {
                    self.forget_subject(subject);
                }
                died
            }
            SubjectState::Dead => {
                self.forget_subject(subject);
                false
            }
        }
    }

    fn forget_subject(&mut self, subject: &Arc<Subject>) {
        let ours = self
            .by_subject
            .get(subject.login())
            .is_some_and(|s| Arc::ptr_eq(s, subject));
        if ours {
            self.by_subject.remove(subject.login());
        }
    }

    pub(crate) fn sessions(&self) -> impl Iterator<Item = &Arc<Session>> {
        self.by_token.values()
    }

    pub(crate) fn tokens(&self) -> Vec<String> {
        self.by_token.keys().cloned().collect()
    }

    pub(crate) fn session_count(&self) -> usize {
        self.by_token.len()
    }

    pub(crate) fn subject_count(&self) -> usize {
        self.by_subject.len()
    }

    /// Empties both maps and halts the index, returning what was in them.
    pub(crate) fn drain(&mut self) -> (Vec<Arc<Session>>, Vec<Arc<Subject>>) {
        self.halted = true;
        let sessions = self.by_token.drain().map(|(_, s)| s).collect();
        let subjects = self.by_subject.drain().map(|(_, s)| s).collect();
        (sessions, subjects)
    }
}
