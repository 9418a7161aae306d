//! Integration tests for the session registry using an in-memory user table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use warden_protocol::{ConnectProperties, ConnectionState, SessionName, SessionPattern};
use warden_session::{
    CredentialChecker, DisconnectOptions, ErrorCode, RegistryConfig, SecurityContext,
    SessionError, SessionEvent, SessionListener, SessionManager, SubjectState,
};

// =========================================================================
// Mock checker: fixed passwords, counts reserve/release pairs.
// =========================================================================

#[derive(Default)]
struct UserTable {
    passwords: HashMap<String, String>,
    verify_delay: Option<Duration>,
    reserved: AtomicUsize,
    released: AtomicUsize,
}

impl UserTable {
    fn with_users(users: &[(&str, &str)]) -> Self {
        Self {
            passwords: users
                .iter()
                .map(|(l, p)| (l.to_string(), p.to_string()))
                .collect(),
            ..Self::default()
        }
    }

    fn slow(mut self, delay: Duration) -> Self {
        self.verify_delay = Some(delay);
        self
    }
}

impl CredentialChecker for UserTable {
    fn mechanism(&self) -> &str {
        "htpasswd"
    }

    fn reserve(&self, token: &str) -> Result<SecurityContext, SessionError> {
        self.reserved.fetch_add(1, Ordering::SeqCst);
        Ok(SecurityContext::new(token, self.mechanism()))
    }

    async fn verify(
        &self,
        _context: &SecurityContext,
        login: &str,
        credential: &str,
    ) -> Result<(), SessionError> {
        if let Some(delay) = self.verify_delay {
            tokio::time::sleep(delay).await;
        }
        match self.passwords.get(login) {
            Some(expected) if expected == credential => Ok(()),
            _ => Err(SessionError::AuthFailed("wrong login or password".into())),
        }
    }

    fn release(&self, _context: &SecurityContext) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }

    fn is_authorized(&self, context: &SecurityContext, action: &str, _key: &str) -> bool {
        action == "subscribe" || context.authenticated_login() == Some("alice")
    }
}

/// Records event kinds in order.
#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<&'static str>>,
}

impl SessionListener for Recorder {
    fn on_event(&self, event: &SessionEvent) {
        self.seen.lock().unwrap().push(event.kind());
    }
}

fn users() -> UserTable {
    UserTable::with_users(&[
        ("alice", "secret"),
        ("bob", "hunter2"),
        ("carol", "pw"),
        ("dave", "pw"),
        ("eve", "pw"),
    ])
}

fn registry() -> SessionManager<UserTable> {
    SessionManager::new(RegistryConfig::default(), users())
}

fn named(raw: &str) -> SessionName {
    SessionName::parse(raw, None).unwrap()
}

/// Lets the expiry task catch up after time moves.
async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

// =========================================================================
// Fresh logins
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_connect_forever_session_never_expires() {
    let registry = registry();
    let props = ConnectProperties::new("alice", "secret").with_session_timeout(Duration::ZERO);

    let login = registry.connect(props, None).await.unwrap();
    assert!(!login.reconnected);
    assert_eq!(login.secret_session_id.len(), 32);

    tokio::time::sleep(Duration::from_secs(3 * 24 * 60 * 60)).await;
    settle().await;

    let session = registry.check(&login.secret_session_id).unwrap();
    assert_eq!(session.login(), "alice");
    assert_eq!(session.expires_in(), None);
}

#[tokio::test]
async fn test_connect_allocates_negative_sequence() {
    let registry = registry();
    let login = registry
        .connect(ConnectProperties::new("alice", "secret"), None)
        .await
        .unwrap();
    assert!(login.session_name.is_internal());
    assert_eq!(login.session_name.login(), "alice");
    assert_eq!(registry.session_count(), 1);
    assert_eq!(registry.subject_count(), 1);
}

#[tokio::test]
async fn test_connect_qualifies_names_with_node() {
    let registry = SessionManager::new(RegistryConfig::with_node("heron"), users());
    let login = registry
        .connect(ConnectProperties::new("alice", "secret"), None)
        .await
        .unwrap();
    assert_eq!(login.session_name.node(), Some("heron"));
}

#[tokio::test]
async fn test_connect_wrong_password_fails_and_releases() {
    let registry = registry();
    let err = registry
        .connect(ConnectProperties::new("alice", "nope"), None)
        .await
        .unwrap_err();

    assert_eq!(err.code(), ErrorCode::AuthenticationFailed);
    let checker = registry.checker();
    assert_eq!(checker.reserved.load(Ordering::SeqCst), 1);
    assert_eq!(checker.released.load(Ordering::SeqCst), 1);
    assert_eq!(registry.subject_count(), 0);
}

#[tokio::test]
async fn test_connect_without_login_fails() {
    let registry = registry();
    let err = registry
        .connect(ConnectProperties::default(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::AuthFailed(_)));
}

#[tokio::test]
async fn test_connect_unsupported_mechanism_fails() {
    let registry = registry();
    let mut props = ConnectProperties::new("alice", "secret");
    props.mechanism = Some("ldap".into());
    let err = registry.connect(props, None).await.unwrap_err();
    assert!(matches!(err, SessionError::AuthFailed(_)));
    assert_eq!(registry.checker().reserved.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_connect_session_name_for_other_login_fails() {
    let registry = registry();
    let props = ConnectProperties::new("alice", "secret").with_session_name(named("bob/1"));
    let err = registry.connect(props, None).await.unwrap_err();
    assert!(matches!(err, SessionError::AuthFailed(_)));
}

// =========================================================================
// Session limits
// =========================================================================

#[tokio::test]
async fn test_second_session_over_limit_is_rejected() {
    let registry = registry();
    let props = ConnectProperties::new("bob", "hunter2").with_max_sessions(1);

    let first = registry.connect(props.clone(), None).await.unwrap();
    let err = registry.connect(props.clone(), None).await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::SessionLimitExceeded { max: 1, .. }
    ));
    assert_eq!(err.code(), ErrorCode::LimitExceeded);

    // The first session is untouched, and the subject lock is free.
    registry.check(&first.secret_session_id).unwrap();
    assert!(!registry.subject("bob").unwrap().is_login_locked());

    // Freeing the slot lets the login in again.
    registry.disconnect(&first.secret_session_id).unwrap();
    registry.connect(props, None).await.unwrap();
}

#[tokio::test]
async fn test_split_limits_count_each_sign_separately() {
    let config = RegistryConfig {
        session_limits_pub_session_id_specific: true,
        ..RegistryConfig::default()
    };
    let registry = SessionManager::new(config, users());
    let base = ConnectProperties::new("bob", "hunter2").with_max_sessions(1);

    registry.connect(base.clone(), None).await.unwrap();
    registry
        .connect(base.clone().with_session_name(named("bob/1")), None)
        .await
        .unwrap();
    assert_eq!(registry.session_count(), 2);
    assert!(registry.connect(base, None).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_logins_never_exceed_limit() {
    let registry = registry();
    let props = ConnectProperties::new("bob", "hunter2").with_max_sessions(3);

    let mut handles = Vec::new();
    for _ in 0..12 {
        let registry = registry.clone();
        let props = props.clone();
        handles.push(tokio::spawn(async move { registry.connect(props, None).await }));
    }

    let mut ok = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => ok += 1,
            Err(e) => assert!(matches!(e, SessionError::SessionLimitExceeded { .. })),
        }
    }
    assert_eq!(ok, 3);
    assert_eq!(registry.subject("bob").unwrap().session_count(), 3);
}

// =========================================================================
// Reconnects
// =========================================================================

#[tokio::test]
async fn test_reconnect_by_token_skips_credential_check() {
    let registry = registry();
    let login = registry
        .connect(ConnectProperties::new("alice", "secret"), None)
        .await
        .unwrap();

    let updated = ConnectProperties::new("alice", "not-checked")
        .with_client_ip("192.0.2.7")
        .with_session_timeout(Duration::from_secs(300));
    let again = registry
        .connect(updated, Some(&login.secret_session_id))
        .await
        .unwrap();

    assert!(again.reconnected);
    assert_eq!(again.secret_session_id, login.secret_session_id);
    assert_eq!(again.session_name, login.session_name);
    assert_eq!(registry.session_count(), 1);

    let session = registry.check(&login.secret_session_id).unwrap();
    let props = session.connection_properties();
    assert_eq!(props.client_ip.as_deref(), Some("192.0.2.7"));
    assert_eq!(props.session_timeout, Duration::from_secs(300));
    assert_eq!(session.client_ip().as_deref(), Some("192.0.2.7"));
    assert!(props.credential.is_empty(), "credential is not kept");
}

#[tokio::test]
async fn test_reconnect_with_token_only() {
    let registry = registry();
    let login = registry
        .connect(ConnectProperties::new("alice", "secret"), None)
        .await
        .unwrap();

    let props = ConnectProperties {
        secret_session_id: Some(login.secret_session_id.clone()),
        ..ConnectProperties::default()
    };
    let again = registry.connect(props, None).await.unwrap();
    assert!(again.reconnected);
    assert_eq!(again.session_name, login.session_name);
}

#[tokio::test]
async fn test_reconnect_by_token_of_other_login_fails() {
    let registry = registry();
    let login = registry
        .connect(ConnectProperties::new("alice", "secret"), None)
        .await
        .unwrap();
    let err = registry
        .connect(
            ConnectProperties::new("bob", "hunter2"),
            Some(&login.secret_session_id),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::UnknownSession));

    // Indistinguishable from a token that was never issued.
    let unknown = registry
        .connect(ConnectProperties::new("bob", "wrong"), Some("0123abcd"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), unknown.code());
    assert_eq!(err.code(), ErrorCode::AuthenticationFailed);
    registry.check(&login.secret_session_id).unwrap();
}

#[tokio::test]
async fn test_reconnect_by_name_checks_credential() {
    let registry = registry();
    let props = ConnectProperties::new("bob", "hunter2").with_session_name(named("bob/1"));

    let first = registry.connect(props.clone(), None).await.unwrap();
    assert_eq!(first.session_name.sequence(), 1);

    let again = registry.connect(props, None).await.unwrap();
    assert!(again.reconnected);
    assert_eq!(again.secret_session_id, first.secret_session_id);

    let wrong = ConnectProperties::new("bob", "wrong").with_session_name(named("bob/1"));
    let err = registry.connect(wrong, None).await.unwrap_err();
    assert!(matches!(err, SessionError::AuthFailed(_)));
    assert_eq!(registry.session_count(), 1);
}

#[tokio::test]
async fn test_reconnect_by_name_can_renew_token() {
    let registry = registry();
    let props = ConnectProperties::new("bob", "hunter2").with_session_name(named("bob/1"));
    let first = registry.connect(props.clone(), None).await.unwrap();

    let mut renew = props;
    renew.renew_token_on_reconnect = true;
    let again = registry.connect(renew, None).await.unwrap();

    assert!(again.reconnected);
    assert_ne!(again.secret_session_id, first.secret_session_id);
    assert!(registry.check(&first.secret_session_id).is_err());
    registry.check(&again.secret_session_id).unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_by_name_with_renew_loses_to_concurrent_disconnect() {
    let registry = SessionManager::new(
        RegistryConfig::default(),
        users().slow(Duration::from_secs(5)),
    );
    let props = ConnectProperties::new("bob", "hunter2").with_session_name(named("bob/1"));
    let first = registry.connect(props.clone(), None).await.unwrap();

    let mut resume = props;
    resume.renew_token_on_reconnect = true;
    let pending = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.connect(resume, None).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    registry.disconnect(&first.secret_session_id).unwrap();
    assert_eq!(registry.session_count(), 0);

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, SessionError::UnknownSession));

    // The shut-down record never comes back under a new token.
    assert_eq!(registry.session_count(), 0);
    assert_eq!(registry.subject_count(), 0);
    assert!(registry.session_by_name(&named("bob/1")).is_none());
    assert!(registry.check(&first.secret_session_id).is_err());
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_by_name_without_renew_loses_to_concurrent_disconnect() {
    let registry = SessionManager::new(
        RegistryConfig::default(),
        users().slow(Duration::from_secs(5)),
    );
    let props = ConnectProperties::new("bob", "hunter2").with_session_name(named("bob/1"));
    let first = registry.connect(props.clone(), None).await.unwrap();

    let pending = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.connect(props, None).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    registry.disconnect(&first.secret_session_id).unwrap();

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, SessionError::UnknownSession));
    assert_eq!(registry.session_count(), 0);
    assert_eq!(registry.subject_count(), 0);
}

#[tokio::test]
async fn test_reconnect_same_client_only_rejects_other_address() {
    let registry = registry();
    let mut props = ConnectProperties::new("bob", "hunter2")
        .with_session_name(named("bob/1"))
        .with_client_ip("10.0.0.1");
    props.reconnect_same_client_only = true;
    registry.connect(props.clone(), None).await.unwrap();

    let elsewhere = props.clone().with_client_ip("10.0.0.2");
    let err = registry.connect(elsewhere, None).await.unwrap_err();
    assert!(matches!(err, SessionError::AuthFailed(_)));

    let same = registry.connect(props, None).await.unwrap();
    assert!(same.reconnected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_logins_of_same_name_share_one_session() {
    let registry = SessionManager::new(
        RegistryConfig::default(),
        users().slow(Duration::from_millis(5)),
    );
    let props = ConnectProperties::new("carol", "pw").with_session_name(named("carol/1"));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let registry = registry.clone();
        let props = props.clone();
        handles.push(tokio::spawn(async move { registry.connect(props, None).await }));
    }

    let mut tokens = Vec::new();
    for handle in handles {
        tokens.push(handle.await.unwrap().unwrap().secret_session_id);
    }
    tokens.dedup();
    assert_eq!(tokens.len(), 1, "every racer got the same session");
    assert_eq!(registry.session_count(), 1);

    let checker = registry.checker();
    let reserved = checker.reserved.load(Ordering::SeqCst);
    let released = checker.released.load(Ordering::SeqCst);
    assert_eq!(reserved, released + 1, "only the winner keeps its context");
}

// =========================================================================
// Logout and expiry
// =========================================================================

#[tokio::test]
async fn test_disconnect_invalidates_token() {
    let registry = registry();
    let login = registry
        .connect(ConnectProperties::new("alice", "secret"), None)
        .await
        .unwrap();
    let subject = registry.subject("alice").unwrap();

    registry.disconnect(&login.secret_session_id).unwrap();

    let err = registry.check(&login.secret_session_id).unwrap_err();
    assert!(matches!(err, SessionError::UnknownSession));
    assert!(matches!(
        registry.disconnect(&login.secret_session_id),
        Err(SessionError::UnknownSession)
    ));
    assert_eq!(subject.state(), SubjectState::Dead);
    assert!(registry.subject("alice").is_none());
    let checker = registry.checker();
    assert_eq!(
        checker.reserved.load(Ordering::SeqCst),
        checker.released.load(Ordering::SeqCst)
    );
}

#[tokio::test]
async fn test_check_unknown_token_looks_like_auth_failure() {
    let registry = registry();
    let err = registry.check("no-such-token").unwrap_err();
    assert_eq!(err.code(), ErrorCode::AuthenticationFailed);
    assert!(registry.check("").is_err());
}

#[tokio::test(start_paused = true)]
async fn test_idle_session_expires() {
    let registry = registry();
    let props = ConnectProperties::new("alice", "secret").with_session_timeout(Duration::from_secs(30));
    let login = registry.connect(props, None).await.unwrap();

    tokio::time::sleep(Duration::from_secs(31)).await;
    settle().await;

    assert!(registry.check(&login.secret_session_id).is_err());
    assert_eq!(registry.session_count(), 0);
    assert_eq!(registry.subject_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_check_keeps_session_alive() {
    let registry = registry();
    let props = ConnectProperties::new("alice", "secret").with_session_timeout(Duration::from_secs(30));
    let login = registry.connect(props, None).await.unwrap();

    for _ in 0..4 {
        tokio::time::sleep(Duration::from_secs(20)).await;
        settle().await;
        registry.check(&login.secret_session_id).unwrap();
    }

    tokio::time::sleep(Duration::from_secs(31)).await;
    settle().await;
    assert!(registry.check(&login.secret_session_id).is_err());
}

#[tokio::test]
async fn test_clear_sessions_replaces_previous_sessions() {
    let registry = registry();
    let props = ConnectProperties::new("dave", "pw");
    let a = registry.connect(props.clone(), None).await.unwrap();
    let b = registry.connect(props.clone(), None).await.unwrap();

    let fresh = registry
        .connect(props.with_clear_sessions(true), None)
        .await
        .unwrap();

    assert!(registry.check(&a.secret_session_id).is_err());
    assert!(registry.check(&b.secret_session_id).is_err());
    registry.check(&fresh.secret_session_id).unwrap();
    assert_eq!(registry.session_count(), 1);
}

#[tokio::test]
async fn test_disconnect_with_clear_sessions_removes_siblings() {
    let registry = registry();
    let props = ConnectProperties::new("dave", "pw");
    let a = registry.connect(props.clone(), None).await.unwrap();
    let b = registry.connect(props.clone(), None).await.unwrap();
    let other = registry
        .connect(ConnectProperties::new("eve", "pw"), None)
        .await
        .unwrap();

    registry
        .disconnect_with(&a.secret_session_id, DisconnectOptions { clear_sessions: true })
        .unwrap();

    assert!(registry.check(&b.secret_session_id).is_err());
    registry.check(&other.secret_session_id).unwrap();
    assert!(registry.subject("dave").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_login_releases_everything() {
    let registry = SessionManager::new(
        RegistryConfig::default(),
        users().slow(Duration::from_secs(10)),
    );
    let pending = {
        let registry = registry.clone();
        tokio::spawn(async move {
            registry
                .connect(ConnectProperties::new("alice", "secret"), None)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    pending.abort();
    let _ = pending.await;

    let checker = registry.checker();
    assert_eq!(checker.reserved.load(Ordering::SeqCst), 1);
    assert_eq!(checker.released.load(Ordering::SeqCst), 1);
    assert_eq!(registry.session_count(), 0);
    assert_eq!(registry.subject_count(), 0);
}

// =========================================================================
// Administration
// =========================================================================

#[tokio::test]
async fn test_block_login_rejects_and_unblock_restores() {
    let registry = registry();
    registry.block_login("eve", true).unwrap();
    assert_eq!(registry.subject_count(), 1, "placeholder keeps the block");

    let err = registry
        .connect(ConnectProperties::new("eve", "pw"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Blocked(_)));
    assert_eq!(err.code(), ErrorCode::AccessDenied);

    registry.block_login("eve", false).unwrap();
    assert_eq!(registry.subject_count(), 0);
    registry
        .connect(ConnectProperties::new("eve", "pw"), None)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_block_session_rejects_resume() {
    let registry = registry();
    let props = ConnectProperties::new("bob", "hunter2").with_session_name(named("bob/1"));
    let login = registry.connect(props.clone(), None).await.unwrap();

    registry.block_session(&named("bob/1"), true).unwrap();
    let err = registry.connect(props.clone(), None).await.unwrap_err();
    assert!(matches!(err, SessionError::Blocked(_)));
    let err = registry
        .connect(ConnectProperties::default(), Some(&login.secret_session_id))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Blocked(_)));

    // Blocking stops resumes, not the live session.
    registry.check(&login.secret_session_id).unwrap();
    registry.block_session(&named("bob/1"), false).unwrap();
    assert!(registry.connect(props, None).await.unwrap().reconnected);
}

#[tokio::test]
async fn test_block_unknown_session_fails() {
    let registry = registry();
    assert!(matches!(
        registry.block_session(&named("bob/9"), true),
        Err(SessionError::UnknownSession)
    ));
}

#[tokio::test]
async fn test_internal_session_is_taken_over_by_verified_login() {
    let registry = registry();
    let name = named("eve/1");
    let internal = registry
        .connect_internal(ConnectProperties::default().with_session_name(name.clone()))
        .await
        .unwrap();
    assert!(registry.session_by_name(&name).unwrap().is_bypass());

    let client = registry
        .connect(
            ConnectProperties::new("eve", "pw").with_session_name(name.clone()),
            None,
        )
        .await
        .unwrap();

    assert!(client.reconnected);
    assert_ne!(client.secret_session_id, internal.secret_session_id);
    assert!(registry.check(&internal.secret_session_id).is_err());
    let session = registry.check(&client.secret_session_id).unwrap();
    assert!(!session.is_bypass());
    assert_eq!(registry.checker().released.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_connection_state_dead_keeps_session() {
    let registry = registry();
    let login = registry
        .connect(ConnectProperties::new("alice", "secret"), None)
        .await
        .unwrap();

    registry
        .connection_state(&login.secret_session_id, ConnectionState::Polling)
        .unwrap();
    registry
        .connection_state(&login.secret_session_id, ConnectionState::Dead)
        .unwrap();

    let session = registry.check(&login.secret_session_id).unwrap();
    assert_eq!(session.connection_state(), ConnectionState::Dead);
    assert!(registry
        .connection_state("unknown", ConnectionState::Dead)
        .is_err());
}

#[tokio::test]
async fn test_is_authorized_asks_checker() {
    let registry = registry();
    let alice = registry
        .connect(ConnectProperties::new("alice", "secret"), None)
        .await
        .unwrap();
    let bob = registry
        .connect(ConnectProperties::new("bob", "hunter2"), None)
        .await
        .unwrap();

    assert!(registry.is_authorized(&alice.secret_session_id, "publish", "news").unwrap());
    assert!(!registry.is_authorized(&bob.secret_session_id, "publish", "news").unwrap());
    assert!(registry.is_authorized(&bob.secret_session_id, "subscribe", "news").unwrap());
    assert!(registry.is_authorized("nope", "subscribe", "news").is_err());
}

#[tokio::test]
async fn test_sessions_matching_pattern() {
    let registry = registry();
    registry
        .connect(ConnectProperties::new("bob", "hunter2").with_session_name(named("bob/1")), None)
        .await
        .unwrap();
    registry
        .connect(ConnectProperties::new("bob", "hunter2").with_session_name(named("bob/2")), None)
        .await
        .unwrap();
    registry
        .connect(ConnectProperties::new("carol", "pw").with_session_name(named("carol/1")), None)
        .await
        .unwrap();

    let bobs = registry.sessions_matching(&SessionPattern::all_sessions_of("bob"));
    assert_eq!(bobs.len(), 2);
    let firsts = registry.sessions_matching(&SessionPattern::parse("*/1").unwrap());
    assert_eq!(firsts.len(), 2);
}

// =========================================================================
// Listeners and shutdown
// =========================================================================

#[tokio::test]
async fn test_listener_sees_lifecycle_in_order() {
    let registry = registry();
    let recorder = Arc::new(Recorder::default());
    registry.add_listener(recorder.clone());

    let login = registry
        .connect(ConnectProperties::new("alice", "secret"), None)
        .await
        .unwrap();
    registry
        .connect(ConnectProperties::new("alice", "x"), Some(&login.secret_session_id))
        .await
        .unwrap();
    registry.disconnect(&login.secret_session_id).unwrap();

    assert_eq!(
        *recorder.seen.lock().unwrap(),
        vec![
            "subject_added",
            "session_added",
            "session_updated",
            "session_pre_remove",
            "session_removed",
            "subject_removed",
        ]
    );

    let as_dyn: Arc<dyn SessionListener> = recorder;
    assert!(registry.remove_listener(&as_dyn));
    assert!(!registry.remove_listener(&as_dyn));
}

#[tokio::test]
async fn test_shutdown_disconnects_all_and_refuses_logins() {
    let registry = registry();
    let a = registry
        .connect(ConnectProperties::new("alice", "secret"), None)
        .await
        .unwrap();
    registry
        .connect(ConnectProperties::new("bob", "hunter2"), None)
        .await
        .unwrap();
    registry.block_login("eve", true).unwrap();

    assert_eq!(registry.shutdown(), 2);
    assert_eq!(registry.shutdown(), 0, "second shutdown is a no-op");

    assert!(registry.check(&a.secret_session_id).is_err());
    let stats = registry.snapshot();
    assert_eq!(stats.sessions, 0);
    assert_eq!(stats.subjects, 0);
    assert!(stats.halted);

    let err = registry
        .connect(ConnectProperties::new("alice", "secret"), None)
        .await
        .unwrap_err();
    assert!(err.is_retryable());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_during_verify_leaves_nothing_indexed() {
    let registry = SessionManager::new(
        RegistryConfig::default(),
        users().slow(Duration::from_secs(5)),
    );
    let pending = {
        let registry = registry.clone();
        tokio::spawn(async move {
            registry
                .connect(ConnectProperties::new("alice", "secret"), None)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(registry.shutdown(), 0);

    tokio::time::sleep(Duration::from_secs(6)).await;
    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, SessionError::TemporarilyUnavailable(_)));

    assert_eq!(registry.session_count(), 0);
    assert_eq!(registry.subject_count(), 0);
    let checker = registry.checker();
    assert_eq!(checker.reserved.load(Ordering::SeqCst), 1);
    assert_eq!(checker.released.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_stats_reflect_registry() {
    let registry = registry();
    registry.add_listener(Arc::new(Recorder::default()));
    registry
        .connect(
            ConnectProperties::new("alice", "secret").with_session_timeout(Duration::from_secs(60)),
            None,
        )
        .await
        .unwrap();
    registry
        .connect(ConnectProperties::new("bob", "hunter2").with_session_timeout(Duration::ZERO), None)
        .await
        .unwrap();
    settle().await;

    let stats = registry.snapshot();
    assert_eq!(stats.subjects, 2);
    assert_eq!(stats.sessions, 2);
    assert_eq!(stats.listeners, 1);
    assert_eq!(stats.pending_timers, 1);
    assert!(!stats.halted);
}
