//! Scripted walk through the login lifecycle against an in-memory user
//! table. Run with `RUST_LOG=debug` to see the registry's own logs.
//!
//! Usage: `login-flow [config.json]`

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use warden::prelude::*;
use warden::{Codec, JsonCodec};

// ---------------------------------------------------------------------------
// Credential checker
// ---------------------------------------------------------------------------

struct UserTable {
    passwords: HashMap<&'static str, &'static str>,
}

impl CredentialChecker for UserTable {
    fn mechanism(&self) -> &str {
        "htpasswd"
    }

    async fn verify(&self, _: &SecurityContext, login: &str, credential: &str) -> Result<(), SessionError> {
        match self.passwords.get(login) {
            Some(expected) if *expected == credential => Ok(()),
            _ => Err(SessionError::AuthFailed("wrong login or password".into())),
        }
    }
}

// ---------------------------------------------------------------------------
// Audit listener
// ---------------------------------------------------------------------------

struct Audit;

impl SessionListener for Audit {
    fn on_event(&self, event: &SessionEvent) {
        let name = match event {
            SessionEvent::SubjectAdded(s) | SessionEvent::SubjectRemoved(s) => s.name().to_string(),
            SessionEvent::SessionAdded(s)
            | SessionEvent::SessionUpdated(s)
            | SessionEvent::SessionPreRemove(s)
            | SessionEvent::SessionRemoved(s) => s.name().to_string(),
        };
        tracing::info!(target: "audit", kind = event.kind(), %name);
    }
}

// ---------------------------------------------------------------------------
// Script
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), WardenError> {
    let config = match std::env::args().nth(1) {
        Some(path) => WardenConfig::load(path)?,
        None => WardenConfig::default(),
    };
    warden::telemetry::init(&config.telemetry)?;

    let checker = UserTable {
        passwords: HashMap::from([("alice", "secret"), ("bob", "hunter2")]),
    };
    let registry = SessionManager::new(config.registry, checker);
    registry.add_listener(Arc::new(Audit));

    // alice: never expires.
    let alice = registry
        .connect(
            ConnectProperties::new("alice", "secret").with_session_timeout(Duration::ZERO),
            None,
        )
        .await?;
    tracing::info!(session = %alice.session_name, "alice logged in");

    // bob: one session at most.
    let bob_props = ConnectProperties::new("bob", "hunter2")
        .with_max_sessions(1)
        .with_session_timeout(Duration::from_secs(1));
    let bob = registry.connect(bob_props.clone(), None).await?;
    match registry.connect(bob_props.clone(), None).await {
        Err(e) => tracing::info!(code = %e.code(), error = %e, "second bob login refused"),
        Ok(_) => tracing::warn!("second bob login unexpectedly accepted"),
    }

    // bob comes back with his token, no password needed.
    let resumed = registry.connect(bob_props, Some(&bob.secret_session_id)).await?;
    tracing::info!(reconnected = resumed.reconnected, "bob resumed");

    // A client request as it would arrive on the wire.
    let wire = br#"{ "login_name": "alice", "credential": "secret", "session_name": "alice/7" }"#;
    let props: ConnectProperties = JsonCodec.decode(wire)?;
    let named = registry.connect(props, None).await?;
    tracing::info!(session = %named.session_name, "alice opened a named session");

    tracing::info!(stats = %serde_json::to_string(&registry.snapshot()).unwrap_or_default(), "registry");

    // bob goes idle and expires.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    match registry.check(&bob.secret_session_id) {
        Err(e) => tracing::info!(error = %e, "bob's token no longer works"),
        Ok(_) => tracing::warn!("bob should have expired"),
    }

    registry.check(&alice.secret_session_id)?;
    registry.disconnect(&named.secret_session_id)?;

    let closed = registry.shutdown();
    tracing::info!(closed, "done");
    Ok(())
}
