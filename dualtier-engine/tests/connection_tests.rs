mod support;

use dualtier_engine::remote::{MemoryBackend, RemoteStore};
use dualtier_engine::{ConnectionConfig, ConnectionState, Credentials, EngineConfig, EngineError};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::time::Duration;
use support::{Harness, credentials, remote_config, signin_response};
use tokio::time::Instant;

fn slow_reconnect_config() -> EngineConfig {
    EngineConfig {
        reconnect_base_delay_ms: 1000,
        ..remote_config()
    }
}

// --- Connect ---

#[tokio::test]
async fn starts_disconnected() {
    let h = Harness::new(remote_config());
    assert_eq!(h.connection.state(), ConnectionState::Disconnected);
    assert!(matches!(h.connection.local(), Err(EngineError::NotConnected)));
    assert!(h.connection.remote().is_none());
}

#[tokio::test]
async fn connect_opens_both_tiers() {
    let h = Harness::connected(remote_config()).await;
    assert_eq!(h.connection.state(), ConnectionState::Connected);
    assert!(h.connection.remote().is_some());
    assert!(h.connection.has_remote_config());
    assert_eq!(h.local().name(), "main");
}

#[tokio::test]
async fn connect_without_remote_is_local_only() {
    let h = Harness::connected(EngineConfig::default()).await;
    assert_eq!(h.connection.state(), ConnectionState::Connected);
    assert!(h.connection.remote().is_none());
    assert!(!h.connection.has_remote_config());
    assert!(h.connection.local().is_ok());
}

#[tokio::test]
async fn connect_failure_moves_to_error() {
    let h = Harness::new(remote_config());
    h.backend.set_offline(true);

    let err = h
        .connection
        .connect(ConnectionConfig::from(&h.config))
        .await
        .unwrap_err();
    assert!(err.is_connection_error());
    assert_eq!(h.connection.state(), ConnectionState::Error);

    h.backend.set_offline(false);
    h.connect().await;
    assert_eq!(h.connection.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn state_changes_are_broadcast() {
    let h = Harness::new(remote_config());
    let mut states = h.connection.subscribe_state();
    h.connect().await;
    assert!(states.has_changed().unwrap());
    assert_eq!(*states.borrow_and_update(), ConnectionState::Connected);
}

#[tokio::test]
async fn tenant_scopes_both_databases() {
    let backend = MemoryBackend::new();
    backend
        .seed("app_acme", "main_acme", "users", &[json!({"id": "u1", "name": "Ada"})])
        .unwrap();
    let config = EngineConfig {
        tenant_code: Some("acme".into()),
        ..remote_config()
    };
    let h = Harness::with_backend(config, backend);
    h.connect().await;

    assert_eq!(h.local().name(), "main_acme");
    assert_eq!(h.connection.tenant().as_deref(), Some("acme"));
    let rows = h.connection.remote().unwrap().select("users", None).await.unwrap();
    assert_eq!(rows, vec![json!({"id": "u1", "name": "Ada"})]);
}

// --- Tenants ---

#[tokio::test]
async fn switch_tenant_requires_connection() {
    let h = Harness::new(remote_config());
    let err = h.connection.switch_tenant("acme").await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidState {
            actual: ConnectionState::Disconnected,
            ..
        }
    ));
}

#[tokio::test]
async fn switch_tenant_reopens_and_drops_authorization() {
    let h = Harness::connected(remote_config()).await;
    h.backend
        .register_principal("alice", "tok", signin_response(&["admin"]));
    h.connection
        .authenticate(credentials("alice", "tok"))
        .await
        .unwrap();
    h.backend
        .seed("app_beta", "main_beta", "users", &[json!({"id": "b1"})])
        .unwrap();

    h.connection.switch_tenant("beta").await.unwrap();

    assert_eq!(h.connection.state(), ConnectionState::Connected);
    assert!(h.connection.auth_state().is_none());
    assert_eq!(h.local().name(), "main_beta");
    let rows = h.connection.remote().unwrap().select("users", None).await.unwrap();
    assert_eq!(rows, vec![json!({"id": "b1"})]);
}

// --- Authentication ---

#[tokio::test]
async fn authenticate_records_permissions() {
    let h = Harness::connected(remote_config()).await;
    h.backend
        .register_principal("alice", "tok", signin_response(&["admin", "viewer"]));

    let auth = h
        .connection
        .authenticate(credentials("alice", "tok"))
        .await
        .unwrap();

    assert_eq!(h.connection.state(), ConnectionState::Authenticated);
    assert_eq!(auth.principal_id, "alice");
    assert!(auth.has_role("admin"));
    assert!(auth.can_access_menu("dashboard"));
    assert!(auth.can_perform("orders.read"));
    assert!(!auth.can_perform("orders.delete"));
    assert_eq!(h.connection.auth_state(), Some(auth));
}

#[tokio::test]
async fn bad_token_fails_without_reconnecting() {
    let h = Harness::connected(remote_config()).await;
    h.backend
        .register_principal("alice", "tok", signin_response(&[]));

    let err = h
        .connection
        .authenticate(credentials("alice", "wrong"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Auth(_)));
    assert_eq!(h.connection.state(), ConnectionState::Error);
    assert!(h.connection.auth_state().is_none());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.connector.attempts().len(), 1);
}

#[tokio::test]
async fn authenticate_switches_to_credential_tenant() {
    let h = Harness::connected(remote_config()).await;
    h.backend
        .register_principal("alice", "tok", signin_response(&[]));
    let creds = Credentials {
        tenant_code: Some("acme".into()),
        ..credentials("alice", "tok")
    };

    let auth = h.connection.authenticate(creds).await.unwrap();
    assert_eq!(auth.tenant_code.as_deref(), Some("acme"));
    assert_eq!(h.local().name(), "main_acme");
}

#[tokio::test]
async fn authenticate_needs_a_remote() {
    let h = Harness::connected(EngineConfig::default()).await;
    let err = h
        .connection
        .authenticate(credentials("alice", "tok"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Config(_)));
}

#[tokio::test]
async fn authenticate_while_disconnected_is_rejected() {
    let h = Harness::new(remote_config());
    let err = h
        .connection
        .authenticate(credentials("alice", "tok"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidState { .. }));
}

// --- Disconnect ---

#[tokio::test]
async fn disconnect_is_idempotent() {
    let h = Harness::connected(remote_config()).await;
    h.connection.disconnect().await;
    h.connection.disconnect().await;
    assert_eq!(h.connection.state(), ConnectionState::Disconnected);
    assert!(h.connection.local().is_err());
    assert!(h.connection.remote().is_none());
    assert!(h.connection.tenant().is_none());
}

// --- Reconnection ---

#[tokio::test(start_paused = true)]
async fn reconnect_backs_off_exponentially_then_gives_up() {
    let h = Harness::connected(slow_reconnect_config()).await;
    h.backend.set_offline(true);

    let lost_at = Instant::now();
    h.connection.notify_remote_lost();
    assert_eq!(h.connection.state(), ConnectionState::Error);

    tokio::time::sleep(Duration::from_secs(30)).await;

    let attempts = h.connector.attempts();
    assert_eq!(attempts.len(), 4, "initial connect plus three retries");
    let offsets: Vec<u128> = attempts[1..]
        .iter()
        .map(|at| at.duration_since(lost_at).as_millis())
        .collect();
    for (offset, expected) in offsets.iter().zip([1000u128, 3000, 7000]) {
        assert!(
            *offset >= expected && *offset < expected + 50,
            "attempt at {offset} ms, expected {expected} ms"
        );
    }
    assert_eq!(h.connection.state(), ConnectionState::Error);
}

#[tokio::test(start_paused = true)]
async fn reconnect_restores_authentication() {
    let h = Harness::connected(slow_reconnect_config()).await;
    h.backend
        .register_principal("alice", "tok", signin_response(&["admin"]));
    h.connection
        .authenticate(credentials("alice", "tok"))
        .await
        .unwrap();

    h.backend.set_offline(true);
    h.connection.notify_remote_lost();
    assert_eq!(h.connection.state(), ConnectionState::Error);
    h.backend.set_offline(false);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(h.connection.state(), ConnectionState::Authenticated);
    assert!(h.connection.auth_state().unwrap().has_role("admin"));
    assert_eq!(h.connector.attempts().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn disconnect_cancels_pending_reconnect() {
    let h = Harness::connected(slow_reconnect_config()).await;
    h.backend.set_offline(true);
    h.connection.notify_remote_lost();
    h.connection.disconnect().await;

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.connection.state(), ConnectionState::Disconnected);
    assert_eq!(h.connector.attempts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn remote_loss_is_ignored_while_offline() {
    let h = Harness::new(slow_reconnect_config());
    h.connection.notify_remote_lost();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.connection.state(), ConnectionState::Disconnected);
    assert!(h.connector.attempts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn second_loss_replaces_reconnect_timer() {
    let h = Harness::connected(slow_reconnect_config()).await;
    h.backend.set_offline(true);
    h.connection.notify_remote_lost();

    // Bring the connection back by hand, then lose it again.
    h.backend.set_offline(false);
    h.connect().await;
    h.backend.set_offline(true);
    let second_loss = Instant::now();
    h.connection.notify_remote_lost();

    tokio::time::sleep(Duration::from_secs(30)).await;
    let after_second: usize = h
        .connector
        .attempts()
        .iter()
        .filter(|at| **at > second_loss)
        .count();
    assert_eq!(after_second, 3);
}
