use dualtier_engine::{ConnectionState, EngineError, RouteStrategy, RpcError};
use dualtier_storage::StorageError;

#[test]
fn kinds_are_stable() {
    assert_eq!(EngineError::NotConnected.kind(), "not_connected");
    assert_eq!(EngineError::RemoteUnavailable.kind(), "remote_unavailable");
    assert_eq!(EngineError::Offline("x".into()).kind(), "offline");
    assert_eq!(EngineError::UnknownMethod("x".into()).kind(), "unknown_method");
    assert_eq!(
        EngineError::Timeout {
            request_id: 1,
            timeout_ms: 10
        }
        .kind(),
        "timeout"
    );
    assert_eq!(
        EngineError::Rpc(RpcError::new("auth", "denied")).kind(),
        "auth"
    );
}

#[test]
fn display_messages() {
    let err = EngineError::InvalidState {
        expected: "connected or authenticated",
        actual: ConnectionState::Disconnected,
    };
    assert_eq!(
        err.to_string(),
        "invalid connection state: expected connected or authenticated, found disconnected"
    );

    let err = EngineError::Timeout {
        request_id: 9,
        timeout_ms: 30000,
    };
    assert_eq!(
        err.to_string(),
        "request 9 timed out after 30000 ms; outcome unknown"
    );
}

#[test]
fn execution_error_names_its_route() {
    let err = EngineError::execution(
        RouteStrategy::Hybrid,
        "cache miss or mixed table set",
        12,
        EngineError::RemoteUnavailable,
    );
    assert_eq!(err.kind(), "execution");
    assert_eq!(
        err.to_string(),
        "hybrid execution failed after 12 ms (cache miss or mixed table set): remote database unavailable"
    );
    assert!(err.is_connection_error());
}

#[test]
fn connection_classification() {
    assert!(EngineError::Connection("refused".into()).is_connection_error());
    assert!(EngineError::Rpc(RpcError::new("connection", "refused")).is_connection_error());
    assert!(!EngineError::Remote("500".into()).is_connection_error());
    assert!(!EngineError::Auth("denied".into()).is_connection_error());
    assert!(
        !EngineError::execution(
            RouteStrategy::LocalOnly,
            "all tables are LOCAL_ONLY",
            0,
            EngineError::NotConnected,
        )
        .is_connection_error()
    );
}

#[test]
fn rpc_error_carries_kind_and_message() {
    let rpc = RpcError::from(&EngineError::Offline("write statements need the remote database".into()));
    assert_eq!(rpc.kind, "offline");
    assert_eq!(rpc.message, "offline: write statements need the remote database");
    assert_eq!(rpc.to_string(), "offline: offline: write statements need the remote database");

    // Errors that already crossed the bridge keep their original kind.
    let original = RpcError::new("storage", "disk full");
    assert_eq!(RpcError::from(&EngineError::Rpc(original.clone())), original);
}

#[test]
fn storage_errors_convert() {
    let err: EngineError = StorageError::InvalidIdentifier("bad name".into()).into();
    assert_eq!(err.kind(), "storage");
}

#[tokio::test]
async fn panicked_task_becomes_task_error() {
    let join = tokio::spawn(async {
        if true {
            panic!("worker died");
        }
    })
    .await
    .unwrap_err();
    let err = EngineError::from(join);
    assert_eq!(err.kind(), "task");
}
