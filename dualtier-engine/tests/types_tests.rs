use chrono::Utc;
use dualtier_engine::{
    AuthState, ConnectionState, Credentials, EngineError, ExecutionResult, NewOperation,
    OfflineOperation, OperationKind, OperationStatus, RouteDecision, RouteStrategy, RpcCall,
    SigninResponse, Source, split_target,
};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};

// --- Connection ---

#[test]
fn only_connected_states_are_online() {
    assert!(ConnectionState::Connected.is_online());
    assert!(ConnectionState::Authenticated.is_online());
    assert!(!ConnectionState::Connecting.is_online());
    assert!(!ConnectionState::Disconnected.is_online());
    assert!(!ConnectionState::Error.is_online());
    assert_eq!(ConnectionState::Authenticated.to_string(), "authenticated");
}

#[test]
fn auth_state_answers_permission_checks() {
    let credentials = Credentials {
        principal_id: "alice".into(),
        token: "t".into(),
        tenant_code: None,
    };
    let response = SigninResponse {
        token: None,
        roles: vec!["admin".into(), "admin".into()],
        menus: vec!["reports".into()],
        operations: vec!["orders.write".into()],
    };
    let auth = AuthState::from_signin(&credentials, Some("acme".into()), response);

    assert_eq!(auth.principal_id, "alice");
    assert_eq!(auth.tenant_code.as_deref(), Some("acme"));
    assert_eq!(auth.roles.len(), 1);
    assert!(auth.has_role("admin"));
    assert!(!auth.has_role("auditor"));
    assert!(auth.can_access_menu("reports"));
    assert!(auth.can_perform("orders.write"));
    assert!(!auth.can_perform("orders.delete"));
}

#[test]
fn signin_response_fields_are_optional() {
    let response: SigninResponse = serde_json::from_value(json!({"roles": ["viewer"]})).unwrap();
    assert_eq!(response.token, None);
    assert_eq!(response.roles, vec!["viewer".to_string()]);
    assert!(response.operations.is_empty());
}

// --- Calls ---

#[test]
fn split_target_forms() {
    assert_eq!(split_target("users"), ("users".into(), None));
    assert_eq!(split_target("users:u1"), ("users".into(), Some("u1".into())));
    assert_eq!(split_target("users:"), ("users".into(), None));
    assert_eq!(split_target("users:a:b"), ("users".into(), Some("a:b".into())));
}

#[test]
fn decodes_record_methods() {
    assert_eq!(
        RpcCall::from_method("select", &json!(["users:u1"])).unwrap(),
        RpcCall::Select {
            table: "users".into(),
            id: Some("u1".into())
        }
    );
    assert_eq!(
        RpcCall::from_method("create", &json!(["notes", {"title": "a"}])).unwrap(),
        RpcCall::Create {
            table: "notes".into(),
            id: None,
            data: json!({"title": "a"})
        }
    );
    assert_eq!(
        RpcCall::from_method("delete", &json!(["notes:n1"])).unwrap(),
        RpcCall::Delete {
            table: "notes".into(),
            id: "n1".into()
        }
    );
}

#[test]
fn decodes_query_with_and_without_vars() {
    let call = RpcCall::from_method("query", &json!(["SELECT 1"])).unwrap();
    assert_eq!(
        call,
        RpcCall::Query {
            sql: "SELECT 1".into(),
            vars: Default::default()
        }
    );

    let call = RpcCall::from_method("query", &json!(["SELECT $a", {"a": 1}])).unwrap();
    let RpcCall::Query { vars, .. } = call else {
        panic!("expected a query");
    };
    assert_eq!(vars.get("a"), Some(&json!(1)));
}

#[test]
fn rejects_malformed_params() {
    let cases = [
        ("update", json!(["notes", {"title": "a"}])),
        ("merge", json!(["notes:n1", "not an object"])),
        ("query", json!(["SELECT 1", [1, 2]])),
        ("select", json!([])),
        ("create", Value::Null),
    ];
    for (method, params) in cases {
        let err = RpcCall::from_method(method, &params).unwrap_err();
        assert!(
            matches!(err, EngineError::InvalidParams(_)),
            "{method} accepted {params}"
        );
    }
    assert!(matches!(
        RpcCall::from_method("drop_everything", &json!([])),
        Err(EngineError::UnknownMethod(_))
    ));
}

#[test]
fn create_takes_its_record_id_from_data() {
    let call = RpcCall::from_method("create", &json!(["notes", {"id": "n7"}])).unwrap();
    assert_eq!(call.record_id(), Some("n7"));
    assert_eq!(call.table(), Some("notes"));
    assert_eq!(call.method(), "create");
}

#[test]
fn only_record_writes_become_offline_operations() {
    let merge = RpcCall::Merge {
        table: "notes".into(),
        id: "n1".into(),
        data: json!({"title": "b"}),
    };
    assert_eq!(
        merge.to_offline_operation(),
        Some(NewOperation {
            kind: OperationKind::Merge,
            table: "notes".into(),
            record_id: Some("n1".into()),
            payload: json!({"title": "b"}),
            max_retries: None,
        })
    );

    let delete = RpcCall::Delete {
        table: "notes".into(),
        id: "n1".into(),
    };
    assert_eq!(delete.to_offline_operation().unwrap().payload, Value::Null);

    let select = RpcCall::Select {
        table: "notes".into(),
        id: None,
    };
    assert_eq!(select.to_offline_operation(), None);
    let query = RpcCall::Query {
        sql: "DELETE FROM notes".into(),
        vars: Default::default(),
    };
    assert_eq!(query.to_offline_operation(), None);
}

// --- Offline operations ---

fn operation(kind: OperationKind) -> OfflineOperation {
    OfflineOperation {
        id: "op-1".into(),
        kind,
        table: "notes".into(),
        record_id: Some("n1".into()),
        payload: json!({"title": "a"}),
        retry_count: 2,
        max_retries: 5,
        status: OperationStatus::InFlight,
        tenant_code: Some("acme".into()),
        queued_at: Utc::now(),
        last_error: Some("timeout".into()),
    }
}

#[test]
fn operation_replays_as_the_matching_call() {
    assert_eq!(
        operation(OperationKind::Update).to_call(),
        RpcCall::Update {
            table: "notes".into(),
            id: "n1".into(),
            data: json!({"title": "a"})
        }
    );
    assert_eq!(
        operation(OperationKind::Delete).to_call(),
        RpcCall::Delete {
            table: "notes".into(),
            id: "n1".into()
        }
    );
}

#[test]
fn operation_survives_the_journal() {
    let op = operation(OperationKind::Merge);
    let entry = op.to_journal_entry();
    assert_eq!(entry.kind, "merge");
    assert_eq!(entry.status, "in_flight");
    assert_eq!(OfflineOperation::try_from(entry).unwrap(), op);
}

#[test]
fn corrupt_journal_entry_is_rejected() {
    let mut entry = operation(OperationKind::Create).to_journal_entry();
    entry.status = "exploded".into();
    assert!(OfflineOperation::try_from(entry).is_err());
}

#[test]
fn terminal_statuses() {
    assert!(OperationStatus::Completed.is_terminal());
    assert!(OperationStatus::Failed.is_terminal());
    assert!(!OperationStatus::Pending.is_terminal());
    assert!(!OperationStatus::InFlight.is_terminal());
}

#[test]
fn new_operation_wire_format() {
    let op: NewOperation = serde_json::from_value(json!({
        "kind": "create",
        "table": "notes",
        "recordId": "n1",
        "payload": {"title": "a"},
        "maxRetries": 7
    }))
    .unwrap();
    assert_eq!(op.kind, OperationKind::Create);
    assert_eq!(op.record_id.as_deref(), Some("n1"));
    assert_eq!(op.max_retries, Some(7));
}

#[test]
fn only_create_may_omit_the_record_id() {
    let op = |kind: &str, record_id: Option<&str>| -> NewOperation {
        serde_json::from_value(json!({"kind": kind, "table": "notes", "recordId": record_id}))
            .unwrap()
    };

    assert!(op("create", None).validate().is_ok());
    assert!(op("update", Some("n1")).validate().is_ok());
    for kind in ["update", "merge", "delete"] {
        let err = op(kind, None).validate().unwrap_err();
        assert_eq!(err.kind(), "invalid_params");
        assert!(op(kind, Some("")).validate().is_err());
    }

    let mut nameless = op("create", None);
    nameless.table.clear();
    assert!(nameless.validate().is_err());
}

// --- Results ---

#[test]
fn execution_result_wire_format() {
    let result = ExecutionResult {
        data: json!([]),
        source: Source::Hybrid,
        execution_time_ms: 4,
        cache_hit: true,
        stale: false,
        route: RouteDecision::new(RouteStrategy::LocalOnly, "all tables served from local cache"),
    };
    assert_eq!(
        serde_json::to_value(&result).unwrap(),
        json!({
            "data": [],
            "source": "hybrid",
            "executionTimeMs": 4,
            "cacheHit": true,
            "stale": false,
            "route": {"strategy": "local_only", "rationale": "all tables served from local cache"}
        })
    );
    assert_eq!(RouteStrategy::RemoteOnly.to_string(), "remote-only");
}
