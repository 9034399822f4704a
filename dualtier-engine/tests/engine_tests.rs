mod support;

use dualtier_engine::remote::{MemoryBackend, RemoteConnector, RemoteStore};
use dualtier_engine::{Engine, EngineBridge, EngineConfig, LiveNotification, spawn_engine};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use support::{Script, ScriptedConnector, app_config, eventually, signin_response};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

struct Running {
    backend: MemoryBackend,
    bridge: EngineBridge,
    handle: JoinHandle<()>,
}

fn start(config: EngineConfig) -> Running {
    let backend = MemoryBackend::new();
    let connector = Arc::new(backend.connector());
    start_with(config, backend, connector)
}

fn start_with(
    config: EngineConfig,
    backend: MemoryBackend,
    connector: Arc<dyn RemoteConnector>,
) -> Running {
    let (bridge, handle) = spawn_engine(config, connector);
    Running {
        backend,
        bridge,
        handle,
    }
}

async fn started_and_connected(config: EngineConfig) -> Running {
    let engine = start(config);
    let state = engine.bridge.call("connect", json!([])).await.unwrap();
    assert_eq!(state, json!("connected"));
    engine
}

/// Poll an engine method until `check` accepts its result.
async fn wait_for(bridge: &EngineBridge, method: &str, check: impl Fn(&Value) -> bool) -> Value {
    for _ in 0..200 {
        let value = bridge.call(method, Value::Null).await.unwrap();
        if check(&value) {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{method} never reached the expected value");
}

// --- Lifecycle ---

#[tokio::test]
async fn connect_and_disconnect_report_state() {
    let engine = start(app_config());
    assert_eq!(engine.bridge.call("state", Value::Null).await.unwrap(), json!("disconnected"));

    engine.bridge.call("connect", json!([])).await.unwrap();
    assert_eq!(engine.bridge.call("state", json!([])).await.unwrap(), json!("connected"));

    let state = engine.bridge.call("disconnect", json!([])).await.unwrap();
    assert_eq!(state, json!("disconnected"));
}

#[tokio::test]
async fn engine_stops_when_the_bridge_is_dropped() {
    let Running {
        backend: _backend,
        bridge,
        handle,
    } = started_and_connected(app_config()).await;
    drop(bridge);

    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("engine did not stop")
        .unwrap();
}

#[tokio::test]
async fn bad_calls_come_back_as_typed_errors() {
    let engine = start(app_config());

    let err = engine.bridge.call("frobnicate", json!([])).await.unwrap_err();
    assert_eq!(err.kind(), "unknown_method");

    let err = engine.bridge.call("select", json!([])).await.unwrap_err();
    assert_eq!(err.kind(), "invalid_params");

    let err = engine.bridge.call("is_table_cached", json!([42])).await.unwrap_err();
    assert_eq!(err.kind(), "invalid_params");

    let err = engine.bridge.call("switch_tenant", json!(["acme"])).await.unwrap_err();
    assert_eq!(err.kind(), "invalid_state");
}

#[tokio::test]
async fn connect_can_pick_a_tenant() {
    let engine = start(app_config());
    engine
        .bridge
        .call("connect", json!([{"tenantCode": "acme"}]))
        .await
        .unwrap();
    engine
        .bridge
        .call("create", json!(["notes:n1", {"title": "a"}]))
        .await
        .unwrap();

    let records = engine.backend.records("app_acme", "main_acme", "notes").unwrap();
    assert_eq!(records.len(), 1);
}

#[tokio::test]
async fn authenticate_records_permissions() {
    let engine = started_and_connected(app_config()).await;
    engine
        .backend
        .register_principal("alice", "id-token", signin_response(&["admin"]));

    let auth = engine
        .bridge
        .call(
            "authenticate",
            json!([{"principalId": "alice", "token": "id-token"}]),
        )
        .await
        .unwrap();
    assert_eq!(auth["principalId"], json!("alice"));
    assert_eq!(auth["roles"], json!(["admin"]));

    assert_eq!(
        engine.bridge.call("state", Value::Null).await.unwrap(),
        json!("authenticated")
    );
    let stored = engine.bridge.call("auth_state", Value::Null).await.unwrap();
    assert_eq!(stored["menus"], json!(["dashboard"]));

    let err = engine
        .bridge
        .call(
            "authenticate",
            json!([{"principalId": "alice", "token": "wrong"}]),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "auth");
}

// --- Data ---

#[tokio::test]
async fn select_warms_the_cache_then_serves_locally() {
    let engine = started_and_connected(app_config()).await;
    engine
        .backend
        .seed("app", "main", "users", &[json!({"id": "u1", "name": "Ada"})])
        .unwrap();

    let first = engine.bridge.call("select", json!(["users"])).await.unwrap();
    assert_eq!(first["source"], json!("hybrid"));
    assert_eq!(first["cacheHit"], json!(false));
    assert_eq!(first["data"], json!([{"id": "u1", "name": "Ada"}]));

    let second = engine.bridge.call("select", json!(["users"])).await.unwrap();
    assert_eq!(second["source"], json!("local"));
    assert_eq!(second["cacheHit"], json!(true));
    assert_eq!(second["route"]["strategy"], json!("local_only"));

    assert_eq!(
        engine.bridge.call("is_table_cached", json!(["users"])).await.unwrap(),
        json!(true)
    );
    let metadata = engine.bridge.call("cache_metadata", Value::Null).await.unwrap();
    assert_eq!(metadata.as_array().map(Vec::len), Some(1));

    let cleared = engine.bridge.call("clear_cache", json!([])).await.unwrap();
    assert_eq!(cleared, json!(["users"]));
    assert_eq!(
        engine.bridge.call("is_table_cached", json!(["users"])).await.unwrap(),
        json!(false)
    );
}

#[tokio::test]
async fn local_only_writes_stay_local() {
    let engine = started_and_connected(app_config()).await;

    let result = engine
        .bridge
        .call("create", json!(["drafts:d1", {"title": "wip"}]))
        .await
        .unwrap();
    assert_eq!(result["source"], json!("local"));
    assert_eq!(result["route"]["strategy"], json!("local_only"));
    assert!(engine.backend.write_log().is_empty());
}

#[tokio::test]
async fn analysis_and_routing_are_exposed() {
    let engine = start(app_config());

    let analysis = engine
        .bridge
        .call(
            "analyze_query",
            json!(["SELECT * FROM users u JOIN orders o ON o.user_id = u.id"]),
        )
        .await
        .unwrap();
    assert_eq!(analysis["tables"], json!(["orders", "users"]));
    assert_eq!(analysis["kind"], json!("read"));

    engine.bridge.call("connect", json!([])).await.unwrap();
    let route = engine
        .bridge
        .call("route_query", json!(["SELECT * FROM audit"]))
        .await
        .unwrap();
    assert_eq!(
        route,
        json!({"strategy": "remote_only", "rationale": "audit is REMOTE_ONLY"})
    );

    assert_eq!(
        engine.bridge.call("get_cacheable_tables", Value::Null).await.unwrap(),
        json!(["orders", "users"])
    );
}

// --- Offline ---

#[tokio::test]
async fn offline_writes_are_queued_and_replayed_on_reconnect() {
    let config = EngineConfig {
        reconnect_base_delay_ms: 100,
        ..app_config()
    };
    let engine = started_and_connected(config).await;
    engine.backend.set_offline(true);

    // The first write discovers the outage, the second is queued up front.
    let first = engine
        .bridge
        .call("create", json!(["notes:n1", {"title": "a"}]))
        .await
        .unwrap();
    assert_eq!(first["queued"], json!(true));
    assert_ne!(engine.bridge.call("state", Value::Null).await.unwrap(), json!("connected"));

    let second = engine
        .bridge
        .call("merge", json!(["notes:n1", {"body": "b"}]))
        .await
        .unwrap();
    assert_eq!(second["queued"], json!(true));

    let err = engine
        .bridge
        .call("query", json!(["UPDATE notes SET title = 'z'"]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "offline");

    let stats = engine.bridge.call("get_operation_stats", Value::Null).await.unwrap();
    assert_eq!(stats["pending"], json!(2));

    engine.backend.set_offline(false);
    wait_for(&engine.bridge, "get_operation_stats", |s| s["completed"] == json!(2)).await;

    let n1 = engine
        .backend
        .records("app", "main", "notes")
        .unwrap()
        .into_iter()
        .find(|r| r["id"] == json!("n1"))
        .unwrap();
    assert_eq!(n1["title"], json!("a"));
    assert_eq!(n1["body"], json!("b"));

    let removed = engine
        .bridge
        .call("clear_completed_operations", Value::Null)
        .await
        .unwrap();
    assert_eq!(removed, json!({"removed": 2}));
}

#[tokio::test]
async fn recovery_waits_for_the_signin_replay() {
    let backend = MemoryBackend::new();
    let script = Script {
        signin_delay: Some(Duration::from_millis(50)),
        ..Script::default()
    };
    let connector = Arc::new(ScriptedConnector::new(&backend, script));
    let config = EngineConfig {
        reconnect_base_delay_ms: 100,
        offline_max_retries: 1,
        ..app_config()
    };
    let engine = start_with(config, backend, connector);
    engine.bridge.call("connect", json!([])).await.unwrap();
    engine
        .backend
        .register_principal("alice", "id-token", signin_response(&["admin"]));
    engine
        .bridge
        .call(
            "authenticate",
            json!([{"principalId": "alice", "token": "id-token"}]),
        )
        .await
        .unwrap();

    engine
        .backend
        .seed("app", "main", "users", &[json!({"id": "u1", "name": "Ada"})])
        .unwrap();
    engine.bridge.call("select", json!(["users"])).await.unwrap();
    assert_eq!(engine.backend.active_live_queries(), 1);

    engine.backend.set_offline(true);
    let queued = engine
        .bridge
        .call("update", json!(["notes:n1", {"title": "a"}]))
        .await
        .unwrap();
    assert_eq!(queued["queued"], json!(true));

    engine.backend.set_offline(false);
    let stats = wait_for(&engine.bridge, "get_operation_stats", |s| {
        s["completed"] == json!(1) || s["failed"] != json!(0)
    })
    .await;
    assert_eq!(stats["failed"], json!(0));
    assert_eq!(stats["completed"], json!(1));
    assert_eq!(
        engine.bridge.call("state", Value::Null).await.unwrap(),
        json!("authenticated")
    );

    // The users cache is live again on the new session.
    eventually(|| engine.backend.active_live_queries() == 1).await;
    engine
        .backend
        .remote()
        .merge("users", "u1", &json!({"name": "Ada L."}))
        .await
        .unwrap();
    for _ in 0..200 {
        let result = engine.bridge.call("select", json!(["users"])).await.unwrap();
        if result["data"][0]["name"] == json!("Ada L.") {
            assert_eq!(result["cacheHit"], json!(true));
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("cached users never saw the remote change");
}

#[tokio::test]
async fn queue_methods_are_reachable_over_the_bridge() {
    let engine = start(app_config());

    let queued = engine
        .bridge
        .call(
            "queue_offline_operation",
            json!([{"kind": "delete", "table": "notes", "recordId": "n9"}]),
        )
        .await
        .unwrap();
    let id = queued["operationId"].as_str().unwrap().to_string();

    let listed = engine
        .bridge
        .call("list_offline_operations", Value::Null)
        .await
        .unwrap();
    assert_eq!(listed[0]["id"], json!(id));
    assert_eq!(listed[0]["status"], json!("pending"));

    let report = engine.bridge.call("start_auto_sync", Value::Null).await.unwrap();
    assert_eq!(report["skipped"], json!(true));

    let err = engine
        .bridge
        .call(
            "queue_offline_operation",
            json!([{"kind": "merge", "table": "notes", "payload": {"title": "x"}}]),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_params");
    let stats = engine.bridge.call("get_operation_stats", Value::Null).await.unwrap();
    assert_eq!(stats["total"], json!(1));
}

// --- Live queries ---

#[tokio::test]
async fn live_query_notifications_reach_the_callback() {
    let engine = started_and_connected(app_config()).await;

    let opened = engine.bridge.call("live", json!(["feed"])).await.unwrap();
    let id: Uuid = serde_json::from_value(opened["id"].clone()).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    engine.bridge.register_live_query_callback(id, {
        let seen = seen.clone();
        move |n: &LiveNotification| {
            seen.lock().unwrap().push(n.result["id"].clone());
            Ok(())
        }
    });

    let remote = engine.backend.remote();
    remote
        .create("feed", Some("f1"), &json!({"text": "hello"}))
        .await
        .unwrap();
    eventually(|| seen.lock().unwrap().len() == 1).await;
    assert_eq!(*seen.lock().unwrap(), vec![json!("f1")]);

    assert_eq!(engine.bridge.call("kill", json!([id])).await.unwrap(), Value::Null);
    assert!(engine.backend.killed().contains(&id));
    assert_eq!(engine.backend.active_live_queries(), 0);
}

#[tokio::test]
async fn ended_live_query_is_forgotten() {
    let backend = MemoryBackend::new();
    let (outbound, _pushed) = mpsc::channel(16);
    let engine = Engine::new(app_config(), Arc::new(backend.connector()), outbound);
    engine.dispatch("connect", json!([])).await.unwrap();

    let opened = engine.dispatch("live", json!(["feed"])).await.unwrap();
    let id: Uuid = serde_json::from_value(opened["id"].clone()).unwrap();
    assert_eq!(engine.live_query_ids(), vec![id]);

    // Ended by the remote, not by a kill call.
    backend.remote().kill(id).await.unwrap();
    eventually(|| engine.live_query_ids().is_empty()).await;
}

#[tokio::test]
async fn live_query_needs_the_remote() {
    let engine = start(app_config());
    let err = engine.bridge.call("live", json!(["feed"])).await.unwrap_err();
    assert_eq!(err.kind(), "remote_unavailable");
}
