use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;

use tsbridge::bridge::field::FieldKind;
use tsbridge::bridge::registry::{KeyRegistry, Resolution, UnitKey, UnitLabel};
use tsbridge::catalog::{self, CatalogClient, Credentials, ServiceRegistration};
use tsbridge::config::{CatalogConfig, SinkConfig};
use tsbridge::sink::thingspeak::ThingSpeakSink;
use tsbridge::sink::{BatchSink, SendError, SinkAck, SinkRecord, SlotValue};

#[derive(Default)]
struct Recorded {
    updates: Vec<HashMap<String, String>>,
    registrations: Vec<(String, Option<String>, serde_json::Value)>,
}

type Shared = Arc<Mutex<Recorded>>;

async fn update(
    State(state): State<Shared>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let key = params.get("api_key").cloned().unwrap_or_default();
    state.lock().updates.push(params);
    match key.as_str() {
        "GOOD" => (StatusCode::OK, "42".to_string()),
        "LIMITED" => (StatusCode::OK, "0".to_string()),
        _ => (StatusCode::BAD_REQUEST, "-1".to_string()),
    }
}

async fn user(Path(id): Path<String>) -> impl IntoResponse {
    match id.as_str() {
        "alice" => Json(json!({
            "userID": "alice",
            "roomID": "Room1",
            "thingspeak_info": {"apikeys": ["GOOD", "READKEY"], "channel": 1001}
        }))
        .into_response(),
        "odd user?%" => Json(json!({
            "userID": "odd user?%",
            "thingspeak_info": {"apikeys": ["ODDKEY"]}
        }))
        .into_response(),
        "broken" => (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn full_catalog() -> Json<serde_json::Value> {
    Json(json!({
        "usersList": [
            {
                "userID": "alice",
                "roomID": "Room1",
                "thingspeak_info": {"apikeys": ["GOOD"], "channel": "1001"}
            },
            {"userID": "bob", "thingspeak_info": {"apikeys": ["BOBKEY"]}},
            {"userID": "carol", "thingspeak_info": {"apikeys": []}}
        ]
    }))
}

async fn update_service() -> StatusCode {
    StatusCode::NOT_FOUND
}

async fn create_service(
    State(state): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> StatusCode {
    let token = headers
        .get("X-Write-Token")
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    state
        .lock()
        .registrations
        .push(("POST".to_string(), token, body));
    StatusCode::CREATED
}

async fn slow_update() -> &'static str {
    tokio::time::sleep(Duration::from_secs(5)).await;
    "1"
}

async fn serve() -> (SocketAddr, Shared) {
    let state: Shared = Arc::new(Mutex::new(Recorded::default()));

    let app = Router::new()
        .route("/update", post(update))
        .route("/slow/update", post(slow_update))
        .route("/users/:id", get(user))
        .route("/catalog", get(full_catalog))
        .route("/services/:id", put(update_service))
        .route("/services", post(create_service))
        .with_state(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });

    (addr, state)
}

fn sink_config(addr: SocketAddr, path: &str, timeout: Duration) -> SinkConfig {
    SinkConfig {
        write_url: format!("http://{addr}{path}"),
        timeout,
        ..SinkConfig::default()
    }
}

fn catalog_config(addr: SocketAddr) -> CatalogConfig {
    CatalogConfig {
        url: format!("http://{addr}/"),
        write_token: Some("TOKEN".to_string()),
        ..CatalogConfig::default()
    }
}

fn record() -> SinkRecord {
    SinkRecord {
        key: UnitKey::canonical("alice", "Room1").expect("key"),
        created_at: Utc::now(),
        values: vec![
            SlotValue {
                field: Arc::from("temp"),
                slot: Arc::from("field1"),
                kind: FieldKind::Average,
                value: 21.333,
            },
            SlotValue {
                field: Arc::from("alerts"),
                slot: Arc::from("field8"),
                kind: FieldKind::Counter,
                value: 2.0,
            },
        ],
    }
}

fn creds(key: &str) -> Credentials {
    Credentials {
        write_key: key.to_string(),
        channel_id: None,
    }
}

#[tokio::test]
async fn test_sink_accepts_and_sends_query() {
    let (addr, state) = serve().await;
    let sink = ThingSpeakSink::new(&sink_config(addr, "/update", Duration::from_secs(2)))
        .expect("sink");

    let ack = sink.write(&record(), &creds("GOOD")).await.expect("write");
    assert_eq!(ack, SinkAck::Accepted { entry_id: 42 });

    let updates = state.lock().updates.clone();
    assert_eq!(updates.len(), 1);
    let params = &updates[0];
    assert_eq!(params.get("api_key").map(String::as_str), Some("GOOD"));
    assert_eq!(params.get("field1").map(String::as_str), Some("21.33"));
    assert_eq!(params.get("field8").map(String::as_str), Some("2"));
    assert!(params.get("created_at").is_some_and(|t| t.ends_with('Z')));
    assert!(!params.contains_key("field2"));
}

#[tokio::test]
async fn test_sink_zero_body_is_rejection() {
    let (addr, _state) = serve().await;
    let sink = ThingSpeakSink::new(&sink_config(addr, "/update", Duration::from_secs(2)))
        .expect("sink");

    let ack = sink.write(&record(), &creds("LIMITED")).await.expect("write");
    assert!(matches!(ack, SinkAck::Rejected { .. }));
}

#[tokio::test]
async fn test_sink_bad_status_is_error() {
    let (addr, _state) = serve().await;
    let sink = ThingSpeakSink::new(&sink_config(addr, "/update", Duration::from_secs(2)))
        .expect("sink");

    let err = sink
        .write(&record(), &creds("WRONG"))
        .await
        .expect_err("bad request");
    assert!(matches!(err, SendError::Status { status: 400, .. }));
}

#[tokio::test]
async fn test_sink_timeout() {
    let (addr, _state) = serve().await;
    let sink = ThingSpeakSink::new(&sink_config(
        addr,
        "/slow/update",
        Duration::from_millis(100),
    ))
    .expect("sink");

    let err = sink
        .write(&record(), &creds("GOOD"))
        .await
        .expect_err("timeout");
    assert!(matches!(err, SendError::Timeout(_)));
}

#[tokio::test]
async fn test_catalog_fetches_user_credentials() {
    let (addr, _state) = serve().await;
    let client = catalog::Client::new(&catalog_config(addr)).expect("client");

    let creds = client
        .fetch_credentials(&UnitLabel::new("alice", "Room1"))
        .await
        .expect("fetch")
        .expect("credentials");
    assert_eq!(creds.write_key, "GOOD");
    assert_eq!(creds.channel_id.as_deref(), Some("1001"));

    let missing = client
        .fetch_credentials(&UnitLabel::new("nobody", "Room1"))
        .await
        .expect("fetch");
    assert!(missing.is_none());

    assert!(client
        .fetch_credentials(&UnitLabel::new("broken", "Room1"))
        .await
        .is_err());
}

#[tokio::test]
async fn test_catalog_escapes_user_in_path() {
    let (addr, _state) = serve().await;
    let client = catalog::Client::new(&catalog_config(addr)).expect("client");

    let creds = client
        .fetch_credentials(&UnitLabel::new("odd user?%", "Room1"))
        .await
        .expect("fetch")
        .expect("credentials");
    assert_eq!(creds.write_key, "ODDKEY");
}

#[tokio::test]
async fn test_catalog_metrics_callback() {
    let (addr, _state) = serve().await;
    let seen: Arc<Mutex<Vec<(String, String)>>> = Arc::default();
    let recorder = Arc::clone(&seen);
    let client = catalog::Client::new(&catalog_config(addr))
        .expect("client")
        .with_metrics(Box::new(move |endpoint, status, _| {
            recorder.lock().push((endpoint.to_string(), status.to_string()));
        }));

    client
        .fetch_credentials(&UnitLabel::new("alice", "Room1"))
        .await
        .expect("fetch");
    client
        .fetch_credentials(&UnitLabel::new("nobody", "Room1"))
        .await
        .expect("fetch");

    assert_eq!(
        *seen.lock(),
        vec![
            ("users".to_string(), "success".to_string()),
            ("users".to_string(), "not_found".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_registry_preload_and_resolve() {
    let (addr, _state) = serve().await;
    let client = catalog::Client::new(&catalog_config(addr)).expect("client");
    let registry = KeyRegistry::new(client, Duration::from_secs(60), None);

    let loaded = registry.preload().await.expect("preload");
    assert_eq!(loaded, 2);
    assert_eq!(registry.cached_len(), 2);

    let bob = UnitKey::canonical("bob", "Room1").expect("key");
    assert_eq!(
        registry.resolve(&bob).await,
        Resolution::Found(creds("BOBKEY"))
    );

    let (nobody, _) = registry.intern("nobody", "Room1").expect("intern");
    assert_eq!(registry.resolve(&nobody).await, Resolution::NotFound);
}

#[tokio::test]
async fn test_register_service_falls_back_to_create() {
    let (addr, state) = serve().await;
    let client = catalog::Client::new(&catalog_config(addr)).expect("client");

    client
        .register_service(&ServiceRegistration {
            service_id: "tsbridge".to_string(),
            subscriptions: vec!["SC/+/+/dht".to_string()],
            publications: Vec::new(),
        })
        .await
        .expect("register");

    let registrations = state.lock().registrations.clone();
    assert_eq!(registrations.len(), 1);
    let (method, token, body) = &registrations[0];
    assert_eq!(method, "POST");
    assert_eq!(token.as_deref(), Some("TOKEN"));
    assert_eq!(body["serviceID"], "tsbridge");
}
