use super::*;
use crate::config::{
    ControlConfig, DecoderConfig, LoggingConfig, StoreConfig, SwarmConfig, TargetConfig,
};
use hyper::client::conn::http1 as client_http1;
use hyper::server::conn::http1 as server_http1;
use mailswarm_api::{Namespace, PollResult, PollTarget, PollerStatus};
use mailswarm_core::decoder::WireMessage;
use mailswarm_core::policy::Policy;
use std::time::Duration;
use tempfile::tempdir;
use tokio::io::duplex;


const KEY_HEX: &str = "0707070707070707070707070707070707070707070707070707070707070707";

#[tokio::test]
async fn config_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("conf.toml");
    let cfg = format!(
        r#"
data_dir = "{dir}"

[store]
file = "swarm.sqlite"
known_hash_limit = 64
job_worker_interval_ms = 0
group_drain = "Drain"

[policy]
min_poll_interval_ms = 1000
max_poll_interval_ms = 5000

[[targets]]
swarm = "05{id}"
namespaces = [0, 2]

[[targets]]
server = "https://open.example.com/"

[[swarm.nodes]]
address = "10.1.0.1"
port = 22021

[decoder]
key_hex = "{key}"
self_id = "me"

[control]
bind_addr = "127.0.0.1:0"

[logging]
level = "info"
"#,
        dir = dir.path().display(),
        id = "ab".repeat(32),
        key = KEY_HEX,
    );
    std::fs::write(&path, cfg).unwrap();
    let loaded = config::load_config(&path).unwrap();
    loaded.validate().unwrap();
    assert_eq!(loaded.store.known_hash_limit, 64);
    assert_eq!(loaded.store.group_drain, mailswarm_core::config::DrainBehaviour::Drain);
    assert_eq!(loaded.policy.max_poll_interval_ms, 5000);
    assert_eq!(loaded.policy.job_batch, Policy::default().job_batch);
    assert_eq!(loaded.targets.len(), 2);
    assert_eq!(
        loaded.targets[0].namespaces().unwrap(),
        Some(vec![Namespace::Default, Namespace::ConfigUserProfile])
    );
    assert_eq!(
        loaded.targets[1].poll_target().unwrap(),
        PollTarget::server("https://open.example.com")
    );
    assert_eq!(loaded.storage_path(), dir.path().join("swarm.sqlite"));
    assert_eq!(loaded.swarm.nodes.len(), 1);
}

#[tokio::test]
async fn daemon_starts_and_stops() {
    let cfg = test_config();
    let state = build_state(&cfg).await;
    let (addr, tx, handle) = start_server(state.clone()).await;
    assert!(addr.is_some() || addr.is_none());
    let _ = tx.send(());
    let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    state.core.shutdown().await;
}

#[tokio::test]
async fn configured_targets_are_watched() {
    let mut cfg = test_config();
    cfg.targets = vec![TargetConfig {
        swarm: Some(format!("05{}", "cd".repeat(32))),
        server: None,
        namespaces: Some(vec![0]),
        legacy: false,
    }];
    let state = build_state(&cfg).await;
    let response = send_in_memory_request(state.clone(), build_request("GET", "/pollers", None)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let pollers: Vec<PollerStatus> = read_json(response).await;
    assert_eq!(pollers.len(), 1);
    assert_eq!(pollers[0].target, PollTarget::swarm(format!("05{}", "cd".repeat(32))));
    state.core.shutdown().await;
}

#[tokio::test]
async fn health_and_stats_endpoints() {
    let cfg = test_config();
    let state = build_state(&cfg).await;
    let health = send_in_memory_request(state.clone(), build_request("GET", "/health", None)).await;
    assert_eq!(health.status(), StatusCode::OK);
    let stats = send_in_memory_request(state.clone(), build_request("GET", "/stats", None)).await;
    assert_eq!(stats.status(), StatusCode::OK);
    let body: serde_json::Value = read_json(stats).await;
    assert_eq!(body["pollers"], 0);
    assert_eq!(body["queued_jobs"], 0);
    assert_eq!(body["handled"], 0);
    let missing = send_in_memory_request(state.clone(), build_request("GET", "/nope", None)).await;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    state.core.shutdown().await;
}

#[tokio::test]
async fn push_endpoint_handles_inline() {
    let cfg = test_config();
    let state = build_state(&cfg).await;
    let target = PollTarget::swarm(format!("05{}", "ef".repeat(32)));
    let payload = sealed_payload(&state, &target, "hello").await;
    let response = send_in_memory_request(
        state.clone(),
        build_request("POST", "/push", Some(serde_json::json!(payload))),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let result: PollResult = read_json(response).await;
    assert_eq!(result.valid_count, 1);
    assert_eq!(state.journal.len(), 1);

    let again = send_in_memory_request(
        state.clone(),
        build_request("POST", "/push", Some(serde_json::json!(payload))),
    )
    .await;
    let result: PollResult = read_json(again).await;
    assert_eq!(result.duplicate_count, 1);
    assert_eq!(state.journal.len(), 1);
    state.core.shutdown().await;
}

#[tokio::test]
async fn push_endpoint_rejects_bad_input() {
    let cfg = test_config();
    let state = build_state(&cfg).await;
    let garbage = send_in_memory_request(
        state.clone(),
        build_request("POST", "/push", Some(serde_json::json!({"unexpected": true}))),
    )
    .await;
    assert_eq!(garbage.status(), StatusCode::BAD_REQUEST);

    let target = PollTarget::swarm(format!("05{}", "ef".repeat(32)));
    let mut payload = sealed_payload(&state, &target, "hello").await;
    payload.namespace = Namespace::ConfigGroupKeys;
    let rejected = send_in_memory_request(
        state.clone(),
        build_request("POST", "/push", Some(serde_json::json!(payload))),
    )
    .await;
    assert_eq!(rejected.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert!(state.journal.is_empty());
    state.core.shutdown().await;
}

#[allow(deprecated)]
pub(super) fn test_config() -> MailswarmConfig {
    MailswarmConfig {
        data_dir: tempdir().unwrap().into_path(),
        store: StoreConfig {
            job_worker_interval_ms: 0,
            ..StoreConfig::default()
        },
        policy: Policy::default(),
        targets: Vec::new(),
        swarm: SwarmConfig::default(),
        decoder: DecoderConfig {
            key_hex: KEY_HEX.to_string(),
            self_id: None,
        },
        control: ControlConfig::default(),
        logging: LoggingConfig {
            level: "error".to_string(),
        },
    }
}

pub(super) async fn build_state(cfg: &MailswarmConfig) -> DaemonState {
    init_logging(cfg);
    init_state(cfg).await.unwrap()
}

async fn sealed_payload(state: &DaemonState, target: &PollTarget, body: &str) -> PushPayload {
    let decoder = AeadDecoder::from_hex(KEY_HEX).unwrap();
    let data = decoder
        .seal(
            Namespace::Default,
            &WireMessage::Standard {
                thread_id: "thread".to_string(),
                sender: "peer".to_string(),
                kind: "text".to_string(),
                body: body.as_bytes().to_vec(),
            },
        )
        .unwrap();
    let raw = state.swarm.store(target, Namespace::Default, data, 60_000).await;
    PushPayload::from_raw(target.clone(), &raw)
}

pub(super) async fn start_server(
    state: DaemonState,
) -> (Option<SocketAddr>, oneshot::Sender<()>, JoinHandle<()>) {
    let (tx, rx) = oneshot::channel();
    let (addr, handle) = start_control_server(state, rx).await.unwrap();
    (addr, tx, handle)
}

pub(super) fn build_request(
    method: &str,
    path: &str,
    body: Option<serde_json::Value>,
) -> Request<Full<Bytes>> {
    let mut builder = Request::builder()
        .method(method)
        .uri(path)
        .header("host", "localhost");
    if body.is_some() {
        builder = builder.header(CONTENT_TYPE, "application/json");
    }
    let bytes = body
        .map(|value| value.to_string().into_bytes())
        .unwrap_or_default();
    builder.body(Full::from(Bytes::from(bytes))).unwrap()
}

async fn send_in_memory_request(state: DaemonState, req: Request<Full<Bytes>>) -> Response<Incoming> {
    let (client, server) = duplex(64 * 1024);
    let server_state = state.clone();
    let service = service_fn(move |incoming: Request<Incoming>| {
        let inner = server_state.clone();
        async move { handle_request(inner, incoming).await }
    });
    tokio::spawn(async move {
        let io = TokioIo::new(server);
        let _ = server_http1::Builder::new().serve_connection(io, service).await;
    });
    let io = TokioIo::new(client);
    let (mut sender, connection) = client_http1::handshake(io).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    sender.send_request(req).await.unwrap()
}

async fn read_json<T: serde::de::DeserializeOwned>(response: Response<Incoming>) -> T {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}
