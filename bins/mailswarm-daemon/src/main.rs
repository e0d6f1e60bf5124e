mod config;

use bytes::Bytes;
use config::MailswarmConfig;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{info, warn, LevelFilter};
use mailswarm_api::{PushPayload, ServiceNode};
use mailswarm_core::config::CoreConfig;
use mailswarm_core::decoder::AeadDecoder;
use mailswarm_core::error::CoreError;
use mailswarm_core::handlers::{Journal, RecordingConfigMerger, RecordingMessageHandler};
use mailswarm_core::network::InMemorySwarm;
use mailswarm_core::Core;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

#[derive(thiserror::Error, Debug)]
enum DaemonError {
    #[error("config {0}")]
    Config(#[from] config::ConfigError),
    #[error("core {0}")]
    Core(#[from] CoreError),
    #[error("bind")]
    Bind,
}

#[derive(Clone)]
struct DaemonState {
    core: Arc<Core>,
    swarm: InMemorySwarm,
    journal: Journal,
    bind_addr: String,
}

#[tokio::main]
async fn main() -> Result<(), DaemonError> {
    let args: Vec<String> = std::env::args().collect();
    let mut path = PathBuf::from("mailswarm.toml");
    let mut i = 1;
    while i + 1 < args.len() {
        if args[i] == "--config" {
            path = PathBuf::from(&args[i + 1]);
        }
        i += 1;
    }
    let cfg = config::load_config(&path)?;
    cfg.validate()?;
    init_logging(&cfg);
    let state = init_state(&cfg).await?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let (addr, server) = start_control_server(state.clone(), shutdown_rx).await?;
    if let Some(addr) = addr {
        info!("control server listening on {}", addr);
    }
    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let _ = ctrl_c.as_mut().await;
    info!("shutting down");
    let _ = shutdown_tx.send(());
    let _ = server.await;
    state.core.shutdown().await;
    Ok(())
}

fn init_logging(cfg: &MailswarmConfig) {
    let level = match cfg.logging.level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => LevelFilter::Info,
    };
    let _ = env_logger::Builder::from_default_env()
        .filter_level(level)
        .try_init();
}

fn core_config(cfg: &MailswarmConfig) -> CoreConfig {
    let storage_path = cfg.storage_path();
    CoreConfig {
        storage_path: storage_path
            .to_str()
            .unwrap_or(".mailswarm/store.sqlite")
            .to_string(),
        swarm_cache_ttl_ms: cfg.store.swarm_cache_ttl_ms,
        user_drain: cfg.store.user_drain.clone(),
        group_drain: cfg.store.group_drain.clone(),
        job_worker_interval_ms: cfg.store.job_worker_interval_ms,
        known_hash_limit: cfg.store.known_hash_limit,
        ..CoreConfig::default()
    }
}

async fn init_state(cfg: &MailswarmConfig) -> Result<DaemonState, DaemonError> {
    std::fs::create_dir_all(&cfg.data_dir).map_err(|_| config::ConfigError::Io)?;
    let nodes: Vec<ServiceNode> = cfg.swarm.nodes.iter().map(|n| n.service_node()).collect();
    let swarm = InMemorySwarm::new(nodes);
    let mut decoder = AeadDecoder::from_hex(cfg.decoder.key_hex.trim())?;
    if let Some(self_id) = cfg.decoder.self_id.as_ref() {
        decoder = decoder.with_self_id(self_id.clone());
    }
    let journal = Journal::new();
    let core = Core::init(
        core_config(cfg),
        cfg.policy.clone(),
        Arc::new(swarm.clone()),
        Arc::new(decoder),
        Arc::new(RecordingConfigMerger::new(journal.clone())),
        Arc::new(RecordingMessageHandler::new(journal.clone())),
    )
    .await?;
    for target in cfg.targets.iter() {
        let poll_target = target.poll_target()?;
        core.watch(&poll_target, target.namespaces()?).await?;
        info!("watching {}", poll_target.key());
    }
    Ok(DaemonState {
        core: Arc::new(core),
        swarm,
        journal,
        bind_addr: cfg.control.bind_addr.clone(),
    })
}

async fn start_control_server(
    state: DaemonState,
    shutdown: oneshot::Receiver<()>,
) -> Result<(Option<SocketAddr>, JoinHandle<()>), DaemonError> {
    let addr: SocketAddr = state.bind_addr.parse().map_err(|_| DaemonError::Bind)?;
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(err) => {
            warn!("control server disabled: {}", err);
            let handle = tokio::spawn(async move {
                let _ = shutdown.await;
            });
            return Ok((None, handle));
        }
    };
    let local = listener.local_addr().ok();
    let handle = tokio::spawn(async move {
        let mut shutdown = shutdown;
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    break;
                }
                res = listener.accept() => {
                    match res {
                        Ok((stream, _)) => {
                            let state_clone = state.clone();
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req: Request<Incoming>| {
                                    let state = state_clone.clone();
                                    async move { handle_request(state, req).await }
                                });
                                let _ = http1::Builder::new().serve_connection(io, service).await;
                            });
                        }
                        Err(_) => break,
                    }
                }
            }
        }
    });
    Ok((local, handle))
}

async fn handle_request(
    state: DaemonState,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().as_str().to_string();
    let path = req.uri().path().to_string();
    match (method.as_str(), path.as_str()) {
        ("GET", "/health") => Ok(json_response(
            StatusCode::OK,
            serde_json::json!({"status":"ok"}),
        )),
        ("GET", "/pollers") => {
            let pollers = state.core.pollers().await;
            Ok(json_response(StatusCode::OK, serde_json::json!(pollers)))
        }
        ("GET", "/stats") => match state.core.stats().await {
            Ok(stats) => Ok(json_response(
                StatusCode::OK,
                serde_json::json!({
                    "pollers": stats.pollers,
                    "running_pollers": stats.running_pollers,
                    "queued_jobs": stats.queued_jobs,
                    "schema_version": stats.schema_version,
                    "store_suspended": stats.store_suspended,
                    "handled": state.journal.len(),
                    "retrieve_requests": state.swarm.requests().await.len(),
                }),
            )),
            Err(err) => Ok(error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())),
        },
        ("POST", "/push") => {
            let body = req.into_body().collect().await?.to_bytes();
            let payload: PushPayload = match serde_json::from_slice(&body) {
                Ok(payload) => payload,
                Err(err) => return Ok(error_response(StatusCode::BAD_REQUEST, &err.to_string())),
            };
            match state.core.ingest_push(&payload).await {
                Ok(result) => Ok(json_response(StatusCode::OK, serde_json::json!(result))),
                Err(CoreError::Validation(reason)) => {
                    Ok(error_response(StatusCode::UNPROCESSABLE_ENTITY, &reason))
                }
                Err(err) => {
                    warn!("push ingestion failed: {}", err);
                    Ok(error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()))
                }
            }
        }
        ("POST", "/jobs/run") => match state.core.run_jobs().await {
            Ok(summary) => Ok(json_response(
                StatusCode::OK,
                serde_json::json!({
                    "completed": summary.completed,
                    "retried": summary.retried,
                    "dropped": summary.dropped,
                }),
            )),
            Err(err) => Ok(error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())),
        },
        _ => Ok(error_response(StatusCode::NOT_FOUND, "not found")),
    }
}

fn json_response(status: StatusCode, value: serde_json::Value) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::from(value.to_string()));
    *response.status_mut() = status;
    if let Ok(content_type) = "application/json".parse() {
        response.headers_mut().insert(CONTENT_TYPE, content_type);
    }
    response
}

fn error_response(status: StatusCode, reason: &str) -> Response<Full<Bytes>> {
    json_response(status, serde_json::json!({ "error": reason }))
}

#[cfg(test)]
mod tests;
