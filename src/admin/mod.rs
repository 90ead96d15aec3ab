//! Read-only admin surface.
//!
//! Serves JSON:API collection listings for the proxy's runtime objects
//! plus the Prometheus `/metrics` endpoint and a `/health` probe. GET only;
//! nothing here mutates proxy state.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::{json, Value};

use crate::backend::ServerInfo;
use crate::config::Config;
use crate::masking::MaskingRules;
use crate::metrics::metrics;

/// What the admin API shows about one live session
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: u32,
    pub user: String,
    pub remote: String,
    pub started: Instant,
}

/// Registry of live sessions, fed by the router and read by the admin API
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<u32, SessionInfo>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, info: SessionInfo) {
        self.sessions.insert(info.id, info);
    }

    pub fn deregister(&self, id: u32) {
        self.sessions.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn snapshot(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> =
            self.sessions.iter().map(|e| e.value().clone()).collect();
        sessions.sort_by_key(|s| s.id);
        sessions
    }
}

/// Deregisters a session when dropped
pub struct SessionRegistration {
    registry: Arc<SessionRegistry>,
    id: u32,
}

impl SessionRegistration {
    pub fn new(registry: Arc<SessionRegistry>, info: SessionInfo) -> Self {
        let id = info.id;
        registry.register(info);
        Self { registry, id }
    }
}

impl Drop for SessionRegistration {
    fn drop(&mut self) {
        self.registry.deregister(self.id);
    }
}

/// Everything the admin endpoints read
pub struct AdminState {
    pub config: Config,
    pub servers: Vec<Arc<ServerInfo>>,
    pub sessions: Arc<SessionRegistry>,
    pub masking: Arc<RwLock<Arc<MaskingRules>>>,
}

const MODULES: &[(&str, &str)] = &[
    ("readwritesplit", "Read/write splitting router"),
    ("masking", "Result-set masking filter"),
];

fn collection(self_path: &str, data: Vec<Value>) -> Value {
    json!({
        "links": { "self": self_path },
        "data": data,
    })
}

fn servers_document(state: &AdminState) -> Value {
    let data = state
        .servers
        .iter()
        .map(|s| {
            json!({
                "id": s.name,
                "type": "servers",
                "attributes": {
                    "address": s.host,
                    "port": s.port,
                    "role": format!("{:?}", s.role).to_lowercase(),
                    "state": if s.is_up() { "Running" } else { "Down" },
                    "statistics": {
                        "connections": s.connections(),
                        "router_connections": s.router_connections(),
                        "current_operations": s.current_operations(),
                        "replication_lag": s.replication_lag(),
                    },
                },
            })
        })
        .collect();
    collection("/v1/servers", data)
}

fn sessions_document(state: &AdminState) -> Value {
    let data = state
        .sessions
        .snapshot()
        .into_iter()
        .map(|s| {
            json!({
                "id": s.id.to_string(),
                "type": "sessions",
                "attributes": {
                    "user": s.user,
                    "remote": s.remote,
                    "seconds_alive": s.started.elapsed().as_secs(),
                },
            })
        })
        .collect();
    collection("/v1/sessions", data)
}

fn services_document(state: &AdminState) -> Value {
    let data = vec![json!({
        "id": "rwsplit-service",
        "type": "services",
        "attributes": {
            "router": "readwritesplit",
            "listener": format!(
                "{}:{}",
                state.config.server.listen_addr, state.config.server.listen_port
            ),
            "connections": state.sessions.len(),
            "parameters": {
                "slave_selection_criteria":
                    state.config.router.slave_selection_criteria.as_str(),
                "master_failure_mode":
                    state.config.router.master_failure_mode.as_str(),
                "max_sescmd_history": state.config.router.max_sescmd_history,
                "master_accept_reads": state.config.router.master_accept_reads,
                "strict_multi_stmt": state.config.router.strict_multi_stmt,
                "retry_failed_reads": state.config.router.retry_failed_reads,
            },
        },
    })];
    collection("/v1/services", data)
}

fn filters_document(state: &AdminState) -> Value {
    let rules = state.masking.read().clone();
    let data = vec![json!({
        "id": "masking",
        "type": "filters",
        "attributes": {
            "module": "masking",
            "rule_count": rules.len(),
            "rules": rules
                .iter()
                .map(|r| json!({ "match": r.match_string(), "kind": r.kind_name() }))
                .collect::<Vec<Value>>(),
        },
    })];
    collection("/v1/filters", data)
}

fn monitors_document() -> Value {
    // Topology comes from static configuration; there is no monitor module.
    collection("/v1/monitors", Vec::new())
}

fn modules_document() -> Value {
    let data = MODULES
        .iter()
        .map(|(name, description)| {
            json!({
                "id": name,
                "type": "modules",
                "attributes": { "description": description },
            })
        })
        .collect();
    collection("/v1/modules", data)
}

fn users_document(state: &AdminState) -> Value {
    let data = vec![json!({
        "id": state.config.cluster.user,
        "type": "users",
        "attributes": { "account": "backend" },
    })];
    collection("/v1/users", data)
}

fn commands_document() -> Value {
    let data = vec![json!({
        "id": "reload-masking-rules",
        "type": "commands",
        "attributes": {
            "description": "Reload the masking rules file (delivered via SIGHUP)",
        },
    })];
    collection("/v1/commands", data)
}

/// Serve the admin API until the process exits
pub async fn serve(addr: String, state: Arc<AdminState>) -> anyhow::Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Method, Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tracing::{error, info};

    fn json_response(status: StatusCode, body: Value) -> Response<Full<Bytes>> {
        Response::builder()
            .status(status)
            .header("Content-Type", "application/vnd.api+json")
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap()
    }

    async fn handle_request(
        req: Request<hyper::body::Incoming>,
        state: Arc<AdminState>,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        if req.method() != Method::GET {
            return Ok(json_response(
                StatusCode::METHOD_NOT_ALLOWED,
                json!({ "errors": [{ "detail": "the admin API is read-only" }] }),
            ));
        }

        let response = match req.uri().path() {
            "/metrics" => {
                return Ok(Response::builder()
                    .status(StatusCode::OK)
                    .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                    .body(Full::new(Bytes::from(metrics().gather())))
                    .unwrap());
            }
            "/health" => {
                return Ok(Response::builder()
                    .status(StatusCode::OK)
                    .body(Full::new(Bytes::from("OK")))
                    .unwrap());
            }
            "/v1/servers" => servers_document(&state),
            "/v1/sessions" => sessions_document(&state),
            "/v1/services" => services_document(&state),
            "/v1/filters" => filters_document(&state),
            "/v1/monitors" => monitors_document(),
            "/v1/modules" => modules_document(),
            "/v1/users" => users_document(&state),
            "/v1/commands" => commands_document(),
            _ => {
                return Ok(json_response(
                    StatusCode::NOT_FOUND,
                    json!({ "errors": [{ "detail": "unknown collection" }] }),
                ));
            }
        };

        Ok(json_response(StatusCode::OK, response))
    }

    let addr: SocketAddr = addr.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Admin API listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| handle_request(req, state.clone()));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!(error = %e, "Admin API connection error");
            }
        });
    }
}
