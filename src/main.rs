mod admin;
mod backend;
mod classify;
mod config;
mod masking;
mod metrics;
mod protocol;
mod router;
mod sescmd;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinSet;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use admin::{AdminState, SessionRegistry};
use backend::ServerInfo;
use config::Config;
use masking::MaskingRules;
use router::{RouterSession, SessionContext};

/// Global connection counter for generating unique session IDs
static CONNECTION_COUNTER: AtomicU32 = AtomicU32::new(1);

/// Graceful shutdown timeout (wait for sessions to close)
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let config = load_or_default_config()?;

    let servers: Vec<Arc<ServerInfo>> = config
        .cluster
        .servers
        .iter()
        .map(|s| Arc::new(ServerInfo::new(&s.name, &s.host, s.port, s.role)))
        .collect();
    info!(
        servers = ?servers.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
        "Cluster configured"
    );

    let masking = Arc::new(RwLock::new(Arc::new(load_masking_rules(&config))));
    let registry = Arc::new(SessionRegistry::new());

    let addr = format!("{}:{}", config.server.listen_addr, config.server.listen_port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Hermes MySQL proxy listening");

    // Admin API + metrics endpoint
    let admin_addr = format!(
        "{}:{}",
        config.admin.listen_addr, config.admin.listen_port
    );
    let admin_state = Arc::new(AdminState {
        config: config.clone(),
        servers: servers.clone(),
        sessions: registry.clone(),
        masking: masking.clone(),
    });
    tokio::spawn(async move {
        if let Err(e) = admin::serve(admin_addr, admin_state).await {
            error!(error = %e, "Admin API failed");
        }
    });

    // SIGHUP reloads the masking rules; a malformed file leaves the
    // previous rule set active
    spawn_masking_reload(config.clone(), masking.clone());

    let mut sessions: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown_signal() => {
                info!("Shutdown signal received, stopping accept loop");
                break;
            }

            accept_result = listener.accept() => {
                let (stream, peer_addr) = match accept_result {
                    Ok(v) => v,
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        continue;
                    }
                };

                let session_id = CONNECTION_COUNTER.fetch_add(1, Ordering::SeqCst);
                info!(session_id = session_id, peer = %peer_addr, "New connection");

                let ctx = SessionContext {
                    id: session_id,
                    servers: servers.clone(),
                    user: config.cluster.user.clone(),
                    password: config.cluster.password.clone(),
                    config: config.router.clone(),
                    masking: masking.clone(),
                    registry: Some(registry.clone()),
                    client_host: peer_addr.ip().to_string(),
                };

                sessions.spawn(async move {
                    let session = RouterSession::new(ctx);
                    if let Err(e) = session.run(stream).await {
                        warn!(session_id = session_id, error = %e, "Session ended with error");
                    } else {
                        info!(session_id = session_id, "Session ended");
                    }
                });
            }
        }
    }

    // Graceful shutdown: wait for active sessions to complete
    let active_count = sessions.len();
    if active_count > 0 {
        info!(
            active_sessions = active_count,
            timeout_secs = GRACEFUL_SHUTDOWN_TIMEOUT.as_secs(),
            "Waiting for active sessions to complete"
        );

        let shutdown_deadline = tokio::time::Instant::now() + GRACEFUL_SHUTDOWN_TIMEOUT;

        loop {
            if sessions.is_empty() {
                info!("All sessions completed gracefully");
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep_until(shutdown_deadline) => {
                    warn!(
                        remaining_sessions = sessions.len(),
                        "Graceful shutdown timeout, aborting remaining sessions"
                    );
                    sessions.abort_all();
                    break;
                }

                Some(result) = sessions.join_next() => {
                    if let Err(e) = result {
                        if !e.is_cancelled() {
                            error!(error = %e, "Session task panicked");
                        }
                    }
                }
            }
        }
    }

    info!("Hermes shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn load_or_default_config() -> anyhow::Result<Config> {
    let config_paths = ["config/hermes.toml", "hermes.toml"];

    for path in config_paths {
        match config::load_config(path) {
            Ok(config) => {
                info!(path = path, "Loaded configuration");
                return Ok(config);
            }
            Err(e) => {
                warn!(path = path, error = %e, "Failed to load config");
            }
        }
    }

    anyhow::bail!("no configuration file found (tried config/hermes.toml, hermes.toml)")
}

fn load_masking_rules(config: &Config) -> MaskingRules {
    let Some(path) = &config.masking.rules_path else {
        return MaskingRules::default();
    };
    match MaskingRules::load(path) {
        Ok(rules) => {
            info!(path = %path, rules = rules.len(), "Masking rules loaded");
            rules
        }
        Err(e) => {
            error!(path = %path, error = %e, "Failed to load masking rules; masking disabled");
            MaskingRules::default()
        }
    }
}

#[cfg(unix)]
fn spawn_masking_reload(config: Config, masking: Arc<RwLock<Arc<MaskingRules>>>) {
    let Some(path) = config.masking.rules_path.clone() else {
        return;
    };
    tokio::spawn(async move {
        let mut hangup = match signal::unix::signal(signal::unix::SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "Failed to install SIGHUP handler");
                return;
            }
        };
        while hangup.recv().await.is_some() {
            match MaskingRules::load(&path) {
                Ok(rules) => {
                    info!(path = %path, rules = rules.len(), "Masking rules reloaded");
                    *masking.write() = Arc::new(rules);
                }
                Err(e) => {
                    error!(path = %path, error = %e,
                        "Masking rules reload failed; keeping previous rule set");
                }
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_masking_reload(_config: Config, _masking: Arc<RwLock<Arc<MaskingRules>>>) {}
