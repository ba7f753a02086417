use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use hermes::config::{self, Config};
use hermes::metrics;
use hermes::monitor::ServerRegistry;
use hermes::session::Session;

/// Global connection counter for generating unique session IDs
static CONNECTION_COUNTER: AtomicU32 = AtomicU32::new(1);

/// Graceful shutdown timeout (wait for sessions to close)
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// How often server roles are re-probed
const PROBE_INTERVAL: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let config = Arc::new(load_config_or_exit());

    let registry = Arc::new(ServerRegistry::new(&config.servers));
    info!(
        servers = ?config.servers.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
        transaction_replay = config.service.transaction_replay,
        causal_reads = ?config.service.causal_reads,
        "Cluster configured"
    );

    let shutdown = CancellationToken::new();
    let probe_task =
        registry
            .clone()
            .start_probing(config.clone(), PROBE_INTERVAL, shutdown.clone());

    let addr = format!("{}:{}", config.proxy.listen_addr, config.proxy.listen_port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Hermes proxy listening");

    if config.proxy.metrics_port != 0 {
        let metrics_addr = format!("{}:{}", config.proxy.listen_addr, config.proxy.metrics_port);
        tokio::spawn(async move {
            if let Err(e) = metrics::start_metrics_server(&metrics_addr).await {
                error!(error = %e, "Metrics server failed");
            }
        });
    }

    // Track active sessions for graceful shutdown
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
                let config = config.clone();
                let registry = registry.clone();

                info!(session_id = session_id, peer = %peer_addr, "New connection");

                sessions.spawn(async move {
                    let session = Session::new(session_id, config, registry);
                    if let Err(e) = session.run(stream).await {
                        warn!(session_id = session_id, error = %e, "Session ended with error");
                    } else {
                        info!(session_id = session_id, "Session ended");
                    }
                });
            }
        }
    }

    shutdown.cancel();
    let _ = probe_task.await;

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

    info!("Hermes proxy shutdown complete");
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

fn load_config_or_exit() -> Config {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "hermes.toml".to_string());

    match config::load_config(&path) {
        Ok(config) => {
            info!(path = %path, "Loaded configuration");
            config
        }
        Err(e) => {
            eprintln!("Cannot load configuration from '{}': {}", path, e);
            std::process::exit(1);
        }
    }
}
