use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use medislot::observability;
use medislot::tenant::TenantManager;
use medislot::wire;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Server settings, all from `MEDISLOT_*` environment variables.
struct Config {
    port: u16,
    bind: String,
    data_dir: PathBuf,
    password: String,
    max_connections: usize,
    compact_threshold: u64,
    tls_cert: Option<String>,
    tls_key: Option<String>,
    metrics_port: Option<u16>,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("ignoring unparseable {key}={raw}");
            default
        }),
        Err(_) => default,
    }
}

impl Config {
    fn from_env() -> Self {
        Self {
            port: env_or("MEDISLOT_PORT", 5433),
            bind: env_or("MEDISLOT_BIND", "0.0.0.0".to_string()),
            data_dir: env_or("MEDISLOT_DATA_DIR", PathBuf::from("./data")),
            password: env_or("MEDISLOT_PASSWORD", "medislot".to_string()),
            max_connections: env_or("MEDISLOT_MAX_CONNECTIONS", 256),
            compact_threshold: env_or("MEDISLOT_COMPACT_THRESHOLD", 1000),
            tls_cert: std::env::var("MEDISLOT_TLS_CERT").ok(),
            tls_key: std::env::var("MEDISLOT_TLS_KEY").ok(),
            metrics_port: std::env::var("MEDISLOT_METRICS_PORT")
                .ok()
                .and_then(|s| s.parse().ok()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    observability::init(config.metrics_port);

    let tls_acceptor =
        medislot::tls::load_tls_acceptor(config.tls_cert.as_deref(), config.tls_key.as_deref())?;
    std::fs::create_dir_all(&config.data_dir)?;

    let tenant_manager = Arc::new(TenantManager::new(
        config.data_dir.clone(),
        config.compact_threshold,
    ));
    let semaphore = Arc::new(Semaphore::new(config.max_connections));

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("medislot listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  max_connections: {}", config.max_connections);
    info!("  tls: {}", if tls_acceptor.is_some() { "enabled" } else { "disabled" });

    let shutdown = shutdown_signal()?;
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("accept error: {e}");
                        continue;
                    }
                };

                let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                    warn!("connection limit reached, rejecting {peer}");
                    metrics::counter!(observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                    drop(socket);
                    continue;
                };

                info!("connection from {peer}");
                metrics::counter!(observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(observability::CONNECTIONS_ACTIVE).increment(1.0);
                let tm = tenant_manager.clone();
                let password = config.password.clone();
                let tls = tls_acceptor.clone();

                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = wire::process_connection(socket, tm, password, tls).await {
                        error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    drain(&semaphore, config.max_connections).await;
    info!("medislot stopped");
    Ok(())
}

/// Resolves on ctrl-c, or SIGTERM on unix.
fn shutdown_signal() -> std::io::Result<impl std::future::Future<Output = ()>> {
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    Ok(async move {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await.ok();
        }
    })
}

/// Wait until every connection permit is back, or the drain timeout passes.
async fn drain(semaphore: &Semaphore, max_connections: usize) {
    info!("draining connections...");
    let deadline = tokio::time::sleep(DRAIN_TIMEOUT);
    tokio::pin!(deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            return;
        }
        tokio::select! {
            _ = &mut deadline => {
                let remaining = max_connections - semaphore.available_permits();
                warn!("drain timeout, {remaining} connections still open");
                return;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }
}
