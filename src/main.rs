use std::future::Future;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use quartermaster::observability::{CONNECTIONS_ACTIVE, CONNECTIONS_REJECTED_TOTAL, CONNECTIONS_TOTAL};
use quartermaster::tenant::TenantManager;
use quartermaster::wire;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Numeric setting from the environment; unset or unparsable means `default`.
fn env_or<T: FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!("ignoring invalid {name}={raw:?}");
            default
        }),
        Err(_) => default,
    }
}

fn env_str(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

struct Settings {
    addr: String,
    data_dir: PathBuf,
    password: String,
    max_connections: usize,
    compact_threshold: u64,
    sweep_interval: Duration,
    metrics_port: Option<u16>,
    tls_cert: Option<String>,
    tls_key: Option<String>,
}

impl Settings {
    fn from_env() -> Self {
        let port: u16 = env_or("QM_PORT", 5433);
        Self {
            addr: format!("{}:{port}", env_str("QM_BIND", "0.0.0.0")),
            data_dir: PathBuf::from(env_str("QM_DATA_DIR", "./data")),
            password: env_str("QM_PASSWORD", "quartermaster"),
            max_connections: env_or("QM_MAX_CONNECTIONS", 256),
            compact_threshold: env_or("QM_COMPACT_THRESHOLD", 1000),
            sweep_interval: Duration::from_secs(env_or::<u64>("QM_SWEEP_INTERVAL_SECS", 120).max(1)),
            metrics_port: std::env::var("QM_METRICS_PORT").ok().and_then(|s| s.parse().ok()),
            tls_cert: std::env::var("QM_TLS_CERT").ok(),
            tls_key: std::env::var("QM_TLS_KEY").ok(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let settings = Settings::from_env();
    quartermaster::observability::init(settings.metrics_port)?;
    let tls = quartermaster::tls::load_tls_acceptor(
        settings.tls_cert.as_deref(),
        settings.tls_key.as_deref(),
    )?;
    std::fs::create_dir_all(&settings.data_dir)?;

    let tenants = Arc::new(TenantManager::new(
        settings.data_dir.clone(),
        settings.compact_threshold,
        settings.sweep_interval,
    ));
    let slots = Arc::new(Semaphore::new(settings.max_connections));
    let listener = TcpListener::bind(&settings.addr).await?;

    info!(
        addr = %settings.addr,
        data_dir = %settings.data_dir.display(),
        max_connections = settings.max_connections,
        sweep_interval_secs = settings.sweep_interval.as_secs(),
        tls = tls.is_some(),
        metrics_port = ?settings.metrics_port,
        "quartermaster listening"
    );

    serve(listener, &settings, tenants, tls, &slots, shutdown_signal()?).await;
    drain(&slots, settings.max_connections).await;

    info!("quartermaster stopped");
    Ok(())
}

/// Resolves on ctrl-c, or SIGTERM on unix.
fn shutdown_signal() -> std::io::Result<impl Future<Output = ()>> {
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    Ok(async move {
        #[cfg(unix)]
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        #[cfg(not(unix))]
        let _ = tokio::signal::ctrl_c().await;
    })
}

/// Accept until `shutdown` fires. Each connection holds one semaphore
/// permit; when none is left the socket is closed straight away.
async fn serve(
    listener: TcpListener,
    settings: &Settings,
    tenants: Arc<TenantManager>,
    tls: Option<TlsAcceptor>,
    slots: &Arc<Semaphore>,
    shutdown: impl Future<Output = ()>,
) {
    tokio::pin!(shutdown);
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = &mut shutdown => {
                info!("shutdown requested, no longer accepting");
                return;
            }
        };
        let (socket, peer) = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                tracing::error!("accept failed: {e}");
                continue;
            }
        };
        let Ok(permit) = slots.clone().try_acquire_owned() else {
            tracing::warn!("{peer}: refused, {} connections open", settings.max_connections);
            metrics::counter!(CONNECTIONS_REJECTED_TOTAL).increment(1);
            continue;
        };

        tracing::debug!("{peer}: connected");
        metrics::counter!(CONNECTIONS_TOTAL).increment(1);
        metrics::gauge!(CONNECTIONS_ACTIVE).increment(1.0);
        let (tenants, password, tls) = (tenants.clone(), settings.password.clone(), tls.clone());
        tokio::spawn(async move {
            if let Err(e) = wire::process_connection(socket, tenants, password, tls).await {
                tracing::warn!("{peer}: {e}");
            }
            metrics::gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
            drop(permit);
        });
    }
}

/// Wait for open connections to hand back their permits, up to DRAIN_TIMEOUT.
async fn drain(slots: &Semaphore, max_connections: usize) {
    let open = || max_connections - slots.available_permits();
    if open() == 0 {
        return;
    }
    info!("waiting for {} connections to close", open());
    let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
    while open() > 0 {
        if tokio::time::Instant::now() >= deadline {
            tracing::warn!("gave up waiting, {} connections still open", open());
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    info!("all connections closed");
}
