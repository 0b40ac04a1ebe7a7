use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;
use tracing_subscriber::EnvFilter;

use stayflow::auth::Credentials;
use stayflow::compactor;
use stayflow::engine::pricing::DEFAULT_COMMISSION_RATE;
use stayflow::engine::{CommissionTable, Engine};
use stayflow::model::SYSTEM_ACTOR;
use stayflow::notify::{self, NotifyHub};
use stayflow::observability::{CONNECTIONS_ACTIVE, CONNECTIONS_REJECTED_TOTAL, CONNECTIONS_TOTAL};
use stayflow::wire;

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.into())
}

fn env_parsed<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

/// Built-in city table unless `STAYFLOW_COMMISSION_RATES` replaces it.
fn commission_table() -> Result<CommissionTable, Box<dyn std::error::Error>> {
    let default_rate: Decimal =
        env_parsed("STAYFLOW_DEFAULT_COMMISSION").unwrap_or(DEFAULT_COMMISSION_RATE);
    let table = match std::env::var("STAYFLOW_COMMISSION_RATES") {
        Ok(json) => CommissionTable::from_json(&json, DEFAULT_COMMISSION_RATE)?,
        Err(_) => CommissionTable::default(),
    };
    Ok(table.with_default_rate(default_rate)?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let metrics_port: Option<u16> = env_parsed("STAYFLOW_METRICS_PORT");
    stayflow::observability::init(metrics_port);

    let port = env_or("STAYFLOW_PORT", "5433");
    let bind = env_or("STAYFLOW_BIND", "0.0.0.0");
    let data_dir = env_or("STAYFLOW_DATA_DIR", "./data");
    let credentials = Credentials {
        password: env_or("STAYFLOW_PASSWORD", "stayflow"),
        system_password: env_or("STAYFLOW_SYSTEM_PASSWORD", "stayflow-system"),
    };
    let max_connections: usize = env_parsed("STAYFLOW_MAX_CONNECTIONS").unwrap_or(256);
    let compact_threshold: u64 = env_parsed("STAYFLOW_COMPACT_THRESHOLD").unwrap_or(1000);

    let tls_cert = std::env::var("STAYFLOW_TLS_CERT").ok();
    let tls_key = std::env::var("STAYFLOW_TLS_KEY").ok();
    let tls_acceptor =
        stayflow::tls::load_tls_acceptor(tls_cert.as_deref(), tls_key.as_deref())?;

    let commission = commission_table()?;

    std::fs::create_dir_all(&data_dir)?;
    let wal_path = PathBuf::from(&data_dir).join("stayflow.wal");

    let notify = Arc::new(NotifyHub::new());
    tokio::spawn(notify::run_dispatcher(notify.subscribe_all()));

    let engine = Arc::new(Engine::new(wal_path, notify, commission)?);
    tokio::spawn(compactor::run_compactor(engine.clone(), compact_threshold));

    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = format!("{bind}:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("stayflow listening on {addr}");
    info!("  data_dir: {data_dir}");
    info!("  max_connections: {max_connections}");
    info!("  default commission: {}", engine.commission_table().default_rate());
    info!("  tls: {}", if tls_acceptor.is_some() { "enabled" } else { "disabled" });
    info!("  system user: {SYSTEM_ACTOR}");
    let metrics_url = metrics_port.map(|p| format!("http://0.0.0.0:{p}/metrics"));
    info!("  metrics: {}", metrics_url.as_deref().unwrap_or("disabled"));

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight connections
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(CONNECTIONS_ACTIVE).increment(1.0);
                let engine = engine.clone();
                let credentials = credentials.clone();
                let tls = tls_acceptor.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    let served = wire::process_connection(socket, engine, credentials, tls).await;
                    if let Err(e) = served {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    // Wait for in-flight connections to finish (up to 10s)
    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(std::time::Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
        }
    }

    info!("stayflow stopped");
    Ok(())
}
