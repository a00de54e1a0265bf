use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::info;

use parkd::compactor::{self, DEFAULT_CHECK_INTERVAL};
use parkd::config::Config;
use parkd::context::Context;
use parkd::dispatcher::JobDispatcher;
use parkd::wire::{self, ParkdFactory};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    parkd::observability::init(config.metrics_port)?;

    let tls_acceptor =
        parkd::tls::load_tls_acceptor(config.tls_cert.as_deref(), config.tls_key.as_deref())?;

    let ctx = Arc::new(Context::open(&config.data_dir)?);
    let factory = Arc::new(ParkdFactory::new(
        ctx.clone(),
        config.password.clone(),
        config.admins.clone(),
    ));
    let semaphore = Arc::new(Semaphore::new(config.max_connections));
    let cancel = CancellationToken::new();

    let dispatcher = JobDispatcher::new(
        ctx.schedules.clone(),
        ctx.timezone.clone(),
        ctx.default_jobs(&config.backup_dir),
    )
    .with_tick(config.tick)
    .with_action_timeout(config.job_timeout);
    let dispatcher_task = tokio::spawn(dispatcher.run(cancel.clone()));
    let compactor_task = tokio::spawn(compactor::run_compactor(
        ctx.clone(),
        config.compact_threshold,
        DEFAULT_CHECK_INTERVAL,
        cancel.clone(),
    ));

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("parkd listening on {addr}");
    info!("  journal: {}", ctx.journal_path().display());
    info!("  backup_dir: {}", config.backup_dir.display());
    info!("  max_connections: {}", config.max_connections);
    info!("  admins: {}", config.admins.join(", "));
    info!("  timezone: {}", ctx.timezone.resolve().name());
    info!("  tls: {}", if tls_acceptor.is_some() { "enabled" } else { "disabled" });
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight connections
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!("cannot register SIGTERM handler: {e}");
                    ctrl_c.await.ok();
                }
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
                        metrics::counter!(parkd::observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(parkd::observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(parkd::observability::CONNECTIONS_ACTIVE).increment(1.0);
                let factory = factory.clone();
                let tls = tls_acceptor.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, factory, tls).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(parkd::observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    // Background jobs stop first; an in-flight firing finishes or times out.
    cancel.cancel();
    let _ = tokio::join!(dispatcher_task, compactor_task);

    // Wait for in-flight connections to finish (up to 10s)
    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == config.max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = config.max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }

    info!("parkd stopped");
    Ok(())
}
