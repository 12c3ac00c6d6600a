use revback_server::{delivery_worker, scan, worker_loop, AppState};
use tokio::signal;
use tokio::sync::watch;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    let config = revback_core::config::AppConfig::from_env().unwrap_or_else(|err| {
        eprintln!("config error: {err}");
        std::process::exit(1);
    });

    revback_core::init_tracing(&config.log_level);

    let state = AppState::build(config).await.unwrap_or_else(|err| {
        tracing::error!(error = %err, "failed to initialize worker state");
        std::process::exit(1);
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let webhook_handle = tokio::spawn(worker_loop::run(state.clone(), shutdown_rx.clone()));
    let delivery_handle = tokio::spawn(delivery_worker::run(state.clone(), shutdown_rx.clone()));
    let scan_consumer_handle = tokio::spawn(scan::run_consumer(state.clone(), shutdown_rx.clone()));
    let scheduler_handle = tokio::spawn(scan::run_scheduler(state.clone(), shutdown_rx.clone()));

    wait_for_shutdown().await;
    tracing::info!("shutdown signal received, draining workers");
    let _ = shutdown_tx.send(true);

    let _ = tokio::join!(webhook_handle, delivery_handle, scan_consumer_handle, scheduler_handle);
    tracing::info!("revback-worker shut down");
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
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
