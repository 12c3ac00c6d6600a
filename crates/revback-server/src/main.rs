use revback_server::{router, AppState};
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
        tracing::error!(error = %err, "failed to initialize application state");
        std::process::exit(1);
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let app = router::build(state);
    let port = std::env::var("PORT").unwrap_or_else(|_| "3000".to_string());
    let addr: std::net::SocketAddr = format!("0.0.0.0:{port}").parse().expect("invalid PORT");

    tracing::info!(%addr, "revback-server listening");

    let listener = tokio::net::TcpListener::bind(addr).await.expect("failed to bind listener");
    let serve = axum::serve(listener, app).with_graceful_shutdown(wait_for_shutdown(shutdown_tx));

    if let Err(err) = serve.await {
        tracing::error!(error = %err, "server loop exited with error");
    }

    let _ = shutdown_rx;
    tracing::info!("revback-server shut down");
}

async fn wait_for_shutdown(shutdown_tx: watch::Sender<bool>) {
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

    tracing::info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
}
