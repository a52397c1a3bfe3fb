use std::sync::Arc;

use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;

use simplebank::{
    api::{self, AppState},
    backend,
    config::{CliArgs, Config},
    logging,
};
use simplebank_core::Store;

#[tokio::main]
async fn main() {
    let cli = CliArgs::parse();
    let config = Config::load(&cli);

    logging::init_logging(&config.logging);

    let metrics = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "Prometheus recorder not installed");
            None
        }
    };

    let db = match backend::open_database(&config.database) {
        Ok(db) => db,
        Err(e) => {
            tracing::error!(error = %e, backend = ?config.database.backend, "Failed to open storage backend");
            std::process::exit(1);
        }
    };

    let state = AppState {
        store: Arc::new(Store::new(db)),
        request_timeout: config.transfer.timeout(),
        metrics,
    };
    let app = api::router(state);

    let addr = match config.listen_addr() {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!(error = %e, "Invalid listen address");
            std::process::exit(1);
        }
    };
    tracing::info!(%addr, "API listening");

    if let Err(e) = axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!(error = %e, "Server error");
        std::process::exit(1);
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
