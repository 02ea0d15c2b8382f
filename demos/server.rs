//! Tilecast server
//!
//! Run with: cargo run --example server --features axum -- demos/tilecast.yaml
//!
//! Without an argument the defaults are used with an empty device store.
//! `demos/tilecast.yaml` seeds two tiles from `demos/devices.yaml`.
//!
//! Set `RUST_LOG=tilecast=debug` to watch rotation decisions.

use std::sync::Arc;

use tilecast::{axum_ext::router, CommandRenderer, Config, Engine, MemoryStore};
use tokio::signal;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer())
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(path)?,
        None => Config::default().with_env(),
    };

    let store = match &config.devices_file {
        Some(path) => MemoryStore::load(path)?,
        None => MemoryStore::new(),
    };
    tracing::info!("Loaded {} device(s)", store.device_ids().await.len());

    let renderer = CommandRenderer::new(config.render.clone());
    let mut engine = Engine::new(config.clone(), Arc::new(store), Arc::new(renderer));
    if let Some(path) = &config.default_image {
        engine = engine.with_default_image(tokio::fs::read(path).await?);
    }
    let engine = Arc::new(engine);

    let listener = tokio::net::TcpListener::bind(&config.bind).await?;
    tracing::info!("Listening on {}", config.bind);

    let shutdown_engine = engine.clone();
    axum::serve(listener, router(engine))
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Sessions hold their websockets open until told to close
            shutdown_engine.shutdown();
        })
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
