//! LiveDesk API server

use std::net::SocketAddr;

use livedesk_api::{
    desk::{spawn_embedded_sweeper, stop_embedded_sweeper},
    routes::create_router,
    state::build_desk,
    telemetry, AppState, Config,
};
use tokio_util::sync::CancellationToken;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    telemetry::init_tracing(config.log_json);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        bind_address = %config.bind_address,
        "Starting LiveDesk API"
    );

    let desk = build_desk(&config).await?;
    let state = AppState::new(config.clone(), desk);

    let shutdown = CancellationToken::new();
    let sweeper = if config.enable_embedded_sweeper {
        tracing::info!(
            interval_secs = config.sweep_interval_secs,
            batch = config.sweep_batch_size,
            "Embedded sweeper enabled"
        );
        Some(spawn_embedded_sweeper(
            state.desk.clone(),
            config.sweep_interval(),
            config.sweep_batch_size,
            shutdown.clone(),
        ))
    } else {
        None
    };

    let app = create_router(state)
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.bind_address.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "Listening");

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown signal received");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    if let Some(sweeper) = sweeper {
        stop_embedded_sweeper(sweeper, &shutdown).await;
    }

    tracing::info!("LiveDesk API stopped");
    Ok(())
}
