//! LMS chat server binary

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

// Use jemalloc on Linux for reduced fragmentation on long-running servers
#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use lms_chat_server::{database, routing, ServerConfig, ServerState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("lms_chat_server=debug".parse()?)
                .add_directive("axum=info".parse()?),
        )
        .init();

    info!("Starting LMS chat server");

    let config = ServerConfig::from_env()?;
    info!("Configuration loaded");

    let db_pool = database::init(&config.database_url).await?;
    info!("Database initialized");

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let state = Arc::new(ServerState::new(db_pool.clone(), config));
    let app = routing::create_router(state);

    let shutdown_signal = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown signal received, draining connections...");
    };

    info!("Server listening on http://{}", addr);
    info!("WebSocket endpoint: ws://{}/ws?username=<peer>", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal)
    .await?;

    // Checkpoint SQLite WAL before exit
    info!("Checkpointing SQLite WAL...");
    if let Err(e) = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
        .execute(&db_pool)
        .await
    {
        warn!("WAL checkpoint failed: {}", e);
    }

    info!("Server stopped cleanly");
    Ok(())
}
