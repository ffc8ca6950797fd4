use std::net::SocketAddr;

use tracing::info;

use parlor_server::{ServerConfig, ServerState, router};
use parlor_store::{Database, MemoryStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parlor=debug,tower_http=debug".into()),
        )
        .init();

    let config = ServerConfig::from_env()?;

    let store = match &config.db_path {
        Some(path) => MemoryStore::with_database(Database::open(path)?)?,
        None => {
            info!("PARLOR_DB_PATH is empty, running without persistence");
            MemoryStore::new()
        }
    };

    let app = router(ServerState {
        store,
        heartbeat: config.heartbeat,
    });

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("Parlor store listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await?;

    Ok(())
}
