mod broadcast;
mod config;
mod db;
mod error;
mod resolver;
mod routes;
mod seed;
mod sync;

use std::sync::Arc;

use config::AppConfig;
use db::ServerStore;
use routes::{app_router, AppState};

/// Load .env.server for local development.
#[cfg(debug_assertions)]
fn load_dev_dotenv() {
    let server_env = std::path::Path::new(".env.server");
    if server_env.exists() {
        let _ = dotenvy::from_path(server_env);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(debug_assertions)]
    load_dev_dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ordo_api=info".parse().expect("valid directive")),
        )
        .init();

    let config = Arc::new(AppConfig::from_env()?);
    tracing::info!("Starting ordo-api with config: {config:?}");

    let store = ServerStore::open(&config.database_path)?;
    if config.seed_demo_data {
        let seeded = seed::seed_demo_data(&store).await?;
        if seeded > 0 {
            tracing::info!("Seeded {seeded} demo reference rows");
        }
    }

    let bind_addr = config.bind_addr.clone();
    let state = AppState::new(config, store);
    let router = app_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("Listening on {bind_addr}");
    axum::serve(listener, router).await?;
    Ok(())
}
