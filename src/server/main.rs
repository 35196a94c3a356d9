// Entry point for the almapac chat relay server
use std::sync::Arc;

use almapac_chat::server::{
    config::ServerConfig, database::Database, relay, relay::ChatRelay, store::MessageStore,
    uploads::MediaUploader,
};
use almapac_chat::utils::stats;
use log::{error, info};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    std::env::set_var("RUST_LOG", &log_level);
    env_logger::init();

    let config = ServerConfig::from_env();

    let database = Arc::new(Database::connect(&config.database_url).await?);

    info!("Running database migrations...");
    database.migrate().await.map_err(|e| {
        error!("Database migration failed: {}", e);
        e
    })?;
    info!("Database migrations completed");

    let store = MessageStore::new(database.clone());
    let uploader = MediaUploader::new(config.upload_service_url.clone());
    let relay = Arc::new(ChatRelay::new(store, uploader, config.clone()));

    // Periodic relay statistics in the background
    let stats_path = std::env::var("STATS_LOG_PATH")
        .unwrap_or_else(|_| "data/almapac_chat_stats.log".to_string());
    let stats_db = database.clone();
    let stats_registry = relay.registry().clone();
    tokio::spawn(async move {
        info!("Starting stats logger - logging every 120 seconds to: {}", stats_path);
        stats::start_stats_logger(stats_db, stats_registry, &stats_path).await;
    });

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Chat relay listening on {}", addr);

    relay::serve(listener, relay).await?;
    Ok(())
}
