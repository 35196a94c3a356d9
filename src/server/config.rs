use std::env;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub upload_service_url: String,
    pub upload_folder: String,
    pub log_level: String,
    pub max_message_length: usize,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self {
            host: env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env::var("SERVER_PORT").ok().and_then(|p| p.parse().ok()).unwrap_or(5001),
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:data/almapac_chat.db".to_string()),
            upload_service_url: env::var("UPLOAD_SERVICE_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8080/api/uploads".to_string()),
            upload_folder: env::var("UPLOAD_FOLDER").unwrap_or_else(|_| "chat".to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            max_message_length: env::var("MAX_MESSAGE_LENGTH")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2048),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub websocket_host: String,
    pub websocket_port: u16,
}

impl ClientConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self {
            websocket_host: env::var("WEBSOCKET_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            websocket_port: env::var("WEBSOCKET_PORT").ok().and_then(|p| p.parse().ok()).unwrap_or(5001),
        }
    }
}
