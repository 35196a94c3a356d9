use std::{fs::OpenOptions, io::Write, sync::Arc, time::Duration};

use chrono::Utc;
use log::{error, info, warn};
use sysinfo::System;
use tokio::time;

use crate::server::database::Database;
use crate::server::rooms::RoomRegistry;

/// Append relay statistics to a log file every two minutes: active
/// connections, rooms, persisted messages and process CPU usage.
pub async fn start_stats_logger(db: Arc<Database>, registry: RoomRegistry, log_path: &str) {
    let mut system = System::new_all();

    let mut file = match OpenOptions::new().create(true).append(true).open(log_path) {
        Ok(f) => f,
        Err(e) => {
            error!("Unable to open stats log file '{}': {}", log_path, e);
            return;
        }
    };

    // Write header if file is empty
    if file.metadata().map(|m| m.len()).unwrap_or(0) == 0 {
        if let Err(e) = writeln!(file, "# Almapac Chat Relay Stats Log") {
            error!("Failed to write header to stats log: {}", e);
            return;
        }
        if let Err(e) = writeln!(file, "# Timestamp, Connections, Rooms, Total_Messages, CPU_Usage") {
            error!("Failed to write header to stats log: {}", e);
            return;
        }
        info!("Stats log initialized: {}", log_path);
    }

    loop {
        system.refresh_all();
        let cpu_usage =
            system.cpus().iter().map(|c| c.cpu_usage()).sum::<f32>() / system.cpus().len().max(1) as f32;
        let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S UTC");

        let (connections, rooms) = registry.stats().await;

        let total_messages = match sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM messages")
            .fetch_one(&db.pool)
            .await
        {
            Ok(count) => count,
            Err(e) => {
                warn!("Failed to query message count: {}", e);
                -1
            }
        };

        info!(
            "[STATS] Connections: {}, Rooms: {}, Messages: {}, CPU: {:.1}%",
            connections, rooms, total_messages, cpu_usage
        );

        if let Err(e) = writeln!(
            file,
            "{}, {}, {}, {}, {:.1}%",
            timestamp, connections, rooms, total_messages, cpu_usage
        ) {
            error!("Failed to write to stats log: {}", e);
        } else if let Err(e) = file.flush() {
            error!("Failed to flush stats log: {}", e);
        }

        time::sleep(Duration::from_secs(120)).await;
    }
}
