use std::time::Duration;

use almapac_chat::client::session::{ChatSession, SessionEvent};
use almapac_chat::server::config::ClientConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = ClientConfig::from_env();
    let url = format!("ws://{}:{}", cfg.websocket_host, cfg.websocket_port);
    println!("Using relay {}", url);

    let mut support = ChatSession::new(&url, "42", "support-1", true);
    let mut reporter = ChatSession::new(&url, "42", "user-7", false);

    support.connect().await?;
    reporter.connect().await?;

    let mut reporter_events = match reporter.take_events() {
        Some(rx) => rx,
        None => {
            println!("Reporter event channel already taken");
            return Ok(());
        }
    };
    // Drop the support side notifications, the probe only watches one end
    let _ = support.take_events();

    support.send_text("hola desde la báscula", Some("user-7")).await?;
    support.send_typing(true).await?;

    // Print whatever arrives for a few seconds, then stop
    loop {
        match tokio::time::timeout(Duration::from_secs(5), reporter_events.recv()).await {
            Ok(Some(SessionEvent::MessageReceived(message))) => {
                println!(
                    "NEW MESSAGE #{} from {}: {}",
                    message.id,
                    message.sender_name.as_deref().unwrap_or(&message.sender_id),
                    message.content.as_deref().unwrap_or("<image>")
                );
                reporter.acknowledge_visible().await?;
            }
            Ok(Some(SessionEvent::HistoryLoaded { count })) => {
                println!("HISTORY -> {} message(s)", count);
            }
            Ok(Some(SessionEvent::TypingChanged { user_id, is_typing })) => {
                println!("TYPING -> {} ({})", user_id, is_typing);
            }
            Ok(Some(SessionEvent::StatusChanged)) => {
                println!("STATUS -> delivered/read flags updated");
                break;
            }
            Ok(Some(other)) => println!("EVENT -> {:?}", other),
            Ok(None) | Err(_) => break,
        }
    }

    Ok(())
}
