use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::{engine::general_purpose, Engine as _};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use crate::client::conversation::ConversationState;
use crate::common::protocol::{ChatMessage, ClientEvent, ServerEvent, MAX_IMAGE_BYTES};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Notifications the embedding page receives from the session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected,
    /// Non-fatal: the session keeps retrying until its attempts run out.
    Disconnected { reason: String },
    Reconnecting { attempt: u32 },
    HistoryLoaded { count: usize },
    MessageReceived(ChatMessage),
    StatusChanged,
    TicketStatusUpdated(Value),
    TypingChanged { user_id: String, is_typing: bool },
    ServerError { message: String },
}

#[derive(Debug, Clone)]
pub enum SessionError {
    ConnectionFailed(String),
    NotConnected,
    ImageTooLarge(usize),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::ConnectionFailed(msg) => write!(f, "Connection failed: {}", msg),
            SessionError::NotConnected => write!(f, "Session is not connected"),
            SessionError::ImageTooLarge(size) => {
                write!(f, "Image of {} bytes exceeds the 10 MB limit", size)
            }
        }
    }
}

impl std::error::Error for SessionError {}

/// One user's connection to a ticket room: connects, joins, keeps the local
/// conversation in sync with the relay and reconnects on transport loss.
pub struct ChatSession {
    url: String,
    ticket_id: String,
    user_id: String,
    is_support: bool,
    max_retry_attempts: u32,
    base_retry_delay: Duration,
    conversation: Arc<Mutex<ConversationState>>,
    outgoing: Arc<Mutex<Option<mpsc::UnboundedSender<ClientEvent>>>>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<SessionEvent>>,
}

impl ChatSession {
    pub fn new(url: &str, ticket_id: &str, user_id: &str, is_support: bool) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            url: url.to_string(),
            ticket_id: ticket_id.to_string(),
            user_id: user_id.to_string(),
            is_support,
            max_retry_attempts: 5,
            base_retry_delay: Duration::from_secs(2),
            conversation: Arc::new(Mutex::new(ConversationState::new())),
            outgoing: Arc::new(Mutex::new(None)),
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    /// Take the notification receiver - can be called only once.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.event_rx.take()
    }

    pub fn conversation(&self) -> Arc<Mutex<ConversationState>> {
        self.conversation.clone()
    }

    /// Snapshot of the rendered message list.
    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.conversation.lock().await.messages().to_vec()
    }

    pub async fn is_connected(&self) -> bool {
        self.outgoing.lock().await.is_some()
    }

    /// Open the transport and start the background driver. The join-room
    /// event goes out as the first frame of every (re)connection.
    pub async fn connect(&self) -> Result<(), SessionError> {
        url::Url::parse(&self.url)
            .map_err(|e| SessionError::ConnectionFailed(format!("invalid relay url: {}", e)))?;

        let mut delay = self.base_retry_delay;
        for attempt in 1..=self.max_retry_attempts {
            match connect_async(&self.url).await {
                Ok((ws, _)) => {
                    log::info!("[SESSION] Connected to {}", self.url);
                    let _ = self.event_tx.send(SessionEvent::Connected);
                    self.spawn_driver(ws);
                    return Ok(());
                }
                Err(e) => {
                    log::warn!("[SESSION] Connection attempt {} failed: {}", attempt, e);
                    if attempt < self.max_retry_attempts {
                        tokio::time::sleep(delay).await;
                        delay = std::cmp::min(delay * 2, Duration::from_secs(30));
                    } else {
                        return Err(SessionError::ConnectionFailed(e.to_string()));
                    }
                }
            }
        }
        Err(SessionError::ConnectionFailed("Max retry attempts exceeded".to_string()))
    }

    fn spawn_driver(&self, ws: WsStream) {
        let url = self.url.clone();
        let join_event = self.join_event();
        let outgoing = self.outgoing.clone();
        let conversation = self.conversation.clone();
        let events = self.event_tx.clone();
        let max_attempts = self.max_retry_attempts;
        let base_delay = self.base_retry_delay;
        tokio::spawn(async move {
            supervise(url, join_event, outgoing, conversation, events, max_attempts, base_delay, ws)
                .await;
        });
    }

    fn join_event(&self) -> ClientEvent {
        ClientEvent::JoinRoom {
            ticket_id: Some(Value::String(self.ticket_id.clone())),
            user_id: Some(Value::String(self.user_id.clone())),
            is_support: self.is_support,
        }
    }

    pub async fn send_text(&self, text: &str, receiver_id: Option<&str>) -> Result<(), SessionError> {
        self.emit(ClientEvent::SendMessage {
            ticket_id: Some(Value::String(self.ticket_id.clone())),
            sender_id: Some(Value::String(self.user_id.clone())),
            receiver_id: receiver_id.map(|r| Value::String(r.to_string())),
            text: Some(text.to_string()),
            image_data: None,
            image_size: None,
        })
        .await
    }

    /// Encode and send an image. The size ceiling is checked here for
    /// immediate feedback; the relay re-validates it regardless.
    pub async fn send_image(
        &self,
        bytes: &[u8],
        caption: Option<&str>,
        receiver_id: Option<&str>,
    ) -> Result<(), SessionError> {
        if bytes.len() as u64 >= MAX_IMAGE_BYTES {
            return Err(SessionError::ImageTooLarge(bytes.len()));
        }
        let encoded = general_purpose::STANDARD.encode(bytes);
        self.emit(ClientEvent::SendMessage {
            ticket_id: Some(Value::String(self.ticket_id.clone())),
            sender_id: Some(Value::String(self.user_id.clone())),
            receiver_id: receiver_id.map(|r| Value::String(r.to_string())),
            text: caption.map(|t| t.to_string()),
            image_data: Some(encoded),
            image_size: Some(bytes.len() as u64),
        })
        .await
    }

    /// Called on every local input change; the receiving side expires the
    /// indicator on its own, no stop event needed.
    pub async fn send_typing(&self, is_typing: bool) -> Result<(), SessionError> {
        self.emit(ClientEvent::Typing {
            user_id: Some(Value::String(self.user_id.clone())),
            is_typing,
        })
        .await
    }

    pub async fn broadcast_ticket_status(&self, updated_ticket: Value) -> Result<(), SessionError> {
        self.emit(ClientEvent::BroadcastTicketStatus {
            ticket_id: Some(Value::String(self.ticket_id.clone())),
            updated_ticket,
        })
        .await
    }

    /// The visibility signal: whenever the list renders or the user hovers
    /// or scrolls it, acknowledge everything from other participants that is
    /// not yet flagged locally. Delivery and read share the trigger.
    pub async fn acknowledge_visible(&self) -> Result<(), SessionError> {
        let (deliver, read) = {
            let conversation = self.conversation.lock().await;
            (
                conversation.pending_delivered(&self.user_id),
                conversation.pending_read(&self.user_id),
            )
        };
        if !deliver.is_empty() {
            self.emit(ClientEvent::MessageDelivered {
                ticket_id: Some(Value::String(self.ticket_id.clone())),
                message_ids: Some(deliver.into_iter().map(Value::from).collect()),
            })
            .await?;
        }
        if !read.is_empty() {
            self.emit(ClientEvent::MessageRead {
                ticket_id: Some(Value::String(self.ticket_id.clone())),
                message_ids: Some(read.into_iter().map(Value::from).collect()),
            })
            .await?;
        }
        Ok(())
    }

    pub async fn leave(&self) -> Result<(), SessionError> {
        self.emit(ClientEvent::LeaveRoom {
            ticket_id: Some(Value::String(self.ticket_id.clone())),
            user_id: Some(Value::String(self.user_id.clone())),
            is_support: self.is_support,
        })
        .await
    }

    async fn emit(&self, event: ClientEvent) -> Result<(), SessionError> {
        let guard = self.outgoing.lock().await;
        match guard.as_ref() {
            Some(sender) => sender.send(event).map_err(|_| SessionError::NotConnected),
            None => Err(SessionError::NotConnected),
        }
    }
}

/// Owns the transport across reconnects: runs one connection until it dies,
/// then retries with backoff and a fresh join-room.
#[allow(clippy::too_many_arguments)]
async fn supervise(
    url: String,
    join_event: ClientEvent,
    outgoing: Arc<Mutex<Option<mpsc::UnboundedSender<ClientEvent>>>>,
    conversation: Arc<Mutex<ConversationState>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    max_attempts: u32,
    base_delay: Duration,
    mut ws: WsStream,
) {
    loop {
        run_connection(ws, &join_event, &outgoing, &conversation, &events).await;
        let _ = events.send(SessionEvent::Disconnected {
            reason: "connection to the chat relay was lost".to_string(),
        });

        let mut delay = base_delay;
        let mut reconnected = None;
        for attempt in 1..=max_attempts {
            let _ = events.send(SessionEvent::Reconnecting { attempt });
            tokio::time::sleep(delay).await;
            delay = std::cmp::min(delay * 2, Duration::from_secs(30));
            match connect_async(&url).await {
                Ok((new_ws, _)) => {
                    log::info!("[SESSION] Reconnected to {} after {} attempt(s)", url, attempt);
                    reconnected = Some(new_ws);
                    break;
                }
                Err(e) => log::warn!("[SESSION] Reconnect attempt {} failed: {}", attempt, e),
            }
        }

        match reconnected {
            Some(new_ws) => {
                let _ = events.send(SessionEvent::Connected);
                ws = new_ws;
            }
            None => {
                let _ = events.send(SessionEvent::Disconnected {
                    reason: "could not reach the chat relay, giving up".to_string(),
                });
                *outgoing.lock().await = None;
                return;
            }
        }
    }
}

async fn run_connection(
    ws: WsStream,
    join_event: &ClientEvent,
    outgoing: &Arc<Mutex<Option<mpsc::UnboundedSender<ClientEvent>>>>,
    conversation: &Arc<Mutex<ConversationState>>,
    events: &mpsc::UnboundedSender<SessionEvent>,
) {
    let (mut ws_sender, mut ws_receiver) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ClientEvent>();

    // Queue the join before exposing the sender so it is always the first
    // frame out; the relay answers with the room's full history.
    let _ = tx.send(join_event.clone());
    *outgoing.lock().await = Some(tx);

    let send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => log::warn!("[SESSION] Failed to serialize outgoing event: {}", e),
            }
        }
    });

    while let Some(frame) = ws_receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                Ok(event) => apply_server_event(event, conversation, events).await,
                Err(e) => log::warn!("[SESSION] Unreadable frame from relay: {}", e),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                log::warn!("[SESSION] Transport error: {}", e);
                break;
            }
        }
    }

    // Dropping the sender ends the send task
    *outgoing.lock().await = None;
    let _ = send_task.await;
}

async fn apply_server_event(
    event: ServerEvent,
    conversation: &Arc<Mutex<ConversationState>>,
    events: &mpsc::UnboundedSender<SessionEvent>,
) {
    match event {
        ServerEvent::PreviousMessages { messages } => {
            let count = messages.len();
            conversation.lock().await.replace_history(messages);
            let _ = events.send(SessionEvent::HistoryLoaded { count });
        }
        ServerEvent::NewMessage { message } => {
            let fresh = conversation.lock().await.push_new(message.clone());
            if fresh {
                let _ = events.send(SessionEvent::MessageReceived(message));
            }
        }
        ServerEvent::MessagesDelivered { message_ids } => {
            conversation.lock().await.apply_delivered(&message_ids);
            let _ = events.send(SessionEvent::StatusChanged);
        }
        ServerEvent::MessagesRead { message_ids } => {
            conversation.lock().await.apply_read(&message_ids);
            let _ = events.send(SessionEvent::StatusChanged);
        }
        ServerEvent::TicketStatusUpdated { updated_ticket } => {
            let _ = events.send(SessionEvent::TicketStatusUpdated(updated_ticket));
        }
        ServerEvent::Typing { user_id, is_typing } => {
            conversation.lock().await.set_typing(&user_id, is_typing, Instant::now());
            let _ = events.send(SessionEvent::TypingChanged { user_id, is_typing });
        }
        ServerEvent::ErrorMessage { message } => {
            let _ = events.send(SessionEvent::ServerError { message });
        }
    }
}
