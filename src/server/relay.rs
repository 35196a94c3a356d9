use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};
use uuid::Uuid;

use crate::common::protocol::{id_text, numeric_ids, ClientEvent, ServerEvent, MAX_IMAGE_BYTES};
use crate::server::config::ServerConfig;
use crate::server::rooms::{ConnId, RoomRegistry};
use crate::server::store::{MessageStore, NewChatMessage, StatusField};
use crate::server::uploads::MediaUploader;

/// The relay: accepts connections, dispatches their events and fans state
/// changes out to the right room. Handlers for one connection run to
/// completion before its next event is read; different connections interleave
/// freely at await points.
pub struct ChatRelay {
    registry: RoomRegistry,
    store: MessageStore,
    uploader: MediaUploader,
    config: ServerConfig,
}

impl ChatRelay {
    pub fn new(store: MessageStore, uploader: MediaUploader, config: ServerConfig) -> Self {
        Self { registry: RoomRegistry::new(), store, uploader, config }
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    /// Drive one client connection from accept to disconnect.
    pub async fn handle_connection(&self, ws_stream: WebSocketStream<TcpStream>) {
        let conn = Uuid::new_v4();
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.registry.register(conn, tx).await;
        log::info!("[RELAY] Connection {} registered", conn);

        // Outgoing frames are queued on the channel so broadcasts from other
        // connections' handlers never block on this socket.
        let send_task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if ws_sender.send(message).await.is_err() {
                    break;
                }
            }
        });

        while let Some(frame) = ws_receiver.next().await {
            match frame {
                Ok(Message::Text(text)) => match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(event) => self.dispatch(conn, event).await,
                    Err(e) => {
                        log::warn!("[RELAY] Connection {} sent an unreadable frame: {}", conn, e);
                    }
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    log::warn!("[RELAY] Connection {} transport error: {}", conn, e);
                    break;
                }
            }
        }

        // Membership lapses with the connection; nothing else to tear down.
        self.registry.remove(conn).await;
        let _ = send_task.await;
        log::info!("[RELAY] Connection {} closed", conn);
    }

    async fn dispatch(&self, conn: ConnId, event: ClientEvent) {
        match event {
            ClientEvent::JoinRoom { ticket_id, user_id, is_support } => {
                self.handle_join(conn, ticket_id, user_id, is_support).await
            }
            ClientEvent::LeaveRoom { ticket_id, .. } => self.handle_leave(conn, ticket_id).await,
            ClientEvent::SendMessage {
                ticket_id,
                sender_id,
                receiver_id,
                text,
                image_data,
                image_size,
            } => {
                self.handle_send(conn, ticket_id, sender_id, receiver_id, text, image_data, image_size)
                    .await
            }
            ClientEvent::MessageDelivered { ticket_id, message_ids } => {
                self.handle_status(conn, ticket_id, message_ids, StatusField::Delivered).await
            }
            ClientEvent::MessageRead { ticket_id, message_ids } => {
                self.handle_status(conn, ticket_id, message_ids, StatusField::Read).await
            }
            ClientEvent::BroadcastTicketStatus { ticket_id, updated_ticket } => {
                self.handle_ticket_status(conn, ticket_id, updated_ticket).await
            }
            ClientEvent::Typing { user_id, is_typing } => {
                self.handle_typing(conn, user_id, is_typing).await
            }
        }
    }

    async fn handle_join(
        &self,
        conn: ConnId,
        ticket_id: Option<Value>,
        user_id: Option<Value>,
        is_support: bool,
    ) {
        let (room, user) = match (id_text(&ticket_id), id_text(&user_id)) {
            (Some(room), Some(user)) => (room, user),
            _ => {
                self.registry
                    .send_to(conn, &ServerEvent::error("ticketId and userId are required to join a room"))
                    .await;
                return;
            }
        };

        self.registry.join(conn, &room, &user, is_support).await;
        log::info!("[RELAY] User {} joined room {} (support={})", user, room, is_support);

        // Every member gets the refreshed history on each join, the joiner
        // included; peers reconcile by message id.
        match self.store.history(&room).await {
            Ok(messages) => {
                self.registry.broadcast(&room, &ServerEvent::PreviousMessages { messages }).await;
            }
            Err(e) => {
                log::error!("[RELAY] History fetch for room {} failed: {}", room, e);
                self.registry
                    .send_to(conn, &ServerEvent::error("Could not load the conversation history"))
                    .await;
            }
        }
    }

    async fn handle_leave(&self, conn: ConnId, ticket_id: Option<Value>) {
        // Best-effort: a malformed leave is logged, never reported back.
        match id_text(&ticket_id) {
            Some(room) => self.registry.leave(conn, &room).await,
            None => log::warn!("[RELAY] Connection {} sent leave-room without a ticket id", conn),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_send(
        &self,
        conn: ConnId,
        ticket_id: Option<Value>,
        sender_id: Option<Value>,
        receiver_id: Option<Value>,
        text: Option<String>,
        image_data: Option<String>,
        image_size: Option<u64>,
    ) {
        let (room, sender) = match (id_text(&ticket_id), id_text(&sender_id)) {
            (Some(room), Some(sender)) => (room, sender),
            _ => {
                self.registry
                    .send_to(conn, &ServerEvent::error("ticketId and senderId are required to send a message"))
                    .await;
                return;
            }
        };

        let text = text.filter(|t| !t.trim().is_empty());
        if let Some(t) = &text {
            if t.len() > self.config.max_message_length {
                self.registry
                    .send_to(
                        conn,
                        &ServerEvent::error(format!(
                            "Message too long (max {} chars)",
                            self.config.max_message_length
                        )),
                    )
                    .await;
                return;
            }
        }

        let mut image_url = None;
        let mut image_public_id = None;
        if let Some(data) = &image_data {
            // The page checks the size before encoding, but that check is
            // advisory only; the ceiling is enforced here.
            let size = image_size.unwrap_or(data.len() as u64);
            if size >= MAX_IMAGE_BYTES {
                self.registry
                    .send_to(conn, &ServerEvent::error("Image exceeds the 10 MB limit"))
                    .await;
                return;
            }
            match self.uploader.upload(data, &self.config.upload_folder).await {
                Ok(uploaded) => {
                    image_url = Some(uploaded.url);
                    image_public_id = Some(uploaded.public_id);
                }
                Err(e) => {
                    log::error!("[RELAY] Image upload for room {} failed: {}", room, e);
                    self.registry
                        .send_to(conn, &ServerEvent::error("Image upload failed, message not sent"))
                        .await;
                    return;
                }
            }
        }

        if text.is_none() && image_url.is_none() {
            self.registry
                .send_to(conn, &ServerEvent::error("Cannot send an empty message"))
                .await;
            return;
        }

        let new = NewChatMessage {
            ticket_id: room.clone(),
            sender_id: sender,
            receiver_id: id_text(&receiver_id),
            content: text,
            image_url,
            image_public_id,
        };

        // Peers only ever see the message after the store accepted it; the
        // sender gets its copy through the same room broadcast.
        match self.store.create(new).await {
            Ok(message) => {
                log::info!("[RELAY] Message {} stored for room {}", message.id, room);
                self.registry.broadcast(&room, &ServerEvent::NewMessage { message }).await;
            }
            Err(e) => {
                log::error!("[RELAY] Failed to store message for room {}: {}", room, e);
                self.registry
                    .send_to(conn, &ServerEvent::error("Could not save the message"))
                    .await;
            }
        }
    }

    async fn handle_status(
        &self,
        conn: ConnId,
        ticket_id: Option<Value>,
        message_ids: Option<Vec<Value>>,
        field: StatusField,
    ) {
        let raw = match message_ids {
            Some(raw) if !raw.is_empty() => raw,
            _ => {
                log::warn!("[RELAY] Connection {} sent a status update with no message ids", conn);
                return;
            }
        };
        let Some(room) = id_text(&ticket_id) else {
            log::warn!("[RELAY] Connection {} sent a status update without a ticket id", conn);
            return;
        };

        // Temporary client-side ids never reached the store; drop them here.
        let ids = numeric_ids(&raw);
        if ids.is_empty() {
            log::warn!("[RELAY] Status update for room {} had no persisted ids", room);
            return;
        }

        match self.store.mark_status(&ids, field).await {
            Ok(updated) if !updated.is_empty() => {
                let event = match field {
                    StatusField::Delivered => ServerEvent::MessagesDelivered { message_ids: updated },
                    StatusField::Read => ServerEvent::MessagesRead { message_ids: updated },
                };
                self.registry.broadcast(&room, &event).await;
            }
            Ok(_) => {
                // Everything was already in the target state; nothing to say.
            }
            Err(e) => {
                log::error!("[RELAY] Status update for room {} failed: {}", room, e);
                self.registry
                    .send_to(conn, &ServerEvent::error("Could not update message status"))
                    .await;
            }
        }
    }

    async fn handle_ticket_status(&self, conn: ConnId, ticket_id: Option<Value>, updated_ticket: Value) {
        // Pure fan-out for a concern owned elsewhere; the payload is opaque.
        match id_text(&ticket_id) {
            Some(room) => {
                self.registry
                    .broadcast(&room, &ServerEvent::TicketStatusUpdated { updated_ticket })
                    .await;
            }
            None => log::warn!("[RELAY] Connection {} broadcast a ticket status without a ticket id", conn),
        }
    }

    async fn handle_typing(&self, conn: ConnId, user_id: Option<Value>, is_typing: bool) {
        // Typing before join is silently dropped.
        let Some(profile) = self.registry.profile_of(conn).await else {
            return;
        };
        let user = id_text(&user_id).unwrap_or_else(|| profile.user_id.clone());
        self.registry
            .broadcast_except(&profile.room_id, conn, &ServerEvent::Typing { user_id: user, is_typing })
            .await;
    }
}

/// Accept loop: one spawned task per connection.
pub async fn serve(listener: TcpListener, relay: Arc<ChatRelay>) -> anyhow::Result<()> {
    while let Ok((stream, addr)) = listener.accept().await {
        log::info!("[RELAY] New connection from {}", addr);
        let relay = relay.clone();
        tokio::spawn(async move {
            match tokio_tungstenite::accept_async(stream).await {
                Ok(ws_stream) => relay.handle_connection(ws_stream).await,
                Err(e) => log::error!("[RELAY] WebSocket handshake with {} failed: {}", addr, e),
            }
        });
    }
    Ok(())
}
