use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Fixed ceiling for inline image payloads. The page enforces the same limit
/// before encoding, but the relay re-validates because client checks are not
/// trusted.
pub const MAX_IMAGE_BYTES: u64 = 10 * 1024 * 1024;

/// A persisted chat message as it travels on the wire, with sender/receiver
/// display names already resolved by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: i64,
    pub ticket_id: String,
    pub sender_id: String,
    pub receiver_id: Option<String>,
    pub content: Option<String>,
    pub image_url: Option<String>,
    pub image_public_id: Option<String>,
    pub delivered: bool,
    pub read: bool,
    pub created_at: i64,
    pub sender_name: Option<String>,
    pub receiver_name: Option<String>,
}

/// Events the page emits towards the relay. Ids arrive as JSON strings or
/// numbers depending on which form screen raised them, so they are carried as
/// raw values and normalized with [`id_text`] inside the handlers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    JoinRoom {
        #[serde(default)]
        ticket_id: Option<Value>,
        #[serde(default)]
        user_id: Option<Value>,
        #[serde(default)]
        is_support: bool,
    },
    LeaveRoom {
        #[serde(default)]
        ticket_id: Option<Value>,
        #[serde(default)]
        user_id: Option<Value>,
        #[serde(default)]
        is_support: bool,
    },
    SendMessage {
        #[serde(default)]
        ticket_id: Option<Value>,
        #[serde(default)]
        sender_id: Option<Value>,
        #[serde(default)]
        receiver_id: Option<Value>,
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        image_data: Option<String>,
        #[serde(default)]
        image_size: Option<u64>,
    },
    MessageDelivered {
        #[serde(default)]
        ticket_id: Option<Value>,
        #[serde(default)]
        message_ids: Option<Vec<Value>>,
    },
    MessageRead {
        #[serde(default)]
        ticket_id: Option<Value>,
        #[serde(default)]
        message_ids: Option<Vec<Value>>,
    },
    BroadcastTicketStatus {
        #[serde(default)]
        ticket_id: Option<Value>,
        #[serde(default)]
        updated_ticket: Value,
    },
    Typing {
        #[serde(default)]
        user_id: Option<Value>,
        #[serde(default)]
        is_typing: bool,
    },
}

/// Events the relay pushes to room members.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    PreviousMessages { messages: Vec<ChatMessage> },
    NewMessage { message: ChatMessage },
    MessagesDelivered { message_ids: Vec<i64> },
    MessagesRead { message_ids: Vec<i64> },
    TicketStatusUpdated { updated_ticket: Value },
    Typing { user_id: String, is_typing: bool },
    ErrorMessage { message: String },
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::ErrorMessage { message: message.into() }
    }
}

/// Normalize an id field the way `String(ticketId)` does on the page: numbers
/// become their textual form, strings pass through. Missing, null, empty or
/// structured values count as absent.
pub fn id_text(value: &Option<Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

/// Keep only ids that are purely numeric. The page tracks unsent messages
/// under temporary string ids ("6-temp"); those were never persisted and must
/// not reach the store.
pub fn numeric_ids(values: &[Value]) -> Vec<i64> {
    values
        .iter()
        .filter_map(|v| match v {
            Value::Number(n) => n.as_i64(),
            Value::String(s) if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) => {
                s.parse::<i64>().ok()
            }
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn id_text_normalizes_numbers_and_strings() {
        assert_eq!(id_text(&Some(json!(42))), Some("42".to_string()));
        assert_eq!(id_text(&Some(json!("42"))), Some("42".to_string()));
        assert_eq!(id_text(&Some(json!(""))), None);
        assert_eq!(id_text(&Some(Value::Null)), None);
        assert_eq!(id_text(&None), None);
        assert_eq!(id_text(&Some(json!({"id": 42}))), None);
    }

    #[test]
    fn numeric_ids_drops_temporary_string_ids() {
        let raw = vec![json!("5"), json!("6-temp"), json!(7), json!(""), json!(1.5)];
        assert_eq!(numeric_ids(&raw), vec![5, 7]);
    }

    #[test]
    fn client_events_deserialize_from_page_payloads() {
        let ev: ClientEvent = serde_json::from_str(
            r#"{"event":"join-room","ticketId":42,"userId":"7","isSupport":true}"#,
        )
        .expect("join-room payload");
        match ev {
            ClientEvent::JoinRoom { ticket_id, user_id, is_support } => {
                assert_eq!(id_text(&ticket_id).as_deref(), Some("42"));
                assert_eq!(id_text(&user_id).as_deref(), Some("7"));
                assert!(is_support);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        // Missing optional fields must not fail parsing; validation is the
        // handlers' job.
        let ev: ClientEvent =
            serde_json::from_str(r#"{"event":"send-message","ticketId":"42"}"#).expect("sparse payload");
        assert!(matches!(ev, ClientEvent::SendMessage { sender_id: None, .. }));
    }

    #[test]
    fn server_events_use_wire_names() {
        let json = serde_json::to_value(ServerEvent::error("boom")).expect("serialize");
        assert_eq!(json["event"], "error-message");
        assert_eq!(json["message"], "boom");

        let json = serde_json::to_value(ServerEvent::MessagesRead { message_ids: vec![5] })
            .expect("serialize");
        assert_eq!(json["event"], "messages-read");
        assert_eq!(json["messageIds"], json!([5]));
    }
}
