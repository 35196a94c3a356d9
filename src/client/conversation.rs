use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::common::protocol::ChatMessage;

/// A remote typing indicator stays visible this long after the last
/// `isTyping=true`; no stop event is required from the other side.
pub const TYPING_TIMEOUT: Duration = Duration::from_secs(3);

/// The ordered message list one chat page holds for its ticket, merged from
/// history reloads and the live event stream.
#[derive(Default)]
pub struct ConversationState {
    messages: Vec<ChatMessage>,
    typing: Option<(String, Instant)>,
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full replace from a `previous-messages` broadcast. Status flags a
    /// concurrent broadcast already flipped locally are kept: the history
    /// snapshot may predate the corresponding store write.
    pub fn replace_history(&mut self, mut messages: Vec<ChatMessage>) {
        let observed: HashMap<i64, (bool, bool)> =
            self.messages.iter().map(|m| (m.id, (m.delivered, m.read))).collect();
        messages.sort_by_key(|m| (m.created_at, m.id));
        for message in &mut messages {
            if let Some((delivered, read)) = observed.get(&message.id) {
                message.delivered |= delivered;
                message.read |= read;
            }
        }
        self.messages = messages;
    }

    /// Append a live message. A message whose id is already present is
    /// ignored; the first copy wins.
    pub fn push_new(&mut self, message: ChatMessage) -> bool {
        if self.messages.iter().any(|m| m.id == message.id) {
            return false;
        }
        self.messages.push(message);
        true
    }

    /// Flags only move false -> true; a message already marked keeps its
    /// state whatever the broadcast says.
    pub fn apply_delivered(&mut self, ids: &[i64]) {
        for message in &mut self.messages {
            if ids.contains(&message.id) {
                message.delivered = true;
            }
        }
    }

    pub fn apply_read(&mut self, ids: &[i64]) {
        for message in &mut self.messages {
            if ids.contains(&message.id) {
                message.read = true;
            }
        }
    }

    /// Ids of messages from other participants not yet flagged delivered.
    /// Driven by the visibility signal (list mutation, hover, scroll).
    pub fn pending_delivered(&self, my_user_id: &str) -> Vec<i64> {
        self.messages
            .iter()
            .filter(|m| m.sender_id != my_user_id && !m.delivered)
            .map(|m| m.id)
            .collect()
    }

    /// Same trigger as delivery; read marking has no separate signal.
    pub fn pending_read(&self, my_user_id: &str) -> Vec<i64> {
        self.messages
            .iter()
            .filter(|m| m.sender_id != my_user_id && !m.read)
            .map(|m| m.id)
            .collect()
    }

    pub fn set_typing(&mut self, user_id: &str, is_typing: bool, now: Instant) {
        if is_typing {
            self.typing = Some((user_id.to_string(), now));
        } else if self.typing.as_ref().map(|(u, _)| u.as_str()) == Some(user_id) {
            self.typing = None;
        }
    }

    /// Who is typing right now, if the indicator has not expired.
    pub fn typing_user(&self, now: Instant) -> Option<&str> {
        self.typing
            .as_ref()
            .filter(|(_, since)| now.duration_since(*since) < TYPING_TIMEOUT)
            .map(|(user, _)| user.as_str())
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: i64, sender: &str, created_at: i64) -> ChatMessage {
        ChatMessage {
            id,
            ticket_id: "42".to_string(),
            sender_id: sender.to_string(),
            receiver_id: None,
            content: Some(format!("message {}", id)),
            image_url: None,
            image_public_id: None,
            delivered: false,
            read: false,
            created_at,
            sender_name: None,
            receiver_name: None,
        }
    }

    #[test]
    fn duplicate_new_messages_are_ignored() {
        let mut state = ConversationState::new();
        assert!(state.push_new(message(1, "7", 100)));

        let mut duplicate = message(1, "7", 100);
        duplicate.content = Some("changed".to_string());
        assert!(!state.push_new(duplicate));

        assert_eq!(state.len(), 1);
        assert_eq!(state.messages()[0].content.as_deref(), Some("message 1"));
    }

    #[test]
    fn status_flags_never_revert() {
        let mut state = ConversationState::new();
        state.push_new(message(1, "7", 100));
        state.apply_read(&[1]);
        assert!(state.messages()[0].read);

        // A history reload carrying the stale flag must not clear it
        state.replace_history(vec![message(1, "7", 100)]);
        assert!(state.messages()[0].read);
        assert!(!state.messages()[0].delivered);
    }

    #[test]
    fn history_replaces_and_sorts_by_creation_time() {
        let mut state = ConversationState::new();
        state.push_new(message(9, "7", 500));

        state.replace_history(vec![message(2, "8", 200), message(1, "7", 100), message(3, "8", 200)]);
        let ids: Vec<i64> = state.messages().iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn pending_acks_skip_own_and_flagged_messages() {
        let mut state = ConversationState::new();
        state.push_new(message(1, "me", 100));
        state.push_new(message(2, "other", 200));
        state.push_new(message(3, "other", 300));
        state.apply_delivered(&[2]);

        assert_eq!(state.pending_delivered("me"), vec![3]);
        assert_eq!(state.pending_read("me"), vec![2, 3]);
    }

    #[test]
    fn typing_indicator_expires_after_timeout() {
        let mut state = ConversationState::new();
        let start = Instant::now();
        state.set_typing("7", true, start);

        assert_eq!(state.typing_user(start + Duration::from_secs(2)), Some("7"));
        assert_eq!(state.typing_user(start + Duration::from_secs(4)), None);

        state.set_typing("7", true, start);
        state.set_typing("7", false, start);
        assert_eq!(state.typing_user(start), None);
    }
}
