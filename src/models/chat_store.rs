use std::collections::HashMap;

use super::message::{Message, SEQUENCE_STEP};
use super::token_usage::ConversationTokenUsage;

/// In-memory store for all conversations' messages.
///
/// Each conversation's messages are kept ordered by `sequence`. The store is
/// the single owner of message state: the reducer mutates messages through
/// `message_mut`, everything else reads snapshots.
pub struct ChatStore {
    conversations: HashMap<String, Vec<Message>>,
    active_conversation_id: Option<String>,
}

impl ChatStore {
    pub fn new() -> Self {
        Self {
            conversations: HashMap::new(),
            active_conversation_id: None,
        }
    }

    /// Next gapped sequence number for a conversation (multiples of
    /// `SEQUENCE_STEP`, leaving room for insertion).
    pub fn next_sequence(&self, conversation_id: &str) -> i64 {
        self.conversations
            .get(conversation_id)
            .and_then(|msgs| msgs.last())
            .map(|m| m.sequence + SEQUENCE_STEP)
            .unwrap_or(SEQUENCE_STEP)
    }

    /// Insert a message, keeping the conversation ordered by sequence.
    pub fn push_message(&mut self, message: Message) {
        let messages = self
            .conversations
            .entry(message.conversation_id.clone())
            .or_default();
        let at = messages
            .binary_search_by_key(&message.sequence, |m| m.sequence)
            .unwrap_or_else(|i| i);
        messages.insert(at, message);

        if self.active_conversation_id.is_none() {
            let id = messages[0].conversation_id.clone();
            self.active_conversation_id = Some(id);
        }
    }

    pub fn messages(&self, conversation_id: &str) -> &[Message] {
        self.conversations
            .get(conversation_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn message(&self, conversation_id: &str, message_id: &str) -> Option<&Message> {
        self.conversations
            .get(conversation_id)?
            .iter()
            .find(|m| m.id == message_id)
    }

    pub fn message_mut(&mut self, conversation_id: &str, message_id: &str) -> Option<&mut Message> {
        self.conversations
            .get_mut(conversation_id)?
            .iter_mut()
            .find(|m| m.id == message_id)
    }

    pub fn delete_conversation(&mut self, conversation_id: &str) -> bool {
        let removed = self.conversations.remove(conversation_id).is_some();
        if self.active_conversation_id.as_deref() == Some(conversation_id) {
            self.active_conversation_id = self.conversations.keys().next().cloned();
        }
        removed
    }

    pub fn set_active(&mut self, conversation_id: String) -> bool {
        if self.conversations.contains_key(&conversation_id) {
            self.active_conversation_id = Some(conversation_id);
            true
        } else {
            false
        }
    }

    pub fn active_id(&self) -> Option<&String> {
        self.active_conversation_id.as_ref()
    }

    pub fn clear_active(&mut self) {
        self.active_conversation_id = None;
    }

    /// Conversation ids sorted by most recent activity.
    pub fn list_recent(&self) -> Vec<&str> {
        let mut ids: Vec<(&str, i64)> = self
            .conversations
            .iter()
            .map(|(id, msgs)| {
                let updated = msgs.iter().map(|m| m.updated_at).max().unwrap_or(0);
                (id.as_str(), updated)
            })
            .collect();
        ids.sort_by_key(|(_, updated)| std::cmp::Reverse(*updated));
        ids.into_iter().map(|(id, _)| id).collect()
    }

    pub fn conversation_count(&self) -> usize {
        self.conversations.len()
    }

    /// Aggregate token usage across a conversation's messages, in order.
    pub fn conversation_usage(&self, conversation_id: &str) -> ConversationTokenUsage {
        let mut total = ConversationTokenUsage::new();
        for message in self.messages(conversation_id) {
            if let Some(usage) = message.metadata.usage {
                total.add_usage(usage);
            }
        }
        total
    }
}

impl Default for ChatStore {
    fn default() -> Self {
        Self::new()
    }
}
