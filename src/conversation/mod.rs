//! Conversation and message data model
//!
//! Messages are stored in a flat arena keyed by id. Order is carried by the
//! reply links: the root message has an empty `reply_id`, every other message
//! points at its predecessor's `message_id`. The conversation additionally
//! tracks the chain tail so appends never need a full traversal.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SUPPORTED_MODELS;
use crate::ids;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Lifecycle of an assistant reply. User messages are created as `Finish`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Placeholder created, no content streamed yet.
    Loading,
    /// At least one character has arrived.
    Generating,
    Finish,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub message_id: String,
    /// `message_id` of the predecessor, empty for the chain root.
    pub reply_id: String,
    pub role: Role,
    pub content: String,
    pub status: MessageStatus,
}

impl Message {
    pub fn user(reply_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            message_id: ids::new_id(),
            reply_id: reply_id.into(),
            role: Role::User,
            content: content.into(),
            status: MessageStatus::Finish,
        }
    }

    /// Empty assistant placeholder, mutated in place while streaming.
    pub fn assistant_placeholder(reply_id: impl Into<String>) -> Self {
        Self {
            message_id: ids::new_id(),
            reply_id: reply_id.into(),
            role: Role::Assistant,
            content: String::new(),
            status: MessageStatus::Loading,
        }
    }
}

/// Generation options sent along with every request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationOptions {
    pub model: String,
    pub seed: u64,
    #[serde(rename = "maxToken")]
    pub max_token: u32,
    pub temperature: f32,
}

impl Default for ConversationOptions {
    fn default() -> Self {
        Self {
            model: SUPPORTED_MODELS[0].to_string(),
            seed: 0,
            max_token: 4086,
            temperature: 0.0,
        }
    }
}

/// Partial update for [`ConversationOptions`]; `None` keys are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptionsPatch {
    pub model: Option<String>,
    pub seed: Option<u64>,
    #[serde(rename = "maxToken")]
    pub max_token: Option<u32>,
    pub temperature: Option<f32>,
}

impl OptionsPatch {
    pub fn apply(&self, options: &mut ConversationOptions) {
        if let Some(model) = &self.model {
            options.model = model.clone();
        }
        if let Some(seed) = self.seed {
            options.seed = seed;
        }
        if let Some(max_token) = self.max_token {
            options.max_token = max_token;
        }
        if let Some(temperature) = self.temperature {
            options.temperature = temperature;
        }
    }
}

pub const DEFAULT_CONVERSATION_LABEL: &str = "New Chat";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub conversation_id: String,
    pub label: String,
    /// Flat message arena; order lives in the reply links.
    pub messages: HashMap<String, Message>,
    /// `message_id` of the current chain tail, `None` while empty.
    pub tail: Option<String>,
    pub options: ConversationOptions,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(options: ConversationOptions) -> Self {
        let now = Utc::now();
        Self {
            conversation_id: ids::new_id(),
            label: DEFAULT_CONVERSATION_LABEL.to_string(),
            messages: HashMap::new(),
            tail: None,
            options,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// `reply_id` a newly appended message should carry.
    pub fn next_reply_id(&self) -> String {
        self.tail.clone().unwrap_or_default()
    }

    /// Insert a message and advance the tail to it. The caller is responsible
    /// for the message's `reply_id` pointing at the previous tail.
    pub fn append_message(&mut self, message: Message) {
        self.tail = Some(message.message_id.clone());
        self.updated_at = Utc::now();
        self.messages.insert(message.message_id.clone(), message);
    }

    pub fn get_message(&self, message_id: &str) -> Option<&Message> {
        self.messages.get(message_id)
    }

    pub fn get_message_mut(&mut self, message_id: &str) -> Option<&mut Message> {
        self.messages.get_mut(message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = ConversationOptions::default();
        assert_eq!(options.model, SUPPORTED_MODELS[0]);
        assert_eq!(options.seed, 0);
        assert_eq!(options.max_token, 4086);
        assert_eq!(options.temperature, 0.0);
    }

    #[test]
    fn test_patch_applies_only_given_keys() {
        let mut options = ConversationOptions::default();
        let patch = OptionsPatch {
            temperature: Some(0.9),
            ..OptionsPatch::default()
        };
        patch.apply(&mut options);

        assert_eq!(options.temperature, 0.9);
        assert_eq!(options.seed, 0);
        assert_eq!(options.max_token, 4086);
        assert_eq!(options.model, SUPPORTED_MODELS[0]);
    }

    #[test]
    fn test_append_advances_tail() {
        let mut conversation = Conversation::new(ConversationOptions::default());
        assert!(conversation.is_empty());
        assert_eq!(conversation.next_reply_id(), "");

        let first = Message::user(conversation.next_reply_id(), "hi");
        let first_id = first.message_id.clone();
        conversation.append_message(first);
        assert_eq!(conversation.tail.as_deref(), Some(first_id.as_str()));
        assert_eq!(conversation.next_reply_id(), first_id);

        let reply = Message::assistant_placeholder(conversation.next_reply_id());
        let reply_id = reply.message_id.clone();
        conversation.append_message(reply);
        assert_eq!(conversation.tail.as_deref(), Some(reply_id.as_str()));
        assert_eq!(conversation.message_count(), 2);
    }

    #[test]
    fn test_serialized_field_names() {
        let message = Message::user("", "hello");
        let value = serde_json::to_value(&message).unwrap();
        assert!(value.get("messageId").is_some());
        assert!(value.get("replyId").is_some());
        assert_eq!(value["role"], "user");
        assert_eq!(value["status"], "finish");

        let options = ConversationOptions::default();
        let value = serde_json::to_value(&options).unwrap();
        assert!(value.get("maxToken").is_some());
    }
}
