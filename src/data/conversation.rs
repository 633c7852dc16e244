//! Conversation data model
//!
//! Conversations are read from JSONL records of the form
//! `{"messages": [{"role": "user", "content": [{"image": "a.jpg", "text": "..."}]}, ...]}`.
//! Message content may also be a plain string.

use serde::{Deserialize, Serialize};

use super::DataError;

/// Author of a turn.
///
/// The set is closed: unknown role names are rejected at parse time instead of
/// silently changing loss masking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System prompt
    System,
    /// Human turn
    User,
    /// Model turn
    Assistant,
    /// Tool / observation output
    #[serde(alias = "observation", alias = "tool", alias = "function")]
    Other,
}

impl Role {
    /// Whether tokens of this role contribute to the training loss
    pub fn loss_included(self) -> bool {
        match self {
            Role::System | Role::User => false,
            Role::Assistant | Role::Other => true,
        }
    }

    /// Lowercase role name
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Other => "observation",
        }
    }
}

/// One part of a message body
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentPart {
    /// Text of the part
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Reference (path) to an image attached to the part
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl ContentPart {
    /// Text-only part
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            image: None,
        }
    }

    /// Part carrying an image reference and optional text
    pub fn image(image: impl Into<String>, text: Option<String>) -> Self {
        Self {
            text,
            image: Some(image.into()),
        }
    }
}

/// Message body: a plain string or an ordered list of parts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Plain text body
    Text(String),
    /// Multi-part body
    Parts(Vec<ContentPart>),
}

/// A single conversational turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Author of the turn
    pub role: Role,
    /// Body of the turn
    pub content: MessageContent,
}

impl Message {
    /// Create a plain-text message
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: MessageContent::Text(content.into()),
        }
    }

    /// Create a system message
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Create a user message whose first part carries an image
    pub fn user_with_image(image: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Parts(vec![ContentPart::image(image, Some(content.into()))]),
        }
    }

    /// Image reference of the first content part, if any
    pub fn first_image(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text(_) => None,
            MessageContent::Parts(parts) => parts.first().and_then(|p| p.image.as_deref()),
        }
    }

    /// Content parts in order; a plain string is a single text part
    pub fn parts(&self) -> Vec<ContentPart> {
        match &self.content {
            MessageContent::Text(text) => vec![ContentPart::text(text.clone())],
            MessageContent::Parts(parts) => parts.clone(),
        }
    }
}

/// Ordered, non-empty sequence of messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Message>", into = "Vec<Message>")]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    /// Create a conversation, rejecting an empty message list
    pub fn new(messages: Vec<Message>) -> Result<Self, DataError> {
        if messages.is_empty() {
            return Err(DataError::EmptyConversation);
        }
        Ok(Self { messages })
    }

    /// Messages in order
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Number of messages
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the conversation has no messages
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Image attached to the conversation.
    ///
    /// Only the first content part of the first message is consulted.
    pub fn image_reference(&self) -> Option<&str> {
        self.messages.first().and_then(Message::first_image)
    }

    /// Per-message loss inclusion flags
    pub fn loss_flags(&self) -> Vec<bool> {
        self.messages.iter().map(|m| m.role.loss_included()).collect()
    }
}

impl TryFrom<Vec<Message>> for Conversation {
    type Error = DataError;

    fn try_from(messages: Vec<Message>) -> Result<Self, Self::Error> {
        Self::new(messages)
    }
}

impl From<Conversation> for Vec<Message> {
    fn from(conversation: Conversation) -> Self {
        conversation.messages
    }
}

/// One JSONL dataset record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    /// The conversation
    pub messages: Conversation,
}
