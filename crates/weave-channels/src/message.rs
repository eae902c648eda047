use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// What a message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// A unit of work dispatched to a worker.
    Task,
    /// A successful task result.
    Result,
    /// A failed task outcome.
    Error,
    /// Informational message, usually broadcast on a topic.
    Notification,
    /// A request for information from another participant.
    Question,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::Task => write!(f, "task"),
            MessageKind::Result => write!(f, "result"),
            MessageKind::Error => write!(f, "error"),
            MessageKind::Notification => write!(f, "notification"),
            MessageKind::Question => write!(f, "question"),
        }
    }
}

/// A message routed through the [`MessageChannel`](crate::MessageChannel).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub id: Uuid,
    pub sender: String,
    pub recipient: String,
    pub kind: MessageKind,
    /// Set on broadcast copies.
    #[serde(default)]
    pub topic: Option<String>,
    /// Mailbox the recipient should answer to.
    #[serde(default)]
    pub reply_to: Option<String>,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl ChannelMessage {
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        kind: MessageKind,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender: sender.into(),
            recipient: recipient.into(),
            kind,
            topic: None,
            reply_to: None,
            payload,
            metadata: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_reply_to(mut self, mailbox: impl Into<String>) -> Self {
        self.reply_to = Some(mailbox.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Copy of this message addressed to another recipient under a topic.
    /// The copy gets a fresh id so each delivery is distinguishable.
    pub fn readdressed(&self, recipient: &str, topic: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            recipient: recipient.to_string(),
            topic: Some(topic.to_string()),
            ..self.clone()
        }
    }

    /// Build the answer to this message, addressed to its `reply_to` mailbox
    /// (or the sender when none was given).
    pub fn reply(&self, sender: impl Into<String>, kind: MessageKind, payload: serde_json::Value) -> Self {
        let recipient = self.reply_to.clone().unwrap_or_else(|| self.sender.clone());
        let mut reply = Self::new(sender, recipient, kind, payload);
        reply.metadata = self.metadata.clone();
        reply
    }

    /// Whether `participant` sent or received this message.
    pub fn involves(&self, participant: &str) -> bool {
        self.sender == participant || self.recipient == participant
    }
}
