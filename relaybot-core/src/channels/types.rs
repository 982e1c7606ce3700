//! Channel types and message protocol.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::assembly::UserId;

/// Unique identifier for a message within a channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

/// A user within a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelUser {
    pub id: String,
    pub display_name: Option<String>,
}

impl ChannelUser {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Identity used to key this user's bursts.
    pub fn user_id(&self) -> UserId {
        UserId::new(self.id.clone())
    }
}

/// Content carried by a channel message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MessageContent {
    /// Plain text content.
    Text { text: String },
    /// A command (e.g., `/start`, `/help`). `raw` is the text as typed.
    Command {
        command: String,
        args: Vec<String>,
        raw: String,
    },
    /// An inline keyboard button press carrying its callback data.
    Callback { data: String },
    /// Anything the relay does not forward (stickers, photos, ...).
    Unsupported { kind: String },
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn command(command: impl Into<String>, args: Vec<String>) -> Self {
        let command = command.into();
        let raw = std::iter::once(command.as_str())
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        Self::Command { command, args, raw }
    }

    pub fn callback(data: impl Into<String>) -> Self {
        Self::Callback { data: data.into() }
    }

    /// Parse raw text, treating a leading `/` as a command.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim_start();
        if let Some(rest) = trimmed.strip_prefix('/') {
            let mut words = rest.split_whitespace();
            if let Some(name) = words.next() {
                // Telegram appends the bot name in groups: /start@my_bot
                let name = name.split('@').next().unwrap_or(name);
                return Self::Command {
                    command: format!("/{name}"),
                    args: words.map(String::from).collect(),
                    raw: raw.to_string(),
                };
            }
        }
        Self::text(raw)
    }

    /// Extract plain text content, if present.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// Connection status of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelStatus {
    /// Not yet connected.
    Disconnected,
    /// Connected and ready.
    Connected,
    /// Permanently failed.
    Failed,
}

/// A message sent or received over a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub id: Option<MessageId>,
    /// Conversation the message belongs to (Telegram chat id).
    pub channel_id: String,
    pub sender: ChannelUser,
    pub content: MessageContent,
    pub timestamp: DateTime<Utc>,
}

impl ChannelMessage {
    /// Create a new text message.
    pub fn text(channel_id: impl Into<String>, sender: ChannelUser, text: impl Into<String>) -> Self {
        Self::with_content(channel_id, sender, MessageContent::text(text))
    }

    pub fn with_content(
        channel_id: impl Into<String>,
        sender: ChannelUser,
        content: MessageContent,
    ) -> Self {
        Self {
            id: None,
            channel_id: channel_id.into(),
            sender,
            content,
            timestamp: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: MessageId) -> Self {
        self.id = Some(id);
        self
    }
}
