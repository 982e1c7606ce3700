//! Reply delivery over a [`Channel`].

use std::sync::Arc;

use async_trait::async_trait;

use super::{Channel, ChannelMessage, ChannelUser};
use crate::assembly::UserId;
use crate::dispatch::Delivery;
use crate::error::RelayError;

const EMPTY_REPLY_PLACEHOLDER: &str = "…";

/// Sends replies to the user's private chat, split to the channel's length limit.
pub struct ChannelDelivery {
    channel: Arc<dyn Channel>,
    placeholder: String,
}

impl ChannelDelivery {
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Self {
            channel,
            placeholder: EMPTY_REPLY_PLACEHOLDER.to_string(),
        }
    }

    /// Text sent instead of an empty reply, which most platforms reject.
    pub fn with_placeholder(mut self, placeholder: impl Into<String>) -> Self {
        self.placeholder = placeholder.into();
        self
    }
}

/// Split `text` into chunks of at most `max_chars` characters.
pub fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    if max_chars == 0 {
        return vec![text.to_string()];
    }
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(max_chars)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

#[async_trait]
impl Delivery for ChannelDelivery {
    async fn send(&self, user: &UserId, text: &str) -> Result<(), RelayError> {
        let text = if text.trim().is_empty() {
            self.placeholder.as_str()
        } else {
            text
        };
        let chunks = match self.channel.max_message_length() {
            Some(limit) => split_message(text, limit),
            None => vec![text.to_string()],
        };
        let total = chunks.len();
        for (index, chunk) in chunks.into_iter().enumerate() {
            let msg = ChannelMessage::text(user.as_str(), ChannelUser::new("relaybot"), chunk);
            self.channel.send_message(msg).await?;
            tracing::debug!(user = %user, chunk = index + 1, total, "reply chunk sent");
        }
        Ok(())
    }
}
