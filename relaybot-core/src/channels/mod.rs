//! # Channel System
//!
//! Chat transports the relay listens on and replies through. Each transport
//! implements [`Channel`]; [`ChannelDelivery`] adapts any channel into the
//! dispatcher's [`Delivery`](crate::dispatch::Delivery) seam.

pub mod delivery;
pub mod telegram;
pub mod types;

pub use delivery::ChannelDelivery;
pub use telegram::{TelegramChannel, TelegramConfig, create_telegram_channel};
pub use types::{ChannelMessage, ChannelStatus, ChannelUser, MessageContent, MessageId};

use crate::error::RelayError;
use async_trait::async_trait;

/// Core trait that all channel implementations must satisfy.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Human-readable name of this channel instance.
    fn name(&self) -> &str;

    /// Connect to the channel's platform.
    async fn connect(&mut self) -> Result<(), RelayError>;

    /// Disconnect from the channel's platform.
    async fn disconnect(&mut self) -> Result<(), RelayError>;

    /// Send a message through this channel. Returns the platform message ID.
    async fn send_message(&self, msg: ChannelMessage) -> Result<MessageId, RelayError>;

    /// Poll for new incoming messages.
    async fn receive_messages(&self) -> Result<Vec<ChannelMessage>, RelayError>;

    /// Current connection status.
    fn status(&self) -> ChannelStatus;

    /// Convenience: whether the channel is connected.
    fn is_connected(&self) -> bool {
        self.status() == ChannelStatus::Connected
    }

    /// Longest message the platform accepts, in characters.
    fn max_message_length(&self) -> Option<usize> {
        None
    }
}
