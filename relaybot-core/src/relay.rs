//! Transport-facing front of the relay.
//!
//! Classifies each inbound channel message as an interrupt (a configured
//! command or menu label, or an inline button press) or a fragment, and
//! routes it to the [`AssemblyEngine`].

use crate::assembly::{AssemblyEngine, UserId};
use crate::channels::{ChannelMessage, MessageContent};
use crate::config::RelayFrontConfig;
use crate::error::AssemblyError;

/// What happened to an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    /// Appended to the sender's burst as part `part`.
    Acknowledged { part: usize, text: String },
    /// The sender's burst, if any, was discarded.
    Interrupted { discarded: bool },
    /// Not something the relay forwards.
    Ignored,
}

pub struct RelayBot {
    engine: AssemblyEngine,
    config: RelayFrontConfig,
}

impl RelayBot {
    pub fn new(engine: AssemblyEngine, config: RelayFrontConfig) -> Self {
        Self { engine, config }
    }

    pub fn engine(&self) -> &AssemblyEngine {
        &self.engine
    }

    /// Whether acknowledgements should be echoed back to the sender.
    pub fn sends_acknowledgements(&self) -> bool {
        self.config.send_acknowledgements
    }

    fn is_interrupt_label(&self, text: &str) -> bool {
        let text = text.trim();
        self.config.interrupt_labels.iter().any(|label| label == text)
    }

    fn is_interrupt_command(&self, command: &str) -> bool {
        self.config.interrupt_commands.iter().any(|c| c == command)
    }

    fn interrupt(&self, user: &UserId) -> InboundOutcome {
        InboundOutcome::Interrupted {
            discarded: self.engine.on_interrupt(user),
        }
    }

    fn fragment(&self, user: &UserId, text: &str) -> Result<InboundOutcome, AssemblyError> {
        tracing::debug!(user = %user, fragment = %text, "fragment received");
        let ack = self.engine.on_fragment(user, text)?;
        Ok(InboundOutcome::Acknowledged {
            part: ack.part,
            text: ack.text,
        })
    }

    /// Route one inbound message to the engine.
    pub fn handle_inbound(&self, msg: &ChannelMessage) -> Result<InboundOutcome, AssemblyError> {
        let user: UserId = msg.sender.user_id();
        match &msg.content {
            MessageContent::Command { command, .. } if self.is_interrupt_command(command) => {
                tracing::debug!(user = %user, %command, "command interrupts burst");
                Ok(self.interrupt(&user))
            }
            // Slash-prefixed text such as a path is part of what the user is typing.
            MessageContent::Command { raw, .. } => self.fragment(&user, raw),
            MessageContent::Callback { data } => {
                tracing::debug!(user = %user, %data, "button press interrupts burst");
                Ok(self.interrupt(&user))
            }
            MessageContent::Text { text } if self.is_interrupt_label(text) => {
                tracing::debug!(user = %user, label = %text.trim(), "menu label interrupts burst");
                Ok(self.interrupt(&user))
            }
            MessageContent::Text { text } => self.fragment(&user, text),
            MessageContent::Unsupported { kind } => {
                tracing::debug!(user = %user, %kind, "ignoring unsupported message");
                Ok(InboundOutcome::Ignored)
            }
        }
    }

    /// Stop the engine; see [`AssemblyEngine::shutdown`].
    pub async fn shutdown(self) {
        self.engine.shutdown().await;
    }
}
