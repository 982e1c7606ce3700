//! # Relaybot Core
//!
//! Core library for the relaybot chat relay.
//! Provides the per-user message assembly engine, completion dispatch,
//! the downstream chat API client, chat channels, quota, and configuration.

pub mod assembly;
pub mod channels;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod pipeline;
pub mod quota;
pub mod relay;

// Re-export commonly used types at the crate root.
pub use assembly::{Acknowledgement, AssemblyEngine, CompletionReason, UserId};
pub use channels::{Channel, ChannelDelivery, ChannelMessage, MessageContent};
pub use config::{RelayConfig, load_config};
pub use dispatch::{
    CompletionDispatcher, Delivery, DispatchOutcome, PipelineReply, QuotaGuard, RequestPipeline,
    Unlimited, UsageInfo,
};
pub use error::{AssemblyError, RelayError, Result};
pub use pipeline::{CozeClient, CozeConfig, create_coze_client};
pub use quota::DailyQuota;
pub use relay::{InboundOutcome, RelayBot};
