//! The relay run loop: poll Telegram, feed the engine, stop on Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use relaybot_core::channels::{Channel, ChannelDelivery, ChannelMessage, ChannelUser, create_telegram_channel};
use relaybot_core::{
    AssemblyEngine, CompletionDispatcher, DailyQuota, InboundOutcome, RelayBot, RelayConfig,
    create_coze_client,
};

/// Pause after a failed poll before trying again.
const POLL_RETRY_DELAY: Duration = Duration::from_secs(5);

pub async fn run(config: RelayConfig) -> anyhow::Result<()> {
    config.validate()?;
    let telegram = config
        .telegram
        .clone()
        .ok_or_else(|| anyhow::anyhow!("Missing [telegram] configuration (bot_token)"))?;
    let coze = config
        .coze
        .clone()
        .ok_or_else(|| anyhow::anyhow!("Missing [coze] configuration (api_key, bot_id)"))?;

    let mut telegram = create_telegram_channel(telegram);
    telegram.connect().await?;
    let channel: Arc<dyn Channel> = Arc::new(telegram);

    let mut dispatcher = CompletionDispatcher::new(
        Arc::new(create_coze_client(coze)),
        Arc::new(ChannelDelivery::new(Arc::clone(&channel))),
        config.dispatch.clone(),
    );
    if config.quota.enabled {
        dispatcher = dispatcher.with_quota(Arc::new(DailyQuota::new(config.quota.daily_limit)));
    }
    let engine = AssemblyEngine::start(config.assembly.clone(), dispatcher);
    let bot = RelayBot::new(engine, config.relay.clone());
    tracing::info!(channel = channel.name(), "relay running, press Ctrl-C to stop");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("shutdown requested");
                break;
            }
            polled = channel.receive_messages() => match polled {
                Ok(messages) => {
                    for msg in &messages {
                        handle_message(&bot, channel.as_ref(), msg).await;
                    }
                }
                Err(error) => {
                    tracing::warn!(%error, "polling failed, retrying");
                    tokio::time::sleep(POLL_RETRY_DELAY).await;
                }
            }
        }
    }

    bot.shutdown().await;
    Ok(())
}

async fn handle_message(bot: &RelayBot, channel: &dyn Channel, msg: &ChannelMessage) {
    let outcome = match bot.handle_inbound(msg) {
        Ok(outcome) => outcome,
        Err(error) => {
            tracing::warn!(%error, "inbound message dropped");
            return;
        }
    };
    if let InboundOutcome::Acknowledged { text, .. } = outcome {
        if !bot.sends_acknowledgements() {
            return;
        }
        let ack = ChannelMessage::text(msg.channel_id.clone(), ChannelUser::new("relaybot"), text);
        if let Err(error) = channel.send_message(ack).await {
            tracing::warn!(%error, "acknowledgement not delivered");
        }
    }
}
