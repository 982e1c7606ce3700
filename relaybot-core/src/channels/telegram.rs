//! Telegram Bot API channel implementation.
//!
//! Uses the Telegram Bot API via reqwest for `getUpdates`, `sendMessage` and
//! `answerCallbackQuery`.
//! In tests, the `TelegramHttpClient` trait abstraction allows mocking.

use std::sync::atomic::{AtomicI64, Ordering};

use super::{Channel, ChannelMessage, ChannelStatus, ChannelUser, MessageContent, MessageId};
use crate::error::{ChannelError, RelayError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Telegram rejects messages longer than this many characters.
pub const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

/// Configuration for a Telegram channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub bot_token: String,
    /// Chats the bot answers. Empty means every chat.
    pub allowed_chat_ids: Vec<i64>,
    /// Long-poll timeout passed to `getUpdates`.
    pub polling_timeout_secs: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            allowed_chat_ids: Vec::new(),
            polling_timeout_secs: 30,
        }
    }
}

/// Trait for HTTP interactions, allowing test mocking.
#[async_trait]
pub trait TelegramHttpClient: Send + Sync {
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<String, String>;
    async fn get_updates(&self, offset: i64, timeout_secs: u64)
    -> Result<Vec<TelegramUpdate>, String>;
    /// Stop the client's loading indicator on a pressed button.
    async fn answer_callback_query(&self, callback_query_id: &str) -> Result<(), String>;
}

/// A Telegram update from the Bot API.
#[derive(Debug, Clone)]
pub struct TelegramUpdate {
    pub update_id: i64,
    /// `None` for update kinds other than a new message.
    pub message: Option<TelegramMessage>,
    pub callback_query: Option<TelegramCallback>,
}

/// The `message` part of an update.
#[derive(Debug, Clone)]
pub struct TelegramMessage {
    pub message_id: i64,
    pub chat_id: i64,
    pub from_id: i64,
    pub from_name: String,
    /// `None` for stickers, photos and other non-text messages.
    pub text: Option<String>,
}

/// The `callback_query` part of an update: an inline button press.
#[derive(Debug, Clone)]
pub struct TelegramCallback {
    pub id: String,
    /// Chat of the message carrying the button; the sender's id when absent.
    pub chat_id: i64,
    pub from_id: i64,
    pub from_name: String,
    pub data: String,
}

/// Telegram channel using the Bot API.
pub struct TelegramChannel {
    config: TelegramConfig,
    status: ChannelStatus,
    http_client: Box<dyn TelegramHttpClient>,
    next_offset: AtomicI64,
    name: String,
}

impl TelegramChannel {
    pub fn new(config: TelegramConfig, http_client: Box<dyn TelegramHttpClient>) -> Self {
        Self {
            config,
            status: ChannelStatus::Disconnected,
            http_client,
            next_offset: AtomicI64::new(0),
            name: "telegram".to_string(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn is_allowed(&self, chat_id: i64) -> bool {
        self.config.allowed_chat_ids.is_empty() || self.config.allowed_chat_ids.contains(&chat_id)
    }

    fn not_connected(&self) -> RelayError {
        RelayError::Channel(ChannelError::NotConnected {
            name: self.name.clone(),
        })
    }
}

fn to_channel_message(msg: TelegramMessage) -> ChannelMessage {
    let sender = ChannelUser::new(msg.from_id.to_string()).with_name(msg.from_name);
    let content = match msg.text {
        Some(text) => MessageContent::parse(&text),
        None => MessageContent::Unsupported {
            kind: "non-text".to_string(),
        },
    };
    ChannelMessage::with_content(msg.chat_id.to_string(), sender, content)
        .with_id(MessageId::new(msg.message_id.to_string()))
}

fn callback_to_channel_message(callback: TelegramCallback) -> ChannelMessage {
    let sender = ChannelUser::new(callback.from_id.to_string()).with_name(callback.from_name);
    ChannelMessage::with_content(
        callback.chat_id.to_string(),
        sender,
        MessageContent::callback(callback.data),
    )
}

#[async_trait]
impl Channel for TelegramChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&mut self) -> Result<(), RelayError> {
        if self.config.bot_token.is_empty() {
            self.status = ChannelStatus::Failed;
            return Err(RelayError::Channel(ChannelError::AuthFailed {
                name: self.name.clone(),
            }));
        }
        self.status = ChannelStatus::Connected;
        tracing::info!(channel = %self.name, "telegram channel connected");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), RelayError> {
        self.status = ChannelStatus::Disconnected;
        Ok(())
    }

    async fn send_message(&self, msg: ChannelMessage) -> Result<MessageId, RelayError> {
        if !self.is_connected() {
            return Err(self.not_connected());
        }
        let send_failed = |message: String| {
            RelayError::Channel(ChannelError::SendFailed {
                name: self.name.clone(),
                message,
            })
        };
        let chat_id: i64 = msg
            .channel_id
            .parse()
            .map_err(|_| send_failed(format!("invalid chat id '{}'", msg.channel_id)))?;
        let text = msg.content.as_text().unwrap_or("");

        self.http_client
            .send_message(chat_id, text)
            .await
            .map(MessageId::new)
            .map_err(send_failed)
    }

    async fn receive_messages(&self) -> Result<Vec<ChannelMessage>, RelayError> {
        if !self.is_connected() {
            return Err(self.not_connected());
        }
        let offset = self.next_offset.load(Ordering::Acquire);
        let updates = self
            .http_client
            .get_updates(offset, self.config.polling_timeout_secs)
            .await
            .map_err(|e| {
                RelayError::Channel(ChannelError::ConnectionFailed {
                    name: self.name.clone(),
                    message: e,
                })
            })?;

        // Acknowledge everything fetched, including updates that are dropped below.
        if let Some(last) = updates.iter().map(|u| u.update_id).max() {
            self.next_offset.fetch_max(last + 1, Ordering::AcqRel);
        }

        let mut messages = Vec::with_capacity(updates.len());
        for update in updates {
            let (chat_id, msg) = match (update.message, update.callback_query) {
                (Some(m), _) => (m.chat_id, to_channel_message(m)),
                (None, Some(callback)) => {
                    if let Err(error) = self.http_client.answer_callback_query(&callback.id).await {
                        tracing::warn!(%error, "callback query not answered");
                    }
                    (callback.chat_id, callback_to_channel_message(callback))
                }
                (None, None) => continue,
            };
            if !self.is_allowed(chat_id) {
                tracing::debug!(chat_id, "ignoring message from disallowed chat");
                continue;
            }
            messages.push(msg);
        }

        Ok(messages)
    }

    fn status(&self) -> ChannelStatus {
        self.status
    }

    fn max_message_length(&self) -> Option<usize> {
        Some(TELEGRAM_MAX_MESSAGE_LENGTH)
    }
}

/// Real Telegram Bot API HTTP client using reqwest.
pub struct RealTelegramHttp {
    client: reqwest::Client,
    base_url: String,
}

impl RealTelegramHttp {
    pub fn new(bot_token: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: format!("https://api.telegram.org/bot{bot_token}"),
        }
    }
}

fn parse_update(u: &serde_json::Value) -> Option<TelegramUpdate> {
    let update_id = u["update_id"].as_i64()?;
    let cb = &u["callback_query"];
    let callback_query = cb["from"]["id"].as_i64().map(|from_id| TelegramCallback {
        id: cb["id"].as_str().unwrap_or_default().to_string(),
        chat_id: cb["message"]["chat"]["id"].as_i64().unwrap_or(from_id),
        from_id,
        from_name: cb["from"]["first_name"]
            .as_str()
            .unwrap_or("Unknown")
            .to_string(),
        data: cb["data"].as_str().unwrap_or_default().to_string(),
    });
    let msg = &u["message"];
    let message = msg["chat"]["id"].as_i64().map(|chat_id| TelegramMessage {
        message_id: msg["message_id"].as_i64().unwrap_or(0),
        chat_id,
        from_id: msg["from"]["id"].as_i64().unwrap_or(chat_id),
        from_name: msg["from"]["first_name"]
            .as_str()
            .unwrap_or("Unknown")
            .to_string(),
        text: msg["text"].as_str().map(str::to_string),
    });
    Some(TelegramUpdate {
        update_id,
        message,
        callback_query,
    })
}

#[async_trait]
impl TelegramHttpClient for RealTelegramHttp {
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<String, String> {
        let url = format!("{}/sendMessage", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "chat_id": chat_id,
                "text": text,
            }))
            .send()
            .await
            .map_err(|e| format!("HTTP error: {e}"))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| format!("JSON parse error: {e}"))?;

        if !body["ok"].as_bool().unwrap_or(false) {
            let desc = body["description"].as_str().unwrap_or("unknown error");
            return Err(format!("Telegram API error ({status}): {desc}"));
        }

        let message_id = body["result"]["message_id"]
            .as_i64()
            .unwrap_or(0)
            .to_string();
        Ok(message_id)
    }

    async fn answer_callback_query(&self, callback_query_id: &str) -> Result<(), String> {
        let url = format!("{}/answerCallbackQuery", self.base_url);
        let body: serde_json::Value = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "callback_query_id": callback_query_id }))
            .send()
            .await
            .map_err(|e| format!("HTTP error: {e}"))?
            .json()
            .await
            .map_err(|e| format!("JSON parse error: {e}"))?;

        if !body["ok"].as_bool().unwrap_or(false) {
            let desc = body["description"].as_str().unwrap_or("unknown error");
            return Err(format!("Telegram API error: {desc}"));
        }
        Ok(())
    }

    async fn get_updates(
        &self,
        offset: i64,
        timeout_secs: u64,
    ) -> Result<Vec<TelegramUpdate>, String> {
        let url = format!(
            "{}/getUpdates?offset={offset}&timeout={timeout_secs}",
            self.base_url
        );
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| format!("HTTP error: {e}"))?;

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| format!("JSON parse error: {e}"))?;

        if !body["ok"].as_bool().unwrap_or(false) {
            let desc = body["description"].as_str().unwrap_or("unknown error");
            return Err(format!("Telegram API error: {desc}"));
        }

        let updates = body["result"]
            .as_array()
            .map(|items| items.iter().filter_map(parse_update).collect())
            .unwrap_or_default();

        Ok(updates)
    }
}

/// Create a Telegram channel with a real HTTP client.
pub fn create_telegram_channel(config: TelegramConfig) -> TelegramChannel {
    let http = RealTelegramHttp::new(&config.bot_token);
    TelegramChannel::new(config, Box::new(http))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct MockTelegramHttp {
        sent: Arc<Mutex<Vec<(i64, String)>>>,
        offsets: Arc<Mutex<Vec<i64>>>,
        answered: Arc<Mutex<Vec<String>>>,
        updates: Vec<TelegramUpdate>,
    }

    impl MockTelegramHttp {
        fn new() -> Self {
            Self {
                sent: Arc::new(Mutex::new(Vec::new())),
                offsets: Arc::new(Mutex::new(Vec::new())),
                answered: Arc::new(Mutex::new(Vec::new())),
                updates: Vec::new(),
            }
        }

        fn with_updates(mut self, updates: Vec<TelegramUpdate>) -> Self {
            self.updates = updates;
            self
        }
    }

    #[async_trait]
    impl TelegramHttpClient for MockTelegramHttp {
        async fn send_message(&self, chat_id: i64, text: &str) -> Result<String, String> {
            self.sent.lock().unwrap().push((chat_id, text.to_string()));
            Ok("msg-123".to_string())
        }

        async fn get_updates(
            &self,
            offset: i64,
            _timeout_secs: u64,
        ) -> Result<Vec<TelegramUpdate>, String> {
            self.offsets.lock().unwrap().push(offset);
            Ok(self
                .updates
                .iter()
                .filter(|u| u.update_id >= offset)
                .cloned()
                .collect())
        }

        async fn answer_callback_query(&self, callback_query_id: &str) -> Result<(), String> {
            self.answered.lock().unwrap().push(callback_query_id.to_string());
            Ok(())
        }
    }

    fn update(update_id: i64, chat_id: i64, text: Option<&str>) -> TelegramUpdate {
        TelegramUpdate {
            update_id,
            message: Some(TelegramMessage {
                message_id: update_id * 10,
                chat_id,
                from_id: chat_id,
                from_name: "Alice".into(),
                text: text.map(String::from),
            }),
            callback_query: None,
        }
    }

    fn button(update_id: i64, chat_id: i64, data: &str) -> TelegramUpdate {
        TelegramUpdate {
            update_id,
            message: None,
            callback_query: Some(TelegramCallback {
                id: format!("cb-{update_id}"),
                chat_id,
                from_id: chat_id,
                from_name: "Alice".into(),
                data: data.into(),
            }),
        }
    }

    fn config() -> TelegramConfig {
        TelegramConfig {
            bot_token: "123:ABC".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_telegram_connect_no_token() {
        let mut ch = TelegramChannel::new(TelegramConfig::default(), Box::new(MockTelegramHttp::new()));
        let result = ch.connect().await;
        assert!(result.is_err());
        assert_eq!(ch.status(), ChannelStatus::Failed);
    }

    #[tokio::test]
    async fn test_telegram_send_message() {
        let http = MockTelegramHttp::new();
        let sent = http.sent.clone();
        let mut ch = TelegramChannel::new(config(), Box::new(http));
        ch.connect().await.unwrap();

        let msg = ChannelMessage::text("12345", ChannelUser::new("bot"), "Hello Telegram!");
        let id = ch.send_message(msg).await.unwrap();
        assert_eq!(id.0, "msg-123");

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0], (12345, "Hello Telegram!".to_string()));
    }

    #[tokio::test]
    async fn test_telegram_send_rejects_bad_chat_id() {
        let mut ch = TelegramChannel::new(config(), Box::new(MockTelegramHttp::new()));
        ch.connect().await.unwrap();
        let msg = ChannelMessage::text("not-a-number", ChannelUser::new("bot"), "hi");
        assert!(ch.send_message(msg).await.is_err());
    }

    #[tokio::test]
    async fn test_telegram_requires_connection() {
        let ch = TelegramChannel::new(config(), Box::new(MockTelegramHttp::new()));
        assert!(matches!(
            ch.receive_messages().await,
            Err(RelayError::Channel(ChannelError::NotConnected { .. }))
        ));
    }

    #[tokio::test]
    async fn test_telegram_receive_filters_and_parses() {
        let config = TelegramConfig {
            allowed_chat_ids: vec![100],
            ..config()
        };
        let http = MockTelegramHttp::new().with_updates(vec![
            update(1, 100, Some("hello")),
            update(2, 999, Some("spam")),
            update(3, 100, Some("/start")),
            update(4, 100, None),
            TelegramUpdate {
                update_id: 5,
                message: None,
                callback_query: None,
            },
        ]);
        let mut ch = TelegramChannel::new(config, Box::new(http));
        ch.connect().await.unwrap();

        let msgs = ch.receive_messages().await.unwrap();
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0].content.as_text(), Some("hello"));
        assert_eq!(msgs[0].sender.id, "100");
        assert_eq!(msgs[0].id, Some(MessageId::new("10")));
        assert_eq!(msgs[1].content, MessageContent::command("/start", vec![]));
        assert!(matches!(msgs[2].content, MessageContent::Unsupported { .. }));
    }

    #[tokio::test]
    async fn test_telegram_offset_advances_past_fetched_updates() {
        let http = MockTelegramHttp::new().with_updates(vec![
            update(7, 1, Some("a")),
            TelegramUpdate {
                update_id: 8,
                message: None,
                callback_query: None,
            },
        ]);
        let offsets = http.offsets.clone();
        let mut ch = TelegramChannel::new(config(), Box::new(http));
        ch.connect().await.unwrap();

        assert_eq!(ch.receive_messages().await.unwrap().len(), 1);
        assert!(ch.receive_messages().await.unwrap().is_empty());
        assert_eq!(*offsets.lock().unwrap(), vec![0, 9]);
    }

    #[test]
    fn test_parse_update_json() {
        let raw = serde_json::json!({
            "update_id": 11,
            "message": {
                "message_id": 3,
                "chat": { "id": 55 },
                "from": { "id": 55, "first_name": "Bob" },
                "sticker": { "file_id": "x" }
            }
        });
        let parsed = parse_update(&raw).unwrap();
        assert_eq!(parsed.update_id, 11);
        let msg = parsed.message.unwrap();
        assert_eq!(msg.chat_id, 55);
        assert_eq!(msg.from_name, "Bob");
        assert!(msg.text.is_none());

        let edited = serde_json::json!({ "update_id": 12, "edited_message": {} });
        let edited = parse_update(&edited).unwrap();
        assert!(edited.message.is_none());
        assert!(edited.callback_query.is_none());
    }

    #[test]
    fn test_parse_callback_query_json() {
        let raw = serde_json::json!({
            "update_id": 13,
            "callback_query": {
                "id": "4382",
                "from": { "id": 77, "first_name": "Eve" },
                "message": { "message_id": 9, "chat": { "id": 77 } },
                "data": "plans"
            }
        });
        let parsed = parse_update(&raw).unwrap();
        assert!(parsed.message.is_none());
        let callback = parsed.callback_query.unwrap();
        assert_eq!(callback.id, "4382");
        assert_eq!(callback.chat_id, 77);
        assert_eq!(callback.from_id, 77);
        assert_eq!(callback.data, "plans");

        // Inline-mode buttons come without a message.
        let inline = serde_json::json!({
            "update_id": 14,
            "callback_query": { "id": "1", "from": { "id": 5 }, "data": "x" }
        });
        assert_eq!(parse_update(&inline).unwrap().callback_query.unwrap().chat_id, 5);
    }

    #[tokio::test]
    async fn test_telegram_receive_callback_queries() {
        let config = TelegramConfig {
            allowed_chat_ids: vec![100],
            ..config()
        };
        let http = MockTelegramHttp::new().with_updates(vec![
            update(1, 100, Some("hello")),
            button(2, 100, "plans"),
            button(3, 999, "plans"),
        ]);
        let answered = http.answered.clone();
        let mut ch = TelegramChannel::new(config, Box::new(http));
        ch.connect().await.unwrap();

        let msgs = ch.receive_messages().await.unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[1].content, MessageContent::callback("plans"));
        assert_eq!(msgs[1].sender.id, "100");
        assert_eq!(msgs[1].channel_id, "100");
        assert_eq!(*answered.lock().unwrap(), vec!["cb-2", "cb-3"]);
    }

    #[test]
    fn test_telegram_max_message_length() {
        let ch = TelegramChannel::new(TelegramConfig::default(), Box::new(MockTelegramHttp::new()));
        assert_eq!(ch.max_message_length(), Some(4096));
    }
}
