//! Coze chat API request pipeline.
//!
//! A chat is submitted with `POST /v3/chat`. When the API answers
//! `in_progress`, the client polls `/v3/chat/retrieve` until the chat is
//! `completed` or `failed`, then reads the assistant's answer from
//! `/v3/chat/message/list`. HTTP goes through [`CozeTransport`] so tests can
//! script responses.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::assembly::UserId;
use crate::dispatch::{PipelineReply, RequestPipeline, UsageInfo};
use crate::error::PipelineError;

/// Configuration for the Coze API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CozeConfig {
    pub api_url: String,
    pub api_key: String,
    pub bot_id: String,
    /// Status polls before giving up on an unfinished chat.
    pub poll_attempts: u32,
    pub poll_interval_ms: u64,
}

impl Default for CozeConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.coze.com".to_string(),
            api_key: String::new(),
            bot_id: String::new(),
            poll_attempts: 30,
            poll_interval_ms: 1000,
        }
    }
}

impl CozeConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Raw HTTP access to the three chat endpoints.
#[async_trait]
pub trait CozeTransport: Send + Sync {
    async fn create_chat(&self, body: serde_json::Value) -> Result<serde_json::Value, PipelineError>;

    async fn retrieve_chat(
        &self,
        conversation_id: &str,
        chat_id: &str,
    ) -> Result<serde_json::Value, PipelineError>;

    async fn list_messages(
        &self,
        conversation_id: &str,
        chat_id: &str,
    ) -> Result<serde_json::Value, PipelineError>;
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
    data: Option<T>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatStatus {
    id: String,
    conversation_id: String,
    status: String,
    #[serde(default)]
    last_error: Option<ChatError>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatError {
    #[serde(default)]
    msg: String,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    token_count: u64,
    #[serde(default)]
    input_count: u64,
    #[serde(default)]
    output_count: u64,
}

impl From<ChatUsage> for UsageInfo {
    fn from(usage: ChatUsage) -> Self {
        Self {
            input_tokens: usage.input_count,
            output_tokens: usage.output_count,
            total_tokens: usage.token_count,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    role: String,
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    content: Option<String>,
}

fn decode<T: DeserializeOwned>(raw: serde_json::Value) -> Result<T, PipelineError> {
    let envelope: Envelope<T> = serde_json::from_value(raw).map_err(|e| PipelineError::Parse {
        message: e.to_string(),
    })?;
    if envelope.code != 0 {
        return Err(PipelineError::Api {
            code: envelope.code,
            message: envelope.msg,
        });
    }
    envelope.data.ok_or_else(|| PipelineError::Parse {
        message: "response has no data".to_string(),
    })
}

/// First non-blank assistant answer in a message list.
fn extract_answer(messages: &[ChatMessage]) -> Option<&str> {
    messages
        .iter()
        .filter(|m| m.role == "assistant" && m.kind == "answer")
        .filter_map(|m| m.content.as_deref())
        .find(|c| !c.trim().is_empty())
}

/// [`RequestPipeline`] backed by the Coze chat API.
pub struct CozeClient {
    config: CozeConfig,
    transport: Box<dyn CozeTransport>,
}

impl CozeClient {
    pub fn new(config: CozeConfig, transport: Box<dyn CozeTransport>) -> Self {
        Self { config, transport }
    }

    fn chat_request(&self, user: &UserId, text: &str) -> serde_json::Value {
        serde_json::json!({
            "bot_id": self.config.bot_id,
            "user_id": user.as_str(),
            "stream": false,
            "auto_save_history": true,
            "additional_messages": [{
                "role": "user",
                "content": text.trim(),
                "content_type": "text",
            }],
        })
    }

    async fn poll_until_done(&self, chat: ChatStatus) -> Option<ChatStatus> {
        for attempt in 1..=self.config.poll_attempts {
            tokio::time::sleep(self.config.poll_interval()).await;
            let status = match self
                .transport
                .retrieve_chat(&chat.conversation_id, &chat.id)
                .await
                .and_then(decode::<ChatStatus>)
            {
                Ok(status) => status,
                Err(error) => {
                    // A single failed poll does not fail the chat.
                    tracing::debug!(attempt, %error, "chat status poll failed");
                    continue;
                }
            };
            if matches!(status.status.as_str(), "completed" | "failed") {
                return Some(status);
            }
        }
        None
    }

    async fn read_answer(&self, chat: &ChatStatus) -> Result<PipelineReply, PipelineError> {
        let raw = self
            .transport
            .list_messages(&chat.conversation_id, &chat.id)
            .await?;
        let messages: Vec<ChatMessage> = decode(raw)?;
        let reply = match extract_answer(&messages) {
            Some(answer) => PipelineReply::ok(answer),
            None => PipelineReply::failed("chat completed without an answer"),
        };
        Ok(match chat.usage {
            Some(usage) => reply.with_usage(usage.into()),
            None => reply,
        })
    }
}

#[async_trait]
impl RequestPipeline for CozeClient {
    async fn send(&self, user: &UserId, text: &str) -> Result<PipelineReply, PipelineError> {
        tracing::info!(user = %user, len = text.len(), "sending chat request");
        let raw = self.transport.create_chat(self.chat_request(user, text)).await?;
        let mut chat: ChatStatus = decode(raw)?;

        if matches!(chat.status.as_str(), "created" | "in_progress") {
            match self.poll_until_done(chat).await {
                Some(done) => chat = done,
                None => {
                    tracing::warn!(
                        user = %user,
                        attempts = self.config.poll_attempts,
                        "chat did not finish in time"
                    );
                    return Ok(PipelineReply::failed("timed out waiting for the answer"));
                }
            }
        }

        match chat.status.as_str() {
            "completed" => self.read_answer(&chat).await,
            "failed" => {
                let reason = chat
                    .last_error
                    .map(|e| e.msg)
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| "chat failed".to_string());
                Ok(PipelineReply::failed(reason))
            }
            other => Ok(PipelineReply::failed(format!("unexpected chat status '{other}'"))),
        }
    }
}

/// Coze HTTP transport using reqwest.
pub struct RealCozeTransport {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
}

impl RealCozeTransport {
    pub fn new(config: &CozeConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        }
    }

    async fn read_json(resp: reqwest::Response) -> Result<serde_json::Value, PipelineError> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PipelineError::Http {
                message: format!("HTTP {status}: {body}"),
            });
        }
        resp.json().await.map_err(|e| PipelineError::Parse {
            message: e.to_string(),
        })
    }

    async fn get(&self, path: &str, conversation_id: &str, chat_id: &str) -> Result<serde_json::Value, PipelineError> {
        let resp = self
            .client
            .get(format!("{}{path}", self.api_url))
            .bearer_auth(&self.api_key)
            .query(&[("conversation_id", conversation_id), ("chat_id", chat_id)])
            .send()
            .await
            .map_err(http_error)?;
        Self::read_json(resp).await
    }
}

fn http_error(e: reqwest::Error) -> PipelineError {
    PipelineError::Http {
        message: e.to_string(),
    }
}

#[async_trait]
impl CozeTransport for RealCozeTransport {
    async fn create_chat(&self, body: serde_json::Value) -> Result<serde_json::Value, PipelineError> {
        let resp = self
            .client
            .post(format!("{}/v3/chat", self.api_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(http_error)?;
        Self::read_json(resp).await
    }

    async fn retrieve_chat(
        &self,
        conversation_id: &str,
        chat_id: &str,
    ) -> Result<serde_json::Value, PipelineError> {
        self.get("/v3/chat/retrieve", conversation_id, chat_id).await
    }

    async fn list_messages(
        &self,
        conversation_id: &str,
        chat_id: &str,
    ) -> Result<serde_json::Value, PipelineError> {
        self.get("/v3/chat/message/list", conversation_id, chat_id).await
    }
}

/// Create a Coze client with a real HTTP transport.
pub fn create_coze_client(config: CozeConfig) -> CozeClient {
    let transport = RealCozeTransport::new(&config);
    CozeClient::new(config, Box::new(transport))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct ScriptedTransport {
        created: Arc<Mutex<Option<serde_json::Value>>>,
        create: Mutex<Option<Result<serde_json::Value, PipelineError>>>,
        retrieves: Mutex<VecDeque<Result<serde_json::Value, PipelineError>>>,
        messages: Mutex<Option<serde_json::Value>>,
        retrieve_calls: Arc<Mutex<u32>>,
    }

    impl ScriptedTransport {
        fn new(create: serde_json::Value) -> Self {
            let transport = Self::default();
            *transport.create.lock().unwrap() = Some(Ok(create));
            transport
        }

        fn then_retrieve(self, response: Result<serde_json::Value, PipelineError>) -> Self {
            self.retrieves.lock().unwrap().push_back(response);
            self
        }

        fn with_messages(self, messages: serde_json::Value) -> Self {
            *self.messages.lock().unwrap() = Some(messages);
            self
        }
    }

    #[async_trait]
    impl CozeTransport for ScriptedTransport {
        async fn create_chat(&self, body: serde_json::Value) -> Result<serde_json::Value, PipelineError> {
            *self.created.lock().unwrap() = Some(body);
            self.create.lock().unwrap().take().unwrap()
        }

        async fn retrieve_chat(&self, _: &str, _: &str) -> Result<serde_json::Value, PipelineError> {
            *self.retrieve_calls.lock().unwrap() += 1;
            self.retrieves
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(chat("in_progress")))
        }

        async fn list_messages(&self, _: &str, _: &str) -> Result<serde_json::Value, PipelineError> {
            Ok(self.messages.lock().unwrap().clone().unwrap())
        }
    }

    fn chat(status: &str) -> serde_json::Value {
        json!({
            "code": 0,
            "msg": "",
            "data": { "id": "c1", "conversation_id": "v1", "status": status }
        })
    }

    fn answer_list(answer: &str) -> serde_json::Value {
        json!({
            "code": 0,
            "data": [
                { "role": "assistant", "type": "verbose", "content": "{\"ignored\":true}" },
                { "role": "assistant", "type": "answer", "content": "   " },
                { "role": "assistant", "type": "answer", "content": answer },
                { "role": "assistant", "type": "follow_up", "content": "Anything else?" }
            ]
        })
    }

    fn client(transport: ScriptedTransport) -> CozeClient {
        let config = CozeConfig {
            bot_id: "bot-7".into(),
            poll_attempts: 3,
            ..Default::default()
        };
        CozeClient::new(config, Box::new(transport))
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_until_completed_and_reads_answer() {
        let completed = json!({
            "code": 0,
            "data": {
                "id": "c1", "conversation_id": "v1", "status": "completed",
                "usage": { "token_count": 30, "input_count": 20, "output_count": 10 }
            }
        });
        let transport = ScriptedTransport::new(chat("in_progress"))
            .then_retrieve(Ok(chat("in_progress")))
            .then_retrieve(Ok(completed))
            .with_messages(answer_list("Hi there!"));
        let reply = client(transport).send(&UserId::from(42), " Hello ").await.unwrap();

        assert!(reply.ok);
        assert_eq!(reply.text, "Hi there!");
        assert_eq!(
            reply.usage,
            Some(UsageInfo {
                input_tokens: 20,
                output_tokens: 10,
                total_tokens: 30
            })
        );
    }

    #[tokio::test]
    async fn test_request_body_carries_user_and_trimmed_text() {
        let transport = ScriptedTransport::new(chat("completed")).with_messages(answer_list("ok"));
        let created = transport.created.clone();
        client(transport).send(&UserId::from(42), "  hi  ").await.unwrap();

        let body = created.lock().unwrap().clone().unwrap();
        assert_eq!(body["bot_id"], "bot-7");
        assert_eq!(body["user_id"], "42");
        assert_eq!(body["stream"], false);
        assert_eq!(body["additional_messages"][0]["content"], "hi");
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_exhaustion_is_a_failed_reply() {
        let transport = ScriptedTransport::new(chat("in_progress"));
        let calls = transport.retrieve_calls.clone();
        let reply = client(transport).send(&UserId::from(1), "q").await.unwrap();
        assert!(!reply.ok);
        assert_eq!(*calls.lock().unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_errors_are_skipped() {
        let transport = ScriptedTransport::new(chat("in_progress"))
            .then_retrieve(Err(PipelineError::Http {
                message: "502".into(),
            }))
            .then_retrieve(Ok(chat("completed")))
            .with_messages(answer_list("recovered"));
        let reply = client(transport).send(&UserId::from(1), "q").await.unwrap();
        assert_eq!(reply, PipelineReply::ok("recovered"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_chat_reports_last_error() {
        let failed = json!({
            "code": 0,
            "data": {
                "id": "c1", "conversation_id": "v1", "status": "failed",
                "last_error": { "code": 4011, "msg": "insufficient balance" }
            }
        });
        let transport = ScriptedTransport::new(chat("in_progress")).then_retrieve(Ok(failed));
        let reply = client(transport).send(&UserId::from(1), "q").await.unwrap();
        assert_eq!(reply, PipelineReply::failed("insufficient balance"));
    }

    #[tokio::test]
    async fn test_api_error_code_is_an_error() {
        let transport = ScriptedTransport::new(json!({ "code": 4100, "msg": "bad token" }));
        let err = client(transport).send(&UserId::from(1), "q").await.unwrap_err();
        assert!(matches!(err, PipelineError::Api { code: 4100, .. }));
    }

    #[tokio::test]
    async fn test_completed_without_answer_is_a_failed_reply() {
        let transport = ScriptedTransport::new(chat("completed"))
            .with_messages(json!({ "code": 0, "data": [] }));
        let reply = client(transport).send(&UserId::from(1), "q").await.unwrap();
        assert!(!reply.ok);
    }
}
