//! Completion dispatch: the single seam between the assembly engine and
//! everything downstream.
//!
//! The dispatcher runs after an assembler has closed and released its lock.
//! It checks the quota, calls the request pipeline, and hands exactly one
//! reply to the delivery collaborator. Every fault on the way is converted
//! into user-facing text; nothing propagates back to the caller.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};

use crate::assembly::UserId;
use crate::config::DispatchConfig;
use crate::error::{PipelineError, RelayError};

/// Queries longer than this are shortened before being recorded.
const MAX_RECORDED_QUERY_CHARS: usize = 1000;

/// Token accounting reported by the downstream API.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageInfo {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// Reply from the request pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineReply {
    /// Whether the API produced a usable answer.
    pub ok: bool,
    pub text: String,
    pub usage: Option<UsageInfo>,
}

impl PipelineReply {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            ok: true,
            text: text.into(),
            usage: None,
        }
    }

    pub fn failed(text: impl Into<String>) -> Self {
        Self {
            ok: false,
            text: text.into(),
            usage: None,
        }
    }

    pub fn with_usage(mut self, usage: UsageInfo) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// One downstream request, as recorded against the user's quota.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub query: String,
    pub successful: bool,
    pub token_count: Option<u64>,
    pub at: DateTime<Utc>,
}

impl UsageRecord {
    pub fn new(query: &str, successful: bool, token_count: Option<u64>) -> Self {
        let query = if query.chars().count() > MAX_RECORDED_QUERY_CHARS {
            let head: String = query.chars().take(MAX_RECORDED_QUERY_CHARS - 3).collect();
            format!("{head}...")
        } else {
            query.to_string()
        };
        Self {
            query,
            successful,
            token_count,
            at: Utc::now(),
        }
    }
}

/// The downstream conversational API. May retry or poll internally.
#[async_trait]
pub trait RequestPipeline: Send + Sync {
    async fn send(&self, user: &UserId, text: &str) -> Result<PipelineReply, PipelineError>;
}

/// Best-effort outbound delivery. Failures are logged, never retried.
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn send(&self, user: &UserId, text: &str) -> Result<(), RelayError>;
}

/// Per-user request quota consulted before every downstream call.
#[async_trait]
pub trait QuotaGuard: Send + Sync {
    /// Claim one request for `user`, returning `false` when none are left.
    ///
    /// Check and claim happen as one step, so overlapping dispatches for the
    /// same user cannot both slip under the limit.
    async fn try_reserve(&self, user: &UserId) -> bool;

    /// Record the outcome of a request claimed with [`try_reserve`](Self::try_reserve).
    async fn record_usage(&self, _user: &UserId, _record: UsageRecord) {}
}

/// A quota guard that never refuses.
pub struct Unlimited;

#[async_trait]
impl QuotaGuard for Unlimited {
    async fn try_reserve(&self, _user: &UserId) -> bool {
        true
    }
}

/// What a dispatch ended up delivering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The pipeline answered and its reply was delivered.
    Replied,
    /// The pipeline answered with a failure; the API error text was delivered.
    Rejected,
    /// The pipeline faulted, panicked, or timed out; the apology was delivered.
    Failed,
    /// The quota was spent; the pipeline was not called.
    QuotaExceeded,
}

/// Routes a completed burst downstream and the reply back to the user.
pub struct CompletionDispatcher {
    pipeline: Arc<dyn RequestPipeline>,
    delivery: Arc<dyn Delivery>,
    quota: Arc<dyn QuotaGuard>,
    config: DispatchConfig,
}

impl CompletionDispatcher {
    pub fn new(
        pipeline: Arc<dyn RequestPipeline>,
        delivery: Arc<dyn Delivery>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            pipeline,
            delivery,
            quota: Arc::new(Unlimited),
            config,
        }
    }

    pub fn with_quota(mut self, quota: Arc<dyn QuotaGuard>) -> Self {
        self.quota = quota;
        self
    }

    /// Produce and deliver exactly one reply for `text`.
    #[tracing::instrument(skip_all, fields(user = %user, len = text.len()))]
    pub async fn dispatch(&self, user: &UserId, text: &str) -> DispatchOutcome {
        if !self.quota.try_reserve(user).await {
            tracing::info!("daily quota exceeded, skipping downstream call");
            self.deliver(user, &self.config.quota_exceeded_text).await;
            return DispatchOutcome::QuotaExceeded;
        }

        let (outcome, reply) = match self.call_pipeline(user, text).await {
            Ok(reply) => {
                // Failed answers are recorded without a token count.
                let tokens = reply.usage.filter(|_| reply.ok).map(|u| u.total_tokens);
                self.quota
                    .record_usage(user, UsageRecord::new(text, reply.ok, tokens))
                    .await;
                if reply.ok {
                    tracing::info!(reply_len = reply.text.len(), "downstream replied");
                    (DispatchOutcome::Replied, reply.text)
                } else {
                    tracing::warn!(message = %reply.text, "downstream reported failure");
                    (DispatchOutcome::Rejected, self.config.api_error_text.clone())
                }
            }
            Err(error) => {
                tracing::error!(%error, "downstream call failed");
                self.quota
                    .record_usage(user, UsageRecord::new(text, false, None))
                    .await;
                (DispatchOutcome::Failed, self.config.apology_text.clone())
            }
        };

        self.deliver(user, &reply).await;
        outcome
    }

    async fn call_pipeline(&self, user: &UserId, text: &str) -> Result<PipelineReply, PipelineError> {
        let timeout = self.config.request_timeout();
        let call = AssertUnwindSafe(self.pipeline.send(user, text)).catch_unwind();
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(_panic)) => Err(PipelineError::Failed {
                message: "request pipeline panicked".to_string(),
            }),
            Err(_elapsed) => Err(PipelineError::Timeout {
                timeout_secs: timeout.as_secs(),
            }),
        }
    }

    async fn deliver(&self, user: &UserId, text: &str) {
        if let Err(error) = self.delivery.send(user, text).await {
            tracing::warn!(%error, "reply delivery failed");
        }
    }
}
