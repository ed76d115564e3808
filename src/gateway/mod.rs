//! Provider gateway for chat completions.
//!
//! Provider dispatch is a capability interface: one adapter per provider,
//! selected by the `ChatModel` variant on the request. Retry/backoff is an
//! explicit `RetrySchedule` state machine so the delay sequence is testable
//! without a clock.

pub mod anthropic;
pub mod error;
pub mod openai;
pub mod types;
pub mod usage;

use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use tokio::time::sleep;
use tracing::warn;

use crate::config::ApiCredentials;

use anthropic::AnthropicAdapter;
use openai::ChatCompletionsAdapter;
use usage::{CallStatus, ProviderCallRecord, UsageSink as UsageSinkTrait};

pub use error::{ErrorContext, ProviderError};
pub use types::{Attribution, ChatModel, ChatRequest, ChatResponse, FinishReason, Message, Role};
pub use usage::{NoopUsageSink, StderrUsageSink, UsageSink};

// =============================================================================
// Provider trait
// =============================================================================

/// Trait for chat completion providers.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError>;
}

// =============================================================================
// Retry state machine
// =============================================================================

/// Retry discipline for a single logical call.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt (total attempts = max_retries + 1).
    pub max_retries: u32,
    /// Base backoff delay, doubled per failed attempt.
    pub base_delay: Duration,
    /// Randomize each delay by up to +50% so parallel units don't retry in
    /// lockstep.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(1),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            jitter: true,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let extra_ms = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 2);
        delay + Duration::from_millis(extra_ms)
    }
}

/// Next action after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStep {
    /// Sleep for this long, then attempt again.
    Backoff(Duration),
    /// Terminal: the error is fatal or the retry budget is spent.
    GiveUp,
}

/// Explicit retry state: attempt count in, next delay or terminal out.
///
/// The schedule never sleeps itself; callers own the clock, which keeps the
/// delay sequence testable.
#[derive(Debug, Clone)]
pub struct RetrySchedule {
    policy: RetryPolicy,
    attempts: u32,
}

impl RetrySchedule {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    /// Attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Mark the start of an attempt.
    pub fn begin_attempt(&mut self) {
        self.attempts += 1;
    }

    /// Decide what happens after the current attempt failed with `err`.
    pub fn after_failure(&self, err: &ProviderError) -> RetryStep {
        if !err.is_retryable() || self.attempts > self.policy.max_retries {
            return RetryStep::GiveUp;
        }
        RetryStep::Backoff(backoff_delay(self.policy.base_delay, self.attempts - 1))
    }
}

/// Exponential backoff: base * 2^attempt, capped at 2^5.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let multiplier = 2u64.pow(attempt.min(5));
    base * multiplier as u32
}

fn is_cancelled(cancel: Option<&AtomicBool>) -> bool {
    cancel.is_some_and(|flag| flag.load(AtomicOrdering::Relaxed))
}

/// Outcome of a retried chat call, with the attempt count preserved for the
/// sample record.
#[derive(Debug)]
pub struct ChatAttempt {
    pub outcome: Result<ChatResponse, ProviderError>,
    pub attempts: u32,
    pub elapsed: Duration,
}

// =============================================================================
// Gateway trait
// =============================================================================

#[async_trait]
pub trait ChatGateway: Send + Sync {
    /// Issue a single attempt. No retries at this layer.
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError>;

    /// Issue a call under the retry schedule. Once cancellation is observed,
    /// no further attempt or retry is started.
    async fn chat_with_retry(
        &self,
        req: ChatRequest,
        policy: RetryPolicy,
        cancel: Option<&AtomicBool>,
    ) -> ChatAttempt {
        let start = Instant::now();
        let mut schedule = RetrySchedule::new(policy);

        loop {
            if is_cancelled(cancel) {
                return ChatAttempt {
                    outcome: Err(ProviderError::Cancelled),
                    attempts: schedule.attempts(),
                    elapsed: start.elapsed(),
                };
            }

            schedule.begin_attempt();
            match self.chat(req.clone()).await {
                Ok(resp) => {
                    return ChatAttempt {
                        outcome: Ok(resp),
                        attempts: schedule.attempts(),
                        elapsed: start.elapsed(),
                    }
                }
                Err(err) => match schedule.after_failure(&err) {
                    RetryStep::GiveUp => {
                        return ChatAttempt {
                            outcome: Err(err),
                            attempts: schedule.attempts(),
                            elapsed: start.elapsed(),
                        }
                    }
                    RetryStep::Backoff(delay) => {
                        warn!(
                            error = %err,
                            attempt = schedule.attempts(),
                            delay_ms = delay.as_millis() as u64,
                            "transient provider error, backing off"
                        );
                        sleep(policy.apply_jitter(delay)).await;
                    }
                },
            }
        }
    }
}

// =============================================================================
// Provider gateway
// =============================================================================

/// Dispatches chat requests to the adapter matching the model's provider and
/// records every call through the usage sink.
pub struct ProviderGateway<U: UsageSinkTrait> {
    openai: Option<ChatCompletionsAdapter>,
    openrouter: Option<ChatCompletionsAdapter>,
    anthropic: Option<AnthropicAdapter>,
    usage_sink: Arc<U>,
}

impl<U: UsageSinkTrait> ProviderGateway<U> {
    /// Build adapters for every provider the credentials cover. Models routed
    /// to an unconfigured provider fail per call with a config error, which
    /// is fatal (non-retryable) for that sample only.
    pub fn from_credentials(
        creds: &ApiCredentials,
        usage_sink: Arc<U>,
    ) -> Result<Self, ProviderError> {
        let openai = creds
            .openai_api_key
            .as_deref()
            .map(|key| ChatCompletionsAdapter::openai(key, creds.timeout))
            .transpose()?;

        let openrouter = creds
            .openrouter_api_key
            .as_deref()
            .map(|key| {
                ChatCompletionsAdapter::openrouter(
                    key,
                    creds.openrouter_base_url.clone(),
                    creds.timeout,
                    creds.openrouter_referer.clone(),
                    creds.openrouter_app_title.clone(),
                )
            })
            .transpose()?;

        let anthropic = creds
            .anthropic_api_key
            .as_deref()
            .map(|key| AnthropicAdapter::new(key, creds.timeout))
            .transpose()?;

        Ok(Self {
            openai,
            openrouter,
            anthropic,
            usage_sink,
        })
    }

    /// Build a gateway around a single OpenAI-style adapter. Used by tests to
    /// point every provider at a mock server.
    pub fn with_chat_completions(adapter: ChatCompletionsAdapter, usage_sink: Arc<U>) -> Self {
        Self {
            openai: Some(adapter.clone()),
            openrouter: Some(adapter),
            anthropic: None,
            usage_sink,
        }
    }

    async fn dispatch(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        match &req.model {
            ChatModel::OpenAi(_) => match &self.openai {
                Some(adapter) => adapter.chat(req).await,
                None => Err(ProviderError::config("OpenAI provider not configured")),
            },
            ChatModel::OpenRouter(_) => match &self.openrouter {
                Some(adapter) => adapter.chat(req).await,
                None => Err(ProviderError::config("OpenRouter provider not configured")),
            },
            ChatModel::Anthropic(_) => match &self.anthropic {
                Some(adapter) => adapter.chat(req).await,
                None => Err(ProviderError::config("Anthropic provider not configured")),
            },
        }
    }

    fn endpoint_for(model: &ChatModel) -> &'static str {
        match model {
            ChatModel::OpenAi(_) | ChatModel::OpenRouter(_) => "chat/completions",
            ChatModel::Anthropic(_) => "messages",
        }
    }

    async fn record_usage(
        &self,
        req: &ChatRequest,
        resp: &ChatResponse,
        status: CallStatus,
        error_code: Option<String>,
    ) {
        let record = ProviderCallRecord::new(
            req.model.provider(),
            Self::endpoint_for(&req.model),
            req.model.model_id(),
            req.attribution.caller,
        )
        .tokens(resp.input_tokens as i32, resp.output_tokens as i32)
        .run(req.attribution.run_id)
        .latency(resp.latency.as_millis() as i32);

        let record = if status == CallStatus::Error {
            record.error(error_code.unwrap_or_else(|| "provider_error".to_string()))
        } else {
            record
        };

        self.usage_sink.record(record).await;
    }
}

#[async_trait]
impl<U: UsageSinkTrait> ChatGateway for ProviderGateway<U> {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        match self.dispatch(&req).await {
            Ok(resp) => {
                self.record_usage(&req, &resp, CallStatus::Success, None).await;
                Ok(resp)
            }
            Err(err) => {
                let code = err.code().to_string();
                self.record_usage(&req, &ChatResponse::empty(), CallStatus::Error, Some(code))
                    .await;
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transient() -> ProviderError {
        ProviderError::provider("openai", "server exploded", true)
    }

    fn fatal() -> ProviderError {
        ProviderError::invalid_request("bad request")
    }

    #[test]
    fn schedule_doubles_delay_per_attempt() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100)).without_jitter();
        let mut schedule = RetrySchedule::new(policy);

        schedule.begin_attempt();
        assert_eq!(
            schedule.after_failure(&transient()),
            RetryStep::Backoff(Duration::from_millis(100))
        );

        schedule.begin_attempt();
        assert_eq!(
            schedule.after_failure(&transient()),
            RetryStep::Backoff(Duration::from_millis(200))
        );

        schedule.begin_attempt();
        assert_eq!(
            schedule.after_failure(&transient()),
            RetryStep::Backoff(Duration::from_millis(400))
        );
    }

    #[test]
    fn schedule_gives_up_when_budget_spent() {
        let policy = RetryPolicy::new(1, Duration::from_millis(10)).without_jitter();
        let mut schedule = RetrySchedule::new(policy);

        schedule.begin_attempt();
        assert!(matches!(
            schedule.after_failure(&transient()),
            RetryStep::Backoff(_)
        ));

        schedule.begin_attempt();
        assert_eq!(schedule.after_failure(&transient()), RetryStep::GiveUp);
        assert_eq!(schedule.attempts(), 2);
    }

    #[test]
    fn schedule_terminal_on_fatal_error() {
        let policy = RetryPolicy::new(5, Duration::from_millis(10)).without_jitter();
        let mut schedule = RetrySchedule::new(policy);

        schedule.begin_attempt();
        assert_eq!(schedule.after_failure(&fatal()), RetryStep::GiveUp);
        assert_eq!(schedule.attempts(), 1);
    }

    #[test]
    fn backoff_multiplier_is_capped() {
        let base = Duration::from_millis(10);
        assert_eq!(backoff_delay(base, 5), base * 32);
        assert_eq!(backoff_delay(base, 9), base * 32);
    }

    #[test]
    fn jitter_bounds() {
        let policy = RetryPolicy::new(1, Duration::from_millis(100));
        for _ in 0..32 {
            let d = policy.apply_jitter(Duration::from_millis(100));
            assert!(d >= Duration::from_millis(100));
            assert!(d <= Duration::from_millis(150));
        }
    }
}
