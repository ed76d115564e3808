//! Sampling: repeated completions per (question, condition, model).
//!
//! Core loop:
//! 1. Expand (question, sample_index) work units, consulting the result
//!    store first so previously completed samples are never re-issued.
//! 2. Run units under bounded concurrency; each unit owns an independent
//!    retry schedule with per-unit jitter.
//! 3. Record every unit as a complete sample: success, or a terminal error
//!    with empty completion text. One sample's exhaustion never aborts the
//!    batch.

use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::condition::Condition;
use crate::config::{ModelConfig, SamplingConfig};
use crate::dataset::Question;
use crate::gateway::{Attribution, ChatGateway, ChatRequest, ProviderError, RetryPolicy};
use crate::prompts::build_chat_messages;
use crate::store::{ResultStore, SampleKey, StoreError};

#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// One sampling attempt, successful or terminally failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSample {
    pub dataset: String,
    pub question_id: String,
    pub model_id: String,
    pub condition: Condition,
    pub sample_index: usize,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub difficulty: Option<String>,
    pub completion_text: String,
    pub attempt_count: u32,
    pub latency_ms: u64,
    /// Terminal error code and message when all retries were exhausted.
    #[serde(default)]
    pub error: Option<String>,
}

impl RawSample {
    pub fn key(&self) -> SampleKey {
        SampleKey {
            dataset: self.dataset.clone(),
            question_id: self.question_id.clone(),
            model_id: self.model_id.clone(),
            condition: self.condition,
            sample_index: self.sample_index,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingStopReason {
    Completed,
    Cancelled,
}

#[derive(Debug)]
pub struct SamplingReport {
    pub samples: Vec<RawSample>,
    pub skipped_existing: usize,
    pub failed: usize,
    pub stop_reason: SamplingStopReason,
}

fn is_cancelled(cancel: Option<&AtomicBool>) -> bool {
    cancel.is_some_and(|flag| flag.load(AtomicOrdering::Relaxed))
}

/// Run sampling for every question under one (model, condition) pair.
///
/// Completed samples are appended to the store as they finish, so a
/// cancelled or crashed run resumes from durable state.
pub async fn run_sampling(
    gateway: &dyn ChatGateway,
    store: &dyn ResultStore,
    questions: &[Question],
    condition: Condition,
    model: &ModelConfig,
    sampling: &SamplingConfig,
    skip_existing: bool,
    cancel: Option<&AtomicBool>,
) -> Result<SamplingReport, SamplerError> {
    struct Unit<'q> {
        question: &'q Question,
        sample_index: usize,
    }

    let mut units: Vec<Unit<'_>> = Vec::new();
    let mut skipped_existing = 0usize;

    for question in questions {
        for sample_index in 0..sampling.num_samples_per_question {
            let key = SampleKey {
                dataset: question.dataset.clone(),
                question_id: question.id.clone(),
                model_id: model.id.clone(),
                condition,
                sample_index,
            };
            if skip_existing && store.exists(&key) {
                skipped_existing += 1;
                continue;
            }
            units.push(Unit {
                question,
                sample_index,
            });
        }
    }

    let retry = sampling.retry_policy();

    let results: Vec<Result<Option<RawSample>, StoreError>> =
        stream::iter(units.into_iter().map(|unit| async move {
            let sample = sample_once(
                gateway,
                unit.question,
                condition,
                model,
                sampling,
                unit.sample_index,
                retry,
                cancel,
            )
            .await;

            if let Some(ref sample) = sample {
                store.append(sample)?;
            }
            Ok(sample)
        }))
        .buffer_unordered(sampling.concurrency.max(1))
        .collect()
        .await;

    let mut samples = Vec::new();
    let mut failed = 0usize;
    let mut cancelled = false;

    for result in results {
        match result? {
            Some(sample) => {
                if sample.error.is_some() {
                    failed += 1;
                }
                samples.push(sample);
            }
            None => cancelled = true,
        }
    }

    Ok(SamplingReport {
        samples,
        skipped_existing,
        failed,
        stop_reason: if cancelled {
            SamplingStopReason::Cancelled
        } else {
            SamplingStopReason::Completed
        },
    })
}

/// Sample one question under one condition, producing exactly
/// `num_samples_per_question` entries unless cancelled. Samples are returned
/// ordered by sample index.
pub async fn sample_question(
    gateway: &dyn ChatGateway,
    store: &dyn ResultStore,
    question: &Question,
    condition: Condition,
    model: &ModelConfig,
    sampling: &SamplingConfig,
    skip_existing: bool,
    cancel: Option<&AtomicBool>,
) -> Result<SamplingReport, SamplerError> {
    let mut report = run_sampling(
        gateway,
        store,
        std::slice::from_ref(question),
        condition,
        model,
        sampling,
        skip_existing,
        cancel,
    )
    .await?;
    report.samples.sort_by_key(|s| s.sample_index);
    Ok(report)
}

/// One (question, sample_index) unit: a single call under the retry
/// schedule. Returns None only when cancellation pre-empted the unit.
#[allow(clippy::too_many_arguments)]
async fn sample_once(
    gateway: &dyn ChatGateway,
    question: &Question,
    condition: Condition,
    model: &ModelConfig,
    sampling: &SamplingConfig,
    sample_index: usize,
    retry: RetryPolicy,
    cancel: Option<&AtomicBool>,
) -> Option<RawSample> {
    if is_cancelled(cancel) {
        return None;
    }

    let messages = build_chat_messages(question, condition, sampling.min_reasoning_tokens);
    let request = ChatRequest::new(
        model.chat_model(),
        messages,
        Attribution::new("sampler::sample"),
    )
    .temperature(sampling.temperature)
    .max_tokens(sampling.max_tokens.min(model.max_output_tokens));

    let attempt = gateway.chat_with_retry(request, retry, cancel).await;

    let base = RawSample {
        dataset: question.dataset.clone(),
        question_id: question.id.clone(),
        model_id: model.id.clone(),
        condition,
        sample_index,
        subject: question.subject.clone(),
        difficulty: question.difficulty.clone(),
        completion_text: String::new(),
        attempt_count: attempt.attempts,
        latency_ms: attempt.elapsed.as_millis() as u64,
        error: None,
    };

    match attempt.outcome {
        Ok(resp) => Some(RawSample {
            completion_text: resp.content,
            latency_ms: resp.latency.as_millis() as u64,
            ..base
        }),
        Err(ProviderError::Cancelled) => None,
        Err(err) => {
            warn!(
                question_id = %question.id,
                sample_index,
                attempts = attempt.attempts,
                error = %err,
                "sample exhausted retries; recording terminal error"
            );
            Some(RawSample {
                error: Some(format!("{}: {err}", err.code())),
                ..base
            })
        }
    }
}
