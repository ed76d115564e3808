//! Scoring: direct comparison for multiple-choice, judge-mediated grading
//! for open-ended answers, refusal classification.
//!
//! Grading outcomes are three-valued: correct, incorrect, or ungradable.
//! Refusals and samples the judge could not grade stay ungradable; they are
//! never coerced to incorrect, so refusal rate and accuracy keep independent
//! denominators downstream.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::dataset::Question;
use crate::gateway::{Attribution, ChatGateway, ChatModel, ChatRequest, RetryPolicy};
use crate::parser::{ExtractedAnswer, ParsedSample};
use crate::prompts::build_judge_messages;

/// How a sample's correctness was decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GradingMethod {
    Direct,
    Judge,
    Ungraded,
}

/// ParsedSample plus grading outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredSample {
    #[serde(flatten)]
    pub parsed: ParsedSample,
    /// None when the sample is ungradable (refusal, missing gold answer,
    /// judge unavailable).
    #[serde(default)]
    pub is_correct: Option<bool>,
    pub is_refusal: bool,
    pub grading_method: GradingMethod,
}

/// Judge model settings resolved from configuration.
#[derive(Debug, Clone)]
pub struct JudgeContext {
    pub model: ChatModel,
    pub temperature: f32,
    pub max_tokens: u32,
    pub retry: RetryPolicy,
}

/// Parse a binary verdict from a judge response using the same keyword
/// discipline as answer extraction. None means the judge produced no signal.
pub fn parse_judge_verdict(raw: &str) -> Option<bool> {
    let cleaned = raw.trim().to_ascii_lowercase();
    if cleaned.is_empty() {
        return None;
    }
    if cleaned == "correct" {
        return Some(true);
    }
    if cleaned == "incorrect" {
        return Some(false);
    }
    if cleaned.contains("incorrect") {
        return Some(false);
    }
    if cleaned.contains("correct") {
        return Some(true);
    }
    None
}

pub struct Scorer<'g> {
    gateway: &'g dyn ChatGateway,
    judge: Option<JudgeContext>,
}

impl<'g> Scorer<'g> {
    pub fn new(gateway: &'g dyn ChatGateway, judge: Option<JudgeContext>) -> Self {
        Self { gateway, judge }
    }

    /// Score one parsed sample against its question.
    pub async fn score(
        &self,
        parsed: ParsedSample,
        question: &Question,
        cancel: Option<&AtomicBool>,
    ) -> ScoredSample {
        let is_refusal = parsed.extracted_answer.is_refusal();

        let (is_correct, grading_method) = if is_refusal {
            // Refusals are ungradable by policy: excluded from the accuracy
            // denominator, counted in refusal rate.
            (None, GradingMethod::Ungraded)
        } else if let Some(gold_letter) = question.correct_letter() {
            match &parsed.extracted_answer {
                ExtractedAnswer::Letter(letter) => (
                    Some(letter.eq_ignore_ascii_case(&gold_letter)),
                    GradingMethod::Direct,
                ),
                ExtractedAnswer::Text(text) => {
                    // An open-format sample landed on an MCQ question. A bare
                    // letter still grades directly; anything longer needs the
                    // gold text and the judge.
                    let trimmed = text.trim();
                    let mut chars = trimmed.chars();
                    match (chars.next(), chars.next()) {
                        (Some(c), None) if c.is_ascii_alphabetic() => (
                            Some(c.eq_ignore_ascii_case(&gold_letter)),
                            GradingMethod::Direct,
                        ),
                        _ => match &question.correct_answer_text {
                            Some(gold_text) => {
                                self.judge_grade(question, gold_text, trimmed, cancel).await
                            }
                            None => (None, GradingMethod::Ungraded),
                        },
                    }
                }
                ExtractedAnswer::Refusal => (None, GradingMethod::Ungraded),
            }
        } else if let Some(gold_text) = &question.correct_answer_text {
            let candidate = match &parsed.extracted_answer {
                ExtractedAnswer::Text(text) => text.clone(),
                ExtractedAnswer::Letter(letter) => letter.to_string(),
                ExtractedAnswer::Refusal => String::new(),
            };
            self.judge_grade(question, gold_text, &candidate, cancel).await
        } else {
            // No gold answer of any kind.
            (None, GradingMethod::Ungraded)
        };

        ScoredSample {
            parsed,
            is_correct,
            is_refusal,
            grading_method,
        }
    }

    /// Score a batch, preserving input order. Samples whose question is
    /// missing from the lookup are dropped with a warning.
    pub async fn score_batch(
        &self,
        parsed: Vec<ParsedSample>,
        questions: &HashMap<(String, String), &Question>,
        concurrency: usize,
        cancel: Option<&AtomicBool>,
    ) -> Vec<ScoredSample> {
        let tasks = parsed.into_iter().filter_map(|sample| {
            let key = (sample.raw.dataset.clone(), sample.raw.question_id.clone());
            match questions.get(&key) {
                Some(question) => Some(self.score(sample, question, cancel)),
                None => {
                    warn!(
                        dataset = %key.0,
                        question_id = %key.1,
                        "question not found for scored sample; dropping"
                    );
                    None
                }
            }
        });

        stream::iter(tasks)
            .buffered(concurrency.max(1))
            .collect()
            .await
    }

    /// Grade a candidate answer against the gold text via the judge model.
    /// Judge exhaustion or an unparseable verdict leaves the sample
    /// ungraded; it never fails the run.
    async fn judge_grade(
        &self,
        question: &Question,
        gold_text: &str,
        candidate: &str,
        cancel: Option<&AtomicBool>,
    ) -> (Option<bool>, GradingMethod) {
        let Some(judge) = &self.judge else {
            return (None, GradingMethod::Ungraded);
        };
        if candidate.trim().is_empty() {
            return (None, GradingMethod::Ungraded);
        }

        let messages = build_judge_messages(&question.question_text, gold_text, candidate);
        let request = ChatRequest::new(
            judge.model.clone(),
            messages,
            Attribution::new("scorer::judge"),
        )
        .temperature(judge.temperature)
        .max_tokens(judge.max_tokens);

        let attempt = self.gateway.chat_with_retry(request, judge.retry, cancel).await;

        match attempt.outcome {
            Ok(resp) => match parse_judge_verdict(&resp.content) {
                Some(verdict) => (Some(verdict), GradingMethod::Judge),
                None => {
                    warn!(
                        question_id = %question.id,
                        verdict = %resp.content.trim(),
                        "judge verdict unparseable; leaving sample ungraded"
                    );
                    (None, GradingMethod::Ungraded)
                }
            },
            Err(err) => {
                warn!(
                    question_id = %question.id,
                    attempts = attempt.attempts,
                    error = %err,
                    "judge unavailable; leaving sample ungraded"
                );
                (None, GradingMethod::Ungraded)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::Condition;
    use crate::gateway::{ChatResponse, FinishReason, ProviderError};
    use crate::sampler::RawSample;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Gateway stub that always answers with fixed content (or always fails).
    struct StubGateway {
        content: Option<String>,
        calls: AtomicUsize,
    }

    impl StubGateway {
        fn answering(content: &str) -> Self {
            Self {
                content: Some(content.to_string()),
                calls: AtomicUsize::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                content: None,
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChatGateway for StubGateway {
        async fn chat(&self, _req: ChatRequest) -> Result<ChatResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.content {
                Some(content) => Ok(ChatResponse {
                    content: content.clone(),
                    input_tokens: 1,
                    output_tokens: 1,
                    latency: Duration::from_millis(1),
                    finish_reason: FinishReason::Stop,
                }),
                None => Err(ProviderError::provider("openai", "boom", true)),
            }
        }
    }

    fn judge_context() -> JudgeContext {
        JudgeContext {
            model: ChatModel::openai("judge-model"),
            temperature: 0.0,
            max_tokens: 16,
            retry: RetryPolicy::new(1, Duration::from_millis(1)).without_jitter(),
        }
    }

    fn mcq_question() -> Question {
        Question {
            dataset: "toy".into(),
            id: "q1".into(),
            question_text: "2+2?".into(),
            options: vec!["A. 3".into(), "B. 4".into()],
            correct_option_letter: Some("B".into()),
            correct_answer_text: None,
            subject: None,
            difficulty: None,
            metadata: Default::default(),
        }
    }

    fn open_question() -> Question {
        Question {
            options: vec![],
            correct_option_letter: None,
            correct_answer_text: Some("four".into()),
            ..mcq_question()
        }
    }

    fn parsed(answer: ExtractedAnswer, condition: Condition) -> ParsedSample {
        ParsedSample {
            raw: RawSample {
                dataset: "toy".into(),
                question_id: "q1".into(),
                model_id: "m".into(),
                condition,
                sample_index: 0,
                subject: None,
                difficulty: None,
                completion_text: "whatever".into(),
                attempt_count: 1,
                latency_ms: 0,
                error: None,
            },
            extracted_answer: answer,
            reasoning_token_estimate: 0,
        }
    }

    #[tokio::test]
    async fn mcq_letter_grades_directly_case_insensitive() {
        let gateway = StubGateway::answering("unused");
        let scorer = Scorer::new(&gateway, Some(judge_context()));

        let scored = scorer
            .score(
                parsed(ExtractedAnswer::Letter('b'), Condition::BaselineMc),
                &mcq_question(),
                None,
            )
            .await;

        assert_eq!(scored.is_correct, Some(true));
        assert_eq!(scored.grading_method, GradingMethod::Direct);
        assert!(!scored.is_refusal);
        assert_eq!(gateway.calls(), 0, "direct grading must not call the judge");
    }

    #[tokio::test]
    async fn wrong_letter_grades_incorrect_not_ungraded() {
        let gateway = StubGateway::answering("unused");
        let scorer = Scorer::new(&gateway, Some(judge_context()));

        let scored = scorer
            .score(
                parsed(ExtractedAnswer::Letter('A'), Condition::BaselineMc),
                &mcq_question(),
                None,
            )
            .await;

        assert_eq!(scored.is_correct, Some(false));
        assert_eq!(scored.grading_method, GradingMethod::Direct);
    }

    #[tokio::test]
    async fn refusal_is_ungradable_and_flagged() {
        let gateway = StubGateway::answering("unused");
        let scorer = Scorer::new(&gateway, Some(judge_context()));

        let scored = scorer
            .score(
                parsed(ExtractedAnswer::Refusal, Condition::BaselineMc),
                &mcq_question(),
                None,
            )
            .await;

        assert_eq!(scored.is_correct, None);
        assert!(scored.is_refusal);
        assert_eq!(scored.grading_method, GradingMethod::Ungraded);
    }

    #[tokio::test]
    async fn open_question_with_gold_text_routes_through_judge() {
        let gateway = StubGateway::answering("correct");
        let scorer = Scorer::new(&gateway, Some(judge_context()));

        let scored = scorer
            .score(
                parsed(
                    ExtractedAnswer::Text("it is four".into()),
                    Condition::BaselineOpen,
                ),
                &open_question(),
                None,
            )
            .await;

        assert_eq!(scored.is_correct, Some(true));
        assert_eq!(scored.grading_method, GradingMethod::Judge);
        assert_eq!(gateway.calls(), 1, "judge must be consulted exactly once");
    }

    #[tokio::test]
    async fn judge_incorrect_verdict_grades_false() {
        let gateway = StubGateway::answering("Incorrect.");
        let scorer = Scorer::new(&gateway, Some(judge_context()));

        let scored = scorer
            .score(
                parsed(
                    ExtractedAnswer::Text("it is five".into()),
                    Condition::BaselineOpen,
                ),
                &open_question(),
                None,
            )
            .await;

        assert_eq!(scored.is_correct, Some(false));
        assert_eq!(scored.grading_method, GradingMethod::Judge);
    }

    #[tokio::test]
    async fn judge_exhaustion_leaves_sample_ungraded() {
        let gateway = StubGateway::failing();
        let scorer = Scorer::new(&gateway, Some(judge_context()));

        let scored = scorer
            .score(
                parsed(
                    ExtractedAnswer::Text("it is four".into()),
                    Condition::BaselineOpen,
                ),
                &open_question(),
                None,
            )
            .await;

        assert_eq!(scored.is_correct, None);
        assert_eq!(scored.grading_method, GradingMethod::Ungraded);
        // max_retries = 1 -> two attempts before giving up.
        assert_eq!(gateway.calls(), 2);
    }

    #[tokio::test]
    async fn no_gold_answer_means_ungraded() {
        let gateway = StubGateway::answering("correct");
        let scorer = Scorer::new(&gateway, Some(judge_context()));

        let mut question = open_question();
        question.correct_answer_text = None;

        let scored = scorer
            .score(
                parsed(
                    ExtractedAnswer::Text("anything".into()),
                    Condition::BaselineOpen,
                ),
                &question,
                None,
            )
            .await;

        assert_eq!(scored.is_correct, None);
        assert_eq!(scored.grading_method, GradingMethod::Ungraded);
        assert_eq!(gateway.calls(), 0);
    }

    #[test]
    fn verdict_parsing_keywords() {
        assert_eq!(parse_judge_verdict("correct"), Some(true));
        assert_eq!(parse_judge_verdict(" Correct.  "), Some(true));
        assert_eq!(parse_judge_verdict("incorrect"), Some(false));
        assert_eq!(
            parse_judge_verdict("The answer is incorrect because..."),
            Some(false)
        );
        assert_eq!(
            parse_judge_verdict("That is correct, well done"),
            Some(true)
        );
        assert_eq!(parse_judge_verdict("no idea"), None);
        assert_eq!(parse_judge_verdict(""), None);
    }
}
