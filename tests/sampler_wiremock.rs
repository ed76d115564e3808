use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use persona_harness::condition::Condition;
use persona_harness::config::{ModelConfig, Provider, SamplingConfig};
use persona_harness::dataset::Question;
use persona_harness::gateway::openai::ChatCompletionsAdapter;
use persona_harness::gateway::{NoopUsageSink, ProviderGateway};
use persona_harness::sampler::{sample_question, SamplingStopReason};
use persona_harness::store::{MemoryResultStore, ResultStore, SampleKey};
use persona_harness::RawSample;

fn success_body(content: &str) -> serde_json::Value {
    json!({
        "choices": [{
            "message": { "content": content },
            "finish_reason": "stop"
        }],
        "usage": { "prompt_tokens": 10, "completion_tokens": 10 }
    })
}

/// Fails with a 500 for the first `failures` requests, then succeeds.
struct FlakyProvider {
    failures: usize,
    calls: Arc<AtomicUsize>,
}

impl Respond for FlakyProvider {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            ResponseTemplate::new(500).set_body_json(json!({
                "error": { "message": "upstream unavailable", "code": "server_error" }
            }))
        } else {
            ResponseTemplate::new(200).set_body_json(success_body("The correct answer is (B)"))
        }
    }
}

fn gateway_for(server: &MockServer) -> ProviderGateway<NoopUsageSink> {
    let adapter = ChatCompletionsAdapter::openrouter(
        "sk-test",
        server.uri(),
        Duration::from_secs(5),
        None,
        None,
    )
    .unwrap();
    ProviderGateway::with_chat_completions(adapter, Arc::new(NoopUsageSink))
}

fn model() -> ModelConfig {
    ModelConfig {
        id: "test-model".into(),
        provider: Provider::OpenRouter,
        model_name: "test/model".into(),
        max_output_tokens: 512,
    }
}

fn sampling(num_samples: usize, max_retries: u32) -> SamplingConfig {
    SamplingConfig {
        num_samples_per_question: num_samples,
        temperature: 0.0,
        max_tokens: 256,
        max_retries,
        retry_base_delay_ms: 1,
        concurrency: 2,
        min_reasoning_tokens: 200,
    }
}

fn question() -> Question {
    Question {
        dataset: "toy".into(),
        id: "q1".into(),
        question_text: "2+2?".into(),
        options: vec!["A. 3".into(), "B. 4".into()],
        correct_option_letter: Some("B".into()),
        correct_answer_text: None,
        subject: Some("math".into()),
        difficulty: None,
        metadata: Default::default(),
    }
}

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    let server = MockServer::start().await;
    let calls = Arc::new(AtomicUsize::new(0));
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(FlakyProvider {
            failures: 2,
            calls: calls.clone(),
        })
        .mount(&server)
        .await;

    let gateway = gateway_for(&server);
    let store = MemoryResultStore::new();

    let report = sample_question(
        &gateway,
        &store,
        &question(),
        Condition::BaselineMc,
        &model(),
        &sampling(1, 3),
        false,
        None,
    )
    .await
    .unwrap();

    assert_eq!(report.stop_reason, SamplingStopReason::Completed);
    assert_eq!(report.samples.len(), 1);

    let sample = &report.samples[0];
    assert_eq!(sample.attempt_count, 3, "two failures then one success");
    assert!(sample.error.is_none());
    assert_eq!(sample.completion_text, "The correct answer is (B)");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn exhausted_retries_record_a_terminal_sample() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({
            "error": { "message": "always down", "code": "server_error" }
        })))
        .mount(&server)
        .await;

    let gateway = gateway_for(&server);
    let store = MemoryResultStore::new();

    let report = sample_question(
        &gateway,
        &store,
        &question(),
        Condition::BaselineMc,
        &model(),
        &sampling(1, 1),
        false,
        None,
    )
    .await
    .unwrap();

    // The batch still produces exactly one entry; failure is contained at
    // the sample granularity.
    assert_eq!(report.samples.len(), 1);
    assert_eq!(report.failed, 1);

    let sample = &report.samples[0];
    assert_eq!(sample.attempt_count, 2, "one attempt plus one retry");
    assert!(sample.completion_text.is_empty());
    assert!(sample.error.as_deref().unwrap().starts_with("provider_error"));

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 2);
}

#[tokio::test]
async fn fatal_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": { "message": "bad key", "code": "invalid_api_key" }
        })))
        .mount(&server)
        .await;

    let gateway = gateway_for(&server);
    let store = MemoryResultStore::new();

    let report = sample_question(
        &gateway,
        &store,
        &question(),
        Condition::BaselineMc,
        &model(),
        &sampling(1, 5),
        false,
        None,
    )
    .await
    .unwrap();

    let sample = &report.samples[0];
    assert_eq!(sample.attempt_count, 1);
    assert!(sample.error.as_deref().unwrap().starts_with("auth_error"));

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
}

#[tokio::test]
async fn produces_exactly_num_samples_entries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(success_body("The correct answer is (A)")),
        )
        .mount(&server)
        .await;

    let gateway = gateway_for(&server);
    let store = MemoryResultStore::new();

    let report = sample_question(
        &gateway,
        &store,
        &question(),
        Condition::BaselineMc,
        &model(),
        &sampling(5, 0),
        false,
        None,
    )
    .await
    .unwrap();

    assert_eq!(report.samples.len(), 5);
    let indices: Vec<usize> = report.samples.iter().map(|s| s.sample_index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn skip_existing_never_reissues_stored_samples() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(success_body("The correct answer is (B)")),
        )
        .mount(&server)
        .await;

    let gateway = gateway_for(&server);
    let store = MemoryResultStore::new();

    // Pre-populate sample_index 0.
    store
        .append(&RawSample {
            dataset: "toy".into(),
            question_id: "q1".into(),
            model_id: "test-model".into(),
            condition: Condition::BaselineMc,
            sample_index: 0,
            subject: None,
            difficulty: None,
            completion_text: "The correct answer is (B)".into(),
            attempt_count: 1,
            latency_ms: 1,
            error: None,
        })
        .unwrap();

    let report = sample_question(
        &gateway,
        &store,
        &question(),
        Condition::BaselineMc,
        &model(),
        &sampling(2, 0),
        true,
        None,
    )
    .await
    .unwrap();

    assert_eq!(report.skipped_existing, 1);
    assert_eq!(report.samples.len(), 1);
    assert_eq!(report.samples[0].sample_index, 1);

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 1, "stored sample must not be re-issued");

    assert!(store.exists(&SampleKey {
        dataset: "toy".into(),
        question_id: "q1".into(),
        model_id: "test-model".into(),
        condition: Condition::BaselineMc,
        sample_index: 1,
    }));
}
