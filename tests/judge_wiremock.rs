use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use persona_harness::condition::Condition;
use persona_harness::dataset::Question;
use persona_harness::gateway::openai::ChatCompletionsAdapter;
use persona_harness::gateway::{ChatModel, NoopUsageSink, ProviderGateway, RetryPolicy};
use persona_harness::parser::{ExtractedAnswer, ParsedSample};
use persona_harness::scorer::{GradingMethod, JudgeContext, Scorer};
use persona_harness::RawSample;

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

fn judge_context() -> JudgeContext {
    JudgeContext {
        model: ChatModel::openrouter("judge/model"),
        temperature: 0.0,
        max_tokens: 16,
        retry: RetryPolicy::new(1, Duration::from_millis(1)).without_jitter(),
    }
}

fn open_question() -> Question {
    Question {
        dataset: "toy".into(),
        id: "q2".into(),
        question_text: "Which gas do plants absorb?".into(),
        options: vec![],
        correct_option_letter: None,
        correct_answer_text: Some("carbon dioxide".into()),
        subject: None,
        difficulty: None,
        metadata: Default::default(),
    }
}

fn parsed_text(answer: &str) -> ParsedSample {
    ParsedSample {
        raw: RawSample {
            dataset: "toy".into(),
            question_id: "q2".into(),
            model_id: "m".into(),
            condition: Condition::BaselineOpen,
            sample_index: 0,
            subject: None,
            difficulty: None,
            completion_text: format!("Reasoning.\nFinal answer: {answer}"),
            attempt_count: 1,
            latency_ms: 1,
            error: None,
        },
        extracted_answer: ExtractedAnswer::Text(answer.into()),
        reasoning_token_estimate: 3,
    }
}

#[tokio::test]
async fn judge_verdict_flows_through_the_gateway() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("strict grading assistant"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": { "content": "correct" },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 30, "completion_tokens": 1 }
        })))
        .mount(&server)
        .await;

    let gateway = gateway_for(&server);
    let scorer = Scorer::new(&gateway, Some(judge_context()));

    let scored = scorer
        .score(parsed_text("carbon dioxide"), &open_question(), None)
        .await;

    assert_eq!(scored.is_correct, Some(true));
    assert_eq!(scored.grading_method, GradingMethod::Judge);

    // The grading prompt must carry the gold and candidate answers.
    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let body = String::from_utf8_lossy(&requests[0].body).into_owned();
    assert!(body.contains("Official correct answer"));
    assert!(body.contains("carbon dioxide"));
}

#[tokio::test]
async fn judge_outage_downgrades_to_ungraded_after_retries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({
            "error": { "message": "judge down", "code": "server_error" }
        })))
        .mount(&server)
        .await;

    let gateway = gateway_for(&server);
    let scorer = Scorer::new(&gateway, Some(judge_context()));

    let scored = scorer
        .score(parsed_text("carbon dioxide"), &open_question(), None)
        .await;

    assert_eq!(scored.is_correct, None);
    assert_eq!(scored.grading_method, GradingMethod::Ungraded);
    assert!(!scored.is_refusal);

    // Judge retries follow the same schedule as sampling: 1 retry here.
    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
}
