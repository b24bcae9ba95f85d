use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nl2sql_harness::gateway::openrouter::{ChatProvider, OpenRouterAdapter};
use nl2sql_harness::gateway::usage::CallStatus;
use nl2sql_harness::gateway::{
    Attribution, ChatGateway, ChatModel, ChatRequest, FinishReason, GatewayConfig,
    MemoryUsageSink, Message, NoopUsageSink, ProviderError, ProviderGateway,
};
use nl2sql_harness::{
    GatewayModelClient, MemorySessionStore, ModelClient, ModelClientConfig, ModelTier, Pipeline,
    PromptInstance, TerminationReason,
};
use serde_json::json;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

const MODEL: &str = "meta-llama/llama-3-70b-instruct";

fn request() -> ChatRequest {
    ChatRequest::new(
        ChatModel::openrouter(MODEL),
        vec![Message::user("hi")],
        Attribution::new("test").with_session("1"),
    )
}

fn adapter(server: &MockServer) -> OpenRouterAdapter {
    OpenRouterAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5)).unwrap()
}

fn no_delay(max_retries: u32) -> GatewayConfig {
    GatewayConfig {
        max_retries,
        retry_base_delay: Duration::from_millis(0),
    }
}

#[tokio::test]
async fn openrouter_parses_success_content_and_usage() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": { "content": "SELECT donor, SUM(amount) FROM contributions GROUP BY donor;" },
                "finish_reason": "stop"
            }],
            "usage": {
                "prompt_tokens": 10,
                "completion_tokens": 20,
                "cost_details": { "upstream_inference_cost": 0.000001 }
            }
        })))
        .mount(&server)
        .await;

    let resp = adapter(&server).chat(&request()).await.unwrap();
    assert_eq!(
        resp.content,
        "SELECT donor, SUM(amount) FROM contributions GROUP BY donor;"
    );
    assert_eq!(resp.finish_reason, FinishReason::Stop);
    assert_eq!(resp.input_tokens, 10);
    assert_eq!(resp.output_tokens, 20);
    assert_eq!(
        resp.cost_nanodollars,
        nl2sql_harness::gateway::chat_cost(MODEL, 10, 20)
    );
    assert_eq!(resp.upstream_cost_nanodollars, Some(1_000));
}

#[tokio::test]
async fn openrouter_tolerates_missing_usage() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "content": "yes" }, "finish_reason": "stop" }]
        })))
        .mount(&server)
        .await;

    let resp = adapter(&server).chat(&request()).await.unwrap();
    assert_eq!(resp.content, "yes");
    assert_eq!(resp.input_tokens, 0);
    assert_eq!(resp.output_tokens, 0);
    assert_eq!(resp.upstream_cost_nanodollars, None);
}

#[tokio::test]
async fn openrouter_returns_negative_sounding_content_as_text() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": { "content": "I cannot be sure these steps are right, so no." },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 1, "completion_tokens": 1 }
        })))
        .mount(&server)
        .await;

    let resp = adapter(&server).chat(&request()).await.unwrap();
    assert_eq!(resp.content, "I cannot be sure these steps are right, so no.");
}

#[tokio::test]
async fn openrouter_maps_refusal_in_error_body() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "error": { "message": "Refused: blocked by content policy", "code": 403 }
        })))
        .mount(&server)
        .await;

    let err = adapter(&server).chat(&request()).await.unwrap_err();
    assert!(matches!(err, ProviderError::Refused { .. }), "got {err:?}");
    assert_eq!(err.code(), "refused");
    assert_eq!(
        err.context().and_then(|c| c.provider_code.as_deref()),
        Some("403")
    );
}

#[tokio::test]
async fn openrouter_classifies_http_429_and_keeps_context() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("x-request-id", "abc123")
                .set_body_json(json!({
                    "error": { "message": "rate limited", "code": "rate_limit_exceeded" }
                })),
        )
        .mount(&server)
        .await;

    let err = adapter(&server).chat(&request()).await.unwrap_err();
    match err {
        ProviderError::RateLimited {
            retry_after,
            context,
        } => {
            assert_eq!(retry_after, Duration::from_secs(60));
            assert_eq!(context.http_status, Some(429));
            assert_eq!(context.provider_code.as_deref(), Some("rate_limit_exceeded"));
            assert_eq!(context.request_id.as_deref(), Some("abc123"));
        }
        other => panic!("expected RateLimited, got {other:?}"),
    }
}

#[tokio::test]
async fn openrouter_accepts_numeric_error_codes() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": { "message": "bad model", "code": 400 }
        })))
        .mount(&server)
        .await;

    let err = adapter(&server).chat(&request()).await.unwrap_err();
    assert!(!err.is_retryable());
    let ctx = err.context().expect("context");
    assert_eq!(ctx.http_status, Some(400));
    assert_eq!(ctx.provider_code.as_deref(), Some("400"));
    assert!(err.to_string().contains("bad model"));
}

#[derive(Clone)]
struct FlipResponder {
    calls: Arc<AtomicUsize>,
    first: ResponseTemplate,
    second: ResponseTemplate,
}

impl Respond for FlipResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n == 0 {
            self.first.clone()
        } else {
            self.second.clone()
        }
    }
}

fn flip_500_then_ok() -> FlipResponder {
    FlipResponder {
        calls: Arc::new(AtomicUsize::new(0)),
        first: ResponseTemplate::new(500).set_body_json(json!({
            "error": { "message": "transient error", "code": "internal" }
        })),
        second: ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": { "content": "ok" },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 1, "completion_tokens": 1 }
        })),
    }
}

#[tokio::test]
async fn provider_gateway_retries_on_retryable_errors_and_succeeds() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(flip_500_then_ok())
        .mount(&server)
        .await;

    let usage = Arc::new(MemoryUsageSink::new());
    let gateway = ProviderGateway::new(adapter(&server), usage.clone(), no_delay(1));

    let resp = gateway.chat(request()).await.unwrap();
    assert_eq!(resp.content, "ok");

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 2);

    let records = usage.records();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].status, CallStatus::Error);
    assert_eq!(records[0].attempt, 0);
    assert_eq!(records[1].status, CallStatus::Success);
    assert_eq!(records[1].attempt, 1);
    assert_eq!(records[1].session_id.as_deref(), Some("1"));
}

#[tokio::test]
async fn provider_gateway_without_retries_surfaces_first_failure() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(flip_500_then_ok())
        .mount(&server)
        .await;

    let gateway = ProviderGateway::new(
        adapter(&server),
        Arc::new(NoopUsageSink),
        GatewayConfig::no_retries(),
    );

    let err = gateway.chat(request()).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn provider_gateway_does_not_retry_permanent_errors() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": { "message": "no auth", "code": 401 }
        })))
        .mount(&server)
        .await;

    let gateway = ProviderGateway::new(adapter(&server), Arc::new(NoopUsageSink), no_delay(3));

    let err = gateway.chat(request()).await.unwrap_err();
    assert_eq!(err.code(), "upstream_error");
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

fn client_config(server: &MockServer, transport_retries: u32) -> ModelClientConfig {
    let mut config = ModelClientConfig::new("sk-test");
    config.base_url = server.uri();
    config.default_model_name = "fast".into();
    config.fallback_model_name = "strong".into();
    config.transport_retries = transport_retries;
    config.timeout = Duration::from_secs(5);
    config
}

fn prompt() -> PromptInstance {
    PromptInstance {
        template_slug: "test",
        system: "sys".into(),
        user: "user".into(),
    }
}

#[tokio::test]
async fn client_from_config_retries_only_on_higher_power_tier() {
    let default_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(flip_500_then_ok())
        .mount(&default_server)
        .await;

    let client =
        GatewayModelClient::from_config(&client_config(&default_server, 1), Arc::new(NoopUsageSink))
            .unwrap();
    let err = client
        .complete(&prompt(), ModelTier::Default, Attribution::new("test"))
        .await
        .unwrap_err();
    assert_eq!(err.tier, ModelTier::Default);
    assert_eq!(err.model, "fast");
    assert_eq!(default_server.received_requests().await.unwrap().len(), 1);

    let strong_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(flip_500_then_ok())
        .mount(&strong_server)
        .await;

    let usage = Arc::new(MemoryUsageSink::new());
    let client =
        GatewayModelClient::from_config(&client_config(&strong_server, 1), usage.clone()).unwrap();
    let completion = client
        .complete(&prompt(), ModelTier::HigherPower, Attribution::new("test"))
        .await
        .unwrap();
    assert_eq!(completion.text, "ok");
    assert_eq!(completion.model, "strong");
    assert_eq!(strong_server.received_requests().await.unwrap().len(), 2);
    assert_eq!(usage.records().len(), 2);
}

fn chat_reply(content: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "choices": [{ "message": { "content": content }, "finish_reason": "stop" }],
        "usage": { "prompt_tokens": 5, "completion_tokens": 5 }
    }))
}

#[tokio::test]
async fn hedged_grade_is_a_rejection_not_an_outage() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("expert at writing SQL queries"))
        .respond_with(chat_reply(
            "SELECT donor, SUM(amount) FROM contributions GROUP BY donor;",
        ))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("<sql_query>"))
        .respond_with(chat_reply("1. Reads contributions. 2. Sums amount per donor."))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("<steps>"))
        .respond_with(chat_reply("I cannot be sure these steps are right, so no."))
        .mount(&server)
        .await;

    let client =
        GatewayModelClient::from_config(&client_config(&server, 0), Arc::new(NoopUsageSink))
            .unwrap();
    let pipeline = Pipeline::new(
        Arc::new(client),
        Arc::new(MemorySessionStore::new()),
        "contributions(donor TEXT, amount REAL, date TEXT)",
    );

    let outcome = pipeline
        .run("1", "show total contributions by donor")
        .await
        .unwrap();
    assert_eq!(outcome.reason, TerminationReason::RetriesExhausted);
    assert_eq!(outcome.state.retry_count, 4);
    assert!(outcome.state.escalate);
    assert_eq!(
        outcome.sql_query,
        "SELECT donor, SUM(amount) FROM contributions GROUP BY donor;"
    );
    assert_eq!(server.received_requests().await.unwrap().len(), 12);
}
