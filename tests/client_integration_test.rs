//! Integration tests for the retrying client
//!
//! Every test runs against a local wiremock server, so status handling,
//! retry counts and headers are observed on the wire.

use chat_pipeline::retry::RetryConfig;
use chat_pipeline::{
    ChatClient, ChatOptions, ChatRequest, Error, ErrorKind, StreamEvent, WireMessage,
};
use futures::StreamExt;
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const COMPLETIONS: &str = "/v1/chat/completions";

fn completion_body(content: &str) -> serde_json::Value {
    json!({
        "id": "chatcmpl-1",
        "choices": [{
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
    })
}

fn options(server: &MockServer) -> ChatOptions {
    // Surfaces the client's retry and timeout logs under `--nocapture`.
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Debug)
        .try_init();

    ChatOptions::builder()
        .model("test-model")
        .endpoint(format!("{}/v1", server.uri()))
        .retry(RetryConfig::immediate())
        .build()
        .unwrap()
}

fn request() -> ChatRequest {
    ChatRequest::new(
        "test-model",
        vec![WireMessage::system("Be brief"), WireMessage::user("Hi")],
    )
}

#[tokio::test]
async fn test_successful_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(COMPLETIONS))
        .and(header("content-type", "application/json"))
        .and(body_partial_json(json!({"model": "test-model", "max_tokens": 1024})))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("Hello!")))
        .expect(1)
        .mount(&server)
        .await;

    let client = ChatClient::new(&options(&server)).unwrap();
    let response = client.call(&request()).await.unwrap();

    assert_eq!(response.id, "chatcmpl-1");
    assert_eq!(response.content(), "Hello!");
    assert_eq!(response.usage.total_tokens, 15);
}

#[tokio::test]
async fn test_call_raw_returns_body_verbatim() {
    let server = MockServer::start().await;
    let body = r#"{"id":"raw","choices":[]}"#;
    Mock::given(method("POST"))
        .and(path(COMPLETIONS))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&server)
        .await;

    let client = ChatClient::new(&options(&server)).unwrap();
    assert_eq!(client.call_raw(&request()).await.unwrap(), body);
}

#[tokio::test]
async fn test_bearer_token_sent_when_configured() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(COMPLETIONS))
        .and(header("authorization", "Bearer sk-test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("ok")))
        .expect(1)
        .mount(&server)
        .await;

    let options = ChatOptions::builder()
        .model("test-model")
        .endpoint(format!("{}/v1", server.uri()))
        .api_key("sk-test")
        .build()
        .unwrap();
    let client = ChatClient::new(&options).unwrap();

    assert!(client.call(&request()).await.is_ok());
}

#[tokio::test]
async fn test_no_authorization_header_without_credential() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(COMPLETIONS))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("ok")))
        .mount(&server)
        .await;

    let client = ChatClient::new(&options(&server)).unwrap();
    client.call(&request()).await.unwrap();

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    assert!(received[0].headers.get("authorization").is_none());
}

#[tokio::test]
async fn test_full_completions_url_used_as_is() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/relay/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("relayed")))
        .expect(1)
        .mount(&server)
        .await;

    let options = ChatOptions::builder()
        .model("test-model")
        .endpoint(format!("{}/relay/chat/completions", server.uri()))
        .build()
        .unwrap();
    let client = ChatClient::new(&options).unwrap();

    assert_eq!(client.call(&request()).await.unwrap().content(), "relayed");
}

#[tokio::test]
async fn test_unauthorized_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(COMPLETIONS))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
        .expect(1)
        .mount(&server)
        .await;

    let client = ChatClient::new(&options(&server)).unwrap();
    let err = client.call(&request()).await.unwrap_err();

    match err {
        Error::Api {
            kind,
            status,
            retryable,
            message,
        } => {
            assert_eq!(kind, ErrorKind::Auth);
            assert_eq!(status, 401);
            assert!(!retryable);
            assert!(message.contains("invalid api key"));
        }
        other => panic!("expected API error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_rate_limit_retried_until_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(COMPLETIONS))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(3)
        .expect(3)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(COMPLETIONS))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("finally")))
        .expect(1)
        .mount(&server)
        .await;

    let client = ChatClient::new(&options(&server)).unwrap();
    let response = client.call(&request()).await.unwrap();

    assert_eq!(response.content(), "finally");
    assert_eq!(server.received_requests().await.unwrap().len(), 4);
}

#[tokio::test]
async fn test_server_errors_exhaust_retries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(COMPLETIONS))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .expect(4)
        .mount(&server)
        .await;

    let client = ChatClient::new(&options(&server)).unwrap();
    let err = client.call(&request()).await.unwrap_err();

    assert_eq!(err.kind(), Some(ErrorKind::Server));
    assert_eq!(err.status(), Some(503));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_custom_retry_count() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(COMPLETIONS))
        .respond_with(ResponseTemplate::new(500))
        .expect(2)
        .mount(&server)
        .await;

    let client = ChatClient::new(&options(&server))
        .unwrap()
        .with_retry(RetryConfig::immediate().with_max_retries(1));

    assert!(client.call(&request()).await.is_err());
}

#[tokio::test]
async fn test_attempt_timeout_cancels_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(COMPLETIONS))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(completion_body("too late"))
                .set_delay(Duration::from_secs(5)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = ChatClient::new(&options(&server))
        .unwrap()
        .with_timeout(Duration::from_millis(100));
    let err = client.call(&request()).await.unwrap_err();

    assert!(matches!(err, Error::Timeout));
    assert_eq!(err.kind(), Some(ErrorKind::Transport));
}

#[tokio::test]
async fn test_malformed_success_body_is_json_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(COMPLETIONS))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>gateway</html>"))
        .mount(&server)
        .await;

    let client = ChatClient::new(&options(&server)).unwrap();
    assert!(matches!(
        client.call(&request()).await,
        Err(Error::Json(_))
    ));
}

#[tokio::test]
async fn test_null_content_reads_as_empty() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(COMPLETIONS))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-2",
            "choices": [{
                "message": {"role": "assistant", "content": null},
                "finish_reason": "content_filter"
            }],
            "usage": null
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = ChatClient::new(&options(&server)).unwrap();
    let response = client.call(&request()).await.unwrap();

    assert_eq!(response.content(), "");
    assert_eq!(
        response.choices[0].finish_reason.as_deref(),
        Some("content_filter")
    );
    assert_eq!(response.usage.total_tokens, 0);
}

#[tokio::test]
async fn test_redirect_status_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(COMPLETIONS))
        .respond_with(ResponseTemplate::new(304))
        .expect(1)
        .mount(&server)
        .await;

    let client = ChatClient::new(&options(&server)).unwrap();
    let err = client.call(&request()).await.unwrap_err();

    assert_eq!(err.kind(), Some(ErrorKind::Unexpected));
    assert_eq!(err.status(), Some(304));
    assert!(!err.is_retryable());
}

// ============================================================================
// STREAMING
// ============================================================================

const SSE_BODY: &str = concat!(
    "data: {\"id\":\"c1\",\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
    ": keep-alive\n\n",
    "data: {\"id\":\"c1\",\"choices\":[{\"delta\":{\"content\":\"lo\"},\"finish_reason\":\"stop\"}]}\n\n",
    "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":2,\"total_tokens\":5}}\n\n",
    "data: [DONE]\n\n",
);

#[tokio::test]
async fn test_streaming_call_assembles_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(COMPLETIONS))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(ResponseTemplate::new(200).set_body_raw(SSE_BODY, "text/event-stream"))
        .expect(1)
        .mount(&server)
        .await;

    let client = ChatClient::new(&options(&server)).unwrap();
    let mut stream = client.call_streaming(&request()).await.unwrap();

    let mut deltas = Vec::new();
    let mut finished = None;
    while let Some(event) = stream.next().await {
        match event.unwrap() {
            StreamEvent::Delta(text) => deltas.push(text),
            StreamEvent::Done(response) => finished = Some(response),
            StreamEvent::Truncated(response) => panic!("unexpected truncation: {response:?}"),
        }
    }

    assert_eq!(deltas, vec!["Hel", "lo"]);
    let response = finished.expect("stream should finish with a response");
    assert_eq!(response.id, "c1");
    assert_eq!(response.content(), "Hello");
    assert_eq!(response.choices[0].finish_reason.as_deref(), Some("stop"));
    assert_eq!(response.usage.total_tokens, 5);
}

#[tokio::test]
async fn test_streaming_status_errors_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(COMPLETIONS))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(COMPLETIONS))
        .respond_with(ResponseTemplate::new(200).set_body_raw(SSE_BODY, "text/event-stream"))
        .expect(1)
        .mount(&server)
        .await;

    let client = ChatClient::new(&options(&server)).unwrap();
    let response = client
        .call_streaming(&request())
        .await
        .unwrap()
        .collect()
        .await
        .unwrap();

    assert_eq!(response.content(), "Hello");
}

#[tokio::test]
async fn test_streaming_forbidden_is_terminal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(COMPLETIONS))
        .respond_with(ResponseTemplate::new(403))
        .expect(1)
        .mount(&server)
        .await;

    let client = ChatClient::new(&options(&server)).unwrap();
    let err = client.call_streaming(&request()).await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::Auth));
}
