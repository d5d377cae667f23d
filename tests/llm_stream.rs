//! Streaming chat-completions contract test against a mock server.

use garbo::backend::local::llm::{ChatClient, ChatMessage};
use garbo::config::LlmConfig;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tokio::sync::mpsc;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn sse_body(tokens: &[&str]) -> String {
    let mut body = String::new();
    for token in tokens {
        let chunk = serde_json::json!({
            "choices": [{ "delta": { "content": token }, "finish_reason": null }],
        });
        body.push_str(&format!("data: {chunk}\n\n"));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

fn config(server: &MockServer) -> LlmConfig {
    LlmConfig {
        api_url: server.uri(),
        api_key: "test-key".to_owned(),
        ..LlmConfig::default()
    }
}

#[tokio::test]
async fn tokens_stream_in_order() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("Authorization", "Bearer test-key"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(
                sse_body(&["Hello", " there", ", how can I help?"]),
                "text/event-stream",
            ),
        )
        .mount(&server)
        .await;

    let client = ChatClient::new(&config(&server));
    let (tx, mut rx) = mpsc::channel(16);
    client
        .stream(
            vec![
                ChatMessage::system("You are a phone agent."),
                ChatMessage::user("hi"),
            ],
            tx,
            Arc::new(AtomicBool::new(false)),
        )
        .await
        .expect("stream");

    let mut text = String::new();
    while let Some(token) = rx.recv().await {
        text.push_str(&token);
    }
    assert_eq!(text, "Hello there, how can I help?");
}

#[tokio::test]
async fn malformed_chunks_are_skipped() {
    let server = MockServer::start().await;
    let body = format!(
        "data: not json\n\n{}",
        sse_body(&["Fine, thanks for asking."])
    );
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let client = ChatClient::new(&config(&server));
    let (tx, mut rx) = mpsc::channel(16);
    client
        .stream(
            vec![ChatMessage::user("how are you?")],
            tx,
            Arc::new(AtomicBool::new(false)),
        )
        .await
        .expect("stream");

    let mut text = String::new();
    while let Some(token) = rx.recv().await {
        text.push_str(&token);
    }
    assert_eq!(text, "Fine, thanks for asking.");
}

#[tokio::test]
async fn http_errors_surface() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let client = ChatClient::new(&config(&server));
    let (tx, _rx) = mpsc::channel(16);
    let result = client
        .stream(
            vec![ChatMessage::user("hi")],
            tx,
            Arc::new(AtomicBool::new(false)),
        )
        .await;
    assert!(result.is_err());
}
