use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use tiein_server::{
    catalog::{ToolCatalog, ToolDescriptor, ToolOutcome},
    config::OrchestratorLimits,
    error::GatewayError,
    orchestrator::GatewayOrchestrator,
    routes::router,
    upstream::{LineStream, UpstreamClient},
};
use tiein_shared::{ChatRequest, ChatResponse};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tower::ServiceExt;

/// Answers every round with the same lines after `delay`, or fails to open.
struct FixedUpstream {
    lines: Result<Vec<String>, u16>,
    delay: Duration,
    seen: Mutex<Vec<ChatRequest>>,
}

#[async_trait]
impl UpstreamClient for FixedUpstream {
    async fn open_stream(
        &self,
        request: &ChatRequest,
        _tools: &[ToolDescriptor],
    ) -> Result<LineStream, GatewayError> {
        self.seen.lock().unwrap().push(request.clone());
        tokio::time::sleep(self.delay).await;
        match &self.lines {
            Ok(lines) => Ok(futures_util::stream::iter(lines.clone().into_iter().map(Ok)).boxed()),
            Err(429) => Err(GatewayError::UpstreamRateLimited("quota".into())),
            Err(_) => Err(GatewayError::UpstreamTransport("down".into())),
        }
    }
}

#[derive(Default)]
struct CountingCatalog {
    executions: AtomicUsize,
}

#[async_trait]
impl ToolCatalog for CountingCatalog {
    async fn tools(&self, _group_id: &str) -> Vec<ToolDescriptor> {
        Vec::new()
    }

    async fn execute(&self, _tool_id: &str, _arguments: Map<String, Value>) -> ToolOutcome {
        self.executions.fetch_add(1, Ordering::SeqCst);
        ToolOutcome::ok("done")
    }
}

struct TestApp {
    router: Router,
    upstream: Arc<FixedUpstream>,
    catalog: Arc<CountingCatalog>,
}

fn test_app(lines: Result<Vec<String>, u16>, delay: Duration) -> TestApp {
    let upstream = Arc::new(FixedUpstream {
        lines,
        delay,
        seen: Mutex::default(),
    });
    let catalog = Arc::new(CountingCatalog::default());
    let gateway = Arc::new(GatewayOrchestrator::new(
        upstream.clone(),
        catalog.clone(),
        OrchestratorLimits::default(),
        "gpt-default",
    ));
    TestApp {
        router: router(gateway),
        upstream,
        catalog,
    }
}

fn app(lines: Result<Vec<String>, u16>) -> (Router, Arc<FixedUpstream>) {
    let app = test_app(lines, Duration::ZERO);
    (app.router, app.upstream)
}

/// Serve `router` on an ephemeral port and return the WebSocket chat URL.
async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("ws://{addr}/ws/chat")
}

fn tool_round_lines() -> Vec<String> {
    vec![
        r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","type":"function","function":{"name":"tool_1","arguments":"{}"}}]}}]}"#.to_string(),
        "data: [DONE]".to_string(),
    ]
}

fn hello_lines() -> Vec<String> {
    vec![
        r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#.to_string(),
        r#"data: {"choices":[{"delta":{"content":"lo"}}]}"#.to_string(),
        "data: [DONE]".to_string(),
    ]
}

fn post_chat(body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/chat")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn sse_data(body: &str) -> Vec<&str> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim)
        .collect()
}

#[tokio::test]
async fn health_check() {
    let (app, _) = app(Ok(vec![]));
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "OK");
}

#[tokio::test]
async fn streaming_chat_is_sse_ending_with_sentinel() {
    let (app, upstream) = app(Ok(hello_lines()));
    let response = app.oneshot(post_chat(r#"{"prompt":"hi"}"#)).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/event-stream"
    );
    let body = body_text(response).await;
    assert_eq!(
        sse_data(&body),
        vec![r#"{"chunk":"Hel"}"#, r#"{"chunk":"lo"}"#, "[DONE]"]
    );
    assert_eq!(upstream.seen.lock().unwrap()[0].model, "gpt-default");
}

#[tokio::test]
async fn non_streaming_chat_collects_content() {
    let (app, _) = app(Ok(hello_lines()));
    let response = app
        .oneshot(post_chat(r#"{"prompt":"hi","stream":false,"model":"gpt-4o"}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let answer: ChatResponse = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(answer.content, "Hello");
    assert_eq!(answer.model, "gpt-4o");
}

#[tokio::test]
async fn non_streaming_error_maps_to_status() {
    let (app, _) = app(Err(429));
    let response = app
        .oneshot(post_chat(r#"{"prompt":"hi","stream":false}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let payload: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(payload["code"], 429);
    assert_eq!(payload["success"], false);
}

#[tokio::test]
async fn streaming_error_uses_error_event() {
    let (app, _) = app(Err(502));
    let response = app.oneshot(post_chat(r#"{"prompt":"hi"}"#)).await.unwrap();
    let body = body_text(response).await;

    assert!(body
        .lines()
        .any(|line| line.strip_prefix("event:").map(str::trim) == Some("error")));
    let data = sse_data(&body);
    assert_eq!(data.len(), 2);
    let payload: Value = serde_json::from_str(data[0]).unwrap();
    assert_eq!(payload["code"], 502);
    assert_eq!(data[1], "[DONE]");
}

#[tokio::test]
async fn openai_get_endpoint_streams_bare_prompt() {
    let (app, upstream) = app(Ok(hello_lines()));
    let response = app
        .oneshot(
            Request::builder()
                .uri("/chat/openai?message=hello%20there")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    let body = body_text(response).await;
    assert_eq!(sse_data(&body).last(), Some(&"[DONE]"));
    let seen = upstream.seen.lock().unwrap();
    assert_eq!(seen[0].history[0].content.as_deref(), Some("hello there"));
}

#[tokio::test]
async fn malformed_body_is_rejected() {
    let (app, upstream) = app(Ok(hello_lines()));
    let response = app.oneshot(post_chat("{not json")).await.unwrap();
    assert!(response.status().is_client_error());
    assert!(upstream.seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn websocket_streams_each_line_as_a_text_frame() {
    let app = test_app(Ok(hello_lines()), Duration::ZERO);
    let url = serve(app.router).await;

    let (mut ws, _) = connect_async(url).await.unwrap();
    ws.send(WsMessage::Text(r#"{"prompt":"hi"}"#.into()))
        .await
        .unwrap();

    let mut lines = Vec::new();
    while let Some(Ok(WsMessage::Text(text))) = ws.next().await {
        let done = text == "[DONE]";
        lines.push(text);
        if done {
            break;
        }
    }
    assert_eq!(
        lines,
        vec![
            r#"{"chunk":"Hel"}"#.to_string(),
            r#"{"chunk":"lo"}"#.to_string(),
            "[DONE]".to_string(),
        ]
    );
}

#[tokio::test]
async fn websocket_close_mid_round_cancels_request() {
    let app = test_app(Ok(tool_round_lines()), Duration::from_millis(400));
    let upstream = app.upstream.clone();
    let catalog = app.catalog.clone();
    let url = serve(app.router).await;

    let (mut ws, _) = connect_async(url).await.unwrap();
    ws.send(WsMessage::Text(r#"{"prompt":"q"}"#.into()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    ws.close(None).await.unwrap();

    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(upstream.seen.lock().unwrap().len(), 1);
    assert_eq!(catalog.executions.load(Ordering::SeqCst), 0);
}
