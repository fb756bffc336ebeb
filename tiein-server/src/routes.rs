use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query,
    },
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::Stream;
use serde::Deserialize;
use tiein_shared::{ChatRequest, ChatResponse, OutputFrame};
use tokio::sync::mpsc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::composer::prepare_request;
use crate::orchestrator::GatewayOrchestrator;

pub fn router(gateway: Arc<GatewayOrchestrator>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/chat",
            post({
                let gateway = gateway.clone();
                move |req| chat(req, gateway)
            }),
        )
        .route(
            "/chat/openai",
            get({
                let gateway = gateway.clone();
                move |query| chat_openai(query, gateway)
            }),
        )
        .route(
            "/ws/chat",
            get({
                let gateway = gateway.clone();
                move |ws| ws_handler(ws, gateway)
            }),
        )
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

async fn health() -> &'static str {
    "OK"
}

async fn chat(Json(request): Json<ChatRequest>, gateway: Arc<GatewayOrchestrator>) -> Response {
    if request.stream {
        return sse_response(gateway.start(request)).into_response();
    }

    let model = prepare_request(request.clone(), gateway.default_model()).model;
    let mut rx = gateway.start(request);
    let mut content = String::new();
    while let Some(frame) = rx.recv().await {
        match frame {
            OutputFrame::Chunk(text) => content.push_str(&text),
            OutputFrame::Error(payload) => {
                error!("Chat failed: {}", payload.message);
                let status = StatusCode::from_u16(payload.code)
                    .ok()
                    .filter(|s| s.is_server_error() || s.is_client_error())
                    .unwrap_or(StatusCode::BAD_GATEWAY);
                return (status, Json(payload)).into_response();
            }
            OutputFrame::Done => break,
        }
    }

    Json(ChatResponse { content, model }).into_response()
}

#[derive(Debug, Deserialize)]
struct PromptQuery {
    message: String,
}

async fn chat_openai(
    Query(query): Query<PromptQuery>,
    gateway: Arc<GatewayOrchestrator>,
) -> impl IntoResponse {
    sse_response(gateway.start(ChatRequest::from_prompt(query.message)))
}

/// One SSE event per output line. The response body ends after `[DONE]`,
/// and a dropped connection drops `rx`.
fn sse_response(
    mut rx: mpsc::Receiver<OutputFrame>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = async_stream::stream! {
        while let Some(frame) = rx.recv().await {
            let event = match &frame {
                OutputFrame::Error(_) => Event::default().event("error"),
                _ => Event::default(),
            };
            yield Ok::<Event, Infallible>(event.data(frame.to_line()));
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn ws_handler(ws: WebSocketUpgrade, gateway: Arc<GatewayOrchestrator>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, gateway))
}

enum SocketStep {
    Frame(Option<OutputFrame>),
    Incoming(Option<Result<Message, axum::Error>>),
}

async fn handle_socket(mut socket: WebSocket, gateway: Arc<GatewayOrchestrator>) {
    info!("WebSocket connection established");

    while let Some(msg) = socket.recv().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        let mut rx = match serde_json::from_str::<ChatRequest>(&text) {
            Ok(request) => {
                info!("WebSocket chat request with {} history messages", request.history.len());
                gateway.start(request)
            }
            Err(e) => {
                warn!("Failed to parse request: {}", e);
                let (tx, rx) = mpsc::channel(2);
                let _ = tx.try_send(OutputFrame::error(400, format!("Invalid request format: {e}")));
                let _ = tx.try_send(OutputFrame::Done);
                rx
            }
        };

        // Keep reading the socket while streaming so a disconnect drops `rx`
        // and cancels the request.
        loop {
            let step = tokio::select! {
                frame = rx.recv() => SocketStep::Frame(frame),
                incoming = socket.recv() => SocketStep::Incoming(incoming),
            };
            match step {
                SocketStep::Frame(Some(frame)) => {
                    if let Err(e) = socket.send(Message::Text(frame.to_line())).await {
                        error!("Failed to send frame: {}", e);
                        return;
                    }
                }
                SocketStep::Frame(None) => break,
                SocketStep::Incoming(Some(Ok(Message::Close(_))) | Some(Err(_)) | None) => {
                    info!("WebSocket client left mid-response; cancelling request");
                    return;
                }
                SocketStep::Incoming(Some(Ok(Message::Text(_)))) => {
                    warn!("Ignoring WebSocket message received while a response is streaming");
                }
                SocketStep::Incoming(Some(Ok(_))) => {}
            }
        }
    }

    info!("WebSocket connection closed");
}
