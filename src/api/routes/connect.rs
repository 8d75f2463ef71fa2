//! Websocket endpoint hosting protocol sessions.

use crate::api::AppState;
use crate::protocol::{Frame, ServerSession, WireFormat};
use crate::tasks::TaskManager;
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, header},
    response::Response,
};
use futures::{SinkExt, StreamExt, future};

/// GET /connect - Upgrade to a websocket carrying the multiplexed protocol
///
/// The wire format is negotiated from the `Accept` header.
#[utoipa::path(
    get,
    path = "/connect",
    tag = "protocol",
    responses(
        (status = 101, description = "Switching to the websocket protocol"),
        (status = 401, description = "Missing or invalid API key", body = crate::error::ApiError)
    )
)]
pub async fn connect(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let accept = headers.get(header::ACCEPT).and_then(|v| v.to_str().ok());
    let format = WireFormat::negotiate(accept);
    let tasks = state.tasks().clone();
    ws.on_upgrade(move |socket| serve_socket(tasks, format, socket))
}

async fn serve_socket(tasks: TaskManager, format: WireFormat, socket: WebSocket) {
    let (sink, stream) = socket.split();

    let inbound = stream
        .take_while(|message| {
            future::ready(matches!(message, Ok(message) if !matches!(message, Message::Close(_))))
        })
        .filter_map(|message| {
            future::ready(match message {
                Ok(Message::Text(text)) => Some(Frame::Text(text)),
                Ok(Message::Binary(bytes)) => Some(Frame::Binary(bytes)),
                _ => None,
            })
        });
    let outbound = sink.with(|frame: Frame| {
        future::ready(Ok::<_, axum::Error>(match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(bytes) => Message::Binary(bytes),
        }))
    });

    ServerSession::run(tasks, format, inbound, outbound).await;
}
