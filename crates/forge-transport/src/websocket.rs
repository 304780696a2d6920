//! WebSocket transport: one duplex channel per session at `/ws/{session_id}`.

use axum::{
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use forge_core::MessageType;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::{
    AppState,
    protocol::{self, ClientMessage},
};

/// WebSocket upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, session_id))
}

async fn handle_socket(socket: WebSocket, state: AppState, session_id: String) {
    let (mut sender, mut receiver) = socket.split();
    let (connection, mut outbound) = state.hub.connect(&session_id);

    // Forward hub output to the socket
    let send_task = tokio::spawn(async move {
        while let Some(envelope) = outbound.recv().await {
            let json = match serde_json::to_string(&envelope) {
                Ok(j) => j,
                Err(e) => {
                    error!("Failed to serialize envelope: {e}");
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    // Requests run in arrival order, outside the read loop
    let (requests, pending) = mpsc::unbounded_channel();
    tokio::spawn(dispatch(state.clone(), session_id.clone(), pending));

    while let Some(msg) = receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(s) => s.into(),
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                error!(%session_id, "WebSocket error: {e}");
                break;
            }
        };

        match ClientMessage::parse(&text) {
            Ok(message) => {
                if requests.send(message).is_err() {
                    break;
                }
            }
            Err(e) if e.is_reportable() => {
                warn!(%session_id, error = %e, "Rejected client message");
                state
                    .hub
                    .send(&session_id, protocol::error_reply(&session_id, e.reply_type(), &e));
            }
            Err(e) => warn!(%session_id, error = %e, "Ignoring client message"),
        }
    }

    send_task.abort();
    state.hub.disconnect(&session_id, connection);
    info!(%session_id, "WebSocket closed");
}

/// Handle one session's requests in order.
///
/// Keeps draining after the socket closes so in-flight turns still commit.
async fn dispatch(
    state: AppState,
    session_id: String,
    mut pending: mpsc::UnboundedReceiver<ClientMessage>,
) {
    while let Some(message) = pending.recv().await {
        handle_message(&state, &session_id, message).await;
    }
}

async fn handle_message(state: &AppState, session_id: &str, message: ClientMessage) {
    let reply = match message {
        ClientMessage::Init => match state.registry.init(session_id).await {
            Ok(outcome) => protocol::init_reply(session_id, &outcome),
            Err(e) => {
                error!(%session_id, error = %e, "Init failed");
                protocol::error_reply(session_id, MessageType::Init, e)
            }
        },
        ClientMessage::User { text } => {
            let mut turn = state.coordinator.submit_feedback(session_id, &text);
            while let Some(envelope) = turn.next().await {
                state.hub.send(session_id, envelope);
            }
            return;
        }
        ClientMessage::LoadCode => match state.coordinator.load_code(session_id).await {
            Ok(snapshot) => protocol::load_code_reply(session_id, &snapshot),
            Err(e) => protocol::error_reply(session_id, MessageType::LoadCode, e),
        },
        ClientMessage::EditCode { code_map } => {
            match state.coordinator.edit_code(session_id, &code_map).await {
                Ok(()) => protocol::edit_code_reply(session_id, &code_map),
                Err(e) => protocol::error_reply(session_id, MessageType::EditCode, e),
            }
        }
    };
    state.hub.send(session_id, reply);
}
