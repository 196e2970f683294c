use crate::hub::{PluginHub, Registration, CLOSE_INVALID_REGISTRATION};
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use std::{future::Future, io, net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, sync::mpsc};
use tracing::{debug, info, warn};
use umb_core::wire::HubMessage;

const MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;

pub fn router(hub: Arc<PluginHub>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(|| async { "ok" }))
        .route("/sessions", get(sessions_handler))
        .with_state(hub)
}

pub async fn serve<F>(hub: Arc<PluginHub>, listener: TcpListener, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(
        listener,
        router(hub).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(hub): State<Arc<PluginHub>>,
) -> impl IntoResponse {
    ws.max_message_size(MAX_MESSAGE_BYTES)
        .on_upgrade(move |socket| async move {
            handle_socket(hub, socket, remote).await;
        })
}

async fn sessions_handler(State(hub): State<Arc<PluginHub>>) -> Json<Value> {
    let sessions = hub
        .sessions()
        .into_iter()
        .map(|session| {
            (
                session.session_id,
                json!({
                    "project": session.project,
                    "hash": session.hash,
                    "unity_version": session.unity_version,
                    "connected_at": session.connected_at,
                }),
            )
        })
        .collect::<Map<String, Value>>();
    Json(json!({ "sessions": sessions }))
}

async fn handle_socket(hub: Arc<PluginHub>, socket: WebSocket, remote: SocketAddr) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(hub.config().queue_capacity.max(1));
    let write_timeout = hub.config().write_timeout;
    let write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            let send = ws_sender.send(msg);
            if tokio::time::timeout(write_timeout, send).await.is_err() || closing {
                return;
            }
        }
    });

    let conn_id = hub.next_conn_id();
    info!(event = "plugin_connected", conn_id = %conn_id, remote = %remote);

    match serde_json::to_string(&hub.welcome()) {
        Ok(text) => {
            let _ = tx.send(Message::Text(text)).await;
        }
        Err(err) => warn!(event = "welcome_encode_error", error = %err),
    }
    let keep_alive = hub.clone().start_keep_alive(conn_id.clone(), tx.clone());

    let mut bound: Option<String> = None;
    while let Some(result) = ws_receiver.next().await {
        let msg = match result {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "plugin_read_error", conn_id = %conn_id, error = %err);
                break;
            }
        };
        let data = match msg {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(bytes) => bytes,
            Message::Close(_) => {
                info!(event = "plugin_close", conn_id = %conn_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                if let Some(session_id) = bound.as_deref() {
                    hub.touch(session_id);
                }
                continue;
            }
        };
        let message: HubMessage = match serde_json::from_slice(&data) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "plugin_message_invalid", conn_id = %conn_id, error = %err);
                continue;
            }
        };
        if let Some(session_id) = bound.as_deref() {
            hub.touch(session_id);
        }

        match message {
            HubMessage::Register { .. } => match Registration::from_message(&message) {
                Some(registration) => {
                    bound = Some(registration.session_id.clone());
                    hub.register_session(&conn_id, tx.clone(), registration);
                }
                None => {
                    warn!(event = "plugin_register_invalid", conn_id = %conn_id);
                    let _ = tx
                        .send(Message::Close(Some(CloseFrame {
                            code: CLOSE_INVALID_REGISTRATION,
                            reason: "register requires session_id and project_hash".into(),
                        })))
                        .await;
                    break;
                }
            },
            HubMessage::CommandResult { id, result } => match id.filter(|id| !id.is_empty()) {
                Some(id) => {
                    hub.complete(&id, result.unwrap_or_else(|| json!({})));
                }
                None => warn!(event = "plugin_result_missing_id", conn_id = %conn_id),
            },
            HubMessage::Pong { session_id } => {
                if let Some(session_id) = session_id.as_deref().or(bound.as_deref()) {
                    hub.touch(session_id);
                }
            }
            other => {
                debug!(event = "plugin_message_ignored", conn_id = %conn_id, kind = other.kind());
            }
        }
    }

    hub.handle_disconnect(&conn_id);
    if let Some(task) = keep_alive {
        task.abort();
    }
    drop(tx);
    let _ = tokio::time::timeout(write_timeout, write_task).await;
}
