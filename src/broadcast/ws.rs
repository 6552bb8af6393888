//! The crate's only `axum` entry point: a `GET /ws` route that upgrades
//! to a WebSocket and forwards every [`Broadcaster`] message verbatim
//! to the client. The handshake itself is `axum`'s.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use log::debug;
use tokio::sync::broadcast::error::RecvError;

use super::Broadcaster;

/// Builds the `GET /ws` route, ready to `.merge()` into a caller's `axum::Router`.
pub fn websocket_route(broadcaster: Broadcaster) -> Router {
    Router::new().route("/ws", get(handle_upgrade)).with_state(broadcaster)
}

async fn handle_upgrade(ws: WebSocketUpgrade, State(broadcaster): State<Broadcaster>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, broadcaster))
}

/// Registers a subscription on connect and removes it on disconnect, the
/// removal happening implicitly when the receiver, and this task with
/// it, is dropped.
async fn handle_socket(mut socket: WebSocket, broadcaster: Broadcaster) {
    let mut rx = broadcaster.subscribe();
    loop {
        tokio::select! {
            message = rx.recv() => {
                match message {
                    Ok(bytes) => {
                        let text = String::from_utf8_lossy(&bytes).into_owned();
                        if socket.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("websocket client lagged, skipped {skipped} messages");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            incoming = socket.recv() => {
                // Clients only observe; an inbound message or a closed
                // socket both end this connection's task.
                match incoming {
                    Some(Ok(_)) => {}
                    _ => break,
                }
            }
        }
    }
}
