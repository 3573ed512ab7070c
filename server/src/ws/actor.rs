//! Actor-per-connection: a reader task pumps decoded client frames into a
//! channel; the main loop multiplexes those frames, the hub's delivery
//! queue and the shutdown signal. A read failure is the normal close path.

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::models::ClientFrame;
use crate::state::AppState;

/// Inbound frames waiting for dispatch; small because dispatch never
/// blocks on the network.
const CLIENT_FRAME_BACKLOG: usize = 16;

pub async fn run_connection(socket: WebSocket, state: AppState, user_id: String) {
    let (connection_id, mut delivery) = state.hub.connect(&user_id);
    let (mut ws_sender, ws_receiver) = socket.split();

    let (frame_tx, mut frame_rx) = mpsc::channel::<ClientFrame>(CLIENT_FRAME_BACKLOG);
    let reader = tokio::spawn(read_frames(ws_receiver, frame_tx, user_id.clone()));

    let mut shutdown = state.shutdown.clone();

    loop {
        tokio::select! {
            frame = frame_rx.recv() => {
                match frame {
                    Some(frame) => state.hub.dispatch(&user_id, frame),
                    // Reader finished: the client went away.
                    None => break,
                }
            }
            event = delivery.recv() => {
                match event {
                    Some(event) => {
                        let json = match serde_json::to_string(&event) {
                            Ok(json) => json,
                            Err(e) => {
                                tracing::error!(user_id = %user_id, error = %e, "failed to encode server event");
                                continue;
                            }
                        };
                        if ws_sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    // Queue closed: the hub dropped its sender, the only
                    // one, because a newer connection superseded this one
                    // or the user was reset/deleted.
                    None => break,
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    let _ = ws_sender.send(Message::Close(None)).await;
    reader.abort();
    let _ = reader.await;

    state.hub.disconnect(&user_id, connection_id);
    tracing::info!(user_id = %user_id, "websocket actor stopped");
}

/// Decode text frames into [`ClientFrame`]s until the transport closes.
async fn read_frames(
    mut ws_receiver: SplitStream<WebSocket>,
    frames: mpsc::Sender<ClientFrame>,
    user_id: String,
) {
    loop {
        match ws_receiver.next().await {
            Some(Ok(Message::Text(text))) => {
                let frame: ClientFrame = match serde_json::from_str(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::warn!(user_id = %user_id, error = %e, "undecodable client frame, closing");
                        return;
                    }
                };
                if frames.send(frame).await.is_err() {
                    return;
                }
            }
            Some(Ok(Message::Close(_))) | None => {
                tracing::info!(user_id = %user_id, "client closed connection");
                return;
            }
            // Ping/pong are answered by the websocket layer; binary frames
            // are not part of the protocol.
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                tracing::info!(user_id = %user_id, error = %e, "websocket read ended");
                return;
            }
        }
    }
}
