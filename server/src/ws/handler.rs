use axum::{
    extract::{ws::WebSocket, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};

use crate::api::extract_token;
use crate::state::AppState;
use crate::ws::actor;

/// GET /api/chat
/// Authenticates via the `token` cookie or header before upgrading; a bad
/// or missing token is rejected with 401 and never upgraded.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(token) = extract_token(&headers) else {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    };
    let Some(user_id) = state.auth.get_user_id(&token) else {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    };

    tracing::info!(user_id = %user_id, "websocket connection authenticated");
    ws.on_upgrade(move |socket| handle_authenticated(socket, state, user_id))
}

async fn handle_authenticated(socket: WebSocket, state: AppState, user_id: String) {
    actor::run_connection(socket, state, user_id).await;
}
