//! Router construction for the two listeners.

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::api;
use crate::state::AppState;
use crate::ws;

/// The public API: auth endpoints, authenticated reads and the websocket
/// upgrade. Cookie-authenticated POSTs pass the same-origin guard first.
pub fn build_api_router(state: AppState) -> Router {
    Router::new()
        .route("/api/login", post(api::login))
        .route("/api/logoff", post(api::logoff))
        .route("/api/register", post(api::register))
        .route("/api/register-info", get(api::register_info))
        .route("/api/reset-password", post(api::reset_password))
        .route("/api/me", get(api::me))
        .route("/api/users", get(api::users))
        .route("/api/chats", get(api::chats))
        .route("/api/chat", get(ws::handler::ws_upgrade))
        .layer(middleware::from_fn(api::require_same_origin))
        .with_state(state)
}

/// The operator listener: HTML form plus JSON endpoints, all behind HTTP
/// Basic auth.
pub fn build_admin_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(api::admin::home))
        .route(
            "/admin/users",
            post(api::admin::add_user_handler).delete(api::admin::delete_user_handler),
        )
        .route("/admin/users/delete", post(api::admin::delete_user_form))
        .route(
            "/api/users",
            get(api::admin::list_users_handler).delete(api::admin::delete_user_handler),
        )
        .route(
            "/api/users/reset-password",
            post(api::admin::reset_password_handler),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            api::admin::require_basic_auth,
        ))
        .with_state(state)
}
