//! Public API handlers: login/logoff, registration, password reset, and
//! the authenticated roster/chat-list/me endpoints. Cookie-authenticated
//! POSTs go through a same-origin guard.

pub mod admin;

use axum::{
    extract::{FromRequestParts, Query, Request, State},
    http::{header, request::Parts, HeaderMap, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::{AuthError, LoginRequest, RegistrationRequest};
use crate::content;
use crate::models::User;
use crate::state::AppState;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("internal server error")]
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({
            "success": false,
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

/// The session token, from the `token` header or the `token` cookie.
pub fn extract_token(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get("token").and_then(|v| v.to_str().ok()) {
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    for pair in cookies.split(';') {
        let mut parts = pair.trim().splitn(2, '=');
        if parts.next() == Some("token") {
            let value = parts.next()?.to_string();
            if !value.is_empty() {
                return Some(value);
            }
        }
    }
    None
}

/// Extractor for handlers that require a valid session. Validating the
/// token also slides its TTL and touches the user's presence.
pub struct AuthedUser(pub String);

impl FromRequestParts<AppState> for AuthedUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = extract_token(&parts.headers).ok_or(ApiError::Unauthorized)?;
        let user_id = state
            .auth
            .get_user_id(&token)
            .ok_or(ApiError::Unauthorized)?;
        Ok(AuthedUser(user_id))
    }
}

// --- same-origin guard ---

fn host_of_url(url: &str) -> Option<&str> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    rest.split('/').next()
}

fn is_same_origin(headers: &HeaderMap, request_host: Option<&str>) -> bool {
    let Some(request_host) = request_host else {
        return false;
    };
    if let Some(origin) = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) {
        return host_of_url(origin) == Some(request_host);
    }
    let Some(referer) = headers.get(header::REFERER).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    host_of_url(referer) == Some(request_host)
}

/// Reject cross-origin POSTs: the Origin (or, failing that, Referer) host
/// must match the request host. CSRF protection for the cookie-based
/// session.
pub async fn require_same_origin(req: Request, next: Next) -> Response {
    if req.method() == Method::POST {
        let host = req
            .headers()
            .get(header::HOST)
            .and_then(|v| v.to_str().ok());
        if !is_same_origin(req.headers(), host) {
            return ApiError::Forbidden("Invalid Origin".to_string()).into_response();
        }
    }
    next.run(req).await
}

// --- cookies ---

fn session_cookie(token: &str, expires_at: i64) -> String {
    let expires = chrono::DateTime::from_timestamp(expires_at, 0)
        .unwrap_or_default()
        .format("%a, %d %b %Y %H:%M:%S GMT");
    format!("token={token}; Path=/; HttpOnly; Secure; Expires={expires}")
}

fn clear_session_cookie() -> &'static str {
    "token=; Path=/; HttpOnly; Secure; Max-Age=0"
}

// --- login / logoff ---

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_expiry: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct LoginForm {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    totp: String,
}

fn login_failure(status: StatusCode, message: String) -> Response {
    (
        status,
        Json(LoginResponse {
            success: false,
            message: Some(message),
            token: None,
            token_expiry: None,
        }),
    )
        .into_response()
}

/// POST /api/login
/// Accepts JSON or form-encoded credentials. Sets the session cookie on
/// success; every authentication failure is a uniform 401.
pub async fn login(State(state): State<AppState>, headers: HeaderMap, body: String) -> Response {
    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("application/json"));

    let request = if is_json {
        match serde_json::from_str::<LoginRequest>(&body) {
            Ok(req) => req,
            Err(_) => return ApiError::BadRequest("Invalid request body".into()).into_response(),
        }
    } else {
        match serde_urlencoded::from_str::<LoginForm>(&body) {
            Ok(form) => LoginRequest {
                username: form.username,
                password: form.password,
                totp: form.totp.trim().parse().unwrap_or(0),
            },
            Err(_) => return ApiError::BadRequest("Failed to parse form".into()).into_response(),
        }
    };

    if let Err(e) = content::validate_username(&request.username) {
        return ApiError::BadRequest(format!("Invalid username: {e}")).into_response();
    }

    match state.auth.login(&request) {
        Ok(grant) => {
            let cookie = session_cookie(&grant.token, grant.token_expiry);
            (
                [(header::SET_COOKIE, cookie)],
                Json(LoginResponse {
                    success: true,
                    message: None,
                    token: Some(grant.token),
                    token_expiry: Some(grant.token_expiry),
                }),
            )
                .into_response()
        }
        Err(e @ AuthError::Throttled { .. }) => {
            login_failure(StatusCode::UNAUTHORIZED, e.to_string())
        }
        Err(AuthError::Storage(e)) => {
            tracing::error!(error = %e, "login storage failure");
            login_failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error".to_string(),
            )
        }
        // Everything else is deliberately indistinguishable.
        Err(_) => login_failure(StatusCode::UNAUTHORIZED, "Login failed".to_string()),
    }
}

/// POST /api/logoff
/// Revokes the session if one is presented and clears the cookie either
/// way.
pub async fn logoff(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(token) = extract_token(&headers) {
        state.auth.logoff(&token);
    }
    (
        [(header::SET_COOKIE, clear_session_cookie())],
        StatusCode::OK,
    )
        .into_response()
}

// --- registration ---

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// POST /api/register
/// Completes an invited user's registration, grows the DM mesh and
/// announces the newcomer to everyone connected.
pub async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegistrationRequest>,
) -> Response {
    let grant = match state.auth.complete_registration(&request) {
        Ok(grant) => grant,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(RegistrationResponse {
                    success: false,
                    message: Some(e.to_string()),
                    token: None,
                }),
            )
                .into_response();
        }
    };

    if let Some(user) = state.auth.get_user(&grant.user_id) {
        let users = state.auth.get_users();
        if let Err(e) = state.hub.ensure_dms_for(&user, &users) {
            tracing::error!(user_id = %user.id, error = %e, "failed to create DMs for new user");
        }
        state.hub.broadcast_new_user(&user);
    }

    let cookie = session_cookie(&grant.token, grant.token_expiry);
    (
        [(header::SET_COOKIE, cookie)],
        Json(RegistrationResponse {
            success: true,
            message: None,
            token: Some(grant.token),
        }),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct RegisterInfoQuery {
    #[serde(default)]
    pub token: String,
}

/// GET /api/register-info?token=…
/// What the registration page needs: username, display name and the TOTP
/// secret for the QR code.
pub async fn register_info(
    State(state): State<AppState>,
    Query(query): Query<RegisterInfoQuery>,
) -> Result<Response, ApiError> {
    if query.token.is_empty() {
        return Err(ApiError::BadRequest("Token required".to_string()));
    }
    let mut info = state
        .auth
        .get_registration_info(&query.token)
        .map_err(|e| ApiError::NotFound(e.to_string()))?;

    info.username = content::escape(&info.username);
    info.display_name = content::escape(&info.display_name);
    Ok(Json(info).into_response())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetPasswordResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub setup_link: String,
}

/// POST /api/reset-password
/// Self-service reset: revokes every session (including this one), kicks
/// any live websocket and hands back a fresh setup link.
pub async fn reset_password(
    State(state): State<AppState>,
    AuthedUser(user_id): AuthedUser,
) -> Result<Response, ApiError> {
    let token = state.auth.reset_password(&user_id).map_err(|e| {
        tracing::error!(user_id = %user_id, error = %e, "failed to reset password");
        ApiError::Internal
    })?;

    state.hub.disconnect_user(&user_id);

    Ok((
        [(header::SET_COOKIE, clear_session_cookie())],
        Json(ResetPasswordResponse {
            success: true,
            message: None,
            setup_link: setup_link_path(&token),
        }),
    )
        .into_response())
}

/// Relative setup link; the admin listener prefixes the base URL.
pub fn setup_link_path(token: &str) -> String {
    let query = serde_urlencoded::to_string([("token", token)]).unwrap_or_default();
    format!("/register.html?{query}")
}

// --- authenticated reads ---

#[derive(Debug, Serialize)]
pub struct MeResponse {
    pub id: String,
    pub name: String,
}

/// GET /api/me
pub async fn me(
    State(state): State<AppState>,
    AuthedUser(user_id): AuthedUser,
) -> Result<Json<MeResponse>, ApiError> {
    let user = state
        .auth
        .get_user(&user_id)
        .ok_or_else(|| ApiError::NotFound("User not found".to_string()))?;
    Ok(Json(MeResponse {
        id: user.id,
        name: content::escape(&user.display_name),
    }))
}

/// GET /api/users
/// Roster of active users with their live connection state.
pub async fn users(
    State(state): State<AppState>,
    AuthedUser(_user_id): AuthedUser,
) -> Json<Vec<User>> {
    let mut users = state.auth.get_users();
    for user in &mut users {
        user.display_name = content::escape(&user.display_name);
        user.username = content::escape(&user.username);
        user.presence.online = state.hub.is_user_online(&user.id);
    }
    Json(users)
}

/// GET /api/chats
/// The caller's chat list: Town Hall first, then DMs.
pub async fn chats(
    State(state): State<AppState>,
    AuthedUser(user_id): AuthedUser,
) -> Json<Vec<crate::models::Chat>> {
    let mut chats = state.hub.get_chats(&user_id);
    for chat in &mut chats {
        chat.name = content::escape(&chat.name);
    }
    Json(chats)
}
