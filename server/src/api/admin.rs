//! Admin listener handlers, HTTP-Basic-guarded: invite, delete and
//! password-reset for users, as a minimal HTML page and as JSON.

use axum::{
    extract::{Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{Html, IntoResponse, Redirect, Response},
    Json,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha512;

use crate::auth::AuthError;
use crate::content;
use crate::models::User;
use crate::state::AppState;

use super::setup_link_path;

/// HTTP Basic guard with the operator credentials from configuration.
pub async fn require_basic_auth(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    if !basic_auth_ok(req.headers(), &state.admin_user, &state.admin_password) {
        return (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"Restricted\"")],
            "Unauthorized",
        )
            .into_response();
    }
    next.run(req).await
}

fn basic_auth_ok(headers: &HeaderMap, user: &str, password: &str) -> bool {
    if password.is_empty() {
        return false;
    }
    let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = BASE64.decode(encoded.trim()) else {
        return false;
    };
    let Ok(credentials) = String::from_utf8(decoded) else {
        return false;
    };
    let mut parts = credentials.splitn(2, ':');
    let (Some(given_user), Some(given_password)) = (parts.next(), parts.next()) else {
        return false;
    };
    // Non-short-circuiting: a wrong username costs the same as a wrong
    // password.
    constant_time_eq(given_user.as_bytes(), user.as_bytes())
        & constant_time_eq(given_password.as_bytes(), password.as_bytes())
}

/// Credential comparison that does not leak position-of-mismatch or
/// length: compare one-shot keyed digests instead of the raw bytes, the
/// same care the password-hash check in auth takes.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let key: [u8; 32] = rand::random();
    let digest = |data: &[u8]| {
        let mut mac =
            Hmac::<Sha512>::new_from_slice(&key).expect("hmac accepts any key length");
        mac.update(data);
        mac.finalize().into_bytes()
    };
    digest(a) == digest(b)
}

fn absolute_setup_link(base_url: &str, token: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), setup_link_path(token))
}

// --- JSON endpoints ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddUserRequest {
    pub username: String,
    #[serde(default)]
    pub display_name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddUserResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setup_link: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminActionResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setup_link: Option<String>,
}

fn add_user(state: &AppState, username: &str, display_name: &str) -> Result<String, AuthError> {
    let display_name = if display_name.is_empty() {
        username
    } else {
        display_name
    };
    state.auth.add_user(username, display_name)
}

/// POST /admin/users
/// Invite a user. JSON in, JSON out; the HTML form on `/` posts
/// form-encoded data to the same path and gets the page re-rendered.
pub async fn add_user_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("application/json"));

    if is_json {
        let request: AddUserRequest = match serde_json::from_str(&body) {
            Ok(req) => req,
            Err(_) => {
                return (StatusCode::BAD_REQUEST, "Invalid request body").into_response();
            }
        };
        if request.username.is_empty() {
            return (StatusCode::BAD_REQUEST, "Username is required").into_response();
        }
        return match add_user(&state, &request.username, &request.display_name) {
            Ok(token) => Json(AddUserResponse {
                success: true,
                message: None,
                username: Some(request.username),
                setup_link: Some(absolute_setup_link(&state.base_url, &token)),
            })
            .into_response(),
            Err(e) => (
                StatusCode::BAD_REQUEST,
                Json(AddUserResponse {
                    success: false,
                    message: Some(format!("Failed to create user: {e}")),
                    username: None,
                    setup_link: None,
                }),
            )
                .into_response(),
        };
    }

    #[derive(Deserialize)]
    struct AddUserForm {
        #[serde(default)]
        username: String,
        #[serde(default, rename = "displayName")]
        display_name: String,
    }
    let form: AddUserForm = match serde_urlencoded::from_str(&body) {
        Ok(form) => form,
        Err(_) => return (StatusCode::BAD_REQUEST, "Failed to parse form").into_response(),
    };
    if form.username.is_empty() {
        return (StatusCode::BAD_REQUEST, "Username is required").into_response();
    }

    match add_user(&state, &form.username, &form.display_name) {
        Ok(token) => {
            let link = absolute_setup_link(&state.base_url, &token);
            render_users_page(&state, Some(&link), None)
        }
        Err(e) => render_users_page(&state, None, Some(&e.to_string())),
    }
}

#[derive(Debug, Deserialize)]
pub struct UserIdQuery {
    #[serde(default)]
    pub id: String,
}

/// DELETE /admin/users?id=… (also DELETE /api/users)
pub async fn delete_user_handler(
    State(state): State<AppState>,
    Query(query): Query<UserIdQuery>,
) -> Response {
    if query.id.is_empty() {
        return (StatusCode::BAD_REQUEST, "User ID is required").into_response();
    }
    match state.auth.delete_user(&query.id) {
        Ok(()) => {
            state.hub.remove_deleted_user(&query.id);
            Json(AdminActionResponse {
                success: true,
                message: format!("User {} deleted", query.id),
                setup_link: None,
            })
            .into_response()
        }
        Err(AuthError::UserNotFound) => (
            StatusCode::NOT_FOUND,
            Json(AdminActionResponse {
                success: false,
                message: "User not found".to_string(),
                setup_link: None,
            }),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(AdminActionResponse {
                success: false,
                message: format!("Failed to delete user: {e}"),
                setup_link: None,
            }),
        )
            .into_response(),
    }
}

/// POST /admin/users/delete — the HTML form variant.
pub async fn delete_user_form(State(state): State<AppState>, body: String) -> Response {
    #[derive(Deserialize)]
    struct DeleteForm {
        #[serde(default)]
        id: String,
    }
    if let Ok(form) = serde_urlencoded::from_str::<DeleteForm>(&body) {
        if !form.id.is_empty() && state.auth.delete_user(&form.id).is_ok() {
            state.hub.remove_deleted_user(&form.id);
        }
    }
    Redirect::to("/").into_response()
}

/// POST /api/users/reset-password?id=…
/// Operator-driven reset: revokes sessions, kicks the websocket and
/// returns the new setup link.
pub async fn reset_password_handler(
    State(state): State<AppState>,
    Query(query): Query<UserIdQuery>,
) -> Response {
    if query.id.is_empty() {
        return (StatusCode::BAD_REQUEST, "User ID is required").into_response();
    }
    match state.auth.reset_password(&query.id) {
        Ok(token) => {
            state.hub.disconnect_user(&query.id);
            Json(AdminActionResponse {
                success: true,
                message: format!("Password for user {} reset successfully", query.id),
                setup_link: Some(absolute_setup_link(&state.base_url, &token)),
            })
            .into_response()
        }
        Err(AuthError::UserNotFound) => (
            StatusCode::NOT_FOUND,
            Json(AdminActionResponse {
                success: false,
                message: "User not found".to_string(),
                setup_link: None,
            }),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(AdminActionResponse {
                success: false,
                message: format!("Failed to reset user password: {e}"),
                setup_link: None,
            }),
        )
            .into_response(),
    }
}

/// GET /api/users — every user regardless of status.
pub async fn list_users_handler(State(state): State<AppState>) -> Json<Vec<User>> {
    Json(state.auth.get_all_users())
}

// --- HTML ---

/// GET / — user list plus invite form.
pub async fn home(State(state): State<AppState>) -> Response {
    render_users_page(&state, None, None)
}

fn render_users_page(state: &AppState, new_link: Option<&str>, error: Option<&str>) -> Response {
    let mut rows = String::new();
    let mut users = state.auth.get_all_users();
    users.sort_by(|a, b| a.username.cmp(&b.username));
    for user in &users {
        let status = match user.status {
            crate::models::UserStatus::Created => "created",
            crate::models::UserStatus::Active => "active",
            crate::models::UserStatus::Deleted => "deleted",
        };
        rows.push_str(&format!(
            "<tr><td>{username}</td><td>{display}</td><td>{status}</td><td>{id}</td>\
             <td><form method=\"post\" action=\"/admin/users/delete\">\
             <input type=\"hidden\" name=\"id\" value=\"{id}\">\
             <button type=\"submit\">delete</button></form></td></tr>\n",
            username = content::escape(&user.username),
            display = content::escape(&user.display_name),
            id = content::escape(&user.id),
        ));
    }

    let notice = match (new_link, error) {
        (Some(link), _) => format!(
            "<p>Setup link: <a href=\"{link}\">{link}</a></p>",
            link = content::escape(link)
        ),
        (None, Some(error)) => format!("<p class=\"error\">{}</p>", content::escape(error)),
        (None, None) => String::new(),
    };

    let page = format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>Besedka admin</title></head>
<body>
<h1>Users</h1>
{notice}
<table border="1">
<tr><th>username</th><th>display name</th><th>status</th><th>id</th><th></th></tr>
{rows}
</table>
<h2>Invite user</h2>
<form method="post" action="/admin/users">
  <input name="username" placeholder="username" required>
  <input name="displayName" placeholder="display name">
  <button type="submit">invite</button>
</form>
</body>
</html>
"#
    );

    Html(page).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth_header(user: &str, pass: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let encoded = BASE64.encode(format!("{user}:{pass}"));
        headers.insert(
            header::AUTHORIZATION,
            format!("Basic {encoded}").parse().unwrap(),
        );
        headers
    }

    #[test]
    fn basic_auth_matches_exact_credentials() {
        let headers = auth_header("admin", "s3cret");
        assert!(basic_auth_ok(&headers, "admin", "s3cret"));
        assert!(!basic_auth_ok(&headers, "admin", "other"));
        assert!(!basic_auth_ok(&headers, "root", "s3cret"));
        assert!(!basic_auth_ok(&HeaderMap::new(), "admin", "s3cret"));
        // An empty configured password locks the listener shut.
        assert!(!basic_auth_ok(&auth_header("admin", ""), "admin", ""));
    }

    #[test]
    fn credential_comparison_handles_length_mismatches() {
        assert!(constant_time_eq(b"s3cret", b"s3cret"));
        assert!(!constant_time_eq(b"s3cret", b"s3cre"));
        assert!(!constant_time_eq(b"s3cret", b"s3cretx"));
        assert!(!constant_time_eq(b"", b"s3cret"));
    }

    #[test]
    fn setup_links_are_absolute() {
        assert_eq!(
            absolute_setup_link("http://localhost:8080/", "t+k"),
            "http://localhost:8080/register.html?token=t%2Bk"
        );
    }
}
