//! Shared harness: boots the full server (both listeners) on random ports
//! against a throwaway database.

use std::net::SocketAddr;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::net::TcpListener;
use tokio::sync::watch;

use besedka_server::auth::{totp, AuthConfig, AuthService};
use besedka_server::hub::Hub;
use besedka_server::routes;
use besedka_server::state::AppState;
use besedka_server::storage::Storage;

pub const ADMIN_USER: &str = "admin";
pub const ADMIN_PASSWORD: &str = "operator-secret";

pub struct TestServer {
    pub api_addr: SocketAddr,
    pub admin_addr: SocketAddr,
    pub client: reqwest::Client,
    _shutdown_tx: watch::Sender<bool>,
    _tmp: tempfile::TempDir,
}

impl TestServer {
    pub async fn start() -> Self {
        let tmp = tempfile::tempdir().expect("tempdir");
        let storage =
            Arc::new(Storage::open(tmp.path().join("besedka.db")).expect("open storage"));
        let auth = Arc::new(
            AuthService::new(
                AuthConfig {
                    secret: BASE64.encode(b"integration-test-secret"),
                    ..AuthConfig::default()
                },
                storage.clone(),
            )
            .expect("auth service"),
        );
        let hub = Hub::new(auth.clone(), storage.clone()).expect("hub");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let api_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind api");
        let api_addr = api_listener.local_addr().expect("api addr");
        let admin_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind admin");
        let admin_addr = admin_listener.local_addr().expect("admin addr");

        let state = AppState {
            auth,
            hub,
            base_url: format!("http://{api_addr}"),
            admin_user: ADMIN_USER.to_string(),
            admin_password: ADMIN_PASSWORD.to_string(),
            shutdown: shutdown_rx.clone(),
        };

        let api_router = routes::build_api_router(state.clone());
        let admin_router = routes::build_admin_router(state);

        let mut api_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            axum::serve(api_listener, api_router)
                .with_graceful_shutdown(async move {
                    let _ = api_shutdown.changed().await;
                })
                .await
                .expect("api listener");
        });
        let mut admin_shutdown = shutdown_rx;
        tokio::spawn(async move {
            axum::serve(admin_listener, admin_router)
                .with_graceful_shutdown(async move {
                    let _ = admin_shutdown.changed().await;
                })
                .await
                .expect("admin listener");
        });

        Self {
            api_addr,
            admin_addr,
            client: reqwest::Client::new(),
            _shutdown_tx: shutdown_tx,
            _tmp: tmp,
        }
    }

    pub fn api_url(&self, path: &str) -> String {
        format!("http://{}{path}", self.api_addr)
    }

    pub fn admin_url(&self, path: &str) -> String {
        format!("http://{}{path}", self.admin_addr)
    }

    /// Origin header value that passes the same-origin POST guard.
    pub fn origin(&self) -> String {
        format!("http://{}", self.api_addr)
    }

    /// Invite a user through the admin listener; returns the registration
    /// token extracted from the setup link.
    pub async fn invite(&self, username: &str) -> String {
        let response = self
            .client
            .post(self.admin_url("/admin/users"))
            .basic_auth(ADMIN_USER, Some(ADMIN_PASSWORD))
            .json(&serde_json::json!({ "username": username }))
            .send()
            .await
            .expect("invite request");
        assert!(response.status().is_success(), "invite failed");
        let body: serde_json::Value = response.json().await.expect("invite body");
        let link = body["setupLink"].as_str().expect("setup link");
        token_from_setup_link(link)
    }

    /// Full registration: invite, fetch the TOTP secret, complete with a
    /// current code. Returns (session token, totp secret).
    pub async fn register(&self, username: &str, password: &str) -> (String, String) {
        let reg_token = self.invite(username).await;

        let info: serde_json::Value = self
            .client
            .get(self.api_url("/api/register-info"))
            .query(&[("token", reg_token.as_str())])
            .send()
            .await
            .expect("register info request")
            .json()
            .await
            .expect("register info body");
        let secret = info["totpSecret"].as_str().expect("totp secret").to_string();

        let code = totp::generate_at(&secret, chrono::Utc::now().timestamp()).expect("totp code");
        let response = self
            .client
            .post(self.api_url("/api/register"))
            .header("Origin", self.origin())
            .json(&serde_json::json!({
                "token": reg_token,
                "displayName": username,
                "password": password,
                "totp": code,
            }))
            .send()
            .await
            .expect("register request");
        assert!(response.status().is_success(), "register failed");
        let body: serde_json::Value = response.json().await.expect("register body");
        let token = body["token"].as_str().expect("session token").to_string();
        (token, secret)
    }

    /// Login with a TOTP generated at `at` (unix seconds).
    pub async fn login_at(
        &self,
        username: &str,
        password: &str,
        secret: &str,
        at: i64,
    ) -> reqwest::Response {
        let code = totp::generate_at(secret, at).expect("totp code");
        self.client
            .post(self.api_url("/api/login"))
            .header("Origin", self.origin())
            .json(&serde_json::json!({
                "username": username,
                "password": password,
                "totp": code,
            }))
            .send()
            .await
            .expect("login request")
    }

    /// GET an authenticated API endpoint with the `token` header.
    pub async fn get_authed(&self, path: &str, token: &str) -> reqwest::Response {
        self.client
            .get(self.api_url(path))
            .header("token", token)
            .send()
            .await
            .expect("authed request")
    }
}

pub fn token_from_setup_link(link: &str) -> String {
    let query = link.split('?').nth(1).expect("setup link query");
    let pairs: Vec<(String, String)> =
        serde_urlencoded::from_str(query).expect("setup link encoding");
    pairs
        .into_iter()
        .find(|(k, _)| k == "token")
        .map(|(_, v)| v)
        .expect("token param")
}
