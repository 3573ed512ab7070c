use std::sync::Arc;

use tokio::sync::watch;

use crate::auth::AuthService;
use crate::hub::Hub;

/// Shared application state handed to every handler via the axum State
/// extractor.
#[derive(Clone)]
pub struct AppState {
    pub auth: Arc<AuthService>,
    pub hub: Arc<Hub>,
    /// Used to materialise setup links handed out by the admin listener.
    pub base_url: String,
    pub admin_user: String,
    pub admin_password: String,
    /// Flips to true when the server is shutting down; websocket actors
    /// watch it.
    pub shutdown: watch::Receiver<bool>,
}
