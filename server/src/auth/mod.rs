//! Authentication: credential lifecycle, password + TOTP verification,
//! login throttling, and session/registration token issuance.
//!
//! Passwords are hashed with keyed HMAC-SHA-512 over
//! `username || password`; session tokens are 128 random bits handed to
//! the client in base64, while the server stores and indexes only their
//! keyed HMAC-SHA-512. Every credential mutation is persisted; tokens are
//! reloaded from storage on start.

pub mod tokens;
pub mod totp;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha512;
use thiserror::Error;
use tokio::sync::watch;

use crate::content;
use crate::models::{Presence, User, UserStatus};
use crate::storage::{Storage, StorageError};

use tokens::{RegistrationTokenIndex, SessionTokenIndex};

pub const DEFAULT_TOKEN_EXPIRY: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_REGISTRATION_TOKEN_EXPIRY: Duration = Duration::from_secs(24 * 60 * 60);

/// Throttling kicks in after this many consecutive failures.
const THROTTLE_FREE_ATTEMPTS: i64 = 3;

type HmacSha512 = Hmac<Sha512>;
type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

#[derive(Debug, Error)]
pub enum AuthError {
    /// Uniform failure for every user-facing authentication problem:
    /// unknown user, deleted user, wrong password, replayed or
    /// out-of-window TOTP. Callers must not leak which one it was.
    #[error("Login failed")]
    LoginFailed,

    #[error("Too many failed login attempts. Next attempt in {retry_in} seconds")]
    Throttled { retry_in: i64 },

    #[error("user already exists")]
    UserExists,

    #[error("user not found")]
    UserNotFound,

    #[error("invalid or expired registration token")]
    InvalidRegistrationToken,

    #[error("invalid TOTP code")]
    InvalidTotp,

    #[error("user already registered")]
    UserAlreadyRegistered,

    #[error("invalid username: {0}")]
    InvalidUsername(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A user's full credential record. Owned exclusively by [`AuthService`];
/// storage persists it, nothing else reads it.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub user: User,
    /// base64 of the keyed HMAC-SHA-512; empty until registration
    /// completes and cleared again on reset/delete.
    pub password_hash: String,
    /// base32 of 160 random bits; cleared on delete.
    pub totp_secret: String,
    /// Last accepted TOTP code, to refuse replays. -1 means registration
    /// has not completed yet.
    pub last_totp: i64,
    pub failed_login_attempts: i64,
    pub last_attempt_time: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub totp: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRequest {
    pub token: String,
    #[serde(default)]
    pub display_name: String,
    pub password: String,
    #[serde(default)]
    pub totp: i64,
}

/// What the registration page needs to render the QR code.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationInfo {
    pub username: String,
    pub display_name: String,
    pub totp_secret: String,
}

/// A freshly issued session.
#[derive(Debug, Clone)]
pub struct SessionGrant {
    pub user_id: String,
    pub token: String,
    /// Unix seconds when the token lapses if never used again.
    pub token_expiry: i64,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// base64-encoded HMAC key for password and token hashing.
    pub secret: String,
    pub token_expiry: Duration,
    pub registration_token_expiry: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            token_expiry: DEFAULT_TOKEN_EXPIRY,
            registration_token_expiry: DEFAULT_REGISTRATION_TOKEN_EXPIRY,
        }
    }
}

#[derive(Default)]
struct UserIndex {
    by_id: HashMap<String, Credentials>,
    by_name: HashMap<String, String>,
}

pub struct AuthService {
    secret: Vec<u8>,
    token_expiry: Duration,
    storage: Arc<Storage>,
    users: RwLock<UserIndex>,
    sessions: SessionTokenIndex,
    registrations: RegistrationTokenIndex,
    clock: Clock,
}

impl AuthService {
    /// Build the service: decode the secret, run the one-shot token
    /// migration, then rebuild every in-memory index from storage.
    pub fn new(config: AuthConfig, storage: Arc<Storage>) -> Result<Self, AuthError> {
        if config.secret.is_empty() {
            return Err(AuthError::InvalidConfig("auth secret is required".into()));
        }
        let secret = BASE64
            .decode(&config.secret)
            .map_err(|e| AuthError::InvalidConfig(format!("auth secret is not valid base64: {e}")))?;

        let service = Self {
            secret,
            token_expiry: config.token_expiry,
            sessions: SessionTokenIndex::new(config.token_expiry),
            registrations: RegistrationTokenIndex::new(config.registration_token_expiry),
            storage,
            users: RwLock::new(UserIndex::default()),
            clock: Arc::new(|| chrono::Utc::now().timestamp()),
        };

        let hash_secret = service.secret.clone();
        service
            .storage
            .migrate_tokens(move |raw| hash_with(&hash_secret, raw.as_bytes()))?;

        let now = service.now();
        {
            let mut users = service.users.write().expect("user index poisoned");
            for mut credentials in service.storage.list_all_credentials()? {
                // Presence never survives a restart.
                credentials.user.presence.online = false;
                users
                    .by_name
                    .insert(credentials.user.username.clone(), credentials.user.id.clone());
                users.by_id.insert(credentials.user.id.clone(), credentials);
            }
        }
        for (hash, user_id) in service.storage.list_tokens()? {
            service.sessions.insert(hash, &user_id, now);
        }
        for (user_id, token) in service.storage.list_registration_tokens()? {
            service.registrations.insert_for_user(&token, &user_id, now);
        }

        Ok(service)
    }

    fn now(&self) -> i64 {
        (self.clock)()
    }

    // --- hashing ---

    fn hash_password(&self, username: &str, password: &str) -> String {
        let mut data = Vec::with_capacity(username.len() + password.len());
        data.extend_from_slice(username.as_bytes());
        data.extend_from_slice(password.as_bytes());
        BASE64.encode(hash_with(&self.secret, &data))
    }

    fn verify_password(&self, username: &str, password: &str, stored_hash: &str) -> bool {
        let Ok(stored) = BASE64.decode(stored_hash) else {
            return false;
        };
        let mut data = Vec::with_capacity(username.len() + password.len());
        data.extend_from_slice(username.as_bytes());
        data.extend_from_slice(password.as_bytes());
        let mut mac =
            HmacSha512::new_from_slice(&self.secret).expect("hmac accepts any key length");
        mac.update(&data);
        mac.verify_slice(&stored).is_ok()
    }

    fn hash_token(&self, token: &str) -> Vec<u8> {
        hash_with(&self.secret, token.as_bytes())
    }

    fn generate_token() -> String {
        let bytes: [u8; 16] = rand::random();
        BASE64.encode(bytes)
    }

    // --- user lifecycle ---

    /// Admin invite. Re-inviting a user who never completed registration
    /// rotates their setup link; a completed user yields `UserExists`.
    /// Returns the new registration token.
    pub fn add_user(&self, username: &str, display_name: &str) -> Result<String, AuthError> {
        content::validate_username(username).map_err(AuthError::InvalidUsername)?;
        let username = content::sanitize(username);
        let display_name = content::sanitize(display_name);
        let now = self.now();

        let mut users = self.users.write().expect("user index poisoned");

        let mut credentials = match users.by_name.get(&username) {
            Some(id) => {
                let existing = users
                    .by_id
                    .get(id)
                    .ok_or(AuthError::UserNotFound)?
                    .clone();
                if existing.last_totp != -1 {
                    return Err(AuthError::UserExists);
                }
                existing
            }
            None => Credentials {
                user: User {
                    id: uuid::Uuid::new_v4().to_string(),
                    username: username.clone(),
                    display_name,
                    avatar_url: String::new(),
                    presence: Presence::default(),
                    status: UserStatus::Created,
                },
                password_hash: String::new(),
                totp_secret: totp::generate_secret(),
                last_totp: -1,
                failed_login_attempts: 0,
                last_attempt_time: 0,
            },
        };
        credentials.user.status = UserStatus::Created;

        let token = Self::generate_token();

        self.storage.upsert_credentials(&credentials)?;
        self.storage
            .upsert_registration_token(&credentials.user.id, &token)?;

        self.registrations
            .insert_for_user(&token, &credentials.user.id, now);
        users
            .by_name
            .insert(username, credentials.user.id.clone());
        users
            .by_id
            .insert(credentials.user.id.clone(), credentials);

        Ok(token)
    }

    /// Revoke every live session, clear the password, rotate the TOTP
    /// secret and hand back a fresh registration token. The user is back
    /// in `created` state, exactly as after an initial invite.
    pub fn reset_password(&self, user_id: &str) -> Result<String, AuthError> {
        let now = self.now();
        let mut users = self.users.write().expect("user index poisoned");
        let credentials = users
            .by_id
            .get_mut(user_id)
            .ok_or(AuthError::UserNotFound)?;

        for hash in self.sessions.remove_user(user_id) {
            if let Err(e) = self.storage.delete_token(&hash) {
                tracing::error!(user_id = %user_id, error = %e, "failed to delete token on password reset");
            }
        }

        let token = Self::generate_token();

        credentials.totp_secret = totp::generate_secret();
        credentials.last_totp = -1;
        credentials.failed_login_attempts = 0;
        credentials.last_attempt_time = 0;
        credentials.password_hash = String::new();
        credentials.user.status = UserStatus::Created;
        credentials.user.presence = Presence {
            online: false,
            last_seen: now,
        };

        self.storage.upsert_credentials(credentials)?;
        self.storage.upsert_registration_token(user_id, &token)?;
        self.registrations.insert_for_user(&token, user_id, now);

        Ok(token)
    }

    /// Admin delete: credentials are cleared, sessions revoked, and the
    /// record kept as a `deleted` tombstone.
    pub fn delete_user(&self, user_id: &str) -> Result<(), AuthError> {
        let now = self.now();
        let mut users = self.users.write().expect("user index poisoned");
        let credentials = users
            .by_id
            .get_mut(user_id)
            .ok_or(AuthError::UserNotFound)?;

        credentials.user.status = UserStatus::Deleted;
        credentials.password_hash = String::new();
        credentials.totp_secret = String::new();
        credentials.user.presence = Presence {
            online: false,
            last_seen: now,
        };

        self.storage.upsert_credentials(credentials)?;

        for hash in self.sessions.remove_user(user_id) {
            if let Err(e) = self.storage.delete_token(&hash) {
                tracing::error!(user_id = %user_id, error = %e, "failed to delete token on user delete");
            }
        }

        Ok(())
    }

    pub fn get_user(&self, id: &str) -> Option<User> {
        let users = self.users.read().expect("user index poisoned");
        users.by_id.get(id).map(|c| c.user.clone())
    }

    /// Roster of active users.
    pub fn get_users(&self) -> Vec<User> {
        let users = self.users.read().expect("user index poisoned");
        users
            .by_id
            .values()
            .filter(|c| c.user.status == UserStatus::Active)
            .map(|c| c.user.clone())
            .collect()
    }

    /// Every user regardless of status; admin view.
    pub fn get_all_users(&self) -> Vec<User> {
        let users = self.users.read().expect("user index poisoned");
        users.by_id.values().map(|c| c.user.clone()).collect()
    }

    // --- login / logoff ---

    pub fn login(&self, req: &LoginRequest) -> Result<SessionGrant, AuthError> {
        let now = self.now();
        let mut users = self.users.write().expect("user index poisoned");

        let id = users
            .by_name
            .get(&req.username)
            .cloned()
            .ok_or(AuthError::LoginFailed)?;
        let credentials = users.by_id.get_mut(&id).ok_or(AuthError::LoginFailed)?;

        if credentials.user.status != UserStatus::Active {
            return Err(AuthError::LoginFailed);
        }

        if credentials.failed_login_attempts > THROTTLE_FREE_ATTEMPTS {
            let attempts = credentials.failed_login_attempts;
            let next_attempt = credentials.last_attempt_time + 30 * attempts * attempts;
            if now < next_attempt {
                return Err(AuthError::Throttled {
                    retry_in: next_attempt - now,
                });
            }
        }

        if !self.verify_password(&req.username, &req.password, &credentials.password_hash) {
            credentials.failed_login_attempts += 1;
            credentials.last_attempt_time = now;
            return Err(AuthError::LoginFailed);
        }

        if credentials.last_totp == -1 {
            return Err(AuthError::LoginFailed);
        }

        // Replayed or out-of-window codes fail the same way as a bad
        // password.
        if req.totp == credentials.last_totp
            || !totp::check(&credentials.totp_secret, req.totp, credentials.last_totp, now)
        {
            credentials.failed_login_attempts += 1;
            credentials.last_attempt_time = now;
            return Err(AuthError::LoginFailed);
        }

        let token = Self::generate_token();
        let hash = self.hash_token(&token);
        self.sessions.insert(hash.clone(), &id, now);

        credentials.failed_login_attempts = 0;
        credentials.last_attempt_time = now;
        credentials.last_totp = req.totp;

        if let Err(e) = self.storage.upsert_credentials(credentials) {
            tracing::error!(user_id = %id, error = %e, "failed to persist user after login");
        }
        if let Err(e) = self.storage.upsert_token(&id, &hash) {
            tracing::error!(user_id = %id, error = %e, "failed to persist token after login");
        }

        Ok(SessionGrant {
            user_id: id,
            token,
            token_expiry: now + self.token_expiry.as_secs() as i64,
        })
    }

    /// Revoke one session. Unknown tokens are a no-op.
    pub fn logoff(&self, token: &str) {
        let hash = self.hash_token(token);
        let Some(user_id) = self.sessions.remove(&hash) else {
            return;
        };

        self.set_offline(&user_id);

        if let Err(e) = self.storage.delete_token(&hash) {
            tracing::error!(user_id = %user_id, error = %e, "failed to delete token on logoff");
        }
    }

    // --- registration ---

    pub fn get_registration_info(&self, token: &str) -> Result<RegistrationInfo, AuthError> {
        let user_id = self
            .registrations
            .get(token, self.now())
            .ok_or(AuthError::InvalidRegistrationToken)?;

        let users = self.users.read().expect("user index poisoned");
        let credentials = users.by_id.get(&user_id).ok_or(AuthError::UserNotFound)?;

        Ok(RegistrationInfo {
            username: credentials.user.username.clone(),
            display_name: credentials.user.display_name.clone(),
            totp_secret: credentials.totp_secret.clone(),
        })
    }

    /// Finish the invite flow: verify the first TOTP code against the
    /// freshly issued secret, set the password, activate the user and open
    /// a session.
    pub fn complete_registration(
        &self,
        req: &RegistrationRequest,
    ) -> Result<SessionGrant, AuthError> {
        let now = self.now();
        let user_id = self
            .registrations
            .get(&req.token, now)
            .ok_or(AuthError::InvalidRegistrationToken)?;

        let mut users = self.users.write().expect("user index poisoned");
        let credentials = users
            .by_id
            .get_mut(&user_id)
            .ok_or(AuthError::UserNotFound)?;

        if credentials.last_totp != -1 {
            return Err(AuthError::UserAlreadyRegistered);
        }

        if !totp::check(&credentials.totp_secret, req.totp, credentials.last_totp, now) {
            return Err(AuthError::InvalidTotp);
        }

        let display_name = content::sanitize(&req.display_name);
        if !display_name.is_empty() {
            credentials.user.display_name = display_name;
        }
        credentials.password_hash =
            self.hash_password(&credentials.user.username, &req.password);
        credentials.last_totp = 0;
        credentials.user.status = UserStatus::Active;

        self.storage.upsert_credentials(credentials)?;

        if let Err(e) = self.storage.delete_registration_token(&user_id) {
            tracing::error!(user_id = %user_id, error = %e, "failed to delete registration token");
        }
        self.registrations.remove(&req.token);

        let token = Self::generate_token();
        let hash = self.hash_token(&token);
        self.sessions.insert(hash.clone(), &user_id, now);
        if let Err(e) = self.storage.upsert_token(&user_id, &hash) {
            tracing::error!(user_id = %user_id, error = %e, "failed to persist token after registration");
        }

        Ok(SessionGrant {
            user_id,
            token,
            token_expiry: now + self.token_expiry.as_secs() as i64,
        })
    }

    // --- session validation & presence ---

    /// Resolve a raw session token to its user. Slides the token's TTL and
    /// touches the user's presence, so an active user never has to relogin.
    pub fn get_user_id(&self, token: &str) -> Option<String> {
        let now = self.now();
        let hash = self.hash_token(token);
        let user_id = self.sessions.touch(&hash, now)?;

        let mut users = self.users.write().expect("user index poisoned");
        if let Some(credentials) = users.by_id.get_mut(&user_id) {
            credentials.user.presence = Presence {
                online: true,
                last_seen: now,
            };
        }
        Some(user_id)
    }

    pub fn set_online(&self, user_id: &str) {
        self.set_presence(user_id, true);
    }

    pub fn set_offline(&self, user_id: &str) {
        self.set_presence(user_id, false);
    }

    fn set_presence(&self, user_id: &str, online: bool) {
        let now = self.now();
        let mut users = self.users.write().expect("user index poisoned");
        let Some(credentials) = users.by_id.get_mut(user_id) else {
            return;
        };
        credentials.user.presence = Presence {
            online,
            last_seen: now,
        };
        // In-memory presence is authoritative for this session.
        if let Err(e) = self.storage.upsert_credentials(credentials) {
            tracing::error!(user_id = %user_id, online, error = %e, "failed to persist presence");
        }
    }

    // --- profile updates ---

    pub fn update_display_name(&self, user_id: &str, display_name: &str) -> Result<(), AuthError> {
        let display_name = content::sanitize(display_name);
        if display_name.is_empty() {
            return Err(AuthError::InvalidUsername(
                "display name cannot be empty".to_string(),
            ));
        }
        let mut users = self.users.write().expect("user index poisoned");
        let credentials = users
            .by_id
            .get_mut(user_id)
            .ok_or(AuthError::UserNotFound)?;
        credentials.user.display_name = display_name;
        self.storage.upsert_credentials(credentials)?;
        Ok(())
    }

    pub fn update_avatar_url(&self, user_id: &str, avatar_url: &str) -> Result<(), AuthError> {
        let mut users = self.users.write().expect("user index poisoned");
        let credentials = users
            .by_id
            .get_mut(user_id)
            .ok_or(AuthError::UserNotFound)?;
        credentials.user.avatar_url = avatar_url.to_string();
        self.storage.upsert_credentials(credentials)?;
        Ok(())
    }

    // --- TTL eviction ---

    /// Drop expired session and registration tokens from the indices and
    /// from storage. Normally driven by [`spawn_sweeper`].
    ///
    /// [`spawn_sweeper`]: AuthService::spawn_sweeper
    pub fn evict_expired(&self) {
        let now = self.now();
        for (hash, user_id) in self.sessions.sweep(now) {
            if let Err(e) = self.storage.delete_token(&hash) {
                tracing::error!(user_id = %user_id, error = %e, "failed to delete expired token");
            }
        }
        for (_, user_id) in self.registrations.sweep(now) {
            if let Err(e) = self.storage.delete_registration_token(&user_id) {
                tracing::error!(user_id = %user_id, error = %e, "failed to delete expired registration token");
            }
        }
    }

    /// Background sweeper; stops when the shutdown signal flips.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let auth = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => auth.evict_expired(),
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    /// Whether this raw token currently maps to a live session. Test seam
    /// for revocation properties.
    pub fn has_live_session(&self, token: &str) -> bool {
        let hash = self.hash_token(token);
        self.sessions.touch(&hash, self.now()).is_some()
    }
}

fn hash_with(secret: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha512::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}
