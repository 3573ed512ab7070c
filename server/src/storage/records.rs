//! On-disk record structs and their binary codec.
//!
//! Every value written to the store is one of these structs encoded with
//! bincode; keys are derived per record type (user id, chat id, 8-byte
//! big-endian seq, token hash).

use serde::{Deserialize, Serialize};

use crate::auth::Credentials;
use crate::models::{Attachment, AttachmentType, Chat, Message, Presence, User, UserStatus};

use super::StorageError;

pub(super) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    Ok(bincode::serialize(value)?)
}

pub(super) fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, StorageError> {
    Ok(bincode::deserialize(bytes)?)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredUser {
    pub id: String,
    pub username: String,
    pub display_name: String,
    pub avatar_url: String,
    pub last_seen: i64,
    pub status: String,
    pub password_hash: String,
    pub totp_secret: String,
    pub last_totp: i64,
    pub failed_login_attempts: i64,
    pub last_attempt_time: i64,
}

impl StoredUser {
    pub fn key(&self) -> &[u8] {
        self.id.as_bytes()
    }
}

fn status_from_str(s: &str) -> UserStatus {
    match s {
        "active" => UserStatus::Active,
        "deleted" => UserStatus::Deleted,
        _ => UserStatus::Created,
    }
}

fn status_to_str(s: UserStatus) -> &'static str {
    match s {
        UserStatus::Created => "created",
        UserStatus::Active => "active",
        UserStatus::Deleted => "deleted",
    }
}

impl From<&Credentials> for StoredUser {
    fn from(c: &Credentials) -> Self {
        Self {
            id: c.user.id.clone(),
            username: c.user.username.clone(),
            display_name: c.user.display_name.clone(),
            avatar_url: c.user.avatar_url.clone(),
            last_seen: c.user.presence.last_seen,
            status: status_to_str(c.user.status).to_string(),
            password_hash: c.password_hash.clone(),
            totp_secret: c.totp_secret.clone(),
            last_totp: c.last_totp,
            failed_login_attempts: c.failed_login_attempts,
            last_attempt_time: c.last_attempt_time,
        }
    }
}

impl From<StoredUser> for Credentials {
    fn from(u: StoredUser) -> Self {
        Credentials {
            user: User {
                id: u.id,
                username: u.username,
                display_name: u.display_name,
                avatar_url: u.avatar_url,
                presence: Presence {
                    online: false,
                    last_seen: u.last_seen,
                },
                status: status_from_str(&u.status),
            },
            password_hash: u.password_hash,
            totp_secret: u.totp_secret,
            last_totp: u.last_totp,
            failed_login_attempts: u.failed_login_attempts,
            last_attempt_time: u.last_attempt_time,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredChat {
    pub id: String,
    pub name: String,
    pub last_seq: i64,
    pub is_dm: bool,
}

impl StoredChat {
    pub fn key(&self) -> &[u8] {
        self.id.as_bytes()
    }
}

impl From<&Chat> for StoredChat {
    fn from(c: &Chat) -> Self {
        Self {
            id: c.id.clone(),
            name: c.name.clone(),
            last_seq: c.last_seq,
            is_dm: c.is_dm,
        }
    }
}

impl From<StoredChat> for Chat {
    fn from(c: StoredChat) -> Self {
        Chat {
            id: c.id,
            name: c.name,
            last_seq: c.last_seq,
            is_dm: c.is_dm,
            online: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredAttachment {
    pub kind: String,
    pub name: String,
    pub mime_type: String,
    pub file_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub seq: i64,
    pub timestamp: i64,
    pub chat_id: String,
    pub user_id: String,
    pub content: String,
    pub attachments: Vec<StoredAttachment>,
}

impl StoredMessage {
    /// Big-endian seq so cursor scans within a chat tree are seq-ordered.
    pub fn key(&self) -> [u8; 8] {
        seq_key(self.seq)
    }
}

pub(super) fn seq_key(seq: i64) -> [u8; 8] {
    (seq as u64).to_be_bytes()
}

impl From<&Message> for StoredMessage {
    fn from(m: &Message) -> Self {
        Self {
            seq: m.seq,
            timestamp: m.timestamp,
            chat_id: m.chat_id.clone(),
            user_id: m.user_id.clone(),
            content: m.content.clone(),
            attachments: m
                .attachments
                .iter()
                .map(|a| StoredAttachment {
                    kind: match a.kind {
                        AttachmentType::Image => "image".to_string(),
                        AttachmentType::File => "file".to_string(),
                    },
                    name: a.name.clone(),
                    mime_type: a.mime_type.clone(),
                    file_id: a.file_id.clone(),
                })
                .collect(),
        }
    }
}

impl From<StoredMessage> for Message {
    fn from(m: StoredMessage) -> Self {
        Message {
            seq: m.seq,
            timestamp: m.timestamp,
            chat_id: m.chat_id,
            user_id: m.user_id,
            content: m.content,
            attachments: m
                .attachments
                .into_iter()
                .map(|a| Attachment {
                    kind: if a.kind == "file" {
                        AttachmentType::File
                    } else {
                        AttachmentType::Image
                    },
                    name: a.name,
                    mime_type: a.mime_type,
                    file_id: a.file_id,
                })
                .collect(),
        }
    }
}

/// Session token record, keyed by its HMAC hash. Only the hash is ever
/// written; a database compromise cannot reconstitute client cookies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSessionToken {
    pub user_id: String,
    pub token_hash: Vec<u8>,
}

/// Registration token record, keyed by user id so at most one invite link
/// is live per user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRegistrationToken {
    pub user_id: String,
    pub token: String,
}

/// Record shape of the legacy `tokens` tree, which stored raw session
/// tokens keyed by user id. Only read by the one-shot migration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyToken {
    pub user_id: String,
    pub token: String,
}

/// Metadata for an uploaded blob; the content itself lives in the
/// content-addressed filestore outside the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadata {
    pub id: String,
    pub hash: String,
    pub mime_type: String,
    pub size: i64,
    pub created_at: i64,
    pub user_id: String,
    pub chat_id: String,
}

impl FileMetadata {
    pub fn key(&self) -> &[u8] {
        self.id.as_bytes()
    }
}
