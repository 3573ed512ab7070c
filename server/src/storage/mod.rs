//! Durable storage on top of an embedded sled database.
//!
//! One tree per bucket: `users`, `chats`, `tokens_v2`,
//! `registration_tokens`, `files`, plus one `messages/<chatID>` tree per
//! chat. Message keys are 8-byte big-endian sequence numbers so range
//! scans come back seq-ordered. Every externally visible operation is a
//! single transaction.

mod records;

pub use records::FileMetadata;

use std::collections::HashMap;
use std::path::Path;

use sled::transaction::{abort, ConflictableTransactionError, TransactionError};
use sled::Transactional;
use thiserror::Error;

use crate::auth::Credentials;
use crate::models::{Chat, Message, UserStatus};

use records::{
    decode, encode, seq_key, LegacyToken, StoredChat, StoredMessage, StoredRegistrationToken,
    StoredSessionToken, StoredUser,
};

const TREE_USERS: &str = "users";
const TREE_CHATS: &str = "chats";
const TREE_TOKENS_LEGACY: &str = "tokens";
const TREE_TOKENS: &str = "tokens_v2";
const TREE_REGISTRATION_TOKENS: &str = "registration_tokens";
const TREE_FILES: &str = "files";
const MESSAGES_TREE_PREFIX: &str = "messages/";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Backend(#[from] sled::Error),

    #[error("codec error: {0}")]
    Codec(#[from] Box<bincode::ErrorKind>),

    #[error("chat {0} not found")]
    ChatNotFound(String),

    #[error("message is missing its chat id")]
    MissingChatId,
}

impl From<TransactionError<StorageError>> for StorageError {
    fn from(err: TransactionError<StorageError>) -> Self {
        match err {
            TransactionError::Abort(e) => e,
            TransactionError::Storage(e) => StorageError::Backend(e),
        }
    }
}

pub struct Storage {
    db: sled::Db,
    users: sled::Tree,
    chats: sled::Tree,
    tokens: sled::Tree,
    registration_tokens: sled::Tree,
    files: sled::Tree,
}

impl Storage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        Ok(Self {
            users: db.open_tree(TREE_USERS)?,
            chats: db.open_tree(TREE_CHATS)?,
            tokens: db.open_tree(TREE_TOKENS)?,
            registration_tokens: db.open_tree(TREE_REGISTRATION_TOKENS)?,
            files: db.open_tree(TREE_FILES)?,
            db,
        })
    }

    /// Block until all dirty pages hit disk. Called on shutdown.
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }

    fn messages_tree(&self, chat_id: &str) -> Result<sled::Tree, StorageError> {
        Ok(self
            .db
            .open_tree(format!("{MESSAGES_TREE_PREFIX}{chat_id}"))?)
    }

    // --- credentials ---

    pub fn upsert_credentials(&self, credentials: &Credentials) -> Result<(), StorageError> {
        let record = StoredUser::from(credentials);
        let data = encode(&record)?;
        self.users.insert(record.key(), data)?;
        Ok(())
    }

    /// All credentials regardless of status; used to rebuild the auth
    /// indices on startup.
    pub fn list_all_credentials(&self) -> Result<Vec<Credentials>, StorageError> {
        let mut out = Vec::new();
        for entry in self.users.iter() {
            let (_, value) = entry?;
            let record: StoredUser = decode(&value)?;
            out.push(record.into());
        }
        Ok(out)
    }

    /// Only credentials with status `active`; the user-visible roster.
    pub fn list_credentials(&self) -> Result<Vec<Credentials>, StorageError> {
        Ok(self
            .list_all_credentials()?
            .into_iter()
            .filter(|c| c.user.status == UserStatus::Active)
            .collect())
    }

    // --- chats ---

    pub fn upsert_chat(&self, chat: &Chat) -> Result<(), StorageError> {
        let record = StoredChat::from(chat);
        let data = encode(&record)?;
        self.chats.insert(record.key(), data)?;
        Ok(())
    }

    pub fn list_chats(&self) -> Result<Vec<Chat>, StorageError> {
        let mut out = Vec::new();
        for entry in self.chats.iter() {
            let (_, value) = entry?;
            let record: StoredChat = decode(&value)?;
            out.push(record.into());
        }
        Ok(out)
    }

    // --- messages ---

    /// Append a message and advance the chat's `last_seq` in one
    /// transaction. Fails if the parent chat record is absent.
    pub fn upsert_message(&self, message: &Message) -> Result<(), StorageError> {
        if message.chat_id.is_empty() {
            return Err(StorageError::MissingChatId);
        }
        let messages = self.messages_tree(&message.chat_id)?;
        let record = StoredMessage::from(message);
        let chat_id = message.chat_id.clone();

        (&messages, &self.chats)
            .transaction(move |(msgs, chats)| {
                let key = record.key();
                let data = encode(&record).map_err(ConflictableTransactionError::Abort)?;

                let chat_raw = match chats.get(chat_id.as_bytes())? {
                    Some(raw) => raw,
                    None => return abort(StorageError::ChatNotFound(chat_id.clone())),
                };
                let mut chat: StoredChat =
                    decode(&chat_raw).map_err(ConflictableTransactionError::Abort)?;

                msgs.insert(&key[..], data)?;

                if record.seq > chat.last_seq {
                    chat.last_seq = record.seq;
                    let chat_data = encode(&chat).map_err(ConflictableTransactionError::Abort)?;
                    chats.insert(chat_id.as_bytes(), chat_data)?;
                }
                Ok(())
            })
            .map_err(StorageError::from)
    }

    /// Inclusive range scan over one chat's messages, ordered by seq.
    pub fn list_messages(
        &self,
        chat_id: &str,
        from: i64,
        to: i64,
    ) -> Result<Vec<Message>, StorageError> {
        if to < from {
            return Ok(Vec::new());
        }
        let messages = self.messages_tree(chat_id)?;
        let mut out = Vec::new();
        for entry in messages.range(seq_key(from.max(0))..=seq_key(to.max(0))) {
            let (_, value) = entry?;
            let record: StoredMessage = decode(&value)?;
            out.push(record.into());
        }
        Ok(out)
    }

    // --- session tokens ---

    pub fn upsert_token(&self, user_id: &str, token_hash: &[u8]) -> Result<(), StorageError> {
        let record = StoredSessionToken {
            user_id: user_id.to_string(),
            token_hash: token_hash.to_vec(),
        };
        let data = encode(&record)?;
        self.tokens.insert(token_hash, data)?;
        Ok(())
    }

    pub fn delete_token(&self, token_hash: &[u8]) -> Result<(), StorageError> {
        self.tokens.remove(token_hash)?;
        Ok(())
    }

    /// All live session tokens as hash -> user id.
    pub fn list_tokens(&self) -> Result<HashMap<Vec<u8>, String>, StorageError> {
        let mut out = HashMap::new();
        for entry in self.tokens.iter() {
            let (_, value) = entry?;
            let record: StoredSessionToken = decode(&value)?;
            out.insert(record.token_hash, record.user_id);
        }
        Ok(out)
    }

    /// One-shot migration of the legacy `tokens` tree (raw tokens keyed by
    /// user id) into `tokens_v2` keyed by token hash. The data move is a
    /// single transaction; the emptied legacy tree is dropped afterwards.
    /// A missing legacy tree is a no-op.
    pub fn migrate_tokens(
        &self,
        hasher: impl Fn(&str) -> Vec<u8>,
    ) -> Result<(), StorageError> {
        let has_legacy = self
            .db
            .tree_names()
            .iter()
            .any(|name| name.as_ref() == TREE_TOKENS_LEGACY.as_bytes());
        if !has_legacy {
            return Ok(());
        }

        let legacy = self.db.open_tree(TREE_TOKENS_LEGACY)?;
        let mut migrated: Vec<(Vec<u8>, StoredSessionToken)> = Vec::new();
        let mut legacy_keys: Vec<Vec<u8>> = Vec::new();
        for entry in legacy.iter() {
            let (key, value) = entry?;
            let old: LegacyToken = decode(&value)?;
            let hash = hasher(&old.token);
            migrated.push((
                hash.clone(),
                StoredSessionToken {
                    user_id: old.user_id,
                    token_hash: hash,
                },
            ));
            legacy_keys.push(key.to_vec());
        }

        (&legacy, &self.tokens)
            .transaction(move |(old, new)| {
                for key in &legacy_keys {
                    old.remove(key.as_slice())?;
                }
                for (hash, record) in &migrated {
                    let data = encode(record).map_err(ConflictableTransactionError::Abort)?;
                    new.insert(hash.as_slice(), data)?;
                }
                Ok(())
            })
            .map_err(StorageError::from)?;

        self.db.drop_tree(TREE_TOKENS_LEGACY)?;
        Ok(())
    }

    // --- registration tokens ---

    pub fn upsert_registration_token(
        &self,
        user_id: &str,
        token: &str,
    ) -> Result<(), StorageError> {
        let record = StoredRegistrationToken {
            user_id: user_id.to_string(),
            token: token.to_string(),
        };
        let data = encode(&record)?;
        self.registration_tokens.insert(user_id.as_bytes(), data)?;
        Ok(())
    }

    pub fn delete_registration_token(&self, user_id: &str) -> Result<(), StorageError> {
        self.registration_tokens.remove(user_id.as_bytes())?;
        Ok(())
    }

    /// All pending registration tokens as user id -> raw token.
    pub fn list_registration_tokens(&self) -> Result<HashMap<String, String>, StorageError> {
        let mut out = HashMap::new();
        for entry in self.registration_tokens.iter() {
            let (_, value) = entry?;
            let record: StoredRegistrationToken = decode(&value)?;
            out.insert(record.user_id, record.token);
        }
        Ok(out)
    }

    // --- file metadata ---

    pub fn upsert_file_metadata(&self, meta: &FileMetadata) -> Result<(), StorageError> {
        let data = encode(meta)?;
        self.files.insert(meta.key(), data)?;
        Ok(())
    }

    pub fn get_file_metadata(&self, id: &str) -> Result<Option<FileMetadata>, StorageError> {
        match self.files.get(id.as_bytes())? {
            Some(value) => Ok(Some(decode(&value)?)),
            None => Ok(None),
        }
    }

    /// Test/migration seam: write a raw record into the legacy token tree.
    #[doc(hidden)]
    pub fn seed_legacy_token(&self, user_id: &str, raw_token: &str) -> Result<(), StorageError> {
        let legacy = self.db.open_tree(TREE_TOKENS_LEGACY)?;
        let record = LegacyToken {
            user_id: user_id.to_string(),
            token: raw_token.to_string(),
        };
        legacy.insert(user_id.as_bytes(), encode(&record)?)?;
        Ok(())
    }
}
