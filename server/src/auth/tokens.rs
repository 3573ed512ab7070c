//! In-memory token indices with TTL.
//!
//! The session index is two-sided: hash -> user for validation, and
//! user -> hashes for bulk revocation. The two maps must never disagree,
//! so every mutation goes through the `insert_entry`/`remove_entry` pair
//! on the locked inner state. Expired entries are collected by a sweep and
//! reported back to the caller, which owns deleting them from storage.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Live session tokens, keyed by their HMAC hash.
pub struct SessionTokenIndex {
    ttl: i64,
    inner: Mutex<SessionTokenInner>,
}

#[derive(Default)]
struct SessionTokenInner {
    by_hash: HashMap<Vec<u8>, SessionEntry>,
    by_user: HashMap<String, Vec<Vec<u8>>>,
}

struct SessionEntry {
    user_id: String,
    expires_at: i64,
}

impl SessionTokenInner {
    fn insert_entry(&mut self, hash: Vec<u8>, user_id: String, expires_at: i64) {
        // Re-inserting an existing hash must not duplicate the per-user entry.
        if let Some(prev) = self.by_hash.insert(
            hash.clone(),
            SessionEntry {
                user_id: user_id.clone(),
                expires_at,
            },
        ) {
            if prev.user_id == user_id {
                return;
            }
            self.unlink_user(&prev.user_id, &hash);
        }
        self.by_user.entry(user_id).or_default().push(hash);
    }

    fn remove_entry(&mut self, hash: &[u8]) -> Option<String> {
        let entry = self.by_hash.remove(hash)?;
        self.unlink_user(&entry.user_id, hash);
        Some(entry.user_id)
    }

    fn unlink_user(&mut self, user_id: &str, hash: &[u8]) {
        if let Some(hashes) = self.by_user.get_mut(user_id) {
            hashes.retain(|h| h != hash);
            if hashes.is_empty() {
                self.by_user.remove(user_id);
            }
        }
    }
}

impl SessionTokenIndex {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl: ttl.as_secs() as i64,
            inner: Mutex::new(SessionTokenInner::default()),
        }
    }

    pub fn insert(&self, hash: Vec<u8>, user_id: &str, now: i64) {
        let mut inner = self.inner.lock().expect("token index poisoned");
        inner.insert_entry(hash, user_id.to_string(), now + self.ttl);
    }

    /// Validate a hash and slide its expiry forward. A user who shows up at
    /// least once per TTL keeps the session alive indefinitely.
    pub fn touch(&self, hash: &[u8], now: i64) -> Option<String> {
        let mut inner = self.inner.lock().expect("token index poisoned");
        let entry = inner.by_hash.get_mut(hash)?;
        if entry.expires_at <= now {
            return None;
        }
        entry.expires_at = now + self.ttl;
        Some(entry.user_id.clone())
    }

    pub fn remove(&self, hash: &[u8]) -> Option<String> {
        let mut inner = self.inner.lock().expect("token index poisoned");
        inner.remove_entry(hash)
    }

    /// Revoke every session of one user; returns the removed hashes so the
    /// caller can delete them from storage.
    pub fn remove_user(&self, user_id: &str) -> Vec<Vec<u8>> {
        let mut inner = self.inner.lock().expect("token index poisoned");
        let hashes = inner.by_user.get(user_id).cloned().unwrap_or_default();
        for hash in &hashes {
            inner.remove_entry(hash);
        }
        hashes
    }

    /// Drop entries that expired at or before `now`; returns them as
    /// (hash, user) pairs for storage cleanup.
    pub fn sweep(&self, now: i64) -> Vec<(Vec<u8>, String)> {
        let mut inner = self.inner.lock().expect("token index poisoned");
        let expired: Vec<Vec<u8>> = inner
            .by_hash
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(h, _)| h.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|hash| {
                let user = inner.remove_entry(&hash)?;
                Some((hash, user))
            })
            .collect()
    }

    pub fn user_sessions(&self, user_id: &str) -> Vec<Vec<u8>> {
        let inner = self.inner.lock().expect("token index poisoned");
        inner.by_user.get(user_id).cloned().unwrap_or_default()
    }
}

/// Pending registration tokens. Short-lived, and at most one live token
/// per user: issuing a new one invalidates any prior one.
pub struct RegistrationTokenIndex {
    ttl: i64,
    inner: Mutex<HashMap<String, RegistrationEntry>>,
}

struct RegistrationEntry {
    user_id: String,
    expires_at: i64,
}

impl RegistrationTokenIndex {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl: ttl.as_secs() as i64,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Register `token` for `user_id`, invalidating any earlier token for
    /// the same user.
    pub fn insert_for_user(&self, token: &str, user_id: &str, now: i64) {
        let mut inner = self.inner.lock().expect("registration index poisoned");
        inner.retain(|_, e| e.user_id != user_id);
        inner.insert(
            token.to_string(),
            RegistrationEntry {
                user_id: user_id.to_string(),
                expires_at: now + self.ttl,
            },
        );
    }

    pub fn get(&self, token: &str, now: i64) -> Option<String> {
        let inner = self.inner.lock().expect("registration index poisoned");
        let entry = inner.get(token)?;
        if entry.expires_at <= now {
            return None;
        }
        Some(entry.user_id.clone())
    }

    pub fn remove(&self, token: &str) -> Option<String> {
        let mut inner = self.inner.lock().expect("registration index poisoned");
        inner.remove(token).map(|e| e.user_id)
    }

    /// Drop expired tokens; returns (token, user) pairs for storage cleanup.
    pub fn sweep(&self, now: i64) -> Vec<(String, String)> {
        let mut inner = self.inner.lock().expect("registration index poisoned");
        let expired: Vec<String> = inner
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(t, _)| t.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|token| {
                let entry = inner.remove(&token)?;
                Some((token, entry.user_id))
            })
            .collect()
    }
}
