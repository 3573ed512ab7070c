//! Central real-time router: owns the live chat buffers and the map of
//! connected users, fans server events out through bounded per-user
//! delivery queues, and manages the DM topology as users come and go.
//!
//! Locking: `chats` and `connected` are separate RwLocks so the chat
//! buffer's record callback (which runs under the buffer lock) only ever
//! touches `connected`. Acquisition order is chats -> buffer -> connected;
//! nothing acquires them the other way around.
//!
//! The connected map owns the only sender of each delivery queue; an
//! actor holds nothing but its receiver and a connection id. Removing a
//! user's entry therefore closes the actor's receiver, which is how
//! supersession, admin delete and password reset terminate a live
//! websocket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use tokio::sync::mpsc;

use crate::auth::AuthService;
use crate::chat::{ChatBuffer, ChatRecord};
use crate::models::{Chat, ClientFrame, ServerEvent, User, UserStatus};
use crate::storage::{Storage, StorageError};

pub const TOWNHALL_ID: &str = "townhall";
pub const TOWNHALL_NAME: &str = "Town Hall";

/// Ring capacity for every chat.
const MAX_CHAT_RECORDS: usize = 500;
/// Bounded per-user delivery queue; overflow drops, never blocks.
const DELIVERY_QUEUE_CAPACITY: usize = 100;
/// Records replayed on an explicit `join` frame.
const JOIN_BACKFILL: usize = 100;

type DeliveryQueue = mpsc::Sender<ServerEvent>;

/// Identifies one websocket connection, so a stale actor cannot tear down
/// its successor's registration.
pub type ConnectionId = u64;

struct ConnectionHandle {
    id: ConnectionId,
    queue: DeliveryQueue,
}

/// Deterministic DM chat id: the two user ids sorted lexicographically.
pub fn dm_id(a: &str, b: &str) -> String {
    if a <= b {
        format!("dm_{a}_{b}")
    } else {
        format!("dm_{b}_{a}")
    }
}

/// Whether `chat_id` is a DM that includes `user_id`.
pub fn dm_includes(chat_id: &str, user_id: &str) -> bool {
    let Some(pair) = chat_id.strip_prefix("dm_") else {
        return false;
    };
    let mut parts = pair.splitn(2, '_');
    match (parts.next(), parts.next()) {
        (Some(a), Some(b)) => a == user_id || b == user_id,
        _ => false,
    }
}

/// The other participant of a DM, if `user_id` is one of the two.
fn dm_peer(chat_id: &str, user_id: &str) -> Option<String> {
    let pair = chat_id.strip_prefix("dm_")?;
    let mut parts = pair.splitn(2, '_');
    let a = parts.next()?;
    let b = parts.next()?;
    if a == user_id {
        Some(b.to_string())
    } else if b == user_id {
        Some(a.to_string())
    } else {
        None
    }
}

pub struct Hub {
    auth: Arc<AuthService>,
    storage: Arc<Storage>,
    chats: RwLock<HashMap<String, Arc<ChatBuffer>>>,
    connected: RwLock<HashMap<String, ConnectionHandle>>,
    next_connection_id: AtomicU64,
}

impl Hub {
    /// Load the chat directory from storage, hydrate each ring's hot tail,
    /// make sure Town Hall exists and the DM mesh covers every active
    /// user.
    pub fn new(auth: Arc<AuthService>, storage: Arc<Storage>) -> Result<Arc<Self>, StorageError> {
        let hub = Arc::new(Self {
            auth,
            storage,
            chats: RwLock::new(HashMap::new()),
            connected: RwLock::new(HashMap::new()),
            next_connection_id: AtomicU64::new(1),
        });
        hub.bootstrap()?;
        Ok(hub)
    }

    fn bootstrap(self: &Arc<Self>) -> Result<(), StorageError> {
        {
            let mut chats = self.chats.write().expect("chat map poisoned");
            for chat in self.storage.list_chats()? {
                let buffer = self.make_buffer(&chat.id);
                buffer.hydrate(chat.last_seq)?;
                chats.insert(chat.id, buffer);
            }

            if !chats.contains_key(TOWNHALL_ID) {
                self.storage.upsert_chat(&Chat {
                    id: TOWNHALL_ID.to_string(),
                    name: TOWNHALL_NAME.to_string(),
                    last_seq: 0,
                    is_dm: false,
                    online: None,
                })?;
                chats.insert(TOWNHALL_ID.to_string(), self.make_buffer(TOWNHALL_ID));
            }
        }

        // The mesh may be incomplete (crash between registration and DM
        // creation, restored backups); rebuild it idempotently.
        let users = self.auth.get_users();
        for user in &users {
            self.ensure_dms_for(user, &users)?;
        }
        Ok(())
    }

    fn make_buffer(self: &Arc<Self>, chat_id: &str) -> Arc<ChatBuffer> {
        let weak: Weak<Hub> = Arc::downgrade(self);
        let callback = Box::new(move |receiver: &str, chat_id: &str, record: &ChatRecord| {
            if let Some(hub) = weak.upgrade() {
                hub.deliver_record(receiver, chat_id, record);
            }
        });
        Arc::new(ChatBuffer::new(
            chat_id,
            MAX_CHAT_RECORDS,
            Some(self.storage.clone()),
            Some(callback),
        ))
    }

    /// Record fan-out, called from inside the chat buffer lock: a single
    /// bounded enqueue per receiver, nothing more.
    fn deliver_record(&self, receiver: &str, chat_id: &str, record: &ChatRecord) {
        let connected = self.connected.read().expect("connected map poisoned");
        let Some(handle) = connected.get(receiver) else {
            return;
        };
        let event = ServerEvent::Messages {
            chat_id: chat_id.to_string(),
            messages: vec![record.to_wire_message()],
        };
        if handle.queue.try_send(event).is_err() {
            tracing::warn!(user_id = %receiver, chat_id = %chat_id, "delivery queue full, dropping record");
        }
    }

    fn send_to(&self, user_id: &str, event: ServerEvent) {
        let connected = self.connected.read().expect("connected map poisoned");
        if let Some(handle) = connected.get(user_id) {
            if handle.queue.try_send(event).is_err() {
                tracing::warn!(user_id = %user_id, "delivery queue full, dropping event");
            }
        }
    }

    fn broadcast_except(&self, skip_user: &str, event: &ServerEvent) {
        let connected = self.connected.read().expect("connected map poisoned");
        for (user_id, handle) in connected.iter() {
            if user_id == skip_user {
                continue;
            }
            if handle.queue.try_send(event.clone()).is_err() {
                tracing::warn!(user_id = %user_id, "delivery queue full, dropping event");
            }
        }
    }

    // --- connection lifecycle ---

    /// Register a connection: fresh delivery queue, membership in Town
    /// Hall and every DM of this user, presence online, `online` fan-out.
    /// The map keeps the only sender, so a second connection for the same
    /// user supersedes the first by closing its receiver. The returned id
    /// identifies this connection to [`disconnect`].
    ///
    /// [`disconnect`]: Hub::disconnect
    pub fn connect(&self, user_id: &str) -> (ConnectionId, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(DELIVERY_QUEUE_CAPACITY);
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut connected = self.connected.write().expect("connected map poisoned");
            connected.insert(user_id.to_string(), ConnectionHandle { id, queue: tx });
        }
        {
            let chats = self.chats.read().expect("chat map poisoned");
            for (chat_id, chat) in chats.iter() {
                if chat_id == TOWNHALL_ID || dm_includes(chat_id, user_id) {
                    chat.join(user_id);
                }
            }
        }

        self.auth.set_online(user_id);
        self.broadcast_except(
            user_id,
            &ServerEvent::Online {
                user_id: user_id.to_string(),
            },
        );

        (id, rx)
    }

    /// Tear a connection down. A stale actor (one whose registration was
    /// already superseded or force-closed) finds a different id, or none,
    /// and leaves the current state alone.
    pub fn disconnect(&self, user_id: &str, connection_id: ConnectionId) {
        {
            let mut connected = self.connected.write().expect("connected map poisoned");
            match connected.get(user_id) {
                Some(handle) if handle.id == connection_id => {
                    connected.remove(user_id);
                }
                _ => return,
            }
        }
        {
            let chats = self.chats.read().expect("chat map poisoned");
            for chat in chats.values() {
                chat.leave(user_id);
            }
        }

        self.auth.set_offline(user_id);
        self.broadcast_except(
            user_id,
            &ServerEvent::Offline {
                user_id: user_id.to_string(),
            },
        );
    }

    // --- inbound frames ---

    /// Route one client frame. Unknown chats and DMs the sender is not
    /// part of are protocol violations: silently dropped, connection kept.
    pub fn dispatch(&self, user_id: &str, frame: ClientFrame) {
        match frame {
            ClientFrame::Send {
                chat_id,
                content,
                attachments,
            } => {
                let Some(chat) = self.authorized_chat(user_id, &chat_id) else {
                    return;
                };
                let record = ChatRecord {
                    seq: 0,
                    timestamp: chrono::Utc::now().timestamp(),
                    user_id: user_id.to_string(),
                    content,
                    attachments,
                };
                if let Err(e) = chat.append(record) {
                    tracing::error!(chat_id = %chat_id, user_id = %user_id, error = %e, "failed to append record");
                }
            }
            ClientFrame::Join { chat_id } => {
                let Some(chat) = self.authorized_chat(user_id, &chat_id) else {
                    return;
                };
                let messages = chat
                    .last_n(JOIN_BACKFILL)
                    .iter()
                    .map(ChatRecord::to_wire_message)
                    .collect();
                self.send_to(
                    user_id,
                    ServerEvent::Messages {
                        chat_id,
                        messages,
                    },
                );
            }
            // Accepted for protocol symmetry; routing ignores it.
            ClientFrame::Leave { .. } => {}
        }
    }

    fn authorized_chat(&self, user_id: &str, chat_id: &str) -> Option<Arc<ChatBuffer>> {
        let chats = self.chats.read().expect("chat map poisoned");
        let chat = match chats.get(chat_id) {
            Some(chat) => chat.clone(),
            None => {
                tracing::debug!(chat_id = %chat_id, user_id = %user_id, "frame for unknown chat dropped");
                return None;
            }
        };
        if chat_id != TOWNHALL_ID && !dm_includes(chat_id, user_id) {
            tracing::debug!(chat_id = %chat_id, user_id = %user_id, "frame for foreign DM dropped");
            return None;
        }
        Some(chat)
    }

    // --- topology lifecycle ---

    /// Create any missing DM between `user` and each of `others`.
    /// Idempotent; participants that are currently connected are joined
    /// into the new buffers immediately.
    pub fn ensure_dms_for(self: &Arc<Self>, user: &User, others: &[User]) -> Result<(), StorageError> {
        let online: Vec<String> = {
            let connected = self.connected.read().expect("connected map poisoned");
            connected.keys().cloned().collect()
        };

        let mut chats = self.chats.write().expect("chat map poisoned");
        for other in others {
            if other.id == user.id || other.status == UserStatus::Deleted {
                continue;
            }
            let id = dm_id(&user.id, &other.id);
            if chats.contains_key(&id) {
                continue;
            }
            self.storage.upsert_chat(&Chat {
                id: id.clone(),
                name: String::new(),
                last_seq: 0,
                is_dm: true,
                online: None,
            })?;
            let buffer = self.make_buffer(&id);
            for participant in [&user.id, &other.id] {
                if online.iter().any(|u| u == participant) {
                    buffer.join(participant);
                }
            }
            chats.insert(id, buffer);
        }
        Ok(())
    }

    /// After a registration completes: grow the mesh and tell every other
    /// connected user about the newcomer and their new DM.
    pub fn broadcast_new_user(&self, user: &User) {
        let recipients: Vec<String> = {
            let connected = self.connected.read().expect("connected map poisoned");
            connected
                .keys()
                .filter(|u| u.as_str() != user.id)
                .cloned()
                .collect()
        };
        let newcomer_online = self.is_user_online(&user.id);

        for recipient in recipients {
            let chat = Chat {
                id: dm_id(&user.id, &recipient),
                name: user.display_name.clone(),
                last_seq: 0,
                is_dm: true,
                online: Some(newcomer_online),
            };
            self.send_to(
                &recipient,
                ServerEvent::New {
                    user: user.clone(),
                    chat,
                },
            );
        }
    }

    /// Admin delete: every DM involving the user disappears from the live
    /// map (persisted history remains), the user's own queue is closed and
    /// everyone else learns about it exactly once.
    pub fn remove_deleted_user(&self, user_id: &str) {
        {
            let mut chats = self.chats.write().expect("chat map poisoned");
            chats.retain(|chat_id, _| !dm_includes(chat_id, user_id));
            for chat in chats.values() {
                chat.leave(user_id);
            }
        }
        {
            let mut connected = self.connected.write().expect("connected map poisoned");
            connected.remove(user_id);
        }
        self.broadcast_except(
            user_id,
            &ServerEvent::Deleted {
                user_id: user_id.to_string(),
            },
        );
    }

    /// Password reset: drop the user's live queue (their websocket actor
    /// ends when the queue closes) and tell the others they went offline.
    pub fn disconnect_user(&self, user_id: &str) {
        let had_queue = {
            let mut connected = self.connected.write().expect("connected map poisoned");
            connected.remove(user_id).is_some()
        };
        if !had_queue {
            return;
        }
        {
            let chats = self.chats.read().expect("chat map poisoned");
            for chat in chats.values() {
                chat.leave(user_id);
            }
        }
        self.broadcast_except(
            user_id,
            &ServerEvent::Offline {
                user_id: user_id.to_string(),
            },
        );
    }

    // --- queries ---

    pub fn is_user_online(&self, user_id: &str) -> bool {
        self.connected
            .read()
            .expect("connected map poisoned")
            .contains_key(user_id)
    }

    /// The chat list for one user: Town Hall first, then their DMs sorted
    /// by the other party's display name, each DM flagged with the other
    /// party's connected state.
    pub fn get_chats(&self, user_id: &str) -> Vec<Chat> {
        let chats = self.chats.read().expect("chat map poisoned");

        let mut result = Vec::new();
        let mut dms = Vec::new();

        for (chat_id, buffer) in chats.iter() {
            if chat_id == TOWNHALL_ID {
                result.push(Chat {
                    id: TOWNHALL_ID.to_string(),
                    name: TOWNHALL_NAME.to_string(),
                    last_seq: buffer.last_seq(),
                    is_dm: false,
                    online: None,
                });
                continue;
            }
            let Some(peer) = dm_peer(chat_id, user_id) else {
                continue;
            };
            let name = self
                .auth
                .get_user(&peer)
                .map(|u| u.display_name)
                .unwrap_or_else(|| "Unknown User".to_string());
            dms.push(Chat {
                id: chat_id.clone(),
                name,
                last_seq: buffer.last_seq(),
                is_dm: true,
                online: Some(self.is_user_online(&peer)),
            });
        }

        dms.sort_by(|a, b| a.name.cmp(&b.name));
        result.extend(dms);
        result
    }
}
