//! Per-chat append-only log: a bounded in-memory ring with monotone
//! sequence numbers, backed by storage for anything the ring has evicted.
//!
//! All state sits behind a single exclusive lock. The record-emitted
//! callback runs while that lock is held, so callbacks must be O(1)
//! enqueue operations and must never call back into the buffer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::models::{Attachment, Message};
use crate::storage::{Storage, StorageError};

/// Invoked once per connected member for every appended record:
/// (receiver id, chat id, record).
pub type RecordCallback = Box<dyn Fn(&str, &str, &ChatRecord) + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct ChatRecord {
    pub seq: i64,
    pub timestamp: i64,
    pub user_id: String,
    pub content: String,
    pub attachments: Vec<Attachment>,
}

impl ChatRecord {
    pub fn to_message(&self, chat_id: &str) -> Message {
        Message {
            seq: self.seq,
            timestamp: self.timestamp,
            chat_id: chat_id.to_string(),
            user_id: self.user_id.clone(),
            content: self.content.clone(),
            attachments: self.attachments.clone(),
        }
    }

    /// Wire form: the enclosing frame already names the chat.
    pub fn to_wire_message(&self) -> Message {
        self.to_message("")
    }

    fn from_message(m: Message) -> Self {
        Self {
            seq: m.seq,
            timestamp: m.timestamp,
            user_id: m.user_id,
            content: m.content,
            attachments: m.attachments,
        }
    }
}

struct RingState {
    /// Circular buffer; once full, `head` marks the physical slot of the
    /// oldest record.
    records: Vec<ChatRecord>,
    head: usize,
    /// Seq of the oldest record still in memory; 0 while empty.
    first_seq: i64,
    /// Seq of the newest record ever appended; 0 for a virgin chat.
    last_seq: i64,
    /// userID -> currently-connected flag. Leaving keeps the entry.
    members: HashMap<String, bool>,
}

pub struct ChatBuffer {
    id: String,
    max_records: usize,
    storage: Option<Arc<Storage>>,
    callback: Option<RecordCallback>,
    state: Mutex<RingState>,
}

impl ChatBuffer {
    pub fn new(
        id: impl Into<String>,
        max_records: usize,
        storage: Option<Arc<Storage>>,
        callback: Option<RecordCallback>,
    ) -> Self {
        Self {
            id: id.into(),
            max_records: max_records.max(1),
            storage,
            callback,
            state: Mutex::new(RingState {
                records: Vec::new(),
                head: 0,
                first_seq: 0,
                last_seq: 0,
                members: HashMap::new(),
            }),
        }
    }

    pub fn last_seq(&self) -> i64 {
        self.state.lock().expect("chat lock poisoned").last_seq
    }

    /// Preload the hot tail of a persisted chat on startup. Must run
    /// before any append.
    pub fn hydrate(&self, persisted_last_seq: i64) -> Result<(), StorageError> {
        let mut state = self.state.lock().expect("chat lock poisoned");
        state.last_seq = persisted_last_seq;
        if persisted_last_seq == 0 {
            return Ok(());
        }
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        let from = (persisted_last_seq - self.max_records as i64 + 1).max(1);
        let messages = storage.list_messages(&self.id, from, persisted_last_seq)?;
        state.first_seq = messages.first().map(|m| m.seq).unwrap_or(0);
        state.records = messages.into_iter().map(ChatRecord::from_message).collect();
        state.head = 0;
        Ok(())
    }

    /// Assign the next seq, persist, slot into the ring and fan out to
    /// connected members. If persistence fails nothing in memory changes
    /// and the failure is returned.
    pub fn append(&self, mut record: ChatRecord) -> Result<ChatRecord, StorageError> {
        let mut state = self.state.lock().expect("chat lock poisoned");

        record.seq = state.last_seq + 1;

        if let Some(storage) = &self.storage {
            storage.upsert_message(&record.to_message(&self.id))?;
        }
        state.last_seq = record.seq;

        if state.records.len() < self.max_records {
            if state.first_seq == 0 {
                state.first_seq = record.seq;
            }
            state.records.push(record.clone());
        } else {
            let head = state.head;
            state.records[head] = record.clone();
            state.head = (head + 1) % self.max_records;
            state.first_seq += 1;
        }

        if let Some(callback) = &self.callback {
            for (user_id, connected) in &state.members {
                if *connected {
                    callback(user_id, &self.id, &record);
                }
            }
        }

        Ok(record)
    }

    /// Records in `[from, to]` inclusive, seq-ascending. A prefix older
    /// than the ring falls through to storage; an empty range is fine.
    pub fn range_by_seq(&self, from: i64, to: i64) -> Result<Vec<ChatRecord>, StorageError> {
        let state = self.state.lock().expect("chat lock poisoned");

        if state.last_seq == 0 || to < from {
            return Ok(Vec::new());
        }

        let from = from.max(1);
        let to = to.min(state.last_seq);
        if to < from {
            return Ok(Vec::new());
        }

        let mem_from = if state.records.is_empty() {
            state.last_seq + 1
        } else {
            state.first_seq
        };

        let mut result = Vec::new();

        if from < mem_from {
            if let Some(storage) = &self.storage {
                let store_to = to.min(mem_from - 1);
                if store_to >= from {
                    result.extend(
                        storage
                            .list_messages(&self.id, from, store_to)?
                            .into_iter()
                            .map(ChatRecord::from_message),
                    );
                }
            }
        }

        if to >= mem_from {
            let ring_from = from.max(mem_from);
            state.copy_range(ring_from, to, &mut result);
        }

        Ok(result)
    }

    /// The newest `n` records held in memory. Cold history is served by
    /// [`range_by_seq`]; the join backfill intentionally stops at the ring.
    ///
    /// [`range_by_seq`]: ChatBuffer::range_by_seq
    pub fn last_n(&self, n: usize) -> Vec<ChatRecord> {
        let state = self.state.lock().expect("chat lock poisoned");
        if state.last_seq == 0 || state.records.is_empty() || n == 0 {
            return Vec::new();
        }
        let window = (state.last_seq - state.first_seq + 1) as usize;
        let count = n.min(window);
        let from = state.last_seq - count as i64 + 1;
        let mut result = Vec::with_capacity(count);
        state.copy_range(from, state.last_seq, &mut result);
        result
    }

    pub fn join(&self, user_id: &str) {
        self.set_member(user_id, true);
    }

    pub fn leave(&self, user_id: &str) {
        self.set_member(user_id, false);
    }

    fn set_member(&self, user_id: &str, connected: bool) {
        let mut state = self.state.lock().expect("chat lock poisoned");
        state.members.insert(user_id.to_string(), connected);
    }
}

impl RingState {
    /// Copy `[from, to]` out of the ring. Caller guarantees the range is
    /// within `[first_seq, last_seq]` and the ring is non-empty.
    fn copy_range(&self, from: i64, to: i64, out: &mut Vec<ChatRecord>) {
        let count = (to - from + 1) as usize;
        let offset = (from - self.first_seq) as usize;
        let len = self.records.len();
        let start = (self.head + offset) % len;
        for i in 0..count {
            out.push(self.records[(start + i) % len].clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Chat;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn record(user: &str, content: &str) -> ChatRecord {
        ChatRecord {
            seq: 0,
            timestamp: 1_700_000_000,
            user_id: user.to_string(),
            content: content.to_string(),
            attachments: Vec::new(),
        }
    }

    fn storage_with_chat(id: &str) -> (Arc<Storage>, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Arc::new(Storage::open(dir.path().join("chat.db")).expect("open"));
        storage
            .upsert_chat(&Chat {
                id: id.to_string(),
                name: id.to_string(),
                last_seq: 0,
                is_dm: false,
                online: None,
            })
            .expect("chat");
        (storage, dir)
    }

    #[test]
    fn seqs_are_dense_from_one() {
        let chat = ChatBuffer::new("townhall", 3, None, None);
        for i in 1..=7 {
            let appended = chat.append(record("u1", &format!("msg {i}"))).unwrap();
            assert_eq!(appended.seq, i);
        }
        assert_eq!(chat.last_seq(), 7);
    }

    #[test]
    fn ring_keeps_only_the_tail() {
        let chat = ChatBuffer::new("townhall", 3, None, None);
        for i in 1..=5 {
            chat.append(record("u1", &format!("msg {i}"))).unwrap();
        }
        let tail = chat.last_n(100);
        assert_eq!(
            tail.iter().map(|r| r.seq).collect::<Vec<_>>(),
            vec![3, 4, 5]
        );
        assert_eq!(tail[0].content, "msg 3");

        let two = chat.last_n(2);
        assert_eq!(two.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![4, 5]);
    }

    #[test]
    fn empty_ranges_are_empty_not_errors() {
        let chat = ChatBuffer::new("townhall", 3, None, None);
        assert!(chat.last_n(10).is_empty());
        assert!(chat.range_by_seq(1, 100).unwrap().is_empty());

        chat.append(record("u1", "only")).unwrap();
        assert!(chat.range_by_seq(5, 2).unwrap().is_empty());
    }

    #[test]
    fn overflow_reads_fall_through_to_storage() {
        let (storage, _dir) = storage_with_chat("townhall");
        let chat = ChatBuffer::new("townhall", 5, Some(storage.clone()), None);

        for i in 1..=10 {
            chat.append(record("u1", &format!("msg {i}"))).unwrap();
        }

        // Everything is persisted even though the ring holds 5.
        assert_eq!(storage.list_messages("townhall", 1, 10).unwrap().len(), 10);

        let all = chat.range_by_seq(1, 10).unwrap();
        assert_eq!(
            all.iter().map(|r| r.seq).collect::<Vec<_>>(),
            (1..=10).collect::<Vec<_>>()
        );
        assert_eq!(all[0].content, "msg 1");
        assert_eq!(all[9].content, "msg 10");

        // A range straddling the storage/ring boundary.
        let mid = chat.range_by_seq(4, 7).unwrap();
        assert_eq!(mid.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![4, 5, 6, 7]);
    }

    #[test]
    fn failed_persist_leaves_memory_untouched() {
        let (storage, _dir) = storage_with_chat("townhall");
        // Buffer pointed at a chat id that has no chat record: every
        // persist fails.
        let chat = ChatBuffer::new("ghost", 5, Some(storage), None);
        assert!(chat.append(record("u1", "lost")).is_err());
        assert_eq!(chat.last_seq(), 0);
        assert!(chat.last_n(10).is_empty());

        // The next append (after the chat exists) starts again at seq 1.
    }

    #[test]
    fn hydrate_restores_the_hot_tail() {
        let (storage, _dir) = storage_with_chat("townhall");
        {
            let chat = ChatBuffer::new("townhall", 3, Some(storage.clone()), None);
            for i in 1..=8 {
                chat.append(record("u1", &format!("msg {i}"))).unwrap();
            }
        }

        let persisted = storage
            .list_chats()
            .unwrap()
            .into_iter()
            .find(|c| c.id == "townhall")
            .unwrap();
        let chat = ChatBuffer::new("townhall", 3, Some(storage), None);
        chat.hydrate(persisted.last_seq).unwrap();

        assert_eq!(chat.last_seq(), 8);
        assert_eq!(
            chat.last_n(10).iter().map(|r| r.seq).collect::<Vec<_>>(),
            vec![6, 7, 8]
        );

        let next = chat.append(record("u1", "msg 9")).unwrap();
        assert_eq!(next.seq, 9);
    }

    #[test]
    fn callback_fires_for_connected_members_only() {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let cb_hits = hits.clone();
        let cb_seen = seen.clone();
        let chat = ChatBuffer::new(
            "townhall",
            3,
            None,
            Some(Box::new(move |receiver, chat_id, rec| {
                cb_hits.fetch_add(1, Ordering::SeqCst);
                cb_seen
                    .lock()
                    .unwrap()
                    .push((receiver.to_string(), chat_id.to_string(), rec.seq));
            })),
        );

        chat.join("u1");
        chat.join("u2");
        chat.leave("u2");
        chat.append(record("u1", "hi")).unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[("u1".to_string(), "townhall".to_string(), 1)]
        );

        // u2 reappears.
        chat.join("u2");
        chat.append(record("u1", "again")).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn concurrent_appends_stay_dense() {
        let (storage, _dir) = storage_with_chat("townhall");
        let chat = Arc::new(ChatBuffer::new("townhall", 50, Some(storage.clone()), None));

        let mut handles = Vec::new();
        for t in 0..4 {
            let chat = chat.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..25 {
                    chat.append(record(&format!("u{t}"), &format!("m{t}-{i}")))
                        .unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let msgs = storage.list_messages("townhall", 1, 100).unwrap();
        assert_eq!(msgs.len(), 100);
        for (i, m) in msgs.iter().enumerate() {
            assert_eq!(m.seq, i as i64 + 1);
        }
        assert_eq!(chat.last_seq(), 100);
    }
}
