use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use parking_lot::RwLock;
use tokio::sync::mpsc;

/// Default room every session joins on connect, absent an explicit
/// `change_room`.
pub const DEFAULT_ROOM: &str = "lobby";

/// Per-session rate limiter enforcing ≤ 30 msg/s over a tumbling one-second
/// window, mirroring the corpus's own per-connection RPC rate limiter.
pub struct RateLimiter {
    count: u32,
    window_start: Instant,
    limit: u32,
}

impl RateLimiter {
    pub fn new(limit: u32) -> Self {
        Self {
            count: 0,
            window_start: Instant::now(),
            limit,
        }
    }

    /// Returns `true` if this message is allowed under the current window.
    pub fn check(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.window_start).as_secs() >= 1 {
            self.count = 0;
            self.window_start = now;
        }
        self.count += 1;
        self.count <= self.limit
    }
}

/// Maximum queued messages held per disconnected nickname before the oldest
/// is dropped to bound memory.
const MAX_QUEUED_PER_PEER: usize = 256;

/// A live, connected session: its nickname, public key, current room, and
/// the sending half of the channel that forwards frames to its socket task.
pub struct SessionHandle {
    pub session_id: String,
    pub nickname: String,
    pub public_key: String, // base64, opaque to the relay beyond routing
    pub room: String,
    pub outbound: mpsc::Sender<String>,
    pub rate_limiter: RateLimiter,
}

/// In-memory session registry the relay server shares across every
/// connection task. Unlike the single-threaded crypto core, this layer is
/// genuinely multi-session, so it takes a lock — `parking_lot::RwLock`.
pub struct SessionRegistry {
    inner: RwLock<Inner>,
}

struct Inner {
    sessions: HashMap<String, SessionHandle>,
    nickname_to_session: HashMap<String, String>,
    last_known_key: HashMap<String, String>,
    offline_queue: HashMap<String, VecDeque<String>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                sessions: HashMap::new(),
                nickname_to_session: HashMap::new(),
                last_known_key: HashMap::new(),
                offline_queue: HashMap::new(),
            }),
        }
    }

    /// `true` if `nickname` (case-insensitive) is already registered to a
    /// live session in `room`.
    pub fn nickname_taken(&self, room: &str, nickname: &str) -> bool {
        let key = nickname.to_lowercase();
        let inner = self.inner.read();
        inner
            .nickname_to_session
            .get(&key)
            .and_then(|sid| inner.sessions.get(sid))
            .is_some_and(|s| s.room == room)
    }

    /// Register a newly-joined session. Returns the number of queued
    /// messages flushed to it (per the offline-queue policy: the queue
    /// survives only if `public_key` matches what this nickname last
    /// presented — see `DESIGN.md`'s Open-Question #3 resolution).
    pub fn join(&self, handle: SessionHandle) -> Vec<String> {
        let key = handle.nickname.to_lowercase();
        let mut inner = self.inner.write();

        let same_key = inner
            .last_known_key
            .get(&key)
            .is_some_and(|k| *k == handle.public_key);

        let flushed = if same_key {
            inner
                .offline_queue
                .remove(&key)
                .map(|q| q.into_iter().collect())
                .unwrap_or_default()
        } else {
            if inner.offline_queue.remove(&key).is_some() {
                tracing::warn!(
                    nickname = %handle.nickname,
                    "discarding queued messages — reconnecting peer presented a different public key"
                );
            }
            Vec::new()
        };

        inner.last_known_key.insert(key.clone(), handle.public_key.clone());
        inner.nickname_to_session.insert(key, handle.session_id.clone());
        inner.sessions.insert(handle.session_id.clone(), handle);
        flushed
    }

    /// Remove a session on disconnect.
    pub fn leave(&self, session_id: &str) -> Option<SessionHandle> {
        let mut inner = self.inner.write();
        let handle = inner.sessions.remove(session_id)?;
        let key = handle.nickname.to_lowercase();
        if inner.nickname_to_session.get(&key) == Some(&handle.session_id) {
            inner.nickname_to_session.remove(&key);
        }
        Some(handle)
    }

    /// Look up a live session's outbound sender by nickname, within `room`.
    pub fn find_by_nickname(&self, room: &str, nickname: &str) -> Option<(String, mpsc::Sender<String>)> {
        let key = nickname.to_lowercase();
        let inner = self.inner.read();
        let session_id = inner.nickname_to_session.get(&key)?;
        let handle = inner.sessions.get(session_id)?;
        if handle.room != room {
            return None;
        }
        Some((handle.session_id.clone(), handle.outbound.clone()))
    }

    /// Queue a frame for a currently-disconnected nickname, bounded to
    /// `MAX_QUEUED_PER_PEER` with oldest-drop overflow.
    pub fn queue_offline(&self, nickname: &str, frame: String) {
        let key = nickname.to_lowercase();
        let mut inner = self.inner.write();
        let queue = inner.offline_queue.entry(key).or_default();
        if queue.len() >= MAX_QUEUED_PER_PEER {
            queue.pop_front();
        }
        queue.push_back(frame);
    }

    /// `true` if a live session is registered under `nickname` (any room).
    pub fn is_online(&self, nickname: &str) -> bool {
        let key = nickname.to_lowercase();
        self.inner.read().nickname_to_session.contains_key(&key)
    }

    /// Every other live session currently in `room`, for broadcast.
    pub fn room_members(&self, room: &str, except: &str) -> Vec<(String, mpsc::Sender<String>)> {
        self.inner
            .read()
            .sessions
            .values()
            .filter(|s| s.room == room && s.session_id != except)
            .map(|s| (s.session_id.clone(), s.outbound.clone()))
            .collect()
    }

    /// A summary of every live peer in `room`, for `join_ack`.
    pub fn room_roster(&self, room: &str) -> Vec<(String, String, String)> {
        self.inner
            .read()
            .sessions
            .values()
            .filter(|s| s.room == room)
            .map(|s| (s.session_id.clone(), s.nickname.clone(), s.public_key.clone()))
            .collect()
    }

    /// Every distinct room name with at least one live session.
    pub fn room_list(&self) -> Vec<String> {
        let mut rooms: Vec<String> = self
            .inner
            .read()
            .sessions
            .values()
            .map(|s| s.room.clone())
            .collect();
        rooms.sort();
        rooms.dedup();
        rooms
    }

    /// Move a live session to a new room, returning its previous room.
    pub fn change_room(&self, session_id: &str, new_room: &str) -> Option<String> {
        let mut inner = self.inner.write();
        let handle = inner.sessions.get_mut(session_id)?;
        let old = handle.room.clone();
        handle.room = new_room.to_string();
        Some(old)
    }

    /// Check (and record) whether `session_id`'s next message is within its
    /// rate limit.
    pub fn check_rate(&self, session_id: &str) -> bool {
        let mut inner = self.inner.write();
        inner
            .sessions
            .get_mut(session_id)
            .map(|s| s.rate_limiter.check())
            .unwrap_or(false)
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(session_id: &str, nickname: &str, room: &str) -> (SessionHandle, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(8);
        (
            SessionHandle {
                session_id: session_id.to_string(),
                nickname: nickname.to_string(),
                public_key: "pk".to_string(),
                room: room.to_string(),
                outbound: tx,
                rate_limiter: RateLimiter::new(30),
            },
            rx,
        )
    }

    #[test]
    fn nickname_uniqueness_within_room() {
        let registry = SessionRegistry::new();
        let (h, _rx) = handle("s1", "Alice", DEFAULT_ROOM);
        registry.join(h);
        assert!(registry.nickname_taken(DEFAULT_ROOM, "alice"));
        assert!(!registry.nickname_taken("other-room", "alice"));
    }

    #[test]
    fn offline_queue_flushes_on_matching_key_rejoin() {
        let registry = SessionRegistry::new();
        let (h, _rx) = handle("s1", "bob", DEFAULT_ROOM);
        registry.join(h);
        registry.leave("s1");

        registry.queue_offline("bob", "frame-1".to_string());
        registry.queue_offline("bob", "frame-2".to_string());

        let (h2, _rx2) = handle("s2", "bob", DEFAULT_ROOM);
        let flushed = registry.join(h2);
        assert_eq!(flushed, vec!["frame-1".to_string(), "frame-2".to_string()]);
    }

    #[test]
    fn offline_queue_discarded_on_key_change() {
        let registry = SessionRegistry::new();
        let (h, _rx) = handle("s1", "carol", DEFAULT_ROOM);
        registry.join(h);
        registry.leave("s1");
        registry.queue_offline("carol", "frame-1".to_string());

        let (tx, _rx2) = mpsc::channel(8);
        let h2 = SessionHandle {
            session_id: "s2".to_string(),
            nickname: "carol".to_string(),
            public_key: "different-pk".to_string(),
            room: DEFAULT_ROOM.to_string(),
            outbound: tx,
            rate_limiter: RateLimiter::new(30),
        };
        let flushed = registry.join(h2);
        assert!(flushed.is_empty());
    }

    #[test]
    fn room_change_moves_membership() {
        let registry = SessionRegistry::new();
        let (h, _rx) = handle("s1", "dave", DEFAULT_ROOM);
        registry.join(h);
        assert_eq!(registry.room_members("other", "").len(), 0);

        let old = registry.change_room("s1", "other").unwrap();
        assert_eq!(old, DEFAULT_ROOM);
        assert_eq!(registry.room_members("other", "").len(), 1);
    }

    #[test]
    fn rate_limiter_rejects_overflow() {
        let mut limiter = RateLimiter::new(3);
        assert!(limiter.check());
        assert!(limiter.check());
        assert!(limiter.check());
        assert!(!limiter.check());
    }
}
