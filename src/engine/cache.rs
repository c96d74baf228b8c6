// In-memory segment blob cache: bounded per session, strict FIFO eviction.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

/// Blobs are keyed by capture timestamp, which stays fixed for a segment while its position in
/// the playlist may shift.
struct CachedSegment {
    captured_at: i64,
    blob: Bytes,
}

pub struct SegmentCache {
    entries: Mutex<HashMap<String, VecDeque<CachedSegment>>>,
    max_per_session: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl SegmentCache {
    /// `max_per_session` is raised to 1 if zero.
    pub fn new(max_per_session: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_per_session: max_per_session.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Store a blob. The oldest insertion for the session is dropped once the bound is exceeded,
    /// regardless of how recently it was read.
    ///
    /// Re-storing a segment already held replaces the blob but keeps its queue position.
    pub fn put(&self, session_id: &str, captured_at: i64, blob: Bytes) {
        let mut entries = self.entries.lock();
        let queue = entries.entry(session_id.to_string()).or_default();

        if let Some(existing) = queue.iter_mut().find(|c| c.captured_at == captured_at) {
            existing.blob = blob;
            return;
        }

        queue.push_back(CachedSegment { captured_at, blob });
        while queue.len() > self.max_per_session {
            if let Some(evicted) = queue.pop_front() {
                debug!("session {} evicted segment {}", session_id, evicted.captured_at);
            }
        }
    }

    /// Cached blob, or `None` on a miss. Never fetches.
    pub fn get(&self, session_id: &str, captured_at: i64) -> Option<Bytes> {
        let found = {
            let entries = self.entries.lock();
            entries
                .get(session_id)
                .and_then(|q| q.iter().find(|c| c.captured_at == captured_at))
                .map(|c| c.blob.clone())
        };
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Presence check that does not count towards hit statistics.
    pub fn contains(&self, session_id: &str, captured_at: i64) -> bool {
        let entries = self.entries.lock();
        entries
            .get(session_id)
            .is_some_and(|q| q.iter().any(|c| c.captured_at == captured_at))
    }

    pub fn len(&self, session_id: &str) -> usize {
        let entries = self.entries.lock();
        entries.get(session_id).map_or(0, VecDeque::len)
    }

    /// Segments held for a session, oldest insertion first.
    pub fn keys(&self, session_id: &str) -> Vec<i64> {
        let entries = self.entries.lock();
        entries
            .get(session_id)
            .map(|q| q.iter().map(|c| c.captured_at).collect())
            .unwrap_or_default()
    }

    pub fn evict_session(&self, session_id: &str) {
        self.entries.lock().remove(session_id);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn max_per_session(&self) -> usize {
        self.max_per_session
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Total cached bytes across all sessions.
    pub fn cached_bytes(&self) -> u64 {
        let entries = self.entries.lock();
        entries
            .values()
            .flat_map(|q| q.iter())
            .map(|c| c.blob.len() as u64)
            .sum()
    }
}
