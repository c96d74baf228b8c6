// Segment downloader: fills the segment cache, one in-flight download per (session, segment).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::cache::SegmentCache;
use super::stats::StatsCollector;
use crate::error::ProctorError;
use crate::source::traits::ProctorRpc;

/// `(session, captured_at)`.
type SegmentKey = (String, i64);

#[derive(Debug, Clone)]
enum FetchState {
    Pending,
    Done(Bytes),
    Failed(String),
}

struct InFlight {
    id: u64,
    rx: watch::Receiver<FetchState>,
}

pub struct SegmentFetcher {
    rpc: Arc<dyn ProctorRpc>,
    cache: Arc<SegmentCache>,
    stats: Arc<StatsCollector>,
    in_flight: Arc<Mutex<HashMap<SegmentKey, InFlight>>>,
    next_id: AtomicU64,
    session_tokens: Mutex<HashMap<String, CancellationToken>>,
    /// Sessions no longer watched. Downloads for them are refused until revived.
    retired: Mutex<HashSet<String>>,
    shutdown_token: CancellationToken,
    max_retries: u32,
    retry_backoff: Duration,
}

impl SegmentFetcher {
    pub fn new(
        rpc: Arc<dyn ProctorRpc>,
        cache: Arc<SegmentCache>,
        stats: Arc<StatsCollector>,
        max_retries: u32,
    ) -> Self {
        Self {
            rpc,
            cache,
            stats,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            session_tokens: Mutex::new(HashMap::new()),
            retired: Mutex::new(HashSet::new()),
            shutdown_token: CancellationToken::new(),
            max_retries,
            retry_backoff: Duration::from_millis(500),
        }
    }

    /// Base delay between attempts; attempt `n` waits `n + 1` times this.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Cancel every in-flight download and refuse new ones.
    pub fn shutdown(&self) {
        self.shutdown_token.cancel();
    }

    /// Cancel in-flight downloads of one session. Later requests for it start fresh instead of
    /// joining a cancelled download.
    pub fn cancel_session(&self, session_id: &str) {
        if let Some(token) = self.session_tokens.lock().remove(session_id) {
            token.cancel();
        }
        self.in_flight.lock().retain(|(session, _), _| session != session_id);
    }

    /// Cancel a session's downloads and refuse new ones until `revive_session`.
    pub fn retire_session(&self, session_id: &str) {
        self.retired.lock().insert(session_id.to_string());
        self.cancel_session(session_id);
    }

    pub fn revive_session(&self, session_id: &str) {
        self.retired.lock().remove(session_id);
    }

    pub fn is_retired(&self, session_id: &str) -> bool {
        self.retired.lock().contains(session_id)
    }

    /// Sessions holding a cancellation token, i.e. with downloads started since their last cancel.
    pub fn tracked_sessions(&self) -> usize {
        self.session_tokens.lock().len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Fire-and-forget background download into the cache. Failures are only logged.
    pub fn prefetch(&self, session_id: &str, captured_at: i64, url: &str) {
        if self.cache.contains(session_id, captured_at) {
            return;
        }
        let _ = self.start_download(session_id, captured_at, url);
    }

    /// Cached blob, or download it now. Joins a download already in flight for the same segment.
    pub async fn fetch(&self, session_id: &str, captured_at: i64, url: &str) -> Result<Bytes> {
        if let Some(blob) = self.cache.get(session_id, captured_at) {
            return Ok(blob);
        }

        let mut rx = self
            .start_download(session_id, captured_at, url)
            .ok_or_else(|| anyhow!("segment fetch for session {} cancelled", session_id))?;

        let state = rx
            .wait_for(|s| !matches!(s, FetchState::Pending))
            .await
            .map(|s| s.clone())
            .map_err(|_| anyhow!("segment {} of session {} abandoned", captured_at, session_id))?;

        match state {
            FetchState::Done(blob) => Ok(blob),
            FetchState::Failed(reason) => Err(ProctorError::NetworkFailure(reason).into()),
            FetchState::Pending => Err(anyhow!("segment {} still pending", captured_at)),
        }
    }

    /// `None` once the session is retired. Checked under the token lock so a concurrent
    /// `retire_session` either sees the new token or this call sees the retirement.
    fn session_token(&self, session_id: &str) -> Option<CancellationToken> {
        let mut tokens = self.session_tokens.lock();
        if self.is_retired(session_id) {
            return None;
        }
        Some(
            tokens
                .entry(session_id.to_string())
                .or_insert_with(|| self.shutdown_token.child_token())
                .clone(),
        )
    }

    fn start_download(
        &self,
        session_id: &str,
        captured_at: i64,
        url: &str,
    ) -> Option<watch::Receiver<FetchState>> {
        if self.shutdown_token.is_cancelled() {
            return None;
        }
        let token = self.session_token(session_id)?;

        let key = (session_id.to_string(), captured_at);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = {
            let mut in_flight = self.in_flight.lock();
            if let Some(existing) = in_flight.get(&key) {
                debug!("session {} segment {} already in flight", session_id, captured_at);
                return Some(existing.rx.clone());
            }
            let (tx, rx) = watch::channel(FetchState::Pending);
            in_flight.insert(key.clone(), InFlight { id, rx: rx.clone() });
            (tx, rx)
        };

        let rpc = Arc::clone(&self.rpc);
        let cache = Arc::clone(&self.cache);
        let stats = Arc::clone(&self.stats);
        let in_flight = Arc::clone(&self.in_flight);
        let max_retries = self.max_retries;
        let backoff = self.retry_backoff;
        let url = url.to_string();

        tokio::spawn(async move {
            stats.increment_workers();
            let result = tokio::select! {
                r = Self::fetch_with_retry(&rpc, &key, &url, max_retries, backoff) => Some(r),
                _ = token.cancelled() => None,
            };
            stats.decrement_workers();

            let state = match result {
                Some(Ok(_)) if token.is_cancelled() => {
                    debug!("session {} segment {} finished after cancel, dropped", key.0, key.1);
                    FetchState::Failed("cancelled".to_string())
                }
                Some(Ok(blob)) => {
                    stats.record_downloaded(blob.len() as u64);
                    cache.put(&key.0, key.1, blob.clone());
                    debug!("session {} segment {} cached ({} bytes)", key.0, key.1, blob.len());
                    FetchState::Done(blob)
                }
                Some(Err(e)) => {
                    stats.record_fetch_failure();
                    warn!("session {} segment {} fetch failed: {:#}", key.0, key.1, e);
                    FetchState::Failed(e.to_string())
                }
                None => {
                    debug!("session {} segment {} cancelled", key.0, key.1);
                    FetchState::Failed("cancelled".to_string())
                }
            };

            {
                let mut in_flight = in_flight.lock();
                if in_flight.get(&key).is_some_and(|entry| entry.id == id) {
                    in_flight.remove(&key);
                }
            }
            let _ = tx.send(state);
        });

        Some(rx)
    }

    async fn fetch_with_retry(
        rpc: &Arc<dyn ProctorRpc>,
        key: &SegmentKey,
        url: &str,
        max_retries: u32,
        backoff: Duration,
    ) -> Result<Bytes> {
        let mut attempt = 0u32;
        loop {
            match rpc.fetch_segment(url).await {
                Ok(blob) => return Ok(blob),
                Err(e) if attempt < max_retries && ProctorError::is_retryable(&e) => {
                    warn!(
                        "session {} segment {} fetch failed (attempt {}): {:#}",
                        key.0, key.1, attempt, e
                    );
                    tokio::time::sleep(backoff * (attempt + 1)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
