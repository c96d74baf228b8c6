// Coordinator loop: owns every watched session and drives refresh, liveness and polling per tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use futures::future::join_all;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::alerts::{BroadcastReload, CriticalAlerts, ReloadAction};
use super::cache::SegmentCache;
use super::events::CoordinatorEvent;
use super::fetcher::SegmentFetcher;
use super::liveness::{Clock, LivenessMonitor, SystemClock};
use super::playlist::{Direction, Playback, PlaylistTracker, SegmentRef};
use super::poller::MessagePoller;
use super::session::{SessionHandle, SessionStatus};
use super::stats::{StatsCollector, StatsSnapshot};
use super::view::SessionView;
use crate::config::{CoordinatorConfig, TERMINATE_CONFIRMATION};
use crate::error::ProctorError;
use crate::source::traits::{OutgoingMessage, ProctorRpc};

/// What one session's tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    pub session_id: String,
    pub playlist_ok: bool,
    pub new_messages: usize,
    pub disconnected: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub outcomes: Vec<SessionOutcome>,
    /// Sessions whose previous tick was still running.
    pub skipped: Vec<String>,
}

impl TickReport {
    pub fn outcome(&self, session_id: &str) -> Option<&SessionOutcome> {
        self.outcomes.iter().find(|o| o.session_id == session_id)
    }
}

pub struct CoordinatorBuilder {
    config: CoordinatorConfig,
    rpc: Arc<dyn ProctorRpc>,
    clock: Option<Arc<dyn Clock>>,
    reload: Option<Arc<dyn ReloadAction>>,
    fetch_backoff: Option<Duration>,
}

impl CoordinatorBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn reload_action(mut self, action: Arc<dyn ReloadAction>) -> Self {
        self.reload = Some(action);
        self
    }

    pub fn fetch_retry_backoff(mut self, backoff: Duration) -> Self {
        self.fetch_backoff = Some(backoff);
        self
    }

    pub fn build(self) -> Arc<Coordinator> {
        let config = self.config;
        let rpc = self.rpc;
        let (events, _) = broadcast::channel(256);
        let shutdown = CancellationToken::new();
        let stats = Arc::new(StatsCollector::new());
        let cache = Arc::new(SegmentCache::new(config.max_cached_segments));

        let mut fetcher = SegmentFetcher::new(
            rpc.clone(),
            cache.clone(),
            stats.clone(),
            config.fetch_max_retries,
        );
        if let Some(backoff) = self.fetch_backoff {
            fetcher = fetcher.with_retry_backoff(backoff);
        }
        let fetcher = Arc::new(fetcher);

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let reload = self
            .reload
            .unwrap_or_else(|| Arc::new(BroadcastReload::new(events.clone())));

        Arc::new(Coordinator {
            tracker: PlaylistTracker::new(rpc.clone(), fetcher.clone()),
            poller: MessagePoller::new(rpc.clone()),
            liveness: LivenessMonitor::new(
                clock,
                config.disconnect_after(),
                config.segment_interval(),
            ),
            alerts: CriticalAlerts::new(
                reload,
                events.clone(),
                config.critical_reload_delay(),
                shutdown.clone(),
            ),
            sessions: RwLock::new(HashMap::new()),
            config,
            rpc,
            cache,
            fetcher,
            stats,
            events,
            shutdown,
        })
    }
}

pub struct Coordinator {
    config: CoordinatorConfig,
    rpc: Arc<dyn ProctorRpc>,
    cache: Arc<SegmentCache>,
    fetcher: Arc<SegmentFetcher>,
    tracker: PlaylistTracker,
    poller: MessagePoller,
    liveness: LivenessMonitor,
    alerts: CriticalAlerts,
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
    stats: Arc<StatsCollector>,
    events: broadcast::Sender<CoordinatorEvent>,
    shutdown: CancellationToken,
}

impl Coordinator {
    pub fn builder(config: CoordinatorConfig, rpc: Arc<dyn ProctorRpc>) -> CoordinatorBuilder {
        CoordinatorBuilder {
            config,
            rpc,
            clock: None,
            reload: None,
            fetch_backoff: None,
        }
    }

    pub fn new(config: CoordinatorConfig, rpc: Arc<dyn ProctorRpc>) -> Arc<Self> {
        Self::builder(config, rpc).build()
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<SegmentCache> {
        &self.cache
    }

    pub fn fetcher(&self) -> &Arc<SegmentFetcher> {
        &self.fetcher
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot(
            self.cache.hits(),
            self.cache.misses(),
            self.alerts.is_armed(),
        )
    }

    // ---- session registry ----

    /// Start tracking a session. Returns false if it was already watched.
    pub fn watch(&self, session_id: &str, status: SessionStatus) -> bool {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(session_id) {
            return false;
        }
        let handle = SessionHandle::new(session_id.to_string(), status, &self.shutdown);
        sessions.insert(session_id.to_string(), Arc::new(handle));
        self.fetcher.revive_session(session_id);
        info!("watching session {} ({:?})", session_id, status);
        true
    }

    /// Stop tracking a session: cancel its tasks and downloads, drop its cached segments.
    ///
    /// A tick already running for the session cannot repopulate the cache afterwards.
    pub fn unwatch(&self, session_id: &str) -> bool {
        let removed = self.sessions.write().remove(session_id);
        match removed {
            Some(handle) => {
                handle.teardown();
                self.fetcher.retire_session(session_id);
                self.cache.evict_session(session_id);
                info!("stopped watching session {}", session_id);
                true
            }
            None => false,
        }
    }

    pub fn is_watching(&self, session_id: &str) -> bool {
        self.sessions.read().contains_key(session_id)
    }

    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn handle(&self, session_id: &str) -> Result<Arc<SessionHandle>> {
        self.sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| ProctorError::UnknownSession(session_id.to_string()).into())
    }

    /// Apply a server-reported status.
    pub fn set_status(&self, session_id: &str, status: SessionStatus) -> Result<()> {
        let handle = self.handle(session_id)?;
        handle.with_state(|s| s.status = status);
        if status.is_terminal() {
            handle.stop_chat();
        }
        Ok(())
    }

    // ---- ticking ----

    /// Refresh every watched, non-terminal session concurrently and wait for all of them.
    ///
    /// A session still busy with an earlier tick is skipped. One session failing never affects
    /// another.
    pub async fn tick(self: &Arc<Self>) -> TickReport {
        self.stats.record_tick();
        let handles: Vec<Arc<SessionHandle>> = self.sessions.read().values().cloned().collect();

        let mut report = TickReport::default();
        let mut tasks = Vec::with_capacity(handles.len());
        for handle in handles {
            if handle.is_cancelled() || handle.status().is_terminal() {
                continue;
            }
            match handle.try_begin_tick() {
                Some(guard) => {
                    let this = Arc::clone(self);
                    tasks.push(tokio::spawn(async move {
                        this.refresh_session(guard.handle()).await
                    }));
                }
                None => {
                    debug!("session {} previous tick still in flight", handle.session_id());
                    self.stats.record_skipped();
                    report.skipped.push(handle.session_id().to_string());
                }
            }
        }

        for result in join_all(tasks).await {
            match result {
                Ok(outcome) => report.outcomes.push(outcome),
                Err(e) => error!("session tick task failed: {}", e),
            }
        }
        report
    }

    /// Playlist refresh, then liveness, then messages. Every step runs even if an earlier one failed.
    async fn refresh_session(&self, handle: &SessionHandle) -> SessionOutcome {
        let session_id = handle.session_id().to_string();

        let playlist_ok = match self.tracker.refresh(handle).await {
            Ok(_) => {
                handle.with_state(|s| s.last_error = None);
                true
            }
            Err(e) => {
                warn!("session {} playlist refresh failed: {:#}", session_id, e);
                handle.with_state(|s| s.last_error = Some(format!("{:#}", e)));
                false
            }
        };
        self.stats.record_refresh(playlist_ok);

        let disconnected = handle.with_state(|s| {
            let disconnected = self.liveness.is_disconnected(&s.playlist);
            s.disconnected = disconnected;
            s.missed_uploads = self.liveness.missed_uploads(&s.playlist);
            s.status = s.status.with_liveness(disconnected);
            disconnected
        });

        let new_messages = if handle.is_cancelled() {
            0
        } else {
            match self.poll_messages(handle).await {
                Ok(count) => count,
                Err(e) => {
                    warn!("session {} message poll failed: {:#}", session_id, e);
                    0
                }
            }
        };

        handle.with_state(|s| s.refreshed = true);

        SessionOutcome {
            session_id,
            playlist_ok,
            new_messages,
            disconnected,
        }
    }

    async fn poll_messages(&self, handle: &SessionHandle) -> Result<usize> {
        let new = self.poller.poll(handle).await?;
        if new.is_empty() {
            return Ok(0);
        }

        let session_id = handle.session_id();
        let count = new.len();
        handle.with_state(|s| s.chat.extend(new.iter().cloned()));
        self.stats.record_messages(count);
        debug!("session {} +{} messages", session_id, count);
        let _ = self.events.send(CoordinatorEvent::NewMessages {
            session_id: session_id.to_string(),
            count,
        });
        self.alerts.raise(session_id, &new);
        Ok(count)
    }

    /// Tick on the dashboard period until `shutdown` is called.
    ///
    /// Each tick runs on its own task, so a slow tick never delays the next one; the per-session
    /// guard keeps the same session from being refreshed twice at once.
    pub async fn run(self: Arc<Self>) {
        let period = self.config.dashboard_poll();
        info!("coordinator loop started, period={}ms", period.as_millis());
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let this = Arc::clone(&self);
                    tokio::spawn(async move {
                        this.tick().await;
                    });
                }
            }
        }
        info!("coordinator loop stopped");
    }

    /// Forced resynchronisation: drop cached segments, show every session as loading again and
    /// refresh immediately. Seen-sets survive so old messages are not re-delivered.
    pub async fn resync(self: &Arc<Self>) -> TickReport {
        info!("resynchronising all sessions");
        let handles: Vec<Arc<SessionHandle>> = self.sessions.read().values().cloned().collect();
        for handle in &handles {
            self.fetcher.cancel_session(handle.session_id());
            handle.with_state(|s| {
                s.refreshed = false;
                s.last_error = None;
            });
        }
        self.cache.clear();
        self.tick().await
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.fetcher.shutdown();
        for handle in self.sessions.read().values() {
            handle.teardown();
        }
    }

    // ---- chat ----

    /// Poll one session's messages on the chat period until `close_chat` or unwatch.
    pub fn open_chat(self: &Arc<Self>, session_id: &str) -> Result<()> {
        let handle = self.handle(session_id)?;
        let token = handle.cancel_token().child_token();
        let period = self.config.chat_poll();

        let this = Arc::clone(self);
        let task_handle = Arc::clone(&handle);
        let task_token = token.clone();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = this.poll_messages(&task_handle).await {
                            warn!("session {} chat poll failed: {:#}", task_handle.session_id(), e);
                        }
                    }
                }
            }
        });

        handle.set_chat_task(token, task);
        info!("chat opened for session {}", session_id);
        Ok(())
    }

    pub fn close_chat(&self, session_id: &str) -> Result<bool> {
        let handle = self.handle(session_id)?;
        Ok(handle.stop_chat())
    }

    /// Post a proctor chat message. Blank messages are rejected without a request.
    pub async fn send_message(&self, session_id: &str, body: &str) -> Result<()> {
        let handle = self.handle(session_id)?;
        if body.trim().is_empty() {
            bail!("message body is empty");
        }
        self.rpc
            .post_message(handle.session_id(), &OutgoingMessage::proctor_chat(body))
            .await
    }

    /// Terminate a candidate's exam. Irreversible, so the proctor must type the confirmation text.
    pub async fn terminate(&self, session_id: &str, confirmation: &str) -> Result<()> {
        if confirmation != TERMINATE_CONFIRMATION {
            return Err(ProctorError::ConfirmationMismatch.into());
        }
        let handle = self.handle(session_id)?;
        self.rpc.terminate_session(session_id).await?;

        handle.with_state(|s| s.status = SessionStatus::Terminated);
        handle.stop_chat();
        let _ = self.events.send(CoordinatorEvent::SessionTerminated {
            session_id: session_id.to_string(),
        });
        info!("session {} terminated", session_id);
        Ok(())
    }

    // ---- navigation ----

    pub fn advance(&self, session_id: &str, direction: Direction) -> Result<Option<SegmentRef>> {
        let handle = self.handle(session_id)?;
        Ok(self.tracker.advance(&handle, direction))
    }

    pub fn jump_to_live(&self, session_id: &str) -> Result<Option<SegmentRef>> {
        let handle = self.handle(session_id)?;
        Ok(self.tracker.jump_to_live(&handle))
    }

    pub fn seek(&self, session_id: &str, index: usize) -> Result<Option<SegmentRef>> {
        let handle = self.handle(session_id)?;
        Ok(self.tracker.seek(&handle, index))
    }

    pub fn current_segment(&self, session_id: &str) -> Result<Option<SegmentRef>> {
        let handle = self.handle(session_id)?;
        Ok(self.tracker.current_segment(&handle))
    }

    pub async fn current_playback(&self, session_id: &str) -> Result<Option<Playback>> {
        let handle = self.handle(session_id)?;
        self.tracker.current_playback(&handle).await
    }

    pub async fn segment_ended(&self, session_id: &str) -> Result<Option<Playback>> {
        let handle = self.handle(session_id)?;
        self.tracker.segment_ended(&handle).await
    }

    /// Player progress inside the current segment, used for the capture clock.
    pub fn set_playback_offset(&self, session_id: &str, offset_secs: f64) -> Result<()> {
        let handle = self.handle(session_id)?;
        handle.with_state(|s| s.playback_offset_secs = offset_secs.max(0.0));
        Ok(())
    }

    // ---- views ----

    pub fn view(&self, session_id: &str) -> Result<SessionView> {
        let handle = self.handle(session_id)?;
        Ok(self.reconcile(&handle))
    }

    pub fn views(&self) -> Vec<SessionView> {
        let mut handles: Vec<Arc<SessionHandle>> =
            self.sessions.read().values().cloned().collect();
        handles.sort_by(|a, b| a.session_id().cmp(b.session_id()));
        handles.iter().map(|h| self.reconcile(h)).collect()
    }

    fn reconcile(&self, handle: &SessionHandle) -> SessionView {
        let now = self.liveness.now_millis();
        let chat_open = handle.chat_open();
        handle.with_state(|s| SessionView::reconcile(handle.session_id(), s, chat_open, now))
    }
}
