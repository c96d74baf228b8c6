// Per-session state object: playlist, seen-set, chat pane and the session's task handles.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::playlist::Playlist;
use super::poller::SeenSet;
use crate::source::traits::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Registered,
    Started,
    Offline,
    Terminated,
    Submitted,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Terminated | SessionStatus::Submitted)
    }

    /// Fold the local liveness verdict into the server-reported status.
    pub fn with_liveness(self, disconnected: bool) -> Self {
        match (self, disconnected) {
            (SessionStatus::Started, true) => SessionStatus::Offline,
            (SessionStatus::Offline, false) => SessionStatus::Started,
            (status, _) => status,
        }
    }
}

pub struct SessionState {
    pub status: SessionStatus,
    pub playlist: Playlist,
    pub seen: SeenSet,
    /// Messages in delivery order, rendered as the chat pane.
    pub chat: Vec<Message>,
    /// Liveness verdict of the last tick.
    pub disconnected: bool,
    /// Segment uploads overdue at the last tick.
    pub missed_uploads: u64,
    /// False until the first tick resolves (or again after a resync).
    pub refreshed: bool,
    /// Error of the last failed playlist refresh; cleared on success.
    pub last_error: Option<String>,
    /// Playback position inside the current segment, reported by the player.
    pub playback_offset_secs: f64,
}

impl SessionState {
    pub fn new(status: SessionStatus) -> Self {
        Self {
            status,
            playlist: Playlist::new(),
            seen: SeenSet::new(),
            chat: Vec::new(),
            disconnected: true,
            missed_uploads: 0,
            refreshed: false,
            last_error: None,
            playback_offset_secs: 0.0,
        }
    }
}

struct ChatTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct SessionHandle {
    session_id: String,
    state: Mutex<SessionState>,
    tick_in_flight: AtomicBool,
    cancel: CancellationToken,
    chat_task: Mutex<Option<ChatTask>>,
}

impl SessionHandle {
    pub fn new(session_id: String, status: SessionStatus, parent: &CancellationToken) -> Self {
        Self {
            session_id,
            state: Mutex::new(SessionState::new(status)),
            tick_in_flight: AtomicBool::new(false),
            cancel: parent.child_token(),
            chat_task: Mutex::new(None),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Run `f` against the state. The lock is never held across an await.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        let mut state = self.state.lock();
        f(&mut state)
    }

    pub fn status(&self) -> SessionStatus {
        self.state.lock().status
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Claim the session for one tick. `None` while the previous tick is still running.
    pub fn try_begin_tick(self: &Arc<Self>) -> Option<TickGuard> {
        self.tick_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| TickGuard {
                handle: Arc::clone(self),
            })
    }

    pub fn tick_in_flight(&self) -> bool {
        self.tick_in_flight.load(Ordering::Acquire)
    }

    /// Install the chat polling task, replacing (and stopping) any previous one.
    pub fn set_chat_task(&self, token: CancellationToken, handle: JoinHandle<()>) {
        let previous = self.chat_task.lock().replace(ChatTask { token, handle });
        if let Some(previous) = previous {
            previous.token.cancel();
            previous.handle.abort();
        }
    }

    pub fn stop_chat(&self) -> bool {
        match self.chat_task.lock().take() {
            Some(task) => {
                task.token.cancel();
                task.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn chat_open(&self) -> bool {
        self.chat_task.lock().is_some()
    }

    /// Stop every task belonging to this session.
    pub fn teardown(&self) {
        self.stop_chat();
        self.cancel.cancel();
        debug!("session {} torn down", self.session_id);
    }
}

/// Releases the per-session in-flight flag on drop.
pub struct TickGuard {
    handle: Arc<SessionHandle>,
}

impl TickGuard {
    pub fn handle(&self) -> &Arc<SessionHandle> {
        &self.handle
    }
}

impl Drop for TickGuard {
    fn drop(&mut self) {
        self.handle.tick_in_flight.store(false, Ordering::Release);
    }
}
