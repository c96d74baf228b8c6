use serde::Serialize;

/// Notifications fanned out to dashboard consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CoordinatorEvent {
    NewMessages { session_id: String, count: usize },
    CriticalAlert { session_id: String, body: String },
    /// The critical-message grace period elapsed; consumers resynchronise their state.
    Reload,
    SessionTerminated { session_id: String },
}
