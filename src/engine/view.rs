// Dashboard view model reconciled from session state.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;

use super::session::{SessionState, SessionStatus};
use crate::detect::segment_name::capture_clock;
use crate::source::traits::{MessageCategory, MessageOrigin};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LiveBadge {
    /// First refresh still pending.
    Loading,
    /// No segment has been uploaded yet.
    NoFeed,
    Live,
    Offline,
    GoLive,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatLine {
    pub age: String,
    pub body: String,
    pub category: MessageCategory,
    pub origin: MessageOrigin,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionView {
    pub session_id: String,
    pub status: SessionStatus,
    pub badge: LiveBadge,
    pub offline_overlay: bool,
    pub missed_uploads: u64,
    pub skip_forward_enabled: bool,
    pub skip_back_enabled: bool,
    pub cursor: usize,
    pub segment_count: usize,
    /// Wall-clock time of the playback position, only while reviewing past segments.
    pub capture_clock: Option<String>,
    pub stale: bool,
    pub last_error: Option<String>,
    pub chat_open: bool,
    pub message_count: usize,
    pub chat: Vec<ChatLine>,
}

impl SessionView {
    pub fn reconcile(
        session_id: &str,
        state: &SessionState,
        chat_open: bool,
        now_millis: i64,
    ) -> Self {
        let playlist = &state.playlist;
        let at_live_edge = playlist.is_at_live_edge();

        let badge = if !state.refreshed {
            LiveBadge::Loading
        } else if playlist.is_empty() {
            LiveBadge::NoFeed
        } else {
            match (at_live_edge, state.disconnected) {
                (true, false) => LiveBadge::Live,
                (true, true) => LiveBadge::Offline,
                (false, false) => LiveBadge::GoLive,
                (false, true) => LiveBadge::Disconnected,
            }
        };

        let capture_clock = if at_live_edge {
            None
        } else {
            playlist
                .current()
                .and_then(|s| capture_clock(&s.url, state.playback_offset_secs))
        };

        let now = DateTime::from_timestamp_millis(now_millis).unwrap_or_else(Utc::now);
        let chat = state
            .chat
            .iter()
            .map(|m| ChatLine {
                age: time_ago(&m.creation_key, now),
                body: m.body.clone(),
                category: m.category,
                origin: m.origin,
            })
            .collect();

        Self {
            session_id: session_id.to_string(),
            status: state.status,
            badge,
            offline_overlay: state.refreshed && state.disconnected,
            missed_uploads: state.missed_uploads,
            skip_forward_enabled: !playlist.is_empty() && !at_live_edge,
            skip_back_enabled: playlist.cursor() > 0,
            cursor: playlist.cursor(),
            segment_count: playlist.len(),
            capture_clock,
            stale: state.last_error.is_some(),
            last_error: state.last_error.clone(),
            chat_open,
            message_count: state.chat.len(),
            chat,
        }
    }
}

/// Parse a message creation key. Offset-less timestamps are taken as UTC.
fn parse_creation(creation: &str) -> Option<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(creation) {
        return Some(at.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(creation, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(creation, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .map(|naive| naive.and_utc())
}

/// Relative age label for a chat line. Unparseable keys are shown verbatim.
pub fn time_ago(creation: &str, now: DateTime<Utc>) -> String {
    let Some(at) = parse_creation(creation) else {
        return creation.to_string();
    };
    let minutes = (now - at).num_minutes();
    match minutes {
        m if m < 1 => "Just now".to_string(),
        1 => "1 minute ago".to_string(),
        m if m < 60 => format!("{} minutes ago", m),
        m if m < 120 => "1 hour ago".to_string(),
        m if m < 1440 => format!("{} hours ago", m / 60),
        m if m < 2880 => "1 day ago".to_string(),
        m => format!("{} days ago", m / 1440),
    }
}
