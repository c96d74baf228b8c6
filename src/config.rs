use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Expected spacing between two uploaded recording segments.
pub const SEGMENT_INTERVAL_SECS: u64 = 10;

/// A feed whose newest segment is at least this old is treated as disconnected.
pub const DISCONNECT_AFTER_SECS: u64 = 30;

/// Fetched segment blobs kept per session before FIFO eviction.
pub const MAX_CACHED_SEGMENTS: usize = 4;

/// Delay between a Critical message alert and the forced resynchronisation.
pub const CRITICAL_RELOAD_DELAY_SECS: u64 = 5;

/// Refresh period of the multi-session dashboard.
pub const DASHBOARD_POLL_SECS: u64 = 5;

/// Refresh period of an open one-on-one chat view.
pub const CHAT_POLL_SECS: u64 = 1;

/// Text the proctor must type before a session is terminated.
pub const TERMINATE_CONFIRMATION: &str = "Terminate Exam";

/// Remote method names of the exam server RPC surface.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RpcMethods {
    pub segment_list: String,
    pub messages: String,
    pub post_message: String,
    pub terminate: String,
}

impl Default for RpcMethods {
    fn default() -> Self {
        let base = "exampro.exam_pro.doctype.exam_submission.exam_submission";
        Self {
            segment_list: format!("{}.proctor_video_list", base),
            messages: format!("{}.exam_messages", base),
            post_message: format!("{}.post_exam_message", base),
            terminate: format!("{}.terminate_exam", base),
        }
    }
}

/// Top-level configuration for the session coordinator.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Exam server origin, e.g. `https://exams.example.org`.
    pub base_url: String,
    /// `key:secret` pair sent as `Authorization: token <key:secret>`.
    pub auth_token: Option<String>,
    pub dashboard_poll_secs: u64,
    pub chat_poll_secs: u64,
    pub segment_interval_secs: u64,
    pub disconnect_after_secs: u64,
    pub max_cached_segments: usize,
    pub critical_reload_delay_secs: u64,
    /// Retries per segment download after the first attempt.
    pub fetch_max_retries: u32,
    /// Port of the local dashboard server. 0 picks a free port.
    pub dashboard_port: u16,
    pub methods: RpcMethods,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            auth_token: None,
            dashboard_poll_secs: DASHBOARD_POLL_SECS,
            chat_poll_secs: CHAT_POLL_SECS,
            segment_interval_secs: SEGMENT_INTERVAL_SECS,
            disconnect_after_secs: DISCONNECT_AFTER_SECS,
            max_cached_segments: MAX_CACHED_SEGMENTS,
            critical_reload_delay_secs: CRITICAL_RELOAD_DELAY_SECS,
            fetch_max_retries: 3,
            dashboard_port: 0,
            methods: RpcMethods::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).context("invalid coordinator config")?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml_str(&raw)
    }

    pub fn dashboard_poll(&self) -> Duration {
        Duration::from_secs(self.dashboard_poll_secs.max(1))
    }

    pub fn chat_poll(&self) -> Duration {
        Duration::from_secs(self.chat_poll_secs.max(1))
    }

    pub fn segment_interval(&self) -> Duration {
        Duration::from_secs(self.segment_interval_secs)
    }

    pub fn disconnect_after(&self) -> Duration {
        Duration::from_secs(self.disconnect_after_secs)
    }

    pub fn critical_reload_delay(&self) -> Duration {
        Duration::from_secs(self.critical_reload_delay_secs)
    }
}
