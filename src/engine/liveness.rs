// Feed liveness: derived from the capture time of the newest segment, re-evaluated every tick.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use super::playlist::Playlist;
use crate::detect::segment_name::capture_timestamp;

/// Wall-clock source in unix milliseconds.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Settable clock for driving liveness and message ages deterministically.
pub struct ManualClock {
    now_millis: AtomicI64,
}

impl ManualClock {
    pub fn new(now_millis: i64) -> Self {
        Self {
            now_millis: AtomicI64::new(now_millis),
        }
    }

    pub fn set_millis(&self, now_millis: i64) {
        self.now_millis.store(now_millis, Ordering::Relaxed);
    }

    pub fn advance(&self, by: Duration) {
        self.now_millis
            .fetch_add(by.as_millis() as i64, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now_millis.load(Ordering::Relaxed)
    }
}

/// True when the newest segment is at least `threshold` old.
///
/// An empty playlist or an unparseable segment URL counts as disconnected.
pub fn is_disconnected(playlist: &Playlist, now_millis: i64, threshold: Duration) -> bool {
    let Some(last) = playlist.last() else {
        return true;
    };
    match capture_timestamp(&last.url) {
        Ok(captured) => {
            let elapsed = now_millis.saturating_sub(captured.saturating_mul(1000));
            elapsed >= threshold.as_millis() as i64
        }
        Err(e) => {
            debug!("liveness: {}", e);
            true
        }
    }
}

/// Uploads overdue since the newest segment, given the expected spacing between segments.
///
/// Zero for an empty playlist, an unparseable URL or a zero interval.
pub fn missed_uploads(playlist: &Playlist, now_millis: i64, interval: Duration) -> u64 {
    let interval_ms = interval.as_millis() as i64;
    if interval_ms == 0 {
        return 0;
    }
    let Some(captured) = playlist
        .last()
        .and_then(|last| capture_timestamp(&last.url).ok())
    else {
        return 0;
    };
    let elapsed = now_millis.saturating_sub(captured.saturating_mul(1000));
    (elapsed.max(0) / interval_ms) as u64
}

pub struct LivenessMonitor {
    clock: Arc<dyn Clock>,
    threshold: Duration,
    segment_interval: Duration,
}

impl LivenessMonitor {
    pub fn new(clock: Arc<dyn Clock>, threshold: Duration, segment_interval: Duration) -> Self {
        Self {
            clock,
            threshold,
            segment_interval,
        }
    }

    pub fn is_disconnected(&self, playlist: &Playlist) -> bool {
        is_disconnected(playlist, self.clock.now_millis(), self.threshold)
    }

    pub fn missed_uploads(&self, playlist: &Playlist) -> u64 {
        missed_uploads(playlist, self.clock.now_millis(), self.segment_interval)
    }

    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }
}
