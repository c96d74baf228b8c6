// Live statistics aggregation: tick outcomes, segment download volume, cache hit rate.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

struct StatsSample {
    at: Instant,
    download_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub ticks: u64,
    pub refresh_ok: u64,
    pub refresh_failed: u64,
    pub skipped_in_flight: u64,
    pub messages_delivered: u64,
    pub fetch_failures: u64,
    pub download_bps: u64,
    pub downloaded_bytes: u64,
    pub active_workers: u32,
    pub cache_hit_rate: f64,
    /// A Critical message armed the forced resync and it has not fired yet.
    pub reload_pending: bool,
}

pub struct StatsCollector {
    ticks: AtomicU64,
    refresh_ok: AtomicU64,
    refresh_failed: AtomicU64,
    skipped_in_flight: AtomicU64,
    messages_delivered: AtomicU64,
    fetch_failures: AtomicU64,
    download_bytes_total: AtomicU64,
    active_workers: AtomicU32,
    last_sample: Mutex<StatsSample>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            ticks: AtomicU64::new(0),
            refresh_ok: AtomicU64::new(0),
            refresh_failed: AtomicU64::new(0),
            skipped_in_flight: AtomicU64::new(0),
            messages_delivered: AtomicU64::new(0),
            fetch_failures: AtomicU64::new(0),
            download_bytes_total: AtomicU64::new(0),
            active_workers: AtomicU32::new(0),
            last_sample: Mutex::new(StatsSample {
                at: Instant::now(),
                download_bytes: 0,
            }),
        }
    }

    pub fn record_tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_refresh(&self, ok: bool) {
        if ok {
            self.refresh_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.refresh_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_skipped(&self) {
        self.skipped_in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_messages(&self, count: usize) {
        self.messages_delivered
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_fetch_failure(&self) {
        self.fetch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_downloaded(&self, bytes: u64) {
        self.download_bytes_total.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn increment_workers(&self) {
        self.active_workers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement_workers(&self) {
        self.active_workers.fetch_sub(1, Ordering::Relaxed);
    }

    /// `hits`/`misses` come from the segment cache, which counts its own lookups.
    pub fn snapshot(&self, hits: u64, misses: u64, reload_pending: bool) -> StatsSnapshot {
        let now = Instant::now();
        let current_download = self.download_bytes_total.load(Ordering::Relaxed);

        let download_bps = {
            let mut sample = self.last_sample.lock();
            let elapsed = now.duration_since(sample.at).as_secs_f64();
            let bps = if elapsed > 0.1 {
                ((current_download - sample.download_bytes) as f64 / elapsed) as u64
            } else {
                0
            };
            sample.at = now;
            sample.download_bytes = current_download;
            bps
        };

        let lookups = hits + misses;
        let cache_hit_rate = if lookups > 0 {
            hits as f64 / lookups as f64
        } else {
            0.0
        };

        StatsSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            refresh_ok: self.refresh_ok.load(Ordering::Relaxed),
            refresh_failed: self.refresh_failed.load(Ordering::Relaxed),
            skipped_in_flight: self.skipped_in_flight.load(Ordering::Relaxed),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            download_bps,
            downloaded_bytes: current_download,
            active_workers: self.active_workers.load(Ordering::Relaxed),
            cache_hit_rate,
            reload_pending,
        }
    }

    pub fn total_downloaded(&self) -> u64 {
        self.download_bytes_total.load(Ordering::Relaxed)
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}
