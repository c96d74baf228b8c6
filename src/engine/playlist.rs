// Per-session segment playlist and playback cursor.

use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::fetcher::SegmentFetcher;
use super::session::SessionHandle;
use crate::source::traits::{ProctorRpc, SegmentListing};

/// One recorded video chunk. `sequence_index` is its position in capture order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentRef {
    pub sequence_index: u64,
    pub captured_at: i64,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[serde(alias = "next")]
    Forward,
    #[serde(alias = "previous")]
    Backward,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshOutcome {
    pub added: usize,
    /// Earlier segments changed position. Cached blobs are keyed by capture time and stay valid.
    pub reindexed: bool,
}

#[derive(Debug, Default)]
pub struct Playlist {
    segments: Vec<SegmentRef>,
    cursor: usize,
    /// Set once the cursor has been placed on a non-empty list.
    positioned: bool,
}

impl Playlist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the list with the server's authoritative one.
    ///
    /// The cursor stays on the segment it pointed at. The first non-empty list starts at the
    /// live edge.
    pub fn replace(&mut self, mut listings: Vec<SegmentListing>) -> RefreshOutcome {
        listings.sort_by_key(|l| l.captured_at);
        listings.dedup_by_key(|l| l.captured_at);

        let current_at = self.current().map(|s| s.captured_at);
        let previous = std::mem::take(&mut self.segments);

        self.segments = listings
            .into_iter()
            .enumerate()
            .map(|(i, l)| SegmentRef {
                sequence_index: i as u64,
                captured_at: l.captured_at,
                url: l.url,
            })
            .collect();

        let reindexed = previous.len() > self.segments.len()
            || previous
                .iter()
                .zip(self.segments.iter())
                .any(|(old, new)| old.captured_at != new.captured_at);
        let added = if reindexed {
            0
        } else {
            self.segments.len() - previous.len()
        };

        if self.segments.is_empty() {
            self.cursor = 0;
        } else if !self.positioned {
            self.cursor = self.segments.len() - 1;
            self.positioned = true;
        } else if let Some(at) = current_at {
            let pos = self.segments.partition_point(|s| s.captured_at < at);
            self.cursor = pos.min(self.segments.len() - 1);
        } else {
            self.cursor = self.cursor.min(self.segments.len() - 1);
        }

        RefreshOutcome { added, reindexed }
    }

    /// Move the cursor one step, clamped to `[0, len-1]`. Returns whether it moved.
    pub fn advance(&mut self, direction: Direction) -> bool {
        if self.segments.is_empty() {
            return false;
        }
        let last = self.segments.len() - 1;
        let target = match direction {
            Direction::Forward => (self.cursor + 1).min(last),
            Direction::Backward => self.cursor.saturating_sub(1),
        };
        let moved = target != self.cursor;
        self.cursor = target;
        moved
    }

    pub fn jump_to_live(&mut self) {
        self.cursor = self.segments.len().saturating_sub(1);
    }

    pub fn seek(&mut self, index: usize) {
        self.cursor = index.min(self.segments.len().saturating_sub(1));
    }

    pub fn current(&self) -> Option<&SegmentRef> {
        self.segments.get(self.cursor)
    }

    /// Segment after the cursor, if any. The prefetch target.
    pub fn successor(&self) -> Option<&SegmentRef> {
        self.segments.get(self.cursor + 1)
    }

    pub fn last(&self) -> Option<&SegmentRef> {
        self.segments.last()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn is_at_live_edge(&self) -> bool {
        !self.segments.is_empty() && self.cursor == self.segments.len() - 1
    }
}

/// A segment ready to hand to the player.
#[derive(Debug, Clone)]
pub struct Playback {
    pub segment: SegmentRef,
    pub blob: Bytes,
}

/// Playlist operations that touch the network: refresh from the server and prefetch on navigation.
pub struct PlaylistTracker {
    rpc: Arc<dyn ProctorRpc>,
    fetcher: Arc<SegmentFetcher>,
}

impl PlaylistTracker {
    pub fn new(rpc: Arc<dyn ProctorRpc>, fetcher: Arc<SegmentFetcher>) -> Self {
        Self { rpc, fetcher }
    }

    /// Pull the segment list and warm the cache around the cursor. Does not reset the cursor.
    ///
    /// A session torn down while the list request was outstanding is left untouched.
    pub async fn refresh(&self, handle: &SessionHandle) -> Result<RefreshOutcome> {
        let session_id = handle.session_id();
        let listings = self.rpc.list_segments(session_id).await?;
        if handle.is_cancelled() {
            debug!("session {} torn down during refresh, result dropped", session_id);
            return Ok(RefreshOutcome::default());
        }

        let (outcome, current, successor) = handle.with_state(|s| {
            let outcome = s.playlist.replace(listings);
            (
                outcome,
                s.playlist.current().cloned(),
                s.playlist.successor().cloned(),
            )
        });

        if outcome.reindexed {
            info!("session {} playlist reindexed", session_id);
        } else if outcome.added > 0 {
            debug!("session {} playlist +{} segments", session_id, outcome.added);
        }

        for segment in current.iter().chain(successor.iter()) {
            self.fetcher
                .prefetch(session_id, segment.captured_at, &segment.url);
        }
        Ok(outcome)
    }

    pub fn advance(&self, handle: &SessionHandle, direction: Direction) -> Option<SegmentRef> {
        let (current, successor) = handle.with_state(|s| {
            s.playlist.advance(direction);
            (
                s.playlist.current().cloned(),
                s.playlist.successor().cloned(),
            )
        });
        self.prefetch_successor(handle.session_id(), successor);
        current
    }

    pub fn jump_to_live(&self, handle: &SessionHandle) -> Option<SegmentRef> {
        handle.with_state(|s| {
            s.playlist.jump_to_live();
            s.playback_offset_secs = 0.0;
            s.playlist.current().cloned()
        })
    }

    pub fn seek(&self, handle: &SessionHandle, index: usize) -> Option<SegmentRef> {
        let (current, successor) = handle.with_state(|s| {
            s.playlist.seek(index);
            s.playback_offset_secs = 0.0;
            (
                s.playlist.current().cloned(),
                s.playlist.successor().cloned(),
            )
        });
        self.prefetch_successor(handle.session_id(), successor);
        current
    }

    pub fn current_segment(&self, handle: &SessionHandle) -> Option<SegmentRef> {
        handle.with_state(|s| s.playlist.current().cloned())
    }

    /// Blob of the segment under the cursor, fetched on demand when not cached.
    pub async fn current_playback(&self, handle: &SessionHandle) -> Result<Option<Playback>> {
        let Some(segment) = self.current_segment(handle) else {
            return Ok(None);
        };
        let blob = self
            .fetcher
            .fetch(handle.session_id(), segment.captured_at, &segment.url)
            .await?;
        Ok(Some(Playback { segment, blob }))
    }

    /// The player finished the current segment: step forward unless already at the live edge
    /// and hand back the next blob. `None` means playback stays where it is.
    pub async fn segment_ended(&self, handle: &SessionHandle) -> Result<Option<Playback>> {
        let (moved, current, successor) = handle.with_state(|s| {
            let moved = s.playlist.advance(Direction::Forward);
            if moved {
                s.playback_offset_secs = 0.0;
            }
            (
                moved,
                s.playlist.current().cloned(),
                s.playlist.successor().cloned(),
            )
        });
        if !moved {
            return Ok(None);
        }
        let Some(segment) = current else {
            return Ok(None);
        };

        self.prefetch_successor(handle.session_id(), successor);
        let blob = self
            .fetcher
            .fetch(handle.session_id(), segment.captured_at, &segment.url)
            .await?;
        Ok(Some(Playback { segment, blob }))
    }

    fn prefetch_successor(&self, session_id: &str, successor: Option<SegmentRef>) {
        if let Some(next) = successor {
            self.fetcher.prefetch(session_id, next.captured_at, &next.url);
        }
    }
}
