// In-memory exam server used by the integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use proctor_stream::error::ProctorError;
use proctor_stream::source::traits::{
    Message, MessageCategory, MessageOrigin, OutgoingMessage, ProctorRpc, SegmentListing,
};

pub fn segment_url(session_id: &str, captured_at: i64) -> String {
    format!("https://r2.example.com/{}/{}.webm", session_id, captured_at)
}

pub fn message(session_id: &str, key: &str, category: MessageCategory) -> Message {
    Message {
        session_id: session_id.to_string(),
        creation_key: key.to_string(),
        body: format!("message {}", key),
        category,
        origin: MessageOrigin::Candidate,
    }
}

#[derive(Default)]
pub struct FakeRpc {
    segments: Mutex<HashMap<String, Vec<SegmentListing>>>,
    messages: Mutex<HashMap<String, Vec<Message>>>,
    failing_lists: Mutex<HashSet<String>>,
    list_delays: Mutex<HashMap<String, Duration>>,
    fetch_delay: Mutex<Duration>,
    pub list_calls: AtomicUsize,
    pub segment_fetches: AtomicUsize,
    pub posted: Mutex<Vec<(String, OutgoingMessage)>>,
    pub terminated: Mutex<Vec<String>>,
}

impl FakeRpc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish segments captured at the given unix seconds.
    pub fn set_segments(&self, session_id: &str, captures: &[i64]) {
        let listings = captures
            .iter()
            .map(|at| SegmentListing {
                captured_at: *at,
                url: segment_url(session_id, *at),
            })
            .collect();
        self.segments
            .lock()
            .insert(session_id.to_string(), listings);
    }

    pub fn set_messages(&self, session_id: &str, messages: Vec<Message>) {
        self.messages
            .lock()
            .insert(session_id.to_string(), messages);
    }

    pub fn fail_list(&self, session_id: &str) {
        self.failing_lists.lock().insert(session_id.to_string());
    }

    pub fn delay_list(&self, session_id: &str, delay: Duration) {
        self.list_delays
            .lock()
            .insert(session_id.to_string(), delay);
    }

    pub fn delay_fetch(&self, delay: Duration) {
        *self.fetch_delay.lock() = delay;
    }

    /// Blob served for a segment URL: the URL bytes themselves.
    pub fn blob_for(url: &str) -> Bytes {
        Bytes::from(url.as_bytes().to_vec())
    }
}

#[async_trait]
impl ProctorRpc for FakeRpc {
    async fn list_segments(&self, session_id: &str) -> Result<Vec<SegmentListing>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.list_delays.lock().get(session_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing_lists.lock().contains(session_id) {
            return Err(ProctorError::NetworkFailure("connection refused".to_string()).into());
        }
        Ok(self
            .segments
            .lock()
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        Ok(self
            .messages
            .lock()
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn post_message(&self, session_id: &str, message: &OutgoingMessage) -> Result<()> {
        self.posted
            .lock()
            .push((session_id.to_string(), message.clone()));
        Ok(())
    }

    async fn terminate_session(&self, session_id: &str) -> Result<()> {
        self.terminated.lock().push(session_id.to_string());
        Ok(())
    }

    async fn fetch_segment(&self, url: &str) -> Result<Bytes> {
        self.segment_fetches.fetch_add(1, Ordering::SeqCst);
        let delay = *self.fetch_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if url.contains("missing") {
            return Err(ProctorError::NetworkFailure("HTTP 404".to_string()).into());
        }
        Ok(Self::blob_for(url))
    }
}
