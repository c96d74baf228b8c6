use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// One entry of the server's `{unixTimestamp: url}` segment map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentListing {
    pub captured_at: i64,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageCategory {
    Warning,
    Critical,
    /// Also covers categories this client does not know.
    #[serde(other)]
    General,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageOrigin {
    Candidate,
    Proctor,
    #[serde(other)]
    System,
}

/// A chat or warning entry. Immutable once received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub session_id: String,
    /// Server creation timestamp, unique per message. Used as the dedup key.
    pub creation_key: String,
    pub body: String,
    pub category: MessageCategory,
    pub origin: MessageOrigin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub body: String,
    pub category: MessageCategory,
    pub origin: MessageOrigin,
}

impl OutgoingMessage {
    pub fn proctor_chat(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            category: MessageCategory::General,
            origin: MessageOrigin::Proctor,
        }
    }
}

/// The exam server as seen from the proctor side. Every call is one network round trip.
#[async_trait]
pub trait ProctorRpc: Send + Sync {
    /// Segment map for a session, in whatever order the server returns it.
    async fn list_segments(&self, session_id: &str) -> Result<Vec<SegmentListing>>;
    async fn fetch_messages(&self, session_id: &str) -> Result<Vec<Message>>;
    async fn post_message(&self, session_id: &str, message: &OutgoingMessage) -> Result<()>;
    /// Destructive and irreversible. Callers confirm with the proctor first.
    async fn terminate_session(&self, session_id: &str) -> Result<()>;
    async fn fetch_segment(&self, url: &str) -> Result<Bytes>;
}
