// Chat/warning message polling with per-session dedup on the creation key.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;

use super::session::SessionHandle;
use crate::source::traits::{Message, ProctorRpc};

/// Creation keys already delivered for one session. Grows without bound for the session's lifetime.
#[derive(Debug, Default)]
pub struct SeenSet {
    keys: HashSet<String>,
}

impl SeenSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep only unseen messages, in receipt order, and remember their keys.
    pub fn absorb(&mut self, batch: Vec<Message>) -> Vec<Message> {
        batch
            .into_iter()
            .filter(|m| self.keys.insert(m.creation_key.clone()))
            .collect()
    }

    pub fn contains(&self, creation_key: &str) -> bool {
        self.keys.contains(creation_key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

pub struct MessagePoller {
    rpc: Arc<dyn ProctorRpc>,
}

impl MessagePoller {
    pub fn new(rpc: Arc<dyn ProctorRpc>) -> Self {
        Self { rpc }
    }

    /// Fetch the session's messages and return only those not delivered before.
    pub async fn poll(&self, handle: &SessionHandle) -> Result<Vec<Message>> {
        let batch = self.rpc.fetch_messages(handle.session_id()).await?;
        Ok(handle.with_state(|s| s.seen.absorb(batch)))
    }
}
