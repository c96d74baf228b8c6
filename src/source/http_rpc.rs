use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use reqwest::{Client, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::traits::{
    Message, MessageCategory, MessageOrigin, OutgoingMessage, ProctorRpc, SegmentListing,
};
use crate::config::RpcMethods;
use crate::error::ProctorError;

/// Frappe-style RPC envelope: every method answers `{"message": <payload>}`.
#[derive(Deserialize)]
struct Envelope<T> {
    message: T,
}

#[derive(Deserialize)]
struct VideoListPayload {
    #[serde(default)]
    videos: HashMap<String, String>,
}

#[derive(Deserialize)]
struct MessagesPayload {
    #[serde(default)]
    messages: Vec<WireMessage>,
}

#[derive(Deserialize)]
struct WireMessage {
    creation: String,
    #[serde(default)]
    message: String,
    #[serde(default = "default_category")]
    type_of_message: MessageCategory,
    #[serde(rename = "from", default = "default_origin")]
    origin: MessageOrigin,
}

fn default_category() -> MessageCategory {
    MessageCategory::General
}

fn default_origin() -> MessageOrigin {
    MessageOrigin::System
}

pub struct HttpRpc {
    client: Client,
    base_url: Url,
    token: Arc<RwLock<Option<String>>>,
    methods: RpcMethods,
}

impl HttpRpc {
    pub fn new(base_url: &str, token: Option<String>, methods: RpcMethods) -> Result<Self> {
        let mut base_url =
            Url::parse(base_url).map_err(|e| anyhow!("invalid exam server url: {}", e))?;
        // `join` replaces the last path segment unless the base ends with '/'.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            client: Client::new(),
            base_url,
            token: Arc::new(RwLock::new(token)),
            methods,
        })
    }

    /// Swap the API token (e.g. after the proctor re-authenticates).
    pub fn update_auth(&self, token: Option<String>) {
        *self.token.write() = token;
    }

    fn method_url(&self, method: &str) -> Result<Url> {
        self.base_url
            .join(&format!("api/method/{}", method))
            .map_err(|e| anyhow!("invalid method url for {}: {}", method, e))
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match self.token.read().as_deref() {
            Some(token) => req.header("Authorization", format!("token {}", token)),
            None => req,
        }
    }

    /// Map HTTP status onto the failure taxonomy; 2xx passes through.
    fn check_status(resp: Response, what: &str) -> Result<Response> {
        let status = resp.status().as_u16();
        if status == 401 || status == 403 {
            warn!("{} auth rejected status={}", what, status);
            return Err(ProctorError::AuthRejected(status).into());
        }
        if !resp.status().is_success() {
            warn!("{} failed status={}", what, status);
            return Err(ProctorError::NetworkFailure(format!("{}: HTTP {}", what, status)).into());
        }
        Ok(resp)
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, args: Value) -> Result<T> {
        let url = self.method_url(method)?;
        debug!("rpc call method={}", method);
        let resp = self
            .authorize(self.client.post(url).json(&args))
            .send()
            .await
            .map_err(|e| ProctorError::NetworkFailure(e.to_string()))?;
        let resp = Self::check_status(resp, method)?;
        let envelope: Envelope<T> = resp
            .json()
            .await
            .map_err(|e| ProctorError::Rpc(format!("{}: {}", method, e)))?;
        Ok(envelope.message)
    }
}

#[async_trait]
impl ProctorRpc for HttpRpc {
    async fn list_segments(&self, session_id: &str) -> Result<Vec<SegmentListing>> {
        let payload: VideoListPayload = self
            .call(
                &self.methods.segment_list,
                json!({ "exam_submission": session_id }),
            )
            .await?;

        let mut listings = Vec::with_capacity(payload.videos.len());
        for (stamp, url) in payload.videos {
            match stamp.parse::<i64>() {
                Ok(captured_at) => listings.push(SegmentListing { captured_at, url }),
                Err(_) => warn!(
                    "session {} segment key {:?} is not a unix timestamp, skipped",
                    session_id, stamp
                ),
            }
        }
        Ok(listings)
    }

    async fn fetch_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        let payload: MessagesPayload = self
            .call(&self.methods.messages, json!({ "exam_submission": session_id }))
            .await?;

        Ok(payload
            .messages
            .into_iter()
            .map(|m| Message {
                session_id: session_id.to_string(),
                creation_key: m.creation,
                body: m.message,
                category: m.type_of_message,
                origin: m.origin,
            })
            .collect())
    }

    async fn post_message(&self, session_id: &str, message: &OutgoingMessage) -> Result<()> {
        let _: Value = self
            .call(
                &self.methods.post_message,
                json!({
                    "exam_submission": session_id,
                    "message": message.body,
                    "type_of_message": message.category,
                    "from": message.origin,
                }),
            )
            .await?;
        Ok(())
    }

    async fn terminate_session(&self, session_id: &str) -> Result<()> {
        let _: Value = self
            .call(&self.methods.terminate, json!({ "exam_submission": session_id }))
            .await?;
        Ok(())
    }

    async fn fetch_segment(&self, url: &str) -> Result<Bytes> {
        // Presigned storage URLs carry their own credentials; no token header.
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ProctorError::NetworkFailure(e.to_string()))?;
        let resp = Self::check_status(resp, "segment fetch")?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| ProctorError::NetworkFailure(e.to_string()))?;
        Ok(bytes)
    }
}
