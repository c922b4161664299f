//! Queue seam. The worker only needs two verbs: receive a batch with a
//! long-poll wait, and delete a handled message. Anything not deleted becomes
//! visible again after the visibility timeout, which is the whole redelivery
//! story (at-least-once, never exactly-once).

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct RawMessage {
    pub message_id: String,
    pub receipt: String,
    pub body: String,
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn receive(&self, max: u32, wait_secs: u64) -> Result<Vec<RawMessage>>;
    async fn delete(&self, receipt: &str) -> Result<()>;
}

/// Remote queue endpoint speaking a small JSON receive/delete protocol.
pub struct HttpQueue {
    client: reqwest::Client,
    endpoint: Url,
    visibility_timeout_secs: u64,
}

impl HttpQueue {
    pub fn new(endpoint: &str, visibility_timeout_secs: u64) -> Result<Self> {
        let endpoint = Url::parse(endpoint).with_context(|| format!("bad queue url {}", endpoint))?;
        Ok(Self { client: reqwest::Client::new(), endpoint, visibility_timeout_secs })
    }

    fn action_url(&self, action: &str) -> Result<Url> {
        self.endpoint.join(action).context("queue url join")
    }
}

#[async_trait]
impl MessageQueue for HttpQueue {
    async fn receive(&self, max: u32, wait_secs: u64) -> Result<Vec<RawMessage>> {
        let resp = self
            .client
            .post(self.action_url("receive")?)
            .json(&json!({
                "max_messages": max,
                "wait_secs": wait_secs,
                "visibility_timeout_secs": self.visibility_timeout_secs,
            }))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            bail!("queue receive failed: {}", status);
        }
        Ok(resp.json::<Vec<RawMessage>>().await?)
    }

    async fn delete(&self, receipt: &str) -> Result<()> {
        let resp = self
            .client
            .post(self.action_url("delete")?)
            .json(&json!({ "receipt": receipt }))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            bail!("queue delete failed: {}", status);
        }
        Ok(())
    }
}

struct MemoryEntry {
    message_id: String,
    body: String,
    receipt: String,
    invisible_until: Option<Instant>,
}

/// In-process queue with the same visibility contract as the remote one.
/// Used by tests and local runs to exercise redelivery without a broker.
pub struct MemoryQueue {
    entries: Mutex<VecDeque<MemoryEntry>>,
    visibility_timeout: Duration,
    seq: Mutex<u64>,
}

impl MemoryQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self { entries: Mutex::new(VecDeque::new()), visibility_timeout, seq: Mutex::new(0) }
    }

    pub fn push(&self, body: &str) {
        let mut seq = self.seq.lock().unwrap();
        *seq += 1;
        let id = *seq;
        drop(seq);
        self.entries.lock().unwrap().push_back(MemoryEntry {
            message_id: format!("m-{}", id),
            body: body.to_string(),
            receipt: format!("r-{}-0", id),
            invisible_until: None,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    async fn receive(&self, max: u32, _wait_secs: u64) -> Result<Vec<RawMessage>> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        let mut out = Vec::new();
        for entry in entries.iter_mut() {
            if out.len() as u32 >= max {
                break;
            }
            let visible = entry.invisible_until.map(|t| t <= now).unwrap_or(true);
            if !visible {
                continue;
            }
            // Each delivery gets a fresh receipt so a stale one cannot delete
            // a redelivered message.
            entry.receipt = format!("{}-{}", entry.message_id, now.elapsed().as_nanos());
            entry.invisible_until = Some(now + self.visibility_timeout);
            out.push(RawMessage {
                message_id: entry.message_id.clone(),
                receipt: entry.receipt.clone(),
                body: entry.body.clone(),
            });
        }
        Ok(out)
    }

    async fn delete(&self, receipt: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|e| e.receipt != receipt);
        Ok(())
    }
}
