//! Compute-node control. Idle shutdown stops the node the worker runs on; the
//! control API is behind a trait so tests and local runs use the stub.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::json;

use crate::logging::{json_log, obj, v_str};

#[async_trait]
pub trait ComputeNode: Send + Sync {
    async fn stop(&self, node_id: &str) -> Result<()>;
}

/// Remote node-control endpoint (EC2-stop-shaped).
pub struct HttpNode {
    client: reqwest::Client,
    control_url: String,
}

impl HttpNode {
    pub fn new(control_url: String) -> Self {
        Self { client: reqwest::Client::new(), control_url }
    }
}

#[async_trait]
impl ComputeNode for HttpNode {
    async fn stop(&self, node_id: &str) -> Result<()> {
        let resp = self
            .client
            .post(format!("{}/stop", self.control_url))
            .json(&json!({ "node_id": node_id }))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            bail!("node stop failed for {}: {}", node_id, status);
        }
        json_log("node", obj(&[("op", v_str("stop")), ("node_id", v_str(node_id))]));
        Ok(())
    }
}

/// Stub: logs the stop command instead of issuing it.
pub struct NullNode;

#[async_trait]
impl ComputeNode for NullNode {
    async fn stop(&self, node_id: &str) -> Result<()> {
        json_log(
            "node",
            obj(&[("op", v_str("stop")), ("node_id", v_str(node_id)), ("stub", v_str("true"))]),
        );
        Ok(())
    }
}
