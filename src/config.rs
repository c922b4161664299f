use anyhow::{bail, Result};
use sha2::{Digest, Sha256};

#[derive(Clone, Debug)]
pub struct Config {
    /// Queue endpoint the worker drains. Required.
    pub queue_url: String,
    /// Identifier of the compute node this worker runs on. Required.
    pub node_id: String,
    pub sqlite_path: String,
    pub node_control_url: Option<String>,
    pub lock_id: String,
    pub lock_ttl_secs: i64,
    pub idle_timeout_secs: i64,
    pub poll_interval_secs: u64,
    pub receive_wait_secs: u64,
    pub receive_max_messages: u32,
    pub visibility_timeout_secs: u64,
    pub error_backoff_secs: u64,
    pub system_user_id: i64,
    pub server_bind: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            queue_url: std::env::var("QUEUE_URL").unwrap_or_default(),
            node_id: std::env::var("PK_INSTANCE").unwrap_or_default(),
            sqlite_path: std::env::var("SQLITE_PATH").unwrap_or_else(|_| "./pk.sqlite".to_string()),
            node_control_url: std::env::var("NODE_CONTROL_URL").ok(),
            lock_id: std::env::var("LOCK_ID").unwrap_or_else(|_| "v2 Position Keeper".to_string()),
            lock_ttl_secs: std::env::var("LOCK_TTL_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(60),
            idle_timeout_secs: std::env::var("IDLE_TIMEOUT_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(900),
            poll_interval_secs: std::env::var("POLL_INTERVAL_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(5),
            receive_wait_secs: std::env::var("RECEIVE_WAIT_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(20),
            receive_max_messages: std::env::var("RECEIVE_MAX").ok().and_then(|v| v.parse().ok()).unwrap_or(5),
            visibility_timeout_secs: std::env::var("VISIBILITY_TIMEOUT_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(30),
            error_backoff_secs: std::env::var("ERROR_BACKOFF_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(10),
            system_user_id: std::env::var("SYSTEM_USER_ID").ok().and_then(|v| v.parse().ok()).unwrap_or(1),
            server_bind: std::env::var("SERVER_BIND").unwrap_or_else(|_| "127.0.0.1:8090".to_string()),
        }
    }

    /// Startup gate: a worker without a queue or a node identity cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.queue_url.is_empty() {
            bail!("QUEUE_URL is missing — cannot start poller");
        }
        if self.node_id.is_empty() {
            bail!("PK_INSTANCE is missing — cannot determine node id");
        }
        Ok(())
    }

    /// SHA256 fingerprint of the effective configuration, logged at startup so
    /// two runs can be compared without diffing environments.
    pub fn config_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.queue_url.as_bytes());
        hasher.update(self.node_id.as_bytes());
        hasher.update(self.sqlite_path.as_bytes());
        hasher.update(self.lock_id.as_bytes());
        hasher.update(self.lock_ttl_secs.to_le_bytes());
        hasher.update(self.idle_timeout_secs.to_le_bytes());
        hasher.update(self.poll_interval_secs.to_le_bytes());
        hasher.update(self.receive_wait_secs.to_le_bytes());
        hasher.update(self.visibility_timeout_secs.to_le_bytes());
        hasher.update(self.system_user_id.to_le_bytes());
        hex::encode(hasher.finalize())
    }
}
