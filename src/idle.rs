//! Idle tracking for the long-running poller. The worker shuts its own node
//! down after a fixed quiet period; any handled message resets the clock.

use chrono::{DateTime, Duration, Utc};

pub struct IdleMonitor {
    timeout: Duration,
    last_message_at: DateTime<Utc>,
}

impl IdleMonitor {
    pub fn new(timeout_secs: i64) -> Self {
        Self { timeout: Duration::seconds(timeout_secs), last_message_at: Utc::now() }
    }

    /// Call whenever a message is handled, including cache-refresh-only ones.
    pub fn touch(&mut self) {
        self.last_message_at = Utc::now();
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        now - self.last_message_at
    }

    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        self.idle_for(now) >= self.timeout
    }
}
