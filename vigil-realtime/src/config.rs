//! Realtime engine configuration.

use crate::error::{RealtimeError, RealtimeResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration for one engine (one tab).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// Base URL of the backend (e.g., "https://api.vigil.community").
    pub api_base_url: String,

    /// Optional bearer token sent on stream, ack and catch-up requests.
    #[serde(default)]
    pub auth_token: Option<String>,

    #[serde(default)]
    pub election: ElectionConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub authority: AuthorityConfig,
}

/// Leader election timings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ElectionConfig {
    /// How long a booting tab waits for `I_AM_LEADER` before claiming.
    pub election_window_ms: u64,
    /// Leader lease rewrite + `I_AM_LEADER` rebroadcast interval.
    pub heartbeat_interval_ms: u64,
    /// Lease lifetime written on every heartbeat.
    pub lease_duration_ms: u64,
    /// Lease poll interval run by every tab.
    pub watchdog_interval_ms: u64,
}

/// Connection pool reconnect policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolConfig {
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Emit a degraded signal every N consecutive failures.
    pub degraded_after_failures: u32,
}

/// Authority log bounds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthorityConfig {
    /// Maximum number of keys remembered; oldest evicted first.
    pub capacity: usize,
    /// Keys older than this are forgotten.
    pub ttl_ms: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8080".to_string(),
            auth_token: None,
            election: ElectionConfig::default(),
            pool: PoolConfig::default(),
            authority: AuthorityConfig::default(),
        }
    }
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            election_window_ms: 300,
            heartbeat_interval_ms: 1_500,
            lease_duration_ms: 3_500,
            watchdog_interval_ms: 2_000,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
            degraded_after_failures: 3,
        }
    }
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            capacity: 4_096,
            ttl_ms: 10 * 60 * 1_000, // 10 min
        }
    }
}

impl ElectionConfig {
    pub fn election_window(&self) -> Duration {
        Duration::from_millis(self.election_window_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }

    /// Worst-case time for a follower to take over from a crashed leader.
    pub fn failover_bound(&self) -> Duration {
        self.lease_duration() + self.watchdog_interval()
    }
}

impl PoolConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

impl RealtimeConfig {
    /// Stream of events scoped to one subject (user/session).
    pub fn subject_stream_url(&self, subject_id: &str) -> String {
        format!(
            "{}/stream/subjects/{}",
            self.base(),
            urlencoding::encode(subject_id)
        )
    }

    /// Global community feed stream.
    pub fn feed_stream_url(&self) -> String {
        format!("{}/stream/feed", self.base())
    }

    /// Per-report social thread stream.
    pub fn report_stream_url(&self, report_id: &str) -> String {
        format!(
            "{}/stream/reports/{}",
            self.base(),
            urlencoding::encode(report_id)
        )
    }

    /// Per-room chat stream.
    pub fn chat_stream_url(&self, room_id: &str) -> String {
        format!("{}/stream/chat/{}", self.base(), urlencoding::encode(room_id))
    }

    pub(crate) fn base(&self) -> &str {
        self.api_base_url.trim_end_matches('/')
    }

    /// Rejects settings the election and pool cannot work with.
    pub fn validate(&self) -> RealtimeResult<()> {
        if self.api_base_url.trim().is_empty() {
            return Err(RealtimeError::Config("api_base_url is empty".into()));
        }

        let e = &self.election;
        if e.election_window_ms == 0 || e.heartbeat_interval_ms == 0 || e.watchdog_interval_ms == 0
        {
            return Err(RealtimeError::Config(
                "election intervals must be non-zero".into(),
            ));
        }
        if e.lease_duration_ms <= e.heartbeat_interval_ms {
            return Err(RealtimeError::Config(format!(
                "lease_duration_ms ({}) must exceed heartbeat_interval_ms ({})",
                e.lease_duration_ms, e.heartbeat_interval_ms
            )));
        }

        let p = &self.pool;
        if p.backoff_base_ms == 0 {
            return Err(RealtimeError::Config("backoff_base_ms must be non-zero".into()));
        }
        if p.backoff_max_ms < p.backoff_base_ms {
            return Err(RealtimeError::Config(format!(
                "backoff_max_ms ({}) is below backoff_base_ms ({})",
                p.backoff_max_ms, p.backoff_base_ms
            )));
        }
        if p.degraded_after_failures == 0 {
            return Err(RealtimeError::Config(
                "degraded_after_failures must be at least 1".into(),
            ));
        }

        if self.authority.capacity == 0 {
            return Err(RealtimeError::Config("authority capacity must be non-zero".into()));
        }

        Ok(())
    }
}
