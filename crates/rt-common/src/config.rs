//! Environment (§6) for the cluster: `max_alive_time`, `ping_interval`,
//! `max_retry_attempts`, `retry_delay`, and the max packed-batch token budget.
//!
//! Loaded from an optional YAML file named by an env var, overridden
//! field-by-field by more specific env vars.

use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    /// Seconds an idle per-request KV cache entry survives before eviction (§5, §4.2).
    pub max_alive_time_secs: f64,
    /// Worker heartbeat interval (§4.8).
    pub ping_interval_secs: f64,
    /// Reconnection attempts after a missed heartbeat (§4.8).
    pub max_retry_attempts: u32,
    /// Backoff between reconnection attempts (§4.8).
    pub retry_delay_secs: f64,
    /// Per-hop RPC timeout (§5, default 100s).
    pub hop_timeout_secs: f64,
    /// Admission policy cap on total packed tokens per step (§4.7).
    pub max_batch_tokens: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_alive_time_secs: 60.0,
            ping_interval_secs: 5.0,
            max_retry_attempts: 3,
            retry_delay_secs: 1.0,
            hop_timeout_secs: 100.0,
            max_batch_tokens: 4096,
        }
    }
}

impl RuntimeConfig {
    pub fn load() -> Self {
        if let Ok(path) = env::var("TLLM_CONFIG") {
            let Ok(text) = std::fs::read_to_string(path) else {
                return Self::default();
            };
            let Ok(cfg) = serde_yaml::from_str::<RuntimeConfig>(&text) else {
                return Self::default();
            };
            return cfg;
        }
        let mut cfg = Self::default();
        if let Some(v) = env_f64("TLLM_MAX_ALIVE_TIME") {
            cfg.max_alive_time_secs = v;
        }
        if let Some(v) = env_f64("TLLM_PING_INTERVAL") {
            cfg.ping_interval_secs = v;
        }
        if let Some(v) = env::var("TLLM_MAX_RETRY_ATTEMPTS").ok().and_then(|v| v.parse().ok()) {
            cfg.max_retry_attempts = v;
        }
        if let Some(v) = env_f64("TLLM_RETRY_DELAY") {
            cfg.retry_delay_secs = v;
        }
        if let Some(v) = env_f64("TLLM_HOP_TIMEOUT") {
            cfg.hop_timeout_secs = v;
        }
        if let Some(v) = env::var("TLLM_MAX_BATCH_TOKENS").ok().and_then(|v| v.parse().ok()) {
            cfg.max_batch_tokens = v;
        }
        cfg
    }

    pub fn max_alive_time(&self) -> Duration {
        Duration::from_secs_f64(self.max_alive_time_secs.max(0.0))
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs_f64(self.ping_interval_secs.max(0.0))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs_f64(self.retry_delay_secs.max(0.0))
    }

    pub fn hop_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.hop_timeout_secs.max(0.0))
    }
}

fn env_f64(key: &str) -> Option<f64> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}
