use serde::{Deserialize, Serialize};

use crate::node::FreshnessThresholds;
use crate::retry::RetryConfig;

/// Which store backend holds the authoritative state.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local in-memory store (default).
    #[default]
    Memory,
    /// Durable external store; requires the `postgres` feature.
    Postgres { url: String },
}

/// Secrets and token lifetimes for the auth surface.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Secret gating admin operations. Unset means admin ops are denied.
    #[serde(default)]
    pub admin_secret: Option<String>,
    /// Secret gating node registration. Unset means registration is denied.
    #[serde(default)]
    pub bootstrap_secret: Option<String>,
    #[serde(default = "default_node_token_ttl_secs")]
    pub node_token_ttl_secs: u64,
    #[serde(default = "default_job_token_ttl_secs")]
    pub job_token_ttl_secs: u64,
    /// Job tokens are consumed on first use when set.
    #[serde(default = "default_true")]
    pub job_token_single_use: bool,
}

fn default_node_token_ttl_secs() -> u64 {
    3600
}

fn default_job_token_ttl_secs() -> u64 {
    900
}

fn default_true() -> bool {
    true
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            admin_secret: None,
            bootstrap_secret: None,
            node_token_ttl_secs: default_node_token_ttl_secs(),
            job_token_ttl_secs: default_job_token_ttl_secs(),
            job_token_single_use: default_true(),
        }
    }
}

/// Top-level configuration. Every field has a default, so an empty
/// document yields a working in-memory control plane.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MeshConfig {
    #[serde(default)]
    pub store: StoreBackend,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub freshness: FreshnessThresholds,
    /// Claim lease TTL; stale claims are recovered past this age.
    #[serde(default = "default_claim_ttl_ms")]
    pub claim_ttl_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_reaper_interval_ms")]
    pub reaper_interval_ms: u64,
    /// Capacity of the event ring buffer feeding summaries.
    #[serde(default = "default_event_ring_capacity")]
    pub event_ring_capacity: usize,
    /// Broadcast channel capacity per live subscriber before it lags out.
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

fn default_claim_ttl_ms() -> u64 {
    30_000
}

fn default_reaper_interval_ms() -> u64 {
    5_000
}

fn default_event_ring_capacity() -> usize {
    2000
}

fn default_event_channel_capacity() -> usize {
    256
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            store: StoreBackend::default(),
            auth: AuthConfig::default(),
            freshness: FreshnessThresholds::default(),
            claim_ttl_ms: default_claim_ttl_ms(),
            retry: RetryConfig::default(),
            reaper_interval_ms: default_reaper_interval_ms(),
            event_ring_capacity: default_event_ring_capacity(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_deserializes_with_defaults() {
        let config: MeshConfig = serde_json::from_str("{}").expect("defaults");
        assert!(matches!(config.store, StoreBackend::Memory));
        assert_eq!(config.claim_ttl_ms, 30_000);
        assert_eq!(config.freshness.healthy_ms, 10_000);
        assert_eq!(config.freshness.degraded_ms, 30_000);
        assert_eq!(config.retry.base_delay_ms, 250);
        assert_eq!(config.reaper_interval_ms, 5_000);
        assert_eq!(config.event_ring_capacity, 2000);
        assert!(config.auth.admin_secret.is_none());
    }

    #[test]
    fn postgres_backend_selector() {
        let config: MeshConfig = serde_json::from_str(
            r#"{"store": {"backend": "postgres", "url": "postgres://mesh@localhost/mesh"}}"#,
        )
        .expect("postgres selector");
        match config.store {
            StoreBackend::Postgres { url } => {
                assert_eq!(url, "postgres://mesh@localhost/mesh")
            }
            other => panic!("unexpected backend: {other:?}"),
        }
    }
}
