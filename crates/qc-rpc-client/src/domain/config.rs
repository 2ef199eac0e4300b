//! Client configuration with validation.

use crate::domain::types::Commitment;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

/// Main client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Default commitment for queries and subscriptions (None = node default)
    pub commitment: Option<Commitment>,
    /// Request/response channel
    pub rpc: RpcConfig,
    /// Notification channel
    pub pubsub: PubsubConfig,
    /// Blockhash cache
    pub blockhash: BlockhashConfig,
    /// Transaction confirmation
    pub confirmation: ConfirmationConfig,
}

impl ClientConfig {
    /// Configuration for `endpoint` with every other value defaulted.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            rpc: RpcConfig {
                endpoint: endpoint.into(),
                ..RpcConfig::default()
            },
            ..Self::default()
        }
    }

    pub fn with_commitment(mut self, commitment: Commitment) -> Self {
        self.commitment = Some(commitment);
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.websocket_url()?;

        if self.rpc.rate_limit_retries == 0 {
            return Err(ConfigError::InvalidLimit(
                "rate_limit_retries cannot be 0".into(),
            ));
        }
        if self.blockhash.poll_attempts == 0 {
            return Err(ConfigError::InvalidLimit("poll_attempts cannot be 0".into()));
        }
        if self.blockhash.max_tracked_signatures == 0 {
            return Err(ConfigError::InvalidLimit(
                "max_tracked_signatures cannot be 0".into(),
            ));
        }

        let intervals = [
            ("rpc.request_timeout", self.rpc.request_timeout),
            ("pubsub.keepalive_interval", self.pubsub.keepalive_interval),
            ("pubsub.request_timeout", self.pubsub.request_timeout),
            ("pubsub.reconnect_base_delay", self.pubsub.reconnect_base_delay),
            (
                "confirmation.block_height_poll_interval",
                self.confirmation.block_height_poll_interval,
            ),
        ];
        for (name, interval) in intervals {
            if interval.is_zero() {
                return Err(ConfigError::InvalidInterval(format!("{name} cannot be 0")));
            }
        }
        if self.pubsub.reconnect_max_delay < self.pubsub.reconnect_base_delay {
            return Err(ConfigError::InvalidInterval(
                "pubsub.reconnect_max_delay is below reconnect_base_delay".into(),
            ));
        }

        Ok(())
    }

    /// Notification endpoint: the override, else derived from the RPC endpoint.
    ///
    /// `http` maps to `ws`, `https` to `wss`, and an explicit port is bumped by
    /// one since the node serves pubsub on the port after RPC.
    pub fn websocket_url(&self) -> Result<Url, ConfigError> {
        if let Some(endpoint) = &self.pubsub.endpoint {
            return parse_endpoint(endpoint);
        }

        let mut url = parse_endpoint(&self.rpc.endpoint)?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(ConfigError::InvalidEndpoint {
                    url: self.rpc.endpoint.clone(),
                    reason: format!("unsupported scheme {other}"),
                })
            }
        };
        let bumped_port = url.port().map(|port| port.saturating_add(1));

        let invalid = |reason: &str| ConfigError::InvalidEndpoint {
            url: self.rpc.endpoint.clone(),
            reason: reason.to_string(),
        };
        url.set_scheme(scheme)
            .map_err(|_| invalid("cannot switch to websocket scheme"))?;
        if bumped_port.is_some() {
            url.set_port(bumped_port)
                .map_err(|_| invalid("cannot set websocket port"))?;
        }
        Ok(url)
    }
}

fn parse_endpoint(endpoint: &str) -> Result<Url, ConfigError> {
    if endpoint.trim().is_empty() {
        return Err(ConfigError::EmptyEndpoint);
    }
    Url::parse(endpoint).map_err(|e| ConfigError::InvalidEndpoint {
        url: endpoint.to_string(),
        reason: e.to_string(),
    })
}

/// Request/response channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// HTTP endpoint
    pub endpoint: String,
    /// Extra headers sent with every request
    pub headers: HashMap<String, String>,
    /// Per-request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Retry requests answered with HTTP 429
    pub retry_on_rate_limit: bool,
    /// Total attempts for a rate-limited request
    pub rate_limit_retries: u32,
    /// First backoff delay, doubled per retry
    #[serde(with = "humantime_serde")]
    pub rate_limit_initial_backoff: Duration,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8899".to_string(),
            headers: HashMap::new(),
            request_timeout: Duration::from_secs(30),
            retry_on_rate_limit: true,
            rate_limit_retries: 5,
            rate_limit_initial_backoff: Duration::from_millis(500),
        }
    }
}

/// Notification channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PubsubConfig {
    /// Endpoint override (derived from the RPC endpoint when unset)
    pub endpoint: Option<String>,
    /// Keepalive ping interval
    #[serde(with = "humantime_serde")]
    pub keepalive_interval: Duration,
    /// Grace period before closing an unused connection
    #[serde(with = "humantime_serde")]
    pub idle_close_delay: Duration,
    /// First reconnect delay
    #[serde(with = "humantime_serde")]
    pub reconnect_base_delay: Duration,
    /// Reconnect delay ceiling
    #[serde(with = "humantime_serde")]
    pub reconnect_max_delay: Duration,
    /// Timeout for subscribe/unsubscribe requests
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Delay before a failed subscribe/unsubscribe is retried
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
}

impl Default for PubsubConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            keepalive_interval: Duration::from_secs(5),
            idle_close_delay: Duration::from_millis(500),
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Blockhash cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockhashConfig {
    /// Always fetch a new blockhash before signing
    pub disable_caching: bool,
    /// Freshness window of a cached blockhash
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
    /// Fetch attempts while waiting for the blockhash to change
    pub poll_attempts: u32,
    /// Network slot duration; polls are spaced at half of it
    #[serde(with = "humantime_serde")]
    pub slot_duration: Duration,
    /// Cap on remembered signatures per blockhash and purpose
    pub max_tracked_signatures: usize,
}

impl Default for BlockhashConfig {
    fn default() -> Self {
        Self {
            disable_caching: false,
            cache_ttl: Duration::from_secs(30),
            poll_attempts: 50,
            slot_duration: Duration::from_millis(400),
            max_tracked_signatures: 4096,
        }
    }
}

/// Transaction confirmation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfirmationConfig {
    /// Overrides the bare-signature timeout (30s at processed/confirmed, 60s otherwise)
    #[serde(with = "humantime_serde")]
    pub initial_timeout: Option<Duration>,
    /// Block height polling interval for blockhash-bound confirmations
    #[serde(with = "humantime_serde")]
    pub block_height_poll_interval: Duration,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            initial_timeout: None,
            block_height_poll_interval: Duration::from_secs(1),
        }
    }
}

impl ConfirmationConfig {
    /// Flat timeout used when no blockhash bounds the confirmation.
    pub fn timeout_for(&self, commitment: Commitment) -> Duration {
        if let Some(timeout) = self.initial_timeout {
            return timeout;
        }
        match commitment {
            Commitment::Processed | Commitment::Confirmed => Duration::from_secs(30),
            Commitment::Finalized => Duration::from_secs(60),
        }
    }
}
