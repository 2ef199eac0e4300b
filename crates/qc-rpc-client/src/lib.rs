//! QC RPC Client - ledger node client with deduplicated push subscriptions.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              LedgerClient                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │  ┌────────────────┐   ┌──────────────────┐   ┌───────────────────────┐  │
//! │  │ RequestGateway │◄──│  BlockhashCache  │   │ ConfirmationCoordinator│ │
//! │  │ (single/batch, │   │ (ttl, single-    │   │ (notification vs.     │  │
//! │  │  429 backoff)  │◄──│  flight, dedup)  │   │  expiry race)         │  │
//! │  └───────┬────────┘   └──────────────────┘   └───────────┬───────────┘  │
//! │          │  ▲                                            │              │
//! │          │  └────────────────────────────────────────────┤              │
//! │          │                                               ▼              │
//! │          │                              ┌──────────────────────────┐    │
//! │          │                              │   SubscriptionRegistry   │    │
//! │          │                              │  (actor, key → server id)│    │
//! │          │                              └────────────┬─────────────┘    │
//! │          │                                           │ events           │
//! │          │                              ┌────────────┴─────────────┐    │
//! │          │                              │   ConnectionLifecycle    │    │
//! │          │                              │ (generation, keepalive,  │    │
//! │          │                              │  reconnect backoff)      │    │
//! │          │                              └────────────┬─────────────┘    │
//! └──────────┼───────────────────────────────────────────┼──────────────────┘
//!            ▼                                           ▼
//!      RpcTransport (HTTP)                    PubsubConnector (WebSocket)
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use qc_rpc_client::{ClientConfig, Commitment, LedgerClient};
//!
//! let client = LedgerClient::new(
//!     ClientConfig::new("http://127.0.0.1:8899").with_commitment(Commitment::Confirmed),
//! )?;
//! let id = client.on_slot_change(|slot| println!("slot {}", slot.slot))?;
//! let height = client.gateway().get_block_height(None).await?;
//! client.remove_listener(id)?;
//! ```

#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod adapters;
pub mod blockhash;
pub mod confirmation;
pub mod domain;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod ports;
pub mod pubsub;
pub mod queries;
pub mod service;
pub mod telemetry;

#[cfg(test)]
mod testing;

// Re-exports for public API
pub use adapters::{HttpTransport, WsConnector};
pub use blockhash::{BlockhashCache, SigningPurpose};
pub use confirmation::ConfirmationCoordinator;
pub use domain::config::{
    BlockhashConfig, ClientConfig, ConfirmationConfig, PubsubConfig, RpcConfig,
};
pub use domain::subscription::{NotificationCallback, SubscriptionKey, SubscriptionKind};
pub use domain::types::*;
pub use error::{ClientError, ClientResult, ConfigError, RpcError, SignerError, TransportError};
pub use gateway::RequestGateway;
pub use metrics::{ClientMetrics, MetricsSnapshot};
pub use ports::{
    HttpReply, InboundFrame, OutboundFrame, PubsubChannel, PubsubConnector, RpcTransport,
    TransactionBuilder, TransactionSigner,
};
pub use pubsub::{SubscriptionRegistry, SubscriptionSnapshot};
pub use service::LedgerClient;
pub use telemetry::{init_tracing, LogConfig};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
