//! Domain types for the ledger client.
//!
//! Wire envelopes, value types, subscription records and configuration.
//! Nothing in here performs I/O.

pub mod config;
pub mod jsonrpc;
pub mod subscription;
pub mod types;

// Re-exports for convenience
pub use config::{BlockhashConfig, ClientConfig, ConfirmationConfig, PubsubConfig, RpcConfig};
pub use jsonrpc::{build_args, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
pub use subscription::{
    NotificationCallback, Subscription, SubscriptionKey, SubscriptionKind, SubscriptionRequest,
    SubscriptionState,
};
pub use types::*;
