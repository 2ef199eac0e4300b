//! Client error types.
//!
//! Transport failures, server-reported JSON-RPC errors and the client's own
//! lifecycle failures are kept apart so callers can tell a rate-limited HTTP
//! round-trip from a rejected transaction.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// JSON-RPC error codes returned by the ledger node.
pub mod codes {
    // JSON-RPC 2.0 standard errors (-32700 to -32600)
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;

    // Ledger node server errors (-32001 to -32016)
    pub const BLOCK_CLEANED_UP: i64 = -32001;
    pub const SEND_TRANSACTION_PREFLIGHT_FAILURE: i64 = -32002;
    pub const TRANSACTION_SIGNATURE_VERIFICATION_FAILURE: i64 = -32003;
    pub const BLOCK_NOT_AVAILABLE: i64 = -32004;
    pub const NODE_UNHEALTHY: i64 = -32005;
    pub const TRANSACTION_PRECOMPILE_VERIFICATION_FAILURE: i64 = -32006;
    pub const SLOT_SKIPPED: i64 = -32007;
    pub const NO_SNAPSHOT: i64 = -32008;
    pub const LONG_TERM_STORAGE_SLOT_SKIPPED: i64 = -32009;
    pub const KEY_EXCLUDED_FROM_SECONDARY_INDEX: i64 = -32010;
    pub const TRANSACTION_HISTORY_NOT_AVAILABLE: i64 = -32011;
    pub const SCAN_ERROR: i64 = -32012;
    pub const TRANSACTION_SIGNATURE_LEN_MISMATCH: i64 = -32013;
    pub const BLOCK_STATUS_NOT_AVAILABLE_YET: i64 = -32014;
    pub const UNSUPPORTED_TRANSACTION_VERSION: i64 = -32015;
    pub const MIN_CONTEXT_SLOT_NOT_REACHED: i64 = -32016;
}

/// A well-formed error envelope reported by the server.
///
/// Never retried automatically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// JSON-RPC error code
    pub code: i64,
    /// Error message
    pub message: String,
    /// Optional structured data (simulation logs, etc.)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(code: i64, message: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            code,
            message: message.into(),
            data: Some(data),
        }
    }

    /// Program logs attached to a preflight or simulation failure.
    pub fn logs(&self) -> Option<Vec<String>> {
        let logs = self.data.as_ref()?.get("logs")?.as_array()?;
        Some(
            logs.iter()
                .filter_map(|line| line.as_str().map(str::to_string))
                .collect(),
        )
    }

    pub fn is_preflight_failure(&self) -> bool {
        self.code == codes::SEND_TRANSACTION_PREFLIGHT_FAILURE
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

/// Failure reaching the server, before any JSON-RPC envelope was parsed.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    /// Non-success HTTP status
    #[error("{status}: {body}")]
    Status { status: u16, body: String },

    /// Rate limited and the retry budget ran out (or retry is disabled)
    #[error("429 Too Many Requests after {attempts} attempt(s): {body}")]
    RateLimited { attempts: u32, body: String },

    /// Request could not be sent or the response could not be read
    #[error("request failed: {0}")]
    Request(String),

    /// Response body was not a JSON-RPC response
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// WebSocket connect or frame failure
    #[error("websocket error: {0}")]
    WebSocket(String),
}

/// Configuration validation errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("endpoint is empty")]
    EmptyEndpoint,

    #[error("invalid endpoint {url}: {reason}")]
    InvalidEndpoint { url: String, reason: String },

    #[error("invalid limit: {0}")]
    InvalidLimit(String),

    #[error("invalid interval: {0}")]
    InvalidInterval(String),

    #[error("invalid header {name}: {reason}")]
    InvalidHeader { name: String, reason: String },
}

/// Failure reported by an external signer.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("signer {pubkey} failed: {reason}")]
pub struct SignerError {
    pub pubkey: String,
    pub reason: String,
}

/// Errors surfaced by every public client operation.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),

    /// Preflight rejected a submitted transaction
    #[error("failed to send transaction: {message}")]
    SendTransaction {
        message: String,
        logs: Option<Vec<String>>,
    },

    /// A subscribe or unsubscribe call failed
    #[error("subscription error: {0}")]
    Subscription(String),

    #[error("unable to obtain a new blockhash after {elapsed_ms}ms")]
    BlockhashExhausted { elapsed_ms: u64 },

    #[error("signature {signature} has expired: block height exceeded")]
    ConfirmationExpired { signature: String },

    #[error(
        "transaction was not confirmed in {:.2} seconds; check signature {signature} to see if it was processed",
        .elapsed.as_secs_f64()
    )]
    ConfirmationTimeout { signature: String, elapsed: Duration },

    /// Confirmed on chain with an execution error
    #[error("transaction {signature} failed: {err}")]
    TransactionFailed { signature: String, err: String },

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error(transparent)]
    Signer(#[from] SignerError),

    #[error("failed to decode {what}: {reason}")]
    Decode { what: String, reason: String },

    #[error("notification channel is not connected")]
    NotConnected,

    #[error("notification channel closed before a response arrived")]
    ConnectionClosed,

    #[error("request {method} timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    #[error("client is shut down")]
    Shutdown,

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl ClientError {
    pub fn decode(what: impl Into<String>, err: impl fmt::Display) -> Self {
        Self::Decode {
            what: what.into(),
            reason: err.to_string(),
        }
    }

    /// Server-reported error, if this is one.
    pub fn rpc_error(&self) -> Option<&RpcError> {
        match self {
            ClientError::Rpc(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;
