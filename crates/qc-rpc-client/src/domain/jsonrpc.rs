//! JSON-RPC 2.0 envelopes and argument building.

use crate::domain::types::Commitment;
use crate::error::RpcError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// JSON-RPC request structure.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    pub params: &'a [Value],
    pub id: u64,
}

impl<'a> JsonRpcRequest<'a> {
    pub fn new(id: u64, method: &'a str, params: &'a [Value]) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params,
            id,
        }
    }
}

/// JSON-RPC response structure.
///
/// `id` is optional because some nodes answer parse errors with `id: null`.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcError>,
}

impl JsonRpcResponse {
    /// Collapse into the result or the server-reported error.
    ///
    /// A response with neither field is a `null` result.
    pub fn into_result(self) -> Result<Value, RpcError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Server push notification on the pubsub channel.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcNotification {
    pub method: String,
    pub params: NotificationParams,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationParams {
    pub subscription: u64,
    pub result: Value,
}

/// Build positional params followed by an optional config object.
///
/// The config object is only appended when it carries at least one key, so
/// callers that pass no commitment and no options send bare positional
/// params. Object keys are emitted in sorted order (serde_json's default
/// map), which keeps subscription keys stable regardless of insertion order.
pub fn build_args(
    mut args: Vec<Value>,
    commitment: Option<Commitment>,
    encoding: Option<&str>,
    extra: Option<Map<String, Value>>,
) -> Vec<Value> {
    let mut config = extra.unwrap_or_default();
    if let Some(commitment) = commitment {
        config.insert("commitment".into(), Value::from(commitment.as_str()));
    }
    if let Some(encoding) = encoding {
        config.insert("encoding".into(), Value::from(encoding));
    }
    if !config.is_empty() {
        args.push(Value::Object(config));
    }
    args
}
