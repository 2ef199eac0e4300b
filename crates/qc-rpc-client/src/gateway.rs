//! Request/response gateway: single and batched JSON-RPC calls.
//!
//! Rate-limited replies (HTTP 429) are retried with exponential backoff when
//! enabled; every other non-success status and every JSON-RPC error envelope
//! goes straight back to the caller.

use crate::domain::config::RpcConfig;
use crate::domain::jsonrpc::{JsonRpcRequest, JsonRpcResponse};
use crate::domain::types::Commitment;
use crate::error::{ClientError, ClientResult, RpcError, TransportError};
use crate::metrics::ClientMetrics;
use crate::ports::RpcTransport;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// HTTP status signalling rate limiting.
const TOO_MANY_REQUESTS: u16 = 429;

/// Executes JSON-RPC calls over an [`RpcTransport`].
pub struct RequestGateway {
    transport: Arc<dyn RpcTransport>,
    commitment: Option<Commitment>,
    retry_on_rate_limit: bool,
    max_attempts: u32,
    initial_backoff: Duration,
    request_id: AtomicU64,
    metrics: Arc<ClientMetrics>,
}

impl RequestGateway {
    pub fn new(
        transport: Arc<dyn RpcTransport>,
        config: &RpcConfig,
        commitment: Option<Commitment>,
        metrics: Arc<ClientMetrics>,
    ) -> Self {
        Self {
            transport,
            commitment,
            retry_on_rate_limit: config.retry_on_rate_limit,
            max_attempts: config.rate_limit_retries.max(1),
            initial_backoff: config.rate_limit_initial_backoff,
            request_id: AtomicU64::new(1),
            metrics,
        }
    }

    /// Default commitment applied to queries that do not name one.
    pub fn commitment(&self) -> Option<Commitment> {
        self.commitment
    }

    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Make a JSON-RPC call.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> ClientResult<Value> {
        let id = self.next_id();
        let body = serde_json::to_string(&JsonRpcRequest::new(id, method, &params))
            .map_err(|e| ClientError::decode("request", e))?;

        debug!(method = method, id = id, "Sending RPC request");
        ClientMetrics::inc(&self.metrics.rpc_requests);

        let result = self.post_with_retry(body).await.and_then(|body| {
            let response: JsonRpcResponse = serde_json::from_str(&body)
                .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;
            Ok(response)
        });

        match result {
            Ok(response) => response.into_result().map_err(|e| {
                ClientMetrics::inc(&self.metrics.rpc_errors);
                debug!(method = method, code = e.code, "RPC error response");
                ClientError::Rpc(e)
            }),
            Err(e) => {
                ClientMetrics::inc(&self.metrics.rpc_errors);
                Err(e.into())
            }
        }
    }

    /// Make a JSON-RPC call and decode the result.
    pub async fn call_typed<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> ClientResult<T> {
        let value = self.call(method, params).await?;
        serde_json::from_value(value).map_err(|e| ClientError::decode(method, e))
    }

    /// Send several calls in one round-trip.
    ///
    /// Results come back in request order regardless of the order the server
    /// answers in. An empty batch never touches the transport.
    pub async fn batch_call(
        &self,
        requests: Vec<(String, Vec<Value>)>,
    ) -> ClientResult<Vec<Result<Value, RpcError>>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<u64> = requests.iter().map(|_| self.next_id()).collect();
        let envelopes: Vec<JsonRpcRequest<'_>> = requests
            .iter()
            .zip(&ids)
            .map(|((method, params), id)| JsonRpcRequest::new(*id, method, params))
            .collect();
        let body =
            serde_json::to_string(&envelopes).map_err(|e| ClientError::decode("request", e))?;

        debug!(size = requests.len(), "Sending RPC batch");
        ClientMetrics::inc(&self.metrics.rpc_requests);

        let body = self.post_with_retry(body).await.map_err(|e| {
            ClientMetrics::inc(&self.metrics.rpc_errors);
            ClientError::from(e)
        })?;
        let reply: Value = serde_json::from_str(&body)
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;
        let responses: Vec<JsonRpcResponse> = match reply {
            Value::Array(items) => serde_json::from_value(Value::Array(items))
                .map_err(|e| TransportError::InvalidResponse(e.to_string()))?,
            // The server rejected the batch as a whole
            single => {
                let response: JsonRpcResponse = serde_json::from_value(single)
                    .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;
                let error = response.into_result().err().ok_or_else(|| {
                    TransportError::InvalidResponse("batch answered with a single result".into())
                })?;
                ClientMetrics::inc(&self.metrics.rpc_errors);
                debug!(code = error.code, "RPC batch rejected");
                return Err(ClientError::Rpc(error));
            }
        };

        let mut by_id: HashMap<u64, JsonRpcResponse> = responses
            .into_iter()
            .filter_map(|response| response.id.map(|id| (id, response)))
            .collect();

        ids.iter()
            .map(|id| {
                by_id.remove(id).map(JsonRpcResponse::into_result).ok_or_else(|| {
                    ClientError::from(TransportError::InvalidResponse(format!(
                        "missing response for batch id {id}"
                    )))
                })
            })
            .collect()
    }

    /// POST with rate-limit retry; returns the body of a successful reply.
    async fn post_with_retry(&self, body: String) -> Result<String, TransportError> {
        let mut backoff = self.initial_backoff;
        let mut attempt = 1;

        loop {
            let reply = self.transport.post(body.clone()).await?;

            if reply.status == TOO_MANY_REQUESTS {
                if !self.retry_on_rate_limit || attempt >= self.max_attempts {
                    return Err(TransportError::RateLimited {
                        attempts: attempt,
                        body: reply.body,
                    });
                }
                warn!(
                    attempt = attempt,
                    delay_ms = backoff.as_millis() as u64,
                    "Server responded with 429 Too Many Requests, retrying"
                );
                ClientMetrics::inc(&self.metrics.rate_limit_retries);
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
                attempt += 1;
                continue;
            }

            if !reply.is_success() {
                return Err(TransportError::Status {
                    status: reply.status,
                    body: reply.body,
                });
            }

            return Ok(reply.body);
        }
    }
}
