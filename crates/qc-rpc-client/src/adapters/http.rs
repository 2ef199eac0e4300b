//! `RpcTransport` over HTTP POST.

use crate::domain::config::RpcConfig;
use crate::error::{ConfigError, TransportError};
use crate::ports::{HttpReply, RpcTransport};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};

/// reqwest-backed transport for the request/response channel.
pub struct HttpTransport {
    http_client: reqwest::Client,
    rpc_url: String,
}

impl HttpTransport {
    /// Create a transport for `config.endpoint` with the configured headers.
    pub fn new(config: &RpcConfig) -> Result<Self, ConfigError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        for (name, value) in &config.headers {
            let invalid = |reason: String| ConfigError::InvalidHeader {
                name: name.clone(),
                reason,
            };
            let header_name =
                HeaderName::from_bytes(name.as_bytes()).map_err(|e| invalid(e.to_string()))?;
            let header_value =
                HeaderValue::from_str(value).map_err(|e| invalid(e.to_string()))?;
            headers.insert(header_name, header_value);
        }

        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| ConfigError::InvalidEndpoint {
                url: config.endpoint.clone(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            http_client,
            rpc_url: config.endpoint.clone(),
        })
    }
}

#[async_trait]
impl RpcTransport for HttpTransport {
    async fn post(&self, body: String) -> Result<HttpReply, TransportError> {
        let response = self
            .http_client
            .post(&self.rpc_url)
            .body(body)
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;

        Ok(HttpReply { status, body })
    }
}
