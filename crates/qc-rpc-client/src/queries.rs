//! Typed queries used by the client core.
//!
//! Only the methods the blockhash cache, the confirmation flow and
//! transaction submission need; other payloads stay opaque `Value`s.

use crate::domain::jsonrpc::build_args;
use crate::domain::types::{
    BlockhashWithExpiry, Commitment, RpcResponse, SendOptions, Signature, SignatureStatus,
    SimulationResult,
};
use crate::error::{ClientError, ClientResult};
use crate::gateway::RequestGateway;
use serde_json::{json, Map, Value};

impl RequestGateway {
    fn query_commitment(&self, commitment: Option<Commitment>) -> Option<Commitment> {
        commitment.or(self.commitment())
    }

    /// getLatestBlockhash
    pub async fn get_latest_blockhash(
        &self,
        commitment: Option<Commitment>,
    ) -> ClientResult<RpcResponse<BlockhashWithExpiry>> {
        let params = build_args(vec![], self.query_commitment(commitment), None, None);
        self.call_typed("getLatestBlockhash", params).await
    }

    /// getBlockHeight
    pub async fn get_block_height(&self, commitment: Option<Commitment>) -> ClientResult<u64> {
        let params = build_args(vec![], self.query_commitment(commitment), None, None);
        self.call_typed("getBlockHeight", params).await
    }

    /// getSlot
    pub async fn get_slot(&self, commitment: Option<Commitment>) -> ClientResult<u64> {
        let params = build_args(vec![], self.query_commitment(commitment), None, None);
        self.call_typed("getSlot", params).await
    }

    /// getBalance, in lamports
    pub async fn get_balance(
        &self,
        address: &str,
        commitment: Option<Commitment>,
    ) -> ClientResult<RpcResponse<u64>> {
        let params = build_args(
            vec![Value::from(address)],
            self.query_commitment(commitment),
            None,
            None,
        );
        self.call_typed("getBalance", params).await
    }

    /// getAccountInfo with base64 data; `None` when the account does not exist.
    pub async fn get_account_info(
        &self,
        address: &str,
        commitment: Option<Commitment>,
    ) -> ClientResult<RpcResponse<Option<Value>>> {
        let params = build_args(
            vec![Value::from(address)],
            self.query_commitment(commitment),
            Some("base64"),
            None,
        );
        self.call_typed("getAccountInfo", params).await
    }

    /// getSignatureStatuses; entries are `None` for unknown signatures.
    pub async fn get_signature_statuses(
        &self,
        signatures: &[String],
        search_transaction_history: bool,
    ) -> ClientResult<RpcResponse<Vec<Option<SignatureStatus>>>> {
        let mut params = vec![json!(signatures)];
        if search_transaction_history {
            params.push(json!({ "searchTransactionHistory": true }));
        }
        self.call_typed("getSignatureStatuses", params).await
    }

    /// getVersion
    pub async fn get_version(&self) -> ClientResult<Value> {
        self.call("getVersion", vec![]).await
    }

    /// sendTransaction with a base64 wire payload.
    ///
    /// Server rejections come back as [`ClientError::SendTransaction`] with
    /// the preflight logs when the node attached them.
    pub async fn send_encoded_transaction(
        &self,
        payload: &str,
        options: &SendOptions,
    ) -> ClientResult<Signature> {
        let mut config = Map::new();
        if options.skip_preflight {
            config.insert("skipPreflight".into(), Value::Bool(true));
        }
        if let Some(commitment) = options.preflight_commitment.or(self.commitment()) {
            config.insert("preflightCommitment".into(), Value::from(commitment.as_str()));
        }
        if let Some(max_retries) = options.max_retries {
            config.insert("maxRetries".into(), Value::from(max_retries));
        }
        if let Some(slot) = options.min_context_slot {
            config.insert("minContextSlot".into(), Value::from(slot));
        }
        let params = build_args(vec![Value::from(payload)], None, Some("base64"), Some(config));

        let signature: String = self
            .call_typed("sendTransaction", params)
            .await
            .map_err(|e| match e {
                ClientError::Rpc(err) => ClientError::SendTransaction {
                    logs: err.logs(),
                    message: err.message,
                },
                other => other,
            })?;
        signature.parse()
    }

    /// simulateTransaction with a base64 wire payload.
    pub async fn simulate_encoded_transaction(
        &self,
        payload: &str,
        commitment: Option<Commitment>,
    ) -> ClientResult<RpcResponse<SimulationResult>> {
        let params = build_args(
            vec![Value::from(payload)],
            self.query_commitment(commitment),
            Some("base64"),
            None,
        );
        self.call_typed("simulateTransaction", params).await
    }
}

#[cfg(test)]
mod tests {
    use crate::domain::config::RpcConfig;
    use crate::domain::types::{Commitment, SendOptions, Signature};
    use crate::error::{codes, ClientError, RpcError};
    use crate::gateway::RequestGateway;
    use crate::metrics::ClientMetrics;
    use crate::testing::MockRpcTransport;
    use serde_json::json;
    use std::sync::Arc;

    fn gateway(transport: Arc<MockRpcTransport>, commitment: Option<Commitment>) -> RequestGateway {
        RequestGateway::new(
            transport,
            &RpcConfig::default(),
            commitment,
            Arc::new(ClientMetrics::new()),
        )
    }

    #[tokio::test]
    async fn test_default_commitment_applied() {
        let transport = MockRpcTransport::new(|_, _| Ok(json!(100)));
        let gateway = gateway(transport.clone(), Some(Commitment::Confirmed));

        assert_eq!(gateway.get_block_height(None).await.unwrap(), 100);
        gateway.get_block_height(Some(Commitment::Processed)).await.unwrap();

        let calls = transport.calls();
        assert_eq!(calls[0].1, json!([{ "commitment": "confirmed" }]));
        assert_eq!(calls[1].1, json!([{ "commitment": "processed" }]));
    }

    #[tokio::test]
    async fn test_no_commitment_sends_bare_params() {
        let transport = MockRpcTransport::new(|_, _| Ok(json!(7)));
        let gateway = gateway(transport.clone(), None);

        gateway.get_slot(None).await.unwrap();
        assert_eq!(transport.calls()[0].1, json!([]));
    }

    #[tokio::test]
    async fn test_latest_blockhash_decoding() {
        let transport = MockRpcTransport::new(|_, _| {
            Ok(json!({
                "context": { "slot": 9 },
                "value": { "blockhash": "hash-a", "lastValidBlockHeight": 150 }
            }))
        });
        let gateway = gateway(transport, None);

        let response = gateway.get_latest_blockhash(Some(Commitment::Finalized)).await.unwrap();
        assert_eq!(response.context.slot, 9);
        assert_eq!(response.value.blockhash.0, "hash-a");
        assert_eq!(response.value.last_valid_block_height, 150);
    }

    #[tokio::test]
    async fn test_signature_statuses_with_unknown_entries() {
        let transport = MockRpcTransport::new(|_, _| {
            Ok(json!({
                "context": { "slot": 5 },
                "value": [
                    null,
                    { "slot": 4, "confirmations": null, "err": null, "confirmationStatus": "finalized" }
                ]
            }))
        });
        let gateway = gateway(transport.clone(), None);

        let response = gateway
            .get_signature_statuses(&["a".into(), "b".into()], true)
            .await
            .unwrap();
        assert!(response.value[0].is_none());
        assert!(response.value[1].as_ref().unwrap().satisfies(Commitment::Finalized));
        assert_eq!(
            transport.calls()[0].1,
            json!([["a", "b"], { "searchTransactionHistory": true }])
        );
    }

    #[tokio::test]
    async fn test_send_preflight_failure_carries_logs() {
        let transport = MockRpcTransport::new(|_, _| {
            Err(RpcError::with_data(
                codes::SEND_TRANSACTION_PREFLIGHT_FAILURE,
                "Transaction simulation failed: Error processing Instruction 0",
                json!({ "logs": ["Program X invoke [1]", "Program X failed"] }),
            ))
        });
        let gateway = gateway(transport, None);

        let err = gateway
            .send_encoded_transaction("AQID", &SendOptions::default())
            .await
            .unwrap_err();
        match err {
            ClientError::SendTransaction { message, logs } => {
                assert!(message.starts_with("Transaction simulation failed"));
                assert_eq!(logs.unwrap().len(), 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_send_options_serialized() {
        let signature = Signature::from_bytes(&[3u8; 64]);
        let expected = signature.to_string();
        let transport = MockRpcTransport::new(move |_, _| Ok(json!(expected)));
        let gateway = gateway(transport.clone(), Some(Commitment::Confirmed));

        let options = SendOptions {
            skip_preflight: true,
            max_retries: Some(2),
            ..SendOptions::default()
        };
        let returned = gateway.send_encoded_transaction("AQID", &options).await.unwrap();

        assert_eq!(returned, signature);
        assert_eq!(
            transport.calls()[0].1,
            json!([
                "AQID",
                {
                    "encoding": "base64",
                    "maxRetries": 2,
                    "preflightCommitment": "confirmed",
                    "skipPreflight": true
                }
            ])
        );
    }
}
