//! Ledger client facade.
//!
//! Wires the request gateway, the notification channel, the blockhash cache
//! and the confirmation coordinator together and exposes typed listeners
//! and the transaction submission flow.

use crate::adapters::{HttpTransport, WsConnector};
use crate::blockhash::{BlockhashCache, SigningPurpose};
use crate::confirmation::ConfirmationCoordinator;
use crate::domain::config::ClientConfig;
use crate::domain::subscription::{NotificationCallback, SubscriptionRequest};
use crate::domain::types::{
    BlockhashWithExpiry, ClientSubscriptionId, Commitment, ConfirmationOutcome,
    ConfirmationStrategy, LogsFilter, LogsNotification, RpcContext, RpcResponse, SendOptions,
    Signature, SignatureNotification, SignatureResult, SimulationResult, SlotInfo,
};
use crate::error::{ClientError, ClientResult};
use crate::gateway::RequestGateway;
use crate::metrics::{ClientMetrics, MetricsSnapshot};
use crate::ports::{PubsubConnector, RpcTransport, TransactionBuilder, TransactionSigner};
use crate::pubsub::{ConnectionLifecycle, SubscriptionRegistry, SubscriptionSnapshot};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Wrap a typed callback; undecodable notifications are logged and dropped.
fn typed<T, F>(notification: &'static str, callback: F) -> NotificationCallback
where
    T: DeserializeOwned,
    F: Fn(T) + Send + Sync + 'static,
{
    Arc::new(move |value: &Value| match serde_json::from_value::<T>(value.clone()) {
        Ok(decoded) => callback(decoded),
        Err(e) => warn!(
            notification = notification,
            error = %e,
            "Dropping undecodable notification"
        ),
    })
}

/// Split a `signatureNotification` result into its context and value.
fn decode_signature_notification(
    value: &Value,
) -> Result<(SignatureNotification, RpcContext), serde_json::Error> {
    let response: RpcResponse<Value> = serde_json::from_value(value.clone())?;
    let notification = match response.value {
        Value::String(ref marker) if marker == "receivedSignature" => {
            SignatureNotification::Received
        }
        other => SignatureNotification::Status(serde_json::from_value(other)?),
    };
    Ok((notification, response.context))
}

/// Client for one ledger node.
pub struct LedgerClient {
    config: ClientConfig,
    gateway: Arc<RequestGateway>,
    registry: SubscriptionRegistry,
    blockhash: BlockhashCache,
    confirmation: ConfirmationCoordinator,
    metrics: Arc<ClientMetrics>,
}

impl LedgerClient {
    /// Client over HTTP and WebSocket.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(config: ClientConfig) -> ClientResult<Self> {
        let transport = HttpTransport::new(&config.rpc)?;
        let connector = WsConnector::new(config.websocket_url()?);
        Self::with_transports(config, Arc::new(transport), Arc::new(connector))
    }

    /// Client over caller-supplied transports.
    pub fn with_transports(
        config: ClientConfig,
        transport: Arc<dyn RpcTransport>,
        connector: Arc<dyn PubsubConnector>,
    ) -> ClientResult<Self> {
        config.validate()?;
        let metrics = Arc::new(ClientMetrics::new());

        let gateway = Arc::new(RequestGateway::new(
            transport,
            &config.rpc,
            config.commitment,
            metrics.clone(),
        ));
        let (lifecycle, events) =
            ConnectionLifecycle::new(connector, config.pubsub.clone(), metrics.clone());
        let registry =
            SubscriptionRegistry::spawn(lifecycle, events, &config.pubsub, metrics.clone());
        let blockhash = BlockhashCache::new(gateway.clone(), config.blockhash.clone(), metrics.clone());
        let confirmation = ConfirmationCoordinator::new(
            gateway.clone(),
            registry.clone(),
            config.confirmation.clone(),
            config.commitment,
            metrics.clone(),
        );

        info!(
            endpoint = %config.rpc.endpoint,
            commitment = ?config.commitment,
            "Ledger client created"
        );
        Ok(Self {
            config,
            gateway,
            registry,
            blockhash,
            confirmation,
            metrics,
        })
    }

    /// Request/response queries.
    pub fn gateway(&self) -> &RequestGateway {
        &self.gateway
    }

    pub fn commitment(&self) -> Option<Commitment> {
        self.config.commitment
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Per-key subscription state.
    pub async fn subscriptions(&self) -> ClientResult<Vec<SubscriptionSnapshot>> {
        self.registry.snapshot().await
    }

    fn subscription_commitment(&self, commitment: Option<Commitment>) -> Commitment {
        Commitment::resolve(commitment, self.config.commitment)
    }

    pub fn on_account_change<F>(
        &self,
        address: &str,
        callback: F,
        commitment: Option<Commitment>,
    ) -> ClientResult<ClientSubscriptionId>
    where
        F: Fn(RpcResponse<Value>) + Send + Sync + 'static,
    {
        let request = SubscriptionRequest::account(address, self.subscription_commitment(commitment));
        self.registry
            .subscribe(request, typed("accountNotification", callback))
    }

    /// `filters` is passed through unchanged.
    pub fn on_program_account_change<F>(
        &self,
        program_id: &str,
        callback: F,
        commitment: Option<Commitment>,
        filters: Option<Value>,
    ) -> ClientResult<ClientSubscriptionId>
    where
        F: Fn(RpcResponse<Value>) + Send + Sync + 'static,
    {
        let request = SubscriptionRequest::program(
            program_id,
            self.subscription_commitment(commitment),
            filters,
        );
        self.registry
            .subscribe(request, typed("programNotification", callback))
    }

    pub fn on_logs<F>(
        &self,
        filter: &LogsFilter,
        callback: F,
        commitment: Option<Commitment>,
    ) -> ClientResult<ClientSubscriptionId>
    where
        F: Fn(RpcResponse<LogsNotification>) + Send + Sync + 'static,
    {
        let request = SubscriptionRequest::logs(filter, self.subscription_commitment(commitment));
        self.registry.subscribe(request, typed("logsNotification", callback))
    }

    pub fn on_slot_change<F>(&self, callback: F) -> ClientResult<ClientSubscriptionId>
    where
        F: Fn(SlotInfo) + Send + Sync + 'static,
    {
        self.registry
            .subscribe(SubscriptionRequest::slot(), typed("slotNotification", callback))
    }

    /// Slot update payloads are passed through undecoded.
    pub fn on_slot_update<F>(&self, callback: F) -> ClientResult<ClientSubscriptionId>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.registry.subscribe(
            SubscriptionRequest::slots_updates(),
            typed("slotsUpdatesNotification", callback),
        )
    }

    pub fn on_root_change<F>(&self, callback: F) -> ClientResult<ClientSubscriptionId>
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        self.registry
            .subscribe(SubscriptionRequest::root(), typed("rootNotification", callback))
    }

    /// One-shot listener for the final status of `signature`.
    ///
    /// Fires at most once and removes itself afterwards.
    pub fn on_signature<F>(
        &self,
        signature: &str,
        callback: F,
        commitment: Option<Commitment>,
    ) -> ClientResult<ClientSubscriptionId>
    where
        F: Fn(SignatureResult, RpcContext) + Send + Sync + 'static,
    {
        self.on_signature_with_options(
            signature,
            move |notification, context| {
                if let SignatureNotification::Status(result) = notification {
                    callback(result, context);
                }
            },
            commitment,
            false,
        )
    }

    /// Like [`on_signature`](Self::on_signature), optionally also reporting
    /// when the node first receives the signature.
    pub fn on_signature_with_options<F>(
        &self,
        signature: &str,
        callback: F,
        commitment: Option<Commitment>,
        received_notification: bool,
    ) -> ClientResult<ClientSubscriptionId>
    where
        F: Fn(SignatureNotification, RpcContext) + Send + Sync + 'static,
    {
        let signature: Signature = signature.parse()?;
        let id = self.registry.allocate_id();
        let registry = self.registry.clone();
        let fired = AtomicBool::new(false);

        let wrapped: NotificationCallback = Arc::new(move |value: &Value| {
            let (notification, context) = match decode_signature_notification(value) {
                Ok(decoded) => decoded,
                Err(e) => {
                    warn!(error = %e, "Dropping undecodable signature notification");
                    return;
                }
            };
            match notification {
                SignatureNotification::Received => callback(notification, context),
                SignatureNotification::Status(_) => {
                    if fired.swap(true, Ordering::SeqCst) {
                        return;
                    }
                    callback(notification, context);
                    let _ = registry.unsubscribe(id);
                }
            }
        });

        let request = SubscriptionRequest::signature(
            signature.as_str(),
            self.subscription_commitment(commitment),
            received_notification,
        );
        self.registry.subscribe_with_id(id, request, wrapped)?;
        Ok(id)
    }

    /// Remove a listener. Removing an unknown or already removed handle is a no-op.
    pub fn remove_listener(&self, id: ClientSubscriptionId) -> ClientResult<()> {
        self.registry.unsubscribe(id)
    }

    /// Sign with a blockhash not yet used for this signature, then submit.
    pub async fn send_transaction(
        &self,
        builder: &dyn TransactionBuilder,
        signers: &[Arc<dyn TransactionSigner>],
        options: &SendOptions,
    ) -> ClientResult<Signature> {
        let (signature, _) = self.sign_and_send(builder, signers, options).await?;
        Ok(signature)
    }

    async fn sign_and_send(
        &self,
        builder: &dyn TransactionBuilder,
        signers: &[Arc<dyn TransactionSigner>],
        options: &SendOptions,
    ) -> ClientResult<(Signature, BlockhashWithExpiry)> {
        let (signed, blockhash) = self
            .blockhash
            .sign_unique(builder, signers, SigningPurpose::Send)
            .await?;
        let signature = self
            .gateway
            .send_encoded_transaction(&signed.payload, options)
            .await?;
        debug!(
            signature = %signature,
            blockhash = %blockhash.blockhash,
            "Transaction submitted"
        );
        Ok((signature, blockhash))
    }

    /// Sign against the cached blockhash and simulate.
    pub async fn simulate_transaction(
        &self,
        builder: &dyn TransactionBuilder,
        signers: &[Arc<dyn TransactionSigner>],
        commitment: Option<Commitment>,
    ) -> ClientResult<RpcResponse<SimulationResult>> {
        let (signed, _) = self
            .blockhash
            .sign_unique(builder, signers, SigningPurpose::Simulate)
            .await?;
        self.gateway
            .simulate_encoded_transaction(&signed.payload, commitment)
            .await
            .map_err(|e| match e {
                ClientError::Rpc(err) => ClientError::SendTransaction {
                    logs: err.logs(),
                    message: err.message,
                },
                other => other,
            })
    }

    /// Submit, then wait until the transaction reaches `commitment` or its
    /// blockhash expires.
    pub async fn send_and_confirm_transaction(
        &self,
        builder: &dyn TransactionBuilder,
        signers: &[Arc<dyn TransactionSigner>],
        options: &SendOptions,
        commitment: Option<Commitment>,
    ) -> ClientResult<Signature> {
        let (signature, blockhash) = self.sign_and_send(builder, signers, options).await?;

        let strategy = ConfirmationStrategy::BlockHeight {
            signature: signature.to_string(),
            blockhash: blockhash.blockhash,
            last_valid_block_height: blockhash.last_valid_block_height,
        };
        let status = self.confirm_transaction(&strategy, commitment).await?;
        if let Some(err) = status.value.err {
            return Err(ClientError::TransactionFailed {
                signature: signature.to_string(),
                err: err.to_string(),
            });
        }
        Ok(signature)
    }

    /// Wait for a signature, surfacing expiry and timeout as errors.
    ///
    /// A transaction that executed with an error still confirms; its error
    /// is in the returned value.
    pub async fn confirm_transaction(
        &self,
        strategy: &ConfirmationStrategy,
        commitment: Option<Commitment>,
    ) -> ClientResult<RpcResponse<SignatureResult>> {
        match self.confirmation.confirm(strategy, commitment).await? {
            ConfirmationOutcome::Confirmed { context, result } => Ok(RpcResponse {
                context,
                value: result,
            }),
            ConfirmationOutcome::Expired => Err(ClientError::ConfirmationExpired {
                signature: strategy.raw_signature().to_string(),
            }),
            ConfirmationOutcome::TimedOut { elapsed_ms } => Err(ClientError::ConfirmationTimeout {
                signature: strategy.raw_signature().to_string(),
                elapsed: Duration::from_millis(elapsed_ms),
            }),
        }
    }

    /// Raw confirmation outcome without error mapping.
    pub async fn confirm(
        &self,
        strategy: &ConfirmationStrategy,
        commitment: Option<Commitment>,
    ) -> ClientResult<ConfirmationOutcome> {
        self.confirmation.confirm(strategy, commitment).await
    }

    /// Stop the registry and close the notification channel.
    pub fn shutdown(&self) {
        info!("Shutting down ledger client");
        self.registry.shutdown();
    }
}

impl Drop for LedgerClient {
    fn drop(&mut self) {
        self.registry.shutdown();
    }
}
