//! Transaction confirmation: a signature notification raced against expiry.
//!
//! ```text
//!              ┌──────────────────────────────┐
//!              │          confirm()           │
//!              └──────────────┬───────────────┘
//!          ┌──────────────────┼───────────────────┐
//!          ▼                  ▼                   ▼
//!   signature notification   status probe    expiry watcher
//!   (registry, one-shot)     (one query      (block height poll | flat timeout)
//!                             after ack)
//!          │                  │                   │
//!          └─────────── first to finish ──────────┘
//!                             │
//!              handle removed, watcher cancelled
//! ```

use crate::domain::config::ConfirmationConfig;
use crate::domain::subscription::{NotificationCallback, SubscriptionRequest};
use crate::domain::types::{
    ClientSubscriptionId, Commitment, ConfirmationOutcome, ConfirmationStrategy, RpcContext,
    RpcResponse, Signature, SignatureResult,
};
use crate::error::{ClientError, ClientResult};
use crate::gateway::RequestGateway;
use crate::metrics::ClientMetrics;
use crate::pubsub::SubscriptionRegistry;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Removes the signature handle on every exit path.
struct SubscriptionGuard {
    registry: SubscriptionRegistry,
    id: ClientSubscriptionId,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        // Fails only after shutdown, when there is nothing left to remove
        let _ = self.registry.unsubscribe(self.id);
    }
}

/// Waits for transactions to reach a commitment level.
pub struct ConfirmationCoordinator {
    gateway: Arc<RequestGateway>,
    registry: SubscriptionRegistry,
    config: ConfirmationConfig,
    default_commitment: Option<Commitment>,
    metrics: Arc<ClientMetrics>,
}

impl ConfirmationCoordinator {
    pub fn new(
        gateway: Arc<RequestGateway>,
        registry: SubscriptionRegistry,
        config: ConfirmationConfig,
        default_commitment: Option<Commitment>,
        metrics: Arc<ClientMetrics>,
    ) -> Self {
        Self {
            gateway,
            registry,
            config,
            default_commitment,
            metrics,
        }
    }

    /// Wait for `strategy`'s signature to reach `commitment`.
    ///
    /// Resolves exactly once; a malformed signature is rejected before
    /// anything is registered.
    pub async fn confirm(
        &self,
        strategy: &ConfirmationStrategy,
        commitment: Option<Commitment>,
    ) -> ClientResult<ConfirmationOutcome> {
        let signature: Signature = strategy.raw_signature().parse()?;
        let commitment = Commitment::resolve(commitment, self.default_commitment);
        let started = Instant::now();

        let (statuses_tx, mut statuses_rx) = mpsc::unbounded_channel();
        let callback: NotificationCallback = Arc::new(move |value: &Value| {
            match serde_json::from_value::<RpcResponse<SignatureResult>>(value.clone()) {
                Ok(response) => {
                    let _ = statuses_tx.send(response);
                }
                Err(_) => trace!("Ignoring non-final signature notification"),
            }
        });
        let (id, acked) = self.registry.subscribe_acked(
            SubscriptionRequest::signature(signature.as_str(), commitment, false),
            callback,
        )?;
        let _subscription = SubscriptionGuard {
            registry: self.registry.clone(),
            id,
        };

        let token = CancellationToken::new();
        let _cancel = token.clone().drop_guard();
        let mut watcher = tokio::spawn(watch_expiry(
            self.gateway.clone(),
            strategy.clone(),
            commitment,
            self.config.timeout_for(commitment),
            self.config.block_height_poll_interval,
            token,
        ));

        // Runs after the subscribe ack; later landings arrive as notifications
        let probe = async {
            if acked.await.is_ok() {
                if let Some(status) = self.fetch_status(&signature, commitment).await {
                    return status;
                }
            }
            std::future::pending().await
        };

        debug!(signature = %signature, commitment = %commitment, "Awaiting confirmation");
        let outcome = tokio::select! {
            biased;

            Some(response) = statuses_rx.recv() => ConfirmationOutcome::Confirmed {
                context: response.context,
                result: response.value,
            },
            (context, result) = probe => ConfirmationOutcome::Confirmed { context, result },
            joined = &mut watcher => match joined {
                Ok(Some(ConfirmationOutcome::Expired)) => {
                    // The transaction may have landed in the last polled block
                    match self.fetch_status(&signature, commitment).await {
                        Some((context, result)) => ConfirmationOutcome::Confirmed { context, result },
                        None => ConfirmationOutcome::Expired,
                    }
                }
                Ok(Some(outcome)) => outcome,
                Ok(None) => return Err(ClientError::Shutdown),
                Err(e) => {
                    warn!(signature = %signature, error = %e, "Expiry watcher failed");
                    return Err(ClientError::Shutdown);
                }
            },
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &outcome {
            ConfirmationOutcome::Confirmed { context, result } => {
                ClientMetrics::inc(&self.metrics.confirmations_succeeded);
                info!(
                    signature = %signature,
                    slot = context.slot,
                    failed = result.err.is_some(),
                    elapsed_ms = elapsed_ms,
                    "Transaction confirmed"
                );
            }
            ConfirmationOutcome::Expired => {
                ClientMetrics::inc(&self.metrics.confirmations_expired);
                warn!(signature = %signature, elapsed_ms = elapsed_ms, "Blockhash expired before confirmation");
            }
            ConfirmationOutcome::TimedOut { .. } => {
                ClientMetrics::inc(&self.metrics.confirmations_timed_out);
                warn!(signature = %signature, elapsed_ms = elapsed_ms, "Confirmation timed out");
            }
        }
        Ok(outcome)
    }

    /// Current status of `signature` if it already satisfies `commitment`.
    ///
    /// Query failures count as "not yet".
    async fn fetch_status(
        &self,
        signature: &Signature,
        commitment: Commitment,
    ) -> Option<(RpcContext, SignatureResult)> {
        let response = match self
            .gateway
            .get_signature_statuses(&[signature.to_string()], false)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                debug!(signature = %signature, error = %e, "Signature status query failed");
                return None;
            }
        };

        let RpcResponse { context, value } = response;
        match value.into_iter().next().flatten() {
            Some(status) if status.satisfies(commitment) => {
                Some((context, SignatureResult { err: status.err }))
            }
            _ => None,
        }
    }
}

async fn watch_expiry(
    gateway: Arc<RequestGateway>,
    strategy: ConfirmationStrategy,
    commitment: Commitment,
    timeout: Duration,
    poll_interval: Duration,
    token: CancellationToken,
) -> Option<ConfirmationOutcome> {
    match strategy {
        ConfirmationStrategy::Signature(_) => {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    return Some(ConfirmationOutcome::TimedOut {
                        elapsed_ms: timeout.as_millis() as u64,
                    });
                }
            }
        }
        ConfirmationStrategy::BlockHeight {
            last_valid_block_height,
            ..
        } => loop {
            let height = tokio::select! {
                _ = token.cancelled() => break,
                height = gateway.get_block_height(Some(commitment)) => height,
            };
            match height {
                Ok(height) if height > last_valid_block_height => {
                    return Some(ConfirmationOutcome::Expired);
                }
                Ok(height) => trace!(height = height, last_valid_block_height = last_valid_block_height, "Blockhash still valid"),
                Err(e) => debug!(error = %e, "Block height query failed"),
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(poll_interval) => {}
            }
        },
    }

    trace!("Expiry watcher cancelled");
    None
}
