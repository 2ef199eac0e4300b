//! Recent-blockhash cache with duplicate-signature avoidance.
//!
//! A cached blockhash is reused for `cache_ttl`. Every signature produced
//! against it is remembered (separately for submission and simulation); a
//! transaction that would reuse a remembered signature forces a new
//! blockhash and is signed again, so a legitimately retried transaction is
//! never mistaken for an accidental duplicate.

use crate::domain::config::BlockhashConfig;
use crate::domain::types::{Blockhash, BlockhashWithExpiry, Commitment, SignedTransaction};
use crate::error::{ClientError, ClientResult};
use crate::gateway::RequestGateway;
use crate::metrics::ClientMetrics;
use crate::ports::{TransactionBuilder, TransactionSigner};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, trace};

/// Which fingerprint set a signature is checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningPurpose {
    Send,
    Simulate,
}

/// Result of recording a fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Recorded {
    Fresh,
    Duplicate,
    /// Set reached its cap
    Full,
    /// The cache moved to another blockhash while signing
    Stale,
}

#[derive(Default)]
struct CacheState {
    latest: Option<BlockhashWithExpiry>,
    fetched_at: Option<Instant>,
    sent: HashSet<String>,
    simulated: HashSet<String>,
    /// Bumped on every adopted blockhash
    epoch: u64,
}

/// Shared blockhash cache.
pub struct BlockhashCache {
    gateway: Arc<RequestGateway>,
    config: BlockhashConfig,
    state: Mutex<CacheState>,
    /// Single-flight guard for polls
    refresh: tokio::sync::Mutex<()>,
    metrics: Arc<ClientMetrics>,
}

impl BlockhashCache {
    pub fn new(
        gateway: Arc<RequestGateway>,
        config: BlockhashConfig,
        metrics: Arc<ClientMetrics>,
    ) -> Self {
        Self {
            gateway,
            config,
            state: Mutex::new(CacheState::default()),
            refresh: tokio::sync::Mutex::new(()),
            metrics,
        }
    }

    /// Blockhash to sign with.
    ///
    /// Returns the cached value while it is fresh unless `force_refresh` is
    /// set; otherwise waits for the network to produce a different one.
    /// Concurrent callers share a single poll.
    pub async fn get_for_sending(&self, force_refresh: bool) -> ClientResult<BlockhashWithExpiry> {
        let epoch = {
            let state = self.state.lock();
            if !force_refresh && !self.config.disable_caching {
                if let (Some(latest), Some(fetched_at)) = (&state.latest, state.fetched_at) {
                    if fetched_at.elapsed() < self.config.cache_ttl {
                        return Ok(latest.clone());
                    }
                }
            }
            state.epoch
        };

        let _refresh = self.refresh.lock().await;
        {
            let state = self.state.lock();
            if state.epoch != epoch {
                if let Some(latest) = &state.latest {
                    trace!(blockhash = %latest.blockhash, "Using blockhash from concurrent refresh");
                    return Ok(latest.clone());
                }
            }
        }
        self.poll_new_blockhash().await
    }

    /// Last adopted blockhash, fresh or not.
    pub fn cached(&self) -> Option<BlockhashWithExpiry> {
        self.state.lock().latest.clone()
    }

    async fn poll_new_blockhash(&self) -> ClientResult<BlockhashWithExpiry> {
        let started = Instant::now();
        let previous: Option<Blockhash> = self
            .state
            .lock()
            .latest
            .as_ref()
            .map(|latest| latest.blockhash.clone());
        let interval = self.config.slot_duration / 2;

        for attempt in 1..=self.config.poll_attempts {
            let fetched = self
                .gateway
                .get_latest_blockhash(Some(Commitment::Finalized))
                .await?
                .value;

            if previous.as_ref() != Some(&fetched.blockhash) {
                self.adopt(fetched.clone());
                debug!(
                    blockhash = %fetched.blockhash,
                    attempts = attempt,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Obtained new blockhash"
                );
                return Ok(fetched);
            }

            trace!(attempt = attempt, "Blockhash unchanged, polling again");
            if attempt < self.config.poll_attempts {
                tokio::time::sleep(interval).await;
            }
        }

        Err(ClientError::BlockhashExhausted {
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    fn adopt(&self, fetched: BlockhashWithExpiry) {
        let mut state = self.state.lock();
        info!(
            blockhash = %fetched.blockhash,
            last_valid_block_height = fetched.last_valid_block_height,
            "Refreshed cached blockhash"
        );
        state.latest = Some(fetched);
        state.fetched_at = Some(Instant::now());
        state.sent.clear();
        state.simulated.clear();
        state.epoch += 1;
        ClientMetrics::inc(&self.metrics.blockhash_refreshes);
    }

    fn record(&self, blockhash: &Blockhash, signed: &SignedTransaction, purpose: SigningPurpose) -> Recorded {
        let mut state = self.state.lock();
        if state.latest.as_ref().map(|latest| &latest.blockhash) != Some(blockhash) {
            return Recorded::Stale;
        }
        let set = match purpose {
            SigningPurpose::Send => &mut state.sent,
            SigningPurpose::Simulate => &mut state.simulated,
        };
        let fingerprint = signed.signature.as_str();
        if set.contains(fingerprint) {
            Recorded::Duplicate
        } else if set.len() >= self.config.max_tracked_signatures {
            Recorded::Full
        } else {
            set.insert(fingerprint.to_string());
            Recorded::Fresh
        }
    }

    /// Build and sign a transaction whose signature has not been used with
    /// the current blockhash for `purpose`.
    ///
    /// Returns the signed transaction and the blockhash it was signed with.
    pub async fn sign_unique(
        &self,
        builder: &dyn TransactionBuilder,
        signers: &[Arc<dyn TransactionSigner>],
        purpose: SigningPurpose,
    ) -> ClientResult<(SignedTransaction, BlockhashWithExpiry)> {
        let mut force_refresh = false;
        loop {
            let blockhash = self.get_for_sending(force_refresh).await?;
            let signed = builder.build(&blockhash, signers).await?;

            match self.record(&blockhash.blockhash, &signed, purpose) {
                Recorded::Fresh => return Ok((signed, blockhash)),
                Recorded::Duplicate => {
                    ClientMetrics::inc(&self.metrics.duplicate_signatures);
                    debug!(
                        signature = %signed.signature,
                        purpose = ?purpose,
                        "Signature already used with this blockhash, refreshing"
                    );
                    force_refresh = true;
                }
                Recorded::Full => {
                    debug!(
                        limit = self.config.max_tracked_signatures,
                        purpose = ?purpose,
                        "Signature set full, refreshing blockhash"
                    );
                    force_refresh = true;
                }
                Recorded::Stale => {
                    trace!("Blockhash changed while signing, signing again");
                    force_refresh = false;
                }
            }
        }
    }
}
