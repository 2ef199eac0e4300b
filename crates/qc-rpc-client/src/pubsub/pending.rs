//! Requests awaiting a response on the notification channel.
//!
//! Maps JSON-RPC request ids to the task waiting for the reply. A session
//! ending fails every entry at once, so no waiter outlives its connection.

use crate::error::{ClientError, ClientResult};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

/// A pending request waiting for response
struct PendingRequest {
    /// Channel to send response
    sender: oneshot::Sender<ClientResult<Value>>,
    /// When request was created
    created_at: Instant,
    /// Method name (for logging)
    method: String,
}

/// Statistics for the pending request table
#[derive(Debug, Default)]
pub struct PendingStats {
    pub total_registered: AtomicU64,
    pub total_completed: AtomicU64,
    /// Removed by the waiter (timeout) or failed by a disconnect
    pub total_cancelled: AtomicU64,
}

/// Request id to waiter table.
#[derive(Default)]
pub struct PendingRequests {
    pending: DashMap<u64, PendingRequest>,
    stats: PendingStats,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` and get a receiver for its response.
    pub fn register(&self, id: u64, method: &str) -> oneshot::Receiver<ClientResult<Value>> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            id,
            PendingRequest {
                sender: tx,
                created_at: Instant::now(),
                method: method.to_string(),
            },
        );
        self.stats.total_registered.fetch_add(1, Ordering::Relaxed);
        rx
    }

    /// Deliver a response.
    ///
    /// Returns false if the id is unknown (already timed out or failed).
    pub fn complete(&self, id: u64, result: ClientResult<Value>) -> bool {
        let Some((_, pending)) = self.pending.remove(&id) else {
            debug!(request_id = id, "Response for unknown request id");
            return false;
        };
        debug!(
            request_id = id,
            method = pending.method,
            response_time_ms = pending.created_at.elapsed().as_millis() as u64,
            "Completed pending request"
        );
        self.stats.total_completed.fetch_add(1, Ordering::Relaxed);
        pending.sender.send(result).is_ok()
    }

    /// Drop a request whose waiter gave up.
    pub fn cancel(&self, id: u64) -> bool {
        if self.pending.remove(&id).is_some() {
            self.stats.total_cancelled.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Fail every pending request with `error`; returns how many were failed.
    pub fn fail_all(&self, error: ClientError) -> usize {
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                let _ = pending.sender.send(Err(error.clone()));
                failed += 1;
            }
        }
        self.stats
            .total_cancelled
            .fetch_add(failed as u64, Ordering::Relaxed);
        failed
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    #[cfg(test)]
    pub fn stats(&self) -> &PendingStats {
        &self.stats
    }
}
