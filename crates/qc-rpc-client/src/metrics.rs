//! Client-side counters.
//!
//! Plain atomics; callers export them however they like via `snapshot()`.

use std::sync::atomic::{AtomicU64, Ordering};

/// Ledger client metrics
#[derive(Debug, Default)]
pub struct ClientMetrics {
    // Request/response channel
    pub rpc_requests: AtomicU64,
    pub rpc_errors: AtomicU64,
    pub rate_limit_retries: AtomicU64,

    // Notification channel
    pub connections_opened: AtomicU64,
    pub connections_lost: AtomicU64,
    pub subscribe_requests: AtomicU64,
    pub unsubscribe_requests: AtomicU64,
    pub notifications_dispatched: AtomicU64,
    pub notifications_dropped: AtomicU64,
    pub callback_panics: AtomicU64,

    // Blockhash cache
    pub blockhash_refreshes: AtomicU64,
    pub duplicate_signatures: AtomicU64,

    // Confirmation
    pub confirmations_succeeded: AtomicU64,
    pub confirmations_expired: AtomicU64,
    pub confirmations_timed_out: AtomicU64,
}

/// Point-in-time copy of [`ClientMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub rpc_requests: u64,
    pub rpc_errors: u64,
    pub rate_limit_retries: u64,
    pub connections_opened: u64,
    pub connections_lost: u64,
    pub subscribe_requests: u64,
    pub unsubscribe_requests: u64,
    pub notifications_dispatched: u64,
    pub notifications_dropped: u64,
    pub callback_panics: u64,
    pub blockhash_refreshes: u64,
    pub duplicate_signatures: u64,
    pub confirmations_succeeded: u64,
    pub confirmations_expired: u64,
    pub confirmations_timed_out: u64,
}

impl ClientMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            rpc_requests: load(&self.rpc_requests),
            rpc_errors: load(&self.rpc_errors),
            rate_limit_retries: load(&self.rate_limit_retries),
            connections_opened: load(&self.connections_opened),
            connections_lost: load(&self.connections_lost),
            subscribe_requests: load(&self.subscribe_requests),
            unsubscribe_requests: load(&self.unsubscribe_requests),
            notifications_dispatched: load(&self.notifications_dispatched),
            notifications_dropped: load(&self.notifications_dropped),
            callback_panics: load(&self.callback_panics),
            blockhash_refreshes: load(&self.blockhash_refreshes),
            duplicate_signatures: load(&self.duplicate_signatures),
            confirmations_succeeded: load(&self.confirmations_succeeded),
            confirmations_expired: load(&self.confirmations_expired),
            confirmations_timed_out: load(&self.confirmations_timed_out),
        }
    }
}
