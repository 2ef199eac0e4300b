//! Subscription records owned by the registry.
//!
//! # State machine
//!
//! ```text
//!                 reconnect (any state)
//!        ┌───────────────────────────────────────────────┐
//!        ▼                                               │
//!   ┌─────────┐  send   ┌─────────────┐  ack   ┌────────────┐
//!   │ PENDING │ ──────► │ SUBSCRIBING │ ─────► │ SUBSCRIBED │
//!   └─────────┘         └─────────────┘        └────────────┘
//!        ▲   ▲   failure      │                  │      ▲
//!        │   └────────────────┘    no callbacks  │      │ failure
//!        │                                       ▼      │
//!        │  callbacks   ┌──────────────┐  ack  ┌───────────────┐
//!        └───────────── │ UNSUBSCRIBED │ ◄──── │ UNSUBSCRIBING │
//!          re-added     └──────────────┘       └───────────────┘
//!                              ▲
//!                              └── server auto-dispose (signature)
//! ```
//!
//! Deletion happens only from `PENDING` or `UNSUBSCRIBED` with no callbacks.
//! `SUBSCRIBING` and `UNSUBSCRIBING` double as the per-subscription "request in
//! flight" marker, so a subscription never has two requests outstanding.

use crate::domain::jsonrpc::build_args;
use crate::domain::types::{ClientSubscriptionId, Commitment, LogsFilter, ServerSubscriptionId};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;

/// Type-erased notification callback; receives the raw `params.result`.
pub type NotificationCallback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Kind of server subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
    Account,
    Program,
    Logs,
    Signature,
    Slot,
    SlotsUpdates,
    Root,
}

impl SubscriptionKind {
    pub fn subscribe_method(&self) -> &'static str {
        match self {
            SubscriptionKind::Account => "accountSubscribe",
            SubscriptionKind::Program => "programSubscribe",
            SubscriptionKind::Logs => "logsSubscribe",
            SubscriptionKind::Signature => "signatureSubscribe",
            SubscriptionKind::Slot => "slotSubscribe",
            SubscriptionKind::SlotsUpdates => "slotsUpdatesSubscribe",
            SubscriptionKind::Root => "rootSubscribe",
        }
    }

    pub fn unsubscribe_method(&self) -> &'static str {
        match self {
            SubscriptionKind::Account => "accountUnsubscribe",
            SubscriptionKind::Program => "programUnsubscribe",
            SubscriptionKind::Logs => "logsUnsubscribe",
            SubscriptionKind::Signature => "signatureUnsubscribe",
            SubscriptionKind::Slot => "slotUnsubscribe",
            SubscriptionKind::SlotsUpdates => "slotsUpdatesUnsubscribe",
            SubscriptionKind::Root => "rootUnsubscribe",
        }
    }

    pub fn notification_method(&self) -> &'static str {
        match self {
            SubscriptionKind::Account => "accountNotification",
            SubscriptionKind::Program => "programNotification",
            SubscriptionKind::Logs => "logsNotification",
            SubscriptionKind::Signature => "signatureNotification",
            SubscriptionKind::Slot => "slotNotification",
            SubscriptionKind::SlotsUpdates => "slotsUpdatesNotification",
            SubscriptionKind::Root => "rootNotification",
        }
    }

    /// Server drops these subscriptions itself after the terminal notification.
    pub fn is_one_shot(&self) -> bool {
        matches!(self, SubscriptionKind::Signature)
    }
}

/// Canonical (method, args) serialization used for deduplication.
///
/// Arrays keep their order; object keys are sorted recursively.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey(String);

impl SubscriptionKey {
    pub fn new(method: &str, args: &[Value]) -> Self {
        let canonical = canonicalize(&Value::Array(vec![
            Value::from(method),
            Value::Array(args.to_vec()),
        ]));
        Self(canonical.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut sorted = Map::new();
            for (key, item) in entries {
                sorted.insert(key.clone(), canonicalize(item));
            }
            Value::Object(sorted)
        }
        other => other.clone(),
    }
}

/// A desired server subscription, before it is keyed into the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionRequest {
    pub kind: SubscriptionKind,
    pub args: Vec<Value>,
}

impl SubscriptionRequest {
    pub fn account(address: &str, commitment: Commitment) -> Self {
        Self {
            kind: SubscriptionKind::Account,
            args: build_args(vec![Value::from(address)], Some(commitment), Some("base64"), None),
        }
    }

    pub fn program(program_id: &str, commitment: Commitment, filters: Option<Value>) -> Self {
        let extra = filters.map(|filters| {
            let mut map = Map::new();
            map.insert("filters".into(), filters);
            map
        });
        Self {
            kind: SubscriptionKind::Program,
            args: build_args(
                vec![Value::from(program_id)],
                Some(commitment),
                Some("base64"),
                extra,
            ),
        }
    }

    pub fn logs(filter: &LogsFilter, commitment: Commitment) -> Self {
        Self {
            kind: SubscriptionKind::Logs,
            args: build_args(vec![filter.to_value()], Some(commitment), None, None),
        }
    }

    pub fn signature(signature: &str, commitment: Commitment, received_notification: bool) -> Self {
        let extra = received_notification.then(|| {
            let mut map = Map::new();
            map.insert("enableReceivedNotification".into(), Value::Bool(true));
            map
        });
        Self {
            kind: SubscriptionKind::Signature,
            args: build_args(vec![Value::from(signature)], Some(commitment), None, extra),
        }
    }

    pub fn slot() -> Self {
        Self {
            kind: SubscriptionKind::Slot,
            args: Vec::new(),
        }
    }

    pub fn slots_updates() -> Self {
        Self {
            kind: SubscriptionKind::SlotsUpdates,
            args: Vec::new(),
        }
    }

    pub fn root() -> Self {
        Self {
            kind: SubscriptionKind::Root,
            args: Vec::new(),
        }
    }

    pub fn key(&self) -> SubscriptionKey {
        SubscriptionKey::new(self.kind.subscribe_method(), &self.args)
    }
}

/// Lifecycle state; the server id exists only once the server has acked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Pending,
    Subscribing,
    Subscribed(ServerSubscriptionId),
    Unsubscribing(ServerSubscriptionId),
    Unsubscribed(ServerSubscriptionId),
}

impl SubscriptionState {
    pub fn name(&self) -> &'static str {
        match self {
            SubscriptionState::Pending => "pending",
            SubscriptionState::Subscribing => "subscribing",
            SubscriptionState::Subscribed(_) => "subscribed",
            SubscriptionState::Unsubscribing(_) => "unsubscribing",
            SubscriptionState::Unsubscribed(_) => "unsubscribed",
        }
    }

    pub fn server_id(&self) -> Option<ServerSubscriptionId> {
        match self {
            SubscriptionState::Subscribed(id)
            | SubscriptionState::Unsubscribing(id)
            | SubscriptionState::Unsubscribed(id) => Some(*id),
            SubscriptionState::Pending | SubscriptionState::Subscribing => None,
        }
    }

    #[cfg(test)]
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            SubscriptionState::Subscribing | SubscriptionState::Unsubscribing(_)
        )
    }
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.server_id() {
            Some(id) => write!(f, "{}({})", self.name(), id),
            None => f.write_str(self.name()),
        }
    }
}

/// One server subscription shared by every local callback with the same key.
pub struct Subscription {
    pub key: SubscriptionKey,
    pub kind: SubscriptionKind,
    pub args: Vec<Value>,
    pub callbacks: HashMap<ClientSubscriptionId, NotificationCallback>,
    pub state: SubscriptionState,
    /// Earliest time a failed request may be retried
    pub retry_after: Option<Instant>,
}

impl Subscription {
    pub fn new(request: SubscriptionRequest) -> Self {
        Self {
            key: request.key(),
            kind: request.kind,
            args: request.args,
            callbacks: HashMap::new(),
            state: SubscriptionState::Pending,
            retry_after: None,
        }
    }

    pub fn is_desired(&self) -> bool {
        !self.callbacks.is_empty()
    }

    pub fn can_retry(&self, now: Instant) -> bool {
        self.retry_after.map_or(true, |at| now >= at)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .field("callbacks", &self.callbacks.len())
            .field("state", &self.state)
            .finish()
    }
}
