//! Deduplicating subscription registry.
//!
//! A single actor task owns every [`Subscription`] and is the only place
//! their state changes. Handle add/remove, request completions, lifecycle
//! events and notifications are all messages to that actor; after each one it
//! runs a settle pass that advances every subscription towards what its
//! callbacks want, sending at most one request per subscription at a time.

use crate::domain::config::PubsubConfig;
use crate::domain::subscription::{
    NotificationCallback, Subscription, SubscriptionKey, SubscriptionKind, SubscriptionRequest,
    SubscriptionState,
};
use crate::domain::types::{ClientSubscriptionId, ServerSubscriptionId};
use crate::error::{ClientError, ClientResult};
use crate::metrics::ClientMetrics;
use crate::pubsub::lifecycle::{ConnectionLifecycle, ConnectionStatus, LifecycleEvent};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Value the server sends before the final status when received
/// notifications are enabled.
const RECEIVED_SIGNATURE: &str = "receivedSignature";

/// Notifications held while their subscribe ack is still being processed.
const MAX_EARLY_NOTIFICATIONS: usize = 256;

/// Diagnostic view of one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSnapshot {
    pub key: SubscriptionKey,
    pub kind: SubscriptionKind,
    pub state: SubscriptionState,
    pub callbacks: usize,
}

enum Command {
    Add {
        id: ClientSubscriptionId,
        request: SubscriptionRequest,
        callback: NotificationCallback,
        acked: Option<oneshot::Sender<()>>,
    },
    Remove {
        id: ClientSubscriptionId,
    },
    SubscribeSettled {
        key: SubscriptionKey,
        generation: u64,
        result: ClientResult<Value>,
    },
    UnsubscribeSettled {
        key: SubscriptionKey,
        generation: u64,
        server_id: ServerSubscriptionId,
        result: ClientResult<Value>,
    },
    /// Re-run settle once a retry delay has elapsed
    Settle,
    Snapshot(oneshot::Sender<Vec<SubscriptionSnapshot>>),
    Shutdown,
}

/// Handle to the registry actor.
///
/// Cheap to clone; every clone talks to the same actor.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    commands: mpsc::UnboundedSender<Command>,
    next_id: Arc<AtomicU64>,
}

impl SubscriptionRegistry {
    /// Spawn the actor. Must be called inside a tokio runtime.
    pub fn spawn(
        lifecycle: ConnectionLifecycle,
        events: mpsc::UnboundedReceiver<LifecycleEvent>,
        config: &PubsubConfig,
        metrics: Arc<ClientMetrics>,
    ) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let actor = RegistryActor {
            lifecycle,
            commands: commands.downgrade(),
            subscriptions: HashMap::new(),
            handles: HashMap::new(),
            by_server_id: HashMap::new(),
            auto_disposed: HashSet::new(),
            early_notifications: Vec::new(),
            ack_waiters: HashMap::new(),
            retry_delay: config.retry_delay,
            idle_close_delay: config.idle_close_delay,
            idle_deadline: None,
            metrics,
        };
        tokio::spawn(actor.run(commands_rx, events));

        Self {
            commands,
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Reserve a handle id ahead of [`subscribe_with_id`](Self::subscribe_with_id).
    pub fn allocate_id(&self) -> ClientSubscriptionId {
        ClientSubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register `callback` for `request`; shares the server subscription with
    /// every other handle whose request has the same key.
    pub fn subscribe(
        &self,
        request: SubscriptionRequest,
        callback: NotificationCallback,
    ) -> ClientResult<ClientSubscriptionId> {
        let id = self.allocate_id();
        self.subscribe_with_id(id, request, callback)?;
        Ok(id)
    }

    pub fn subscribe_with_id(
        &self,
        id: ClientSubscriptionId,
        request: SubscriptionRequest,
        callback: NotificationCallback,
    ) -> ClientResult<()> {
        self.send(Command::Add {
            id,
            request,
            callback,
            acked: None,
        })
    }

    /// Like [`subscribe`](Self::subscribe); the returned receiver completes
    /// once the server has acknowledged the shared subscription.
    ///
    /// The receiver errors if the subscription is deleted first.
    pub fn subscribe_acked(
        &self,
        request: SubscriptionRequest,
        callback: NotificationCallback,
    ) -> ClientResult<(ClientSubscriptionId, oneshot::Receiver<()>)> {
        let id = self.allocate_id();
        let (acked, ack) = oneshot::channel();
        self.send(Command::Add {
            id,
            request,
            callback,
            acked: Some(acked),
        })?;
        Ok((id, ack))
    }

    /// Remove one handle. Unknown or already removed handles are ignored.
    pub fn unsubscribe(&self, id: ClientSubscriptionId) -> ClientResult<()> {
        self.send(Command::Remove { id })
    }

    pub async fn snapshot(&self) -> ClientResult<Vec<SubscriptionSnapshot>> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Snapshot(tx))?;
        rx.await.map_err(|_| ClientError::Shutdown)
    }

    /// Stop the actor and close the notification channel.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    fn send(&self, command: Command) -> ClientResult<()> {
        self.commands.send(command).map_err(|_| ClientError::Shutdown)
    }
}

struct RegistryActor {
    lifecycle: ConnectionLifecycle,
    /// Weak so dropping every handle stops the actor
    commands: mpsc::WeakUnboundedSender<Command>,
    subscriptions: HashMap<SubscriptionKey, Subscription>,
    handles: HashMap<ClientSubscriptionId, SubscriptionKey>,
    /// Notification routing; only holds ids of the current session
    by_server_id: HashMap<ServerSubscriptionId, SubscriptionKey>,
    /// Ids the server already dropped on its own
    auto_disposed: HashSet<ServerSubscriptionId>,
    /// A server may notify right after acking, before the ack reaches us
    early_notifications: Vec<(String, ServerSubscriptionId, Value)>,
    /// Callers waiting for a key's subscribe ack
    ack_waiters: HashMap<SubscriptionKey, Vec<oneshot::Sender<()>>>,
    retry_delay: Duration,
    idle_close_delay: Duration,
    idle_deadline: Option<Instant>,
    metrics: Arc<ClientMetrics>,
}

async fn idle_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl RegistryActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<LifecycleEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(event) = events.recv() => self.handle_event(event),
                _ = idle_elapsed(self.idle_deadline) => {
                    self.idle_deadline = None;
                    if self.subscriptions.is_empty() {
                        info!("No active subscriptions, closing idle notification channel");
                        self.lifecycle.close();
                    }
                }
            }
            self.settle();
        }

        debug!("Subscription registry stopped");
        self.lifecycle.close();
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Add {
                id,
                request,
                callback,
                acked,
            } => {
                let key = request.key();
                let subscription = self
                    .subscriptions
                    .entry(key.clone())
                    .or_insert_with(|| Subscription::new(request));
                subscription.callbacks.insert(id, callback);
                debug!(
                    handle = %id,
                    key = %key,
                    callbacks = subscription.callbacks.len(),
                    state = %subscription.state,
                    "Added subscription handle"
                );
                if let Some(acked) = acked {
                    if matches!(subscription.state, SubscriptionState::Subscribed(_)) {
                        let _ = acked.send(());
                    } else {
                        self.ack_waiters.entry(key.clone()).or_default().push(acked);
                    }
                }
                self.handles.insert(id, key);
            }
            Command::Remove { id } => {
                let Some(key) = self.handles.remove(&id) else {
                    trace!(handle = %id, "Remove for unknown handle");
                    return;
                };
                if let Some(subscription) = self.subscriptions.get_mut(&key) {
                    subscription.callbacks.remove(&id);
                    debug!(
                        handle = %id,
                        key = %key,
                        callbacks = subscription.callbacks.len(),
                        "Removed subscription handle"
                    );
                }
            }
            Command::SubscribeSettled {
                key,
                generation,
                result,
            } => self.subscribe_settled(key, generation, result),
            Command::UnsubscribeSettled {
                key,
                generation,
                server_id,
                result,
            } => self.unsubscribe_settled(key, generation, server_id, result),
            Command::Settle => {}
            Command::Snapshot(reply) => {
                let mut snapshot: Vec<SubscriptionSnapshot> = self
                    .subscriptions
                    .values()
                    .map(|subscription| SubscriptionSnapshot {
                        key: subscription.key.clone(),
                        kind: subscription.kind,
                        state: subscription.state,
                        callbacks: subscription.callbacks.len(),
                    })
                    .collect();
                snapshot.sort_by(|a, b| a.key.cmp(&b.key));
                let _ = reply.send(snapshot);
            }
            // Handled by the run loop
            Command::Shutdown => {}
        }
    }

    fn handle_event(&mut self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::Opened { generation } => {
                debug!(generation = generation, "Registry observed connection open");
            }
            LifecycleEvent::Closed { generation, clean } => {
                debug!(
                    generation = generation,
                    clean = clean,
                    "Registry observed connection close"
                );
                self.reset_to_pending();
            }
            LifecycleEvent::Notification {
                method,
                subscription,
                result,
            } => self.dispatch(&method, subscription, &result),
        }
    }

    /// Server ids die with their session: everything goes back to pending.
    fn reset_to_pending(&mut self) {
        self.by_server_id.clear();
        self.auto_disposed.clear();
        self.drop_early_notifications();
        for subscription in self.subscriptions.values_mut() {
            if subscription.state != SubscriptionState::Pending {
                debug!(
                    key = %subscription.key,
                    from = %subscription.state,
                    "Resetting subscription to pending"
                );
                subscription.state = SubscriptionState::Pending;
            }
            subscription.retry_after = None;
        }
    }

    fn dispatch(&mut self, method: &str, server_id: ServerSubscriptionId, result: &Value) {
        let Some(subscription) = self
            .by_server_id
            .get(&server_id)
            .and_then(|key| self.subscriptions.get(key))
        else {
            let awaiting_ack = self
                .subscriptions
                .values()
                .any(|s| s.state == SubscriptionState::Subscribing);
            if awaiting_ack && self.early_notifications.len() < MAX_EARLY_NOTIFICATIONS {
                trace!(server_id = %server_id, method = method, "Holding notification until subscribe ack");
                self.early_notifications
                    .push((method.to_string(), server_id, result.clone()));
            } else {
                ClientMetrics::inc(&self.metrics.notifications_dropped);
                trace!(server_id = %server_id, method = method, "Notification for unknown subscription");
            }
            return;
        };

        if method != subscription.kind.notification_method() {
            ClientMetrics::inc(&self.metrics.notifications_dropped);
            debug!(
                server_id = %server_id,
                method = method,
                expected = subscription.kind.notification_method(),
                "Notification method does not match subscription"
            );
            return;
        }

        if subscription.kind.is_one_shot() && !is_received_notification(result) {
            debug!(server_id = %server_id, "Server auto-disposed subscription");
            self.auto_disposed.insert(server_id);
        }

        for (handle, callback) in &subscription.callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback(result))) {
                Ok(()) => ClientMetrics::inc(&self.metrics.notifications_dispatched),
                Err(_) => {
                    ClientMetrics::inc(&self.metrics.callback_panics);
                    warn!(
                        handle = %handle,
                        server_id = %server_id,
                        method = method,
                        "Notification callback panicked"
                    );
                }
            }
        }
    }

    /// Advance every subscription until nothing changes, then reconcile the
    /// connection with the remaining interest.
    fn settle(&mut self) {
        let now = Instant::now();
        let connected = self.lifecycle.is_connected();
        let generation = self.lifecycle.generation();

        loop {
            let keys: Vec<SubscriptionKey> = self.subscriptions.keys().cloned().collect();
            let mut changed = false;
            for key in keys {
                changed |= self.settle_one(&key, connected, generation, now);
            }
            if !changed {
                break;
            }
        }

        if !self.early_notifications.is_empty()
            && !self
                .subscriptions
                .values()
                .any(|s| s.state == SubscriptionState::Subscribing)
        {
            self.drop_early_notifications();
        }

        if self.subscriptions.values().any(Subscription::is_desired) {
            self.idle_deadline = None;
            if self.lifecycle.status() == ConnectionStatus::Idle {
                self.lifecycle.open();
            }
        } else if self.subscriptions.is_empty()
            && self.idle_deadline.is_none()
            && self.lifecycle.status() != ConnectionStatus::Idle
        {
            self.idle_deadline = Some(now + self.idle_close_delay);
        }
    }

    /// One transition for `key`; returns whether anything changed.
    fn settle_one(
        &mut self,
        key: &SubscriptionKey,
        connected: bool,
        generation: u64,
        now: Instant,
    ) -> bool {
        let Some(subscription) = self.subscriptions.get_mut(key) else {
            return false;
        };
        let desired = subscription.is_desired();
        let can_retry = subscription.can_retry(now);

        match subscription.state {
            SubscriptionState::Pending | SubscriptionState::Unsubscribed(_) if !desired => {
                if let Some(server_id) = subscription.state.server_id() {
                    self.by_server_id.remove(&server_id);
                    self.auto_disposed.remove(&server_id);
                }
                self.subscriptions.remove(key);
                self.ack_waiters.remove(key);
                debug!(key = %key, "Deleted subscription");
                true
            }
            SubscriptionState::Pending | SubscriptionState::Unsubscribed(_) => {
                if !connected || !can_retry {
                    return false;
                }
                let previous = subscription.state.server_id();
                subscription.state = SubscriptionState::Subscribing;
                subscription.retry_after = None;
                let kind = subscription.kind;
                let args = subscription.args.clone();
                if let Some(server_id) = previous {
                    self.by_server_id.remove(&server_id);
                    self.auto_disposed.remove(&server_id);
                }
                self.send_subscribe(key.clone(), kind, args, generation);
                true
            }
            SubscriptionState::Subscribed(server_id) if !desired => {
                if self.auto_disposed.remove(&server_id) {
                    debug!(key = %key, server_id = %server_id, "Skipping unsubscribe for auto-disposed subscription");
                    subscription.state = SubscriptionState::Unsubscribed(server_id);
                    self.by_server_id.remove(&server_id);
                    return true;
                }
                if !connected || !can_retry {
                    return false;
                }
                subscription.state = SubscriptionState::Unsubscribing(server_id);
                subscription.retry_after = None;
                let kind = subscription.kind;
                self.send_unsubscribe(key.clone(), kind, server_id, generation);
                true
            }
            _ => false,
        }
    }

    fn send_subscribe(
        &self,
        key: SubscriptionKey,
        kind: SubscriptionKind,
        args: Vec<Value>,
        generation: u64,
    ) {
        let Some(commands) = self.commands.upgrade() else {
            return;
        };
        ClientMetrics::inc(&self.metrics.subscribe_requests);
        debug!(method = kind.subscribe_method(), key = %key, generation = generation, "Subscribing");

        let lifecycle = self.lifecycle.clone();
        tokio::spawn(async move {
            let result = lifecycle
                .request(generation, kind.subscribe_method(), args)
                .await;
            let _ = commands.send(Command::SubscribeSettled {
                key,
                generation,
                result,
            });
        });
    }

    fn send_unsubscribe(
        &self,
        key: SubscriptionKey,
        kind: SubscriptionKind,
        server_id: ServerSubscriptionId,
        generation: u64,
    ) {
        let Some(commands) = self.commands.upgrade() else {
            return;
        };
        ClientMetrics::inc(&self.metrics.unsubscribe_requests);
        debug!(method = kind.unsubscribe_method(), server_id = %server_id, generation = generation, "Unsubscribing");

        let lifecycle = self.lifecycle.clone();
        tokio::spawn(async move {
            let result = lifecycle
                .request(
                    generation,
                    kind.unsubscribe_method(),
                    vec![Value::from(server_id.0)],
                )
                .await;
            let _ = commands.send(Command::UnsubscribeSettled {
                key,
                generation,
                server_id,
                result,
            });
        });
    }

    fn subscribe_settled(
        &mut self,
        key: SubscriptionKey,
        generation: u64,
        result: ClientResult<Value>,
    ) {
        if generation != self.lifecycle.generation() {
            debug!(key = %key, generation = generation, "Discarding subscribe result from previous connection");
            return;
        }
        let Some(subscription) = self.subscriptions.get_mut(&key) else {
            return;
        };
        if subscription.state != SubscriptionState::Subscribing {
            return;
        }

        let server_id = result.and_then(|value| {
            serde_json::from_value::<ServerSubscriptionId>(value)
                .map_err(|e| ClientError::decode("subscription id", e))
        });
        match server_id {
            Ok(server_id) => {
                debug!(key = %key, server_id = %server_id, "Subscribed");
                subscription.state = SubscriptionState::Subscribed(server_id);
                for acked in self.ack_waiters.remove(&key).unwrap_or_default() {
                    let _ = acked.send(());
                }
                self.by_server_id.insert(server_id, key);
                self.replay_early_notifications(server_id);
            }
            Err(e) => {
                warn!(
                    method = subscription.kind.subscribe_method(),
                    error = %ClientError::Subscription(e.to_string()),
                    "Subscribe failed, will retry"
                );
                subscription.state = SubscriptionState::Pending;
                subscription.retry_after = Some(Instant::now() + self.retry_delay);
                self.schedule_settle(self.retry_delay);
            }
        }
    }

    fn unsubscribe_settled(
        &mut self,
        key: SubscriptionKey,
        generation: u64,
        server_id: ServerSubscriptionId,
        result: ClientResult<Value>,
    ) {
        if generation != self.lifecycle.generation() {
            debug!(key = %key, generation = generation, "Discarding unsubscribe result from previous connection");
            return;
        }
        let Some(subscription) = self.subscriptions.get_mut(&key) else {
            return;
        };
        if subscription.state != SubscriptionState::Unsubscribing(server_id) {
            return;
        }

        match result {
            Ok(_) => {
                debug!(key = %key, server_id = %server_id, "Unsubscribed");
                subscription.state = SubscriptionState::Unsubscribed(server_id);
                self.by_server_id.remove(&server_id);
            }
            // A one-shot id the server already dropped: nothing left to tear down
            Err(ClientError::Rpc(e)) if subscription.kind.is_one_shot() => {
                debug!(server_id = %server_id, error = %e, "Unsubscribe rejected for one-shot subscription");
                subscription.state = SubscriptionState::Unsubscribed(server_id);
                self.by_server_id.remove(&server_id);
            }
            Err(e) => {
                warn!(
                    method = subscription.kind.unsubscribe_method(),
                    server_id = %server_id,
                    error = %ClientError::Subscription(e.to_string()),
                    "Unsubscribe failed, will retry"
                );
                subscription.state = SubscriptionState::Subscribed(server_id);
                subscription.retry_after = Some(Instant::now() + self.retry_delay);
                self.schedule_settle(self.retry_delay);
            }
        }
    }

    fn replay_early_notifications(&mut self, server_id: ServerSubscriptionId) {
        if self.early_notifications.is_empty() {
            return;
        }
        let (matching, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.early_notifications)
            .into_iter()
            .partition(|(_, id, _)| *id == server_id);
        self.early_notifications = rest;
        for (method, id, result) in matching {
            self.dispatch(&method, id, &result);
        }
    }

    fn drop_early_notifications(&mut self) {
        let dropped = self.early_notifications.len() as u64;
        if dropped > 0 {
            self.metrics
                .notifications_dropped
                .fetch_add(dropped, Ordering::Relaxed);
            self.early_notifications.clear();
        }
    }

    fn schedule_settle(&self, delay: Duration) {
        let Some(commands) = self.commands.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = commands.send(Command::Settle);
        });
    }
}

fn is_received_notification(result: &Value) -> bool {
    result.get("value").and_then(Value::as_str) == Some(RECEIVED_SIGNATURE)
}
