//! Notification channel session management.
//!
//! Owns the single transport session: opens it on demand, reconnects after
//! implicit disconnects with capped exponential backoff, sends keepalive pings
//! and correlates request ids with responses. Every disconnect bumps the
//! generation counter exactly once; requests are bound to the generation they
//! were issued in and never leak onto a later session.

use crate::domain::config::PubsubConfig;
use crate::domain::jsonrpc::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use crate::domain::types::ServerSubscriptionId;
use crate::error::{ClientError, ClientResult};
use crate::metrics::ClientMetrics;
use crate::ports::{InboundFrame, OutboundFrame, PubsubChannel, PubsubConnector};
use crate::pubsub::pending::PendingRequests;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Connection state as seen by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// No session and none wanted
    Idle,
    /// Connecting or waiting to reconnect
    Connecting,
    Connected,
}

/// Events delivered to the registry actor.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    Opened {
        generation: u64,
    },
    /// `clean` is true only for closes requested through [`ConnectionLifecycle::close`]
    Closed {
        generation: u64,
        clean: bool,
    },
    Notification {
        method: String,
        subscription: ServerSubscriptionId,
        result: Value,
    },
}

struct Session {
    generation: u64,
    outgoing: mpsc::UnboundedSender<OutboundFrame>,
}

struct Inner {
    connector: Arc<dyn PubsubConnector>,
    config: PubsubConfig,
    events: mpsc::UnboundedSender<LifecycleEvent>,
    generation: AtomicU64,
    status: RwLock<ConnectionStatus>,
    session: RwLock<Option<Session>>,
    pending: PendingRequests,
    request_id: AtomicU64,
    /// Cancels the current run loop
    shutdown: Mutex<Option<CancellationToken>>,
    metrics: Arc<ClientMetrics>,
}

/// Handle to the notification channel session.
#[derive(Clone)]
pub struct ConnectionLifecycle {
    inner: Arc<Inner>,
}

impl ConnectionLifecycle {
    /// Create the lifecycle and the event stream consumed by the registry.
    pub fn new(
        connector: Arc<dyn PubsubConnector>,
        config: PubsubConfig,
        metrics: Arc<ClientMetrics>,
    ) -> (Self, mpsc::UnboundedReceiver<LifecycleEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let inner = Inner {
            connector,
            config,
            events,
            generation: AtomicU64::new(0),
            status: RwLock::new(ConnectionStatus::Idle),
            session: RwLock::new(None),
            pending: PendingRequests::new(),
            request_id: AtomicU64::new(1),
            shutdown: Mutex::new(None),
            metrics,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            events_rx,
        )
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.read()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Start connecting if idle; a no-op otherwise.
    pub fn open(&self) {
        {
            let mut status = self.inner.status.write();
            if *status != ConnectionStatus::Idle {
                return;
            }
            *status = ConnectionStatus::Connecting;
        }

        let token = CancellationToken::new();
        *self.inner.shutdown.lock() = Some(token.clone());
        debug!("Opening notification channel");
        tokio::spawn(self.inner.clone().run(token));
    }

    /// Close the session (or stop reconnecting); reported as a clean close.
    pub fn close(&self) {
        if let Some(token) = self.inner.shutdown.lock().take() {
            debug!("Closing notification channel");
            token.cancel();
        }
    }

    /// Send a request on the session of `generation` and wait for its response.
    ///
    /// Fails with `NotConnected` if that session is gone, so a request can
    /// never land on a newer session than the one its caller observed.
    pub async fn request(
        &self,
        generation: u64,
        method: &str,
        params: Vec<Value>,
    ) -> ClientResult<Value> {
        let outgoing = match &*self.inner.session.read() {
            Some(session) if session.generation == generation => session.outgoing.clone(),
            _ => return Err(ClientError::NotConnected),
        };

        let id = self.inner.request_id.fetch_add(1, Ordering::Relaxed);
        let body = serde_json::to_string(&JsonRpcRequest::new(id, method, &params))
            .map_err(|e| ClientError::decode("request", e))?;
        let rx = self.inner.pending.register(id, method);

        trace!(request_id = id, method = method, "Sending notification channel request");
        if outgoing.send(OutboundFrame::Text(body)).is_err() {
            self.inner.pending.cancel(id);
            return Err(ClientError::ConnectionClosed);
        }

        let timeout = self.inner.config.request_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => {
                self.inner.pending.cancel(id);
                Err(ClientError::Timeout {
                    method: method.to_string(),
                    timeout,
                })
            }
        }
    }
}

impl Inner {
    async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut attempt = 0u32;

        loop {
            let connected = tokio::select! {
                _ = token.cancelled() => break,
                result = self.connector.connect() => result,
            };

            match connected {
                Ok(channel) => {
                    attempt = 0;
                    let clean = self.run_session(channel, &token).await;
                    self.disconnected(clean);
                    if clean {
                        return;
                    }
                }
                Err(e) => {
                    warn!(error = %e, attempt = attempt + 1, "Notification channel connect failed");
                }
            }

            attempt = attempt.saturating_add(1);
            let delay = self.backoff_delay(attempt);
            debug!(delay_ms = delay.as_millis() as u64, "Reconnecting notification channel");
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        // Cancelled before a session was established
        *self.status.write() = ConnectionStatus::Idle;
        let _ = self.events.send(LifecycleEvent::Closed {
            generation: self.generation.load(Ordering::SeqCst),
            clean: true,
        });
    }

    /// Exponential backoff: base, 2x base, 4x base... capped at the max delay.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.config.reconnect_base_delay.saturating_mul(1 << exponent);
        delay.min(self.config.reconnect_max_delay)
    }

    /// Pump one session until it ends; returns true for a requested close.
    async fn run_session(&self, channel: PubsubChannel, token: &CancellationToken) -> bool {
        let PubsubChannel {
            outgoing,
            mut incoming,
        } = channel;

        let generation = self.generation.load(Ordering::SeqCst);
        *self.session.write() = Some(Session {
            generation,
            outgoing: outgoing.clone(),
        });
        *self.status.write() = ConnectionStatus::Connected;
        ClientMetrics::inc(&self.metrics.connections_opened);
        info!(generation = generation, "Notification channel connected");
        let _ = self.events.send(LifecycleEvent::Opened { generation });

        let mut keepalive = tokio::time::interval(self.config.keepalive_interval);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        keepalive.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    let _ = outgoing.send(OutboundFrame::Close);
                    return true;
                }
                _ = keepalive.tick() => {
                    // Best effort
                    let _ = outgoing.send(OutboundFrame::Ping);
                }
                frame = incoming.recv() => match frame {
                    Some(InboundFrame::Text(text)) => self.handle_text(&text),
                    Some(InboundFrame::Error(e)) => {
                        warn!(error = %e, "Notification channel error");
                    }
                    Some(InboundFrame::Closed) | None => return false,
                },
            }
        }
    }

    fn disconnected(&self, clean: bool) {
        *self.session.write() = None;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let failed = self.pending.fail_all(ClientError::ConnectionClosed);
        // Last, so a fresh open() never observes the previous generation
        *self.status.write() = if clean {
            ConnectionStatus::Idle
        } else {
            ConnectionStatus::Connecting
        };

        if clean {
            info!(generation = generation, "Notification channel closed");
        } else {
            ClientMetrics::inc(&self.metrics.connections_lost);
            warn!(
                generation = generation,
                failed_requests = failed,
                "Notification channel lost"
            );
        }
        let _ = self.events.send(LifecycleEvent::Closed { generation, clean });
    }

    fn handle_text(&self, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "Unparseable notification channel message");
                return;
            }
        };

        if let Some(id) = value.get("id").and_then(Value::as_u64) {
            let result = serde_json::from_value::<JsonRpcResponse>(value)
                .map_err(|e| ClientError::decode("response", e))
                .and_then(|response| response.into_result().map_err(ClientError::Rpc));
            self.pending.complete(id, result);
            return;
        }

        match serde_json::from_value::<JsonRpcNotification>(value) {
            Ok(notification) => {
                let _ = self.events.send(LifecycleEvent::Notification {
                    method: notification.method,
                    subscription: ServerSubscriptionId(notification.params.subscription),
                    result: notification.params.result,
                });
            }
            Err(e) => debug!(error = %e, "Ignoring unrecognized message"),
        }
    }
}
