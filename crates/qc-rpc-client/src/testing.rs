//! In-process doubles for the outbound ports.

use crate::domain::types::{BlockhashWithExpiry, Signature, SignedTransaction, SIGNATURE_BYTES};
use crate::error::{ClientError, RpcError, SignerError, TransportError};
use crate::ports::{
    HttpReply, InboundFrame, OutboundFrame, PubsubChannel, PubsubConnector, RpcTransport,
    TransactionBuilder, TransactionSigner,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use sha2::{Digest, Sha512};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Poll `condition` every 10ms (virtual time under `start_paused`).
pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..2_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 20s");
}

type RpcHandler = Box<dyn FnMut(&str, &Value) -> Result<Value, RpcError> + Send>;

/// Scripted request/response transport.
///
/// Queued replies are returned verbatim first; after that every request (or
/// batch entry) is answered by the handler.
pub struct MockRpcTransport {
    handler: Mutex<RpcHandler>,
    replies: Mutex<VecDeque<HttpReply>>,
    calls: Mutex<Vec<(String, Value)>>,
    posts: AtomicUsize,
    reverse_batches: AtomicBool,
}

impl MockRpcTransport {
    pub fn new(
        handler: impl FnMut(&str, &Value) -> Result<Value, RpcError> + Send + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            handler: Mutex::new(Box::new(handler)),
            replies: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            posts: AtomicUsize::new(0),
            reverse_batches: AtomicBool::new(false),
        })
    }

    pub fn push_reply(&self, reply: HttpReply) {
        self.replies.lock().push_back(reply);
    }

    /// Answer batches in reverse order.
    pub fn reverse_batches(&self) {
        self.reverse_batches.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().clone()
    }

    pub fn calls_to(&self, method: &str) -> usize {
        self.calls.lock().iter().filter(|(m, _)| m == method).count()
    }

    pub fn posts(&self) -> usize {
        self.posts.load(Ordering::SeqCst)
    }

    fn answer(&self, request: &Value) -> Value {
        let method = request["method"].as_str().unwrap_or_default().to_string();
        let params = request.get("params").cloned().unwrap_or_else(|| json!([]));
        self.calls.lock().push((method.clone(), params.clone()));
        let outcome = {
            let mut handler = self.handler.lock();
            (&mut **handler)(&method, &params)
        };
        match outcome {
            Ok(result) => json!({ "jsonrpc": "2.0", "id": request["id"], "result": result }),
            Err(error) => json!({ "jsonrpc": "2.0", "id": request["id"], "error": error }),
        }
    }
}

#[async_trait]
impl RpcTransport for MockRpcTransport {
    async fn post(&self, body: String) -> Result<HttpReply, TransportError> {
        self.posts.fetch_add(1, Ordering::SeqCst);
        if let Some(reply) = self.replies.lock().pop_front() {
            return Ok(reply);
        }

        let request: Value =
            serde_json::from_str(&body).map_err(|e| TransportError::Request(e.to_string()))?;
        let response = match request {
            Value::Array(batch) => {
                let mut responses: Vec<Value> = batch.iter().map(|r| self.answer(r)).collect();
                if self.reverse_batches.load(Ordering::SeqCst) {
                    responses.reverse();
                }
                Value::Array(responses)
            }
            single => self.answer(&single),
        };

        Ok(HttpReply {
            status: 200,
            body: response.to_string(),
        })
    }
}

#[derive(Default)]
struct ServerState {
    calls: Mutex<Vec<(String, Value)>>,
    /// Inbound sender of the live connection
    client: Mutex<Option<mpsc::UnboundedSender<InboundFrame>>>,
    failures: Mutex<HashMap<String, usize>>,
    next_server_id: AtomicU64,
    pings: AtomicUsize,
    connections: AtomicUsize,
    refuse: AtomicUsize,
    hold_responses: AtomicBool,
}

/// Pubsub server double.
///
/// Acks `*Subscribe` with increasing ids starting at 1 and `*Unsubscribe`
/// with `true`.
pub struct MockPubsubServer {
    state: Arc<ServerState>,
}

impl MockPubsubServer {
    pub fn new() -> Arc<Self> {
        let state = ServerState::default();
        state.next_server_id.store(1, Ordering::SeqCst);
        Arc::new(Self {
            state: Arc::new(state),
        })
    }

    /// Push a notification on the live connection.
    pub fn notify(&self, method: &str, subscription: u64, result: Value) {
        let message = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": { "subscription": subscription, "result": result }
        });
        if let Some(client) = &*self.state.client.lock() {
            let _ = client.send(InboundFrame::Text(message.to_string()));
        }
    }

    /// Simulate the server dropping the socket.
    pub fn drop_connection(&self) {
        if let Some(client) = self.state.client.lock().take() {
            let _ = client.send(InboundFrame::Closed);
        }
    }

    /// Answer the next `times` calls to `method` with an error.
    pub fn fail_next(&self, method: &str, times: usize) {
        self.state.failures.lock().insert(method.to_string(), times);
    }

    pub fn refuse_connections(&self, times: usize) {
        self.state.refuse.store(times, Ordering::SeqCst);
    }

    /// Leave requests unanswered.
    pub fn hold_responses(&self, hold: bool) {
        self.state.hold_responses.store(hold, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.state.calls.lock().clone()
    }

    pub fn calls_to(&self, method: &str) -> usize {
        self.state
            .calls
            .lock()
            .iter()
            .filter(|(m, _)| m == method)
            .count()
    }

    /// Last id handed out by a subscribe ack.
    pub fn last_server_id(&self) -> u64 {
        self.state.next_server_id.load(Ordering::SeqCst) - 1
    }

    pub fn pings(&self) -> usize {
        self.state.pings.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.state.client.lock().is_some()
    }
}

impl ServerState {
    fn respond(&self, text: &str) -> Option<Value> {
        let request: Value = serde_json::from_str(text).ok()?;
        let method = request["method"].as_str()?.to_string();
        let params = request.get("params").cloned().unwrap_or_else(|| json!([]));
        self.calls.lock().push((method.clone(), params));

        if self.hold_responses.load(Ordering::SeqCst) {
            return None;
        }

        let id = request["id"].clone();
        let fail = {
            let mut failures = self.failures.lock();
            match failures.get_mut(&method) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            }
        };
        if fail {
            return Some(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32602, "message": "Invalid subscription id" }
            }));
        }

        let result = if method.ends_with("Unsubscribe") {
            json!(true)
        } else if method.ends_with("Subscribe") {
            json!(self.next_server_id.fetch_add(1, Ordering::SeqCst))
        } else {
            Value::Null
        };
        Some(json!({ "jsonrpc": "2.0", "id": id, "result": result }))
    }
}

#[async_trait]
impl PubsubConnector for MockPubsubServer {
    async fn connect(&self) -> Result<PubsubChannel, TransportError> {
        let refused = self
            .state
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::WebSocket("connection refused".into()));
        }

        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<OutboundFrame>();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel::<InboundFrame>();
        *self.state.client.lock() = Some(incoming_tx.clone());
        self.state.connections.fetch_add(1, Ordering::SeqCst);

        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(frame) = outgoing_rx.recv().await {
                match frame {
                    OutboundFrame::Text(text) => {
                        if let Some(response) = state.respond(&text) {
                            let _ = incoming_tx.send(InboundFrame::Text(response.to_string()));
                        }
                    }
                    OutboundFrame::Ping => {
                        state.pings.fetch_add(1, Ordering::SeqCst);
                    }
                    OutboundFrame::Close => break,
                }
            }
            let mut client = state.client.lock();
            if client
                .as_ref()
                .map_or(false, |live| live.same_channel(&incoming_tx))
            {
                *client = None;
            }
        });

        Ok(PubsubChannel {
            outgoing: outgoing_tx,
            incoming: incoming_rx,
        })
    }
}

/// Deterministic signer: the signature is a hash of key and message.
pub struct FakeSigner {
    pubkey: String,
}

impl FakeSigner {
    pub fn new(pubkey: &str) -> Arc<Self> {
        Arc::new(Self {
            pubkey: pubkey.to_string(),
        })
    }
}

#[async_trait]
impl TransactionSigner for FakeSigner {
    fn pubkey(&self) -> String {
        self.pubkey.clone()
    }

    async fn sign_message(&self, message: &[u8]) -> Result<Vec<u8>, SignerError> {
        let mut hasher = Sha512::new();
        hasher.update(self.pubkey.as_bytes());
        hasher.update(message);
        Ok(hasher.finalize().to_vec())
    }
}

/// Builds a transaction whose first signature comes from the first signer.
///
/// With `varying` every build includes a fresh nonce, so signatures differ
/// even against the same blockhash.
pub struct FakeTransactionBuilder {
    instruction: String,
    varying: bool,
    builds: AtomicUsize,
}

impl FakeTransactionBuilder {
    pub fn new(instruction: &str) -> Arc<Self> {
        Arc::new(Self {
            instruction: instruction.to_string(),
            varying: false,
            builds: AtomicUsize::new(0),
        })
    }

    pub fn varying(instruction: &str) -> Arc<Self> {
        Arc::new(Self {
            instruction: instruction.to_string(),
            varying: true,
            builds: AtomicUsize::new(0),
        })
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransactionBuilder for FakeTransactionBuilder {
    async fn build(
        &self,
        blockhash: &BlockhashWithExpiry,
        signers: &[Arc<dyn TransactionSigner>],
    ) -> Result<SignedTransaction, ClientError> {
        let build = self.builds.fetch_add(1, Ordering::SeqCst);
        let mut message = format!("{}:{}", blockhash.blockhash, self.instruction);
        if self.varying {
            message.push_str(&format!(":{build}"));
        }

        let signer = signers.first().ok_or_else(|| SignerError {
            pubkey: String::new(),
            reason: "no signers".into(),
        })?;
        let raw = signer.sign_message(message.as_bytes()).await?;
        let mut bytes = [0u8; SIGNATURE_BYTES];
        bytes.copy_from_slice(&raw[..SIGNATURE_BYTES]);

        Ok(SignedTransaction {
            signature: Signature::from_bytes(&bytes),
            payload: bs58::encode(message.as_bytes()).into_string(),
        })
    }
}

/// Answer for `getLatestBlockhash`.
pub fn blockhash_reply(blockhash: &str, last_valid_block_height: u64) -> Value {
    json!({
        "context": { "slot": 1 },
        "value": { "blockhash": blockhash, "lastValidBlockHeight": last_valid_block_height }
    })
}
