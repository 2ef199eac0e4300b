//! End-to-end flows through the public `LedgerClient` surface.

use async_trait::async_trait;
use parking_lot::Mutex;
use qc_rpc_client::{
    BlockhashWithExpiry, ClientConfig, ClientError, Commitment, HttpReply, InboundFrame,
    LedgerClient, OutboundFrame, PubsubChannel, PubsubConnector, RpcTransport, SendOptions,
    Signature, SignedTransaction, SignerError, SubscriptionKind, TransactionBuilder,
    TransactionSigner, TransportError,
};
use serde_json::{json, Value};
use sha2::{Digest, Sha512};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..2_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met");
}

// ---------------------------------------------------------------------------
// Request/response node
// ---------------------------------------------------------------------------

struct Node {
    calls: Mutex<Vec<(String, Value)>>,
    blockhashes: AtomicU64,
    block_height: AtomicU64,
    last_valid_block_height: u64,
}

impl Node {
    fn new(block_height: u64, last_valid_block_height: u64) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            blockhashes: AtomicU64::new(0),
            block_height: AtomicU64::new(block_height),
            last_valid_block_height,
        })
    }

    fn count(&self, method: &str) -> usize {
        self.calls.lock().iter().filter(|(m, _)| m == method).count()
    }

    fn result_for(&self, method: &str, params: &Value) -> Value {
        match method {
            "getLatestBlockhash" => json!({
                "context": { "slot": 1 },
                "value": {
                    "blockhash": format!("hash-{}", self.blockhashes.fetch_add(1, Ordering::SeqCst)),
                    "lastValidBlockHeight": self.last_valid_block_height
                }
            }),
            // Echo the signature embedded by the builder
            "sendTransaction" => {
                let payload = params[0].as_str().unwrap_or_default();
                let decoded = bs58::decode(payload).into_vec().unwrap_or_default();
                json!(Signature::from_bytes(&signature_of(&decoded)).to_string())
            }
            "getSignatureStatuses" => json!({ "context": { "slot": 1 }, "value": [null] }),
            "getBlockHeight" => json!(self.block_height.fetch_add(1, Ordering::SeqCst)),
            _ => Value::Null,
        }
    }
}

#[async_trait]
impl RpcTransport for Node {
    async fn post(&self, body: String) -> Result<HttpReply, TransportError> {
        let request: Value =
            serde_json::from_str(&body).map_err(|e| TransportError::Request(e.to_string()))?;
        let method = request["method"].as_str().unwrap_or_default().to_string();
        let params = request["params"].clone();
        self.calls.lock().push((method.clone(), params.clone()));

        let result = self.result_for(&method, &params);
        Ok(HttpReply {
            status: 200,
            body: json!({ "jsonrpc": "2.0", "id": request["id"], "result": result }).to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Notification server
// ---------------------------------------------------------------------------

#[derive(Default)]
struct PubsubState {
    calls: Mutex<Vec<String>>,
    next_id: AtomicU64,
    connections: AtomicUsize,
    client: Mutex<Option<mpsc::UnboundedSender<InboundFrame>>>,
    /// Confirm every signature right after subscribing
    confirm_signatures: bool,
}

struct Pubsub {
    state: Arc<PubsubState>,
}

impl Pubsub {
    fn new(confirm_signatures: bool) -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(PubsubState {
                confirm_signatures,
                ..PubsubState::default()
            }),
        })
    }

    fn count(&self, method: &str) -> usize {
        self.state.calls.lock().iter().filter(|m| *m == method).count()
    }

    fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    fn notify(&self, method: &str, subscription: u64, result: Value) {
        if let Some(client) = &*self.state.client.lock() {
            let message = json!({
                "jsonrpc": "2.0",
                "method": method,
                "params": { "subscription": subscription, "result": result }
            });
            let _ = client.send(InboundFrame::Text(message.to_string()));
        }
    }

    fn drop_connection(&self) {
        if let Some(client) = self.state.client.lock().take() {
            let _ = client.send(InboundFrame::Closed);
        }
    }
}

#[async_trait]
impl PubsubConnector for Pubsub {
    async fn connect(&self) -> Result<PubsubChannel, TransportError> {
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming) = mpsc::unbounded_channel();
        *self.state.client.lock() = Some(incoming_tx.clone());
        self.state.connections.fetch_add(1, Ordering::SeqCst);

        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(frame) = outgoing_rx.recv().await {
                let text = match frame {
                    OutboundFrame::Text(text) => text,
                    OutboundFrame::Ping => continue,
                    OutboundFrame::Close => break,
                };
                let request: Value = match serde_json::from_str(&text) {
                    Ok(request) => request,
                    Err(_) => continue,
                };
                let method = request["method"].as_str().unwrap_or_default().to_string();
                state.calls.lock().push(method.clone());

                let result = if method.ends_with("Unsubscribe") {
                    json!(true)
                } else {
                    json!(state.next_id.fetch_add(1, Ordering::SeqCst) + 1)
                };
                let ack = json!({ "jsonrpc": "2.0", "id": request["id"], "result": result });
                let _ = incoming_tx.send(InboundFrame::Text(ack.to_string()));

                if state.confirm_signatures && method == "signatureSubscribe" {
                    let notification = json!({
                        "jsonrpc": "2.0",
                        "method": "signatureNotification",
                        "params": {
                            "subscription": result,
                            "result": { "context": { "slot": 2 }, "value": { "err": null } }
                        }
                    });
                    let _ = incoming_tx.send(InboundFrame::Text(notification.to_string()));
                }
            }
        });

        Ok(PubsubChannel { outgoing, incoming })
    }
}

// ---------------------------------------------------------------------------
// Signing
// ---------------------------------------------------------------------------

fn signature_of(message: &[u8]) -> [u8; 64] {
    let digest = Sha512::digest(message);
    let mut bytes = [0u8; 64];
    bytes.copy_from_slice(&digest);
    bytes
}

struct Keypair(String);

#[async_trait]
impl TransactionSigner for Keypair {
    fn pubkey(&self) -> String {
        self.0.clone()
    }

    async fn sign_message(&self, message: &[u8]) -> Result<Vec<u8>, SignerError> {
        Ok(signature_of(message).to_vec())
    }
}

/// Transfer whose wire form is just its signed message.
struct Transfer {
    lamports: u64,
}

#[async_trait]
impl TransactionBuilder for Transfer {
    async fn build(
        &self,
        blockhash: &BlockhashWithExpiry,
        signers: &[Arc<dyn TransactionSigner>],
    ) -> Result<SignedTransaction, ClientError> {
        let payer = signers.first().ok_or_else(|| SignerError {
            pubkey: String::new(),
            reason: "missing payer".into(),
        })?;
        let message = format!("{}:{}:{}", payer.pubkey(), blockhash.blockhash, self.lamports);
        let raw = payer.sign_message(message.as_bytes()).await?;
        let mut bytes = [0u8; 64];
        bytes.copy_from_slice(&raw);
        Ok(SignedTransaction {
            signature: Signature::from_bytes(&bytes),
            payload: bs58::encode(message.as_bytes()).into_string(),
        })
    }
}

fn payer() -> Vec<Arc<dyn TransactionSigner>> {
    let keypair: Arc<dyn TransactionSigner> = Arc::new(Keypair("payer".into()));
    vec![keypair]
}

fn client(node: Arc<Node>, pubsub: Arc<Pubsub>) -> LedgerClient {
    let config = ClientConfig::new("http://127.0.0.1:8899").with_commitment(Commitment::Confirmed);
    LedgerClient::with_transports(config, node, pubsub).unwrap()
}

// ---------------------------------------------------------------------------
// Flows
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_send_and_confirm_round_trip() {
    let node = Node::new(10, 1_000);
    let pubsub = Pubsub::new(true);
    let client = client(node.clone(), pubsub.clone());

    let signature = client
        .send_and_confirm_transaction(&Transfer { lamports: 5 }, &payer(), &SendOptions::default(), None)
        .await
        .unwrap();

    assert_eq!(node.count("sendTransaction"), 1);
    assert_eq!(pubsub.count("signatureSubscribe"), 1);
    assert_eq!(client.metrics().confirmations_succeeded, 1);

    // Auto-disposed by the server, so only a local removal happens
    let mut emptied = false;
    for _ in 0..200 {
        if client.subscriptions().await.unwrap().is_empty() {
            emptied = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(emptied);
    assert_eq!(pubsub.count("signatureUnsubscribe"), 0);
    assert!(!signature.as_str().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_retried_transfer_gets_new_blockhash() {
    let node = Node::new(10, 1_000);
    let client = client(node.clone(), Pubsub::new(false));
    let transfer = Transfer { lamports: 5 };

    let first = client
        .send_transaction(&transfer, &payer(), &SendOptions::default())
        .await
        .unwrap();
    let second = client
        .send_transaction(&transfer, &payer(), &SendOptions::default())
        .await
        .unwrap();

    assert_ne!(first, second);
    assert_eq!(node.count("getLatestBlockhash"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_expired_blockhash_surfaces_error() {
    let node = Node::new(998, 1_000);
    let pubsub = Pubsub::new(false);
    let client = client(node.clone(), pubsub.clone());

    let err = client
        .send_and_confirm_transaction(&Transfer { lamports: 1 }, &payer(), &SendOptions::default(), None)
        .await
        .unwrap_err();

    assert!(matches!(err, ClientError::ConfirmationExpired { .. }));
    eventually(|| pubsub.count("signatureUnsubscribe") == 1).await;
    assert_eq!(pubsub.count("signatureSubscribe"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_listeners_survive_reconnect() {
    let pubsub = Pubsub::new(false);
    let client = client(Node::new(0, 0), pubsub.clone());
    let seen = Arc::new(AtomicUsize::new(0));

    for _ in 0..2 {
        let seen = seen.clone();
        client
            .on_account_change(
                "vault",
                move |_| {
                    seen.fetch_add(1, Ordering::SeqCst);
                },
                None,
            )
            .unwrap();
    }
    eventually(|| pubsub.count("accountSubscribe") == 1).await;

    pubsub.drop_connection();
    eventually(|| pubsub.count("accountSubscribe") == 2).await;
    assert_eq!(pubsub.connections(), 2);

    let snapshot = client.subscriptions().await.unwrap();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].kind, SubscriptionKind::Account);
    assert_eq!(snapshot[0].callbacks, 2);

    tokio::time::sleep(Duration::from_millis(100)).await;
    pubsub.notify(
        "accountNotification",
        2,
        json!({ "context": { "slot": 3 }, "value": { "lamports": 1 } }),
    );
    eventually(|| seen.load(Ordering::SeqCst) == 2).await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_rejects_new_listeners() {
    let client = client(Node::new(0, 0), Pubsub::new(false));
    client.shutdown();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let err = client.on_root_change(|_| {}).unwrap_err();
    assert!(matches!(err, ClientError::Shutdown));
}
