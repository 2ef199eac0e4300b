//! Outbound ports for the ledger client.

use crate::domain::types::{BlockhashWithExpiry, SignedTransaction};
use crate::error::{ClientError, SignerError, TransportError};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Raw HTTP reply: the status and the undecoded body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

impl HttpReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Request/response transport carrying serialized JSON-RPC bodies.
///
/// Implementations report the HTTP status as-is; retry and envelope
/// decoding live in the gateway.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn post(&self, body: String) -> Result<HttpReply, TransportError>;
}

/// Frame sent to the notification server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    /// Keepalive
    Ping,
    Close,
}

/// Frame received from the notification server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Text(String),
    /// Transport error; the connection may still be usable
    Error(String),
    /// Server closed the connection
    Closed,
}

/// One live duplex connection.
///
/// The connection is torn down when `outgoing` is dropped; the adapter ends
/// `incoming` once the socket is gone.
pub struct PubsubChannel {
    pub outgoing: mpsc::UnboundedSender<OutboundFrame>,
    pub incoming: mpsc::UnboundedReceiver<InboundFrame>,
}

/// Opens notification connections.
#[async_trait]
pub trait PubsubConnector: Send + Sync {
    async fn connect(&self) -> Result<PubsubChannel, TransportError>;
}

/// External signer; key material never enters the client.
#[async_trait]
pub trait TransactionSigner: Send + Sync {
    /// Base58 public key
    fn pubkey(&self) -> String;

    async fn sign_message(&self, message: &[u8]) -> Result<Vec<u8>, SignerError>;
}

/// Builds and signs a transaction against a given blockhash.
///
/// Encapsulates the transaction codec, which is outside this crate.
#[async_trait]
pub trait TransactionBuilder: Send + Sync {
    async fn build(
        &self,
        blockhash: &BlockhashWithExpiry,
        signers: &[Arc<dyn TransactionSigner>],
    ) -> Result<SignedTransaction, ClientError>;
}
