//! Core value types shared by the gateway, registry and confirmation flow.

use crate::error::ClientError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Length of a transaction signature in bytes.
pub const SIGNATURE_BYTES: usize = 64;

/// Durability guarantee requested for a query or subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Commitment {
    Processed,
    Confirmed,
    Finalized,
}

impl Commitment {
    /// Explicit level if given, else the configured default, else `finalized`.
    pub fn resolve(explicit: Option<Commitment>, default: Option<Commitment>) -> Commitment {
        explicit.or(default).unwrap_or(Commitment::Finalized)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Commitment::Processed => "processed",
            Commitment::Confirmed => "confirmed",
            Commitment::Finalized => "finalized",
        }
    }
}

impl Default for Commitment {
    fn default() -> Self {
        Commitment::Finalized
    }
}

impl fmt::Display for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Base58-encoded transaction signature.
///
/// Only constructed from strings that decode to exactly 64 bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Signature(String);

impl Signature {
    pub fn from_bytes(bytes: &[u8; SIGNATURE_BYTES]) -> Self {
        Self(bs58::encode(bytes).into_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Signature {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let decoded = bs58::decode(s)
            .into_vec()
            .map_err(|e| ClientError::InvalidSignature(format!("{s}: {e}")))?;
        if decoded.len() != SIGNATURE_BYTES {
            return Err(ClientError::InvalidSignature(format!(
                "{s}: decoded to {} bytes, expected {SIGNATURE_BYTES}",
                decoded.len()
            )));
        }
        Ok(Self(s.to_string()))
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Recent blockhash used as a transaction's freshness nonce.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Blockhash(pub String);

impl fmt::Display for Blockhash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `getLatestBlockhash` value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockhashWithExpiry {
    pub blockhash: Blockhash,
    pub last_valid_block_height: u64,
}

/// Slot context attached to `{ context, value }` responses and notifications.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcContext {
    pub slot: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
}

/// `{ context, value }` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse<T> {
    pub context: RpcContext,
    pub value: T,
}

/// Entry of `getSignatureStatuses`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureStatus {
    pub slot: u64,
    pub confirmations: Option<u64>,
    pub err: Option<serde_json::Value>,
    pub confirmation_status: Option<Commitment>,
}

impl SignatureStatus {
    /// Whether the status has reached at least `commitment`.
    ///
    /// A rooted status (`confirmations: null`) counts as finalized when the
    /// node omits `confirmationStatus`.
    pub fn satisfies(&self, commitment: Commitment) -> bool {
        let reached = match self.confirmation_status {
            Some(level) => level,
            None if self.confirmations.is_none() => Commitment::Finalized,
            None => Commitment::Processed,
        };
        reached >= commitment
    }
}

/// Terminal result of a signature: `err` is `None` on success.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignatureResult {
    pub err: Option<serde_json::Value>,
}

/// Decoded `signatureNotification` value.
#[derive(Debug, Clone, PartialEq)]
pub enum SignatureNotification {
    /// Node received the signature (only with `enableReceivedNotification`)
    Received,
    /// Signature reached the subscribed commitment
    Status(SignatureResult),
}

/// `slotNotification` value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotInfo {
    pub slot: u64,
    pub parent: u64,
    pub root: u64,
}

/// `logsNotification` value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogsNotification {
    pub signature: String,
    pub err: Option<serde_json::Value>,
    pub logs: Vec<String>,
}

/// Which transactions a logs subscription covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogsFilter {
    All,
    AllWithVotes,
    Mentions(String),
}

impl LogsFilter {
    pub fn to_value(&self) -> serde_json::Value {
        match self {
            LogsFilter::All => serde_json::json!("all"),
            LogsFilter::AllWithVotes => serde_json::json!("allWithVotes"),
            LogsFilter::Mentions(address) => serde_json::json!({ "mentions": [address] }),
        }
    }
}

/// `simulateTransaction` value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SimulationResult {
    pub err: Option<serde_json::Value>,
    pub logs: Option<Vec<String>>,
    pub accounts: Option<serde_json::Value>,
    pub units_consumed: Option<u64>,
    pub return_data: Option<serde_json::Value>,
}

/// Options for `sendTransaction`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    pub skip_preflight: bool,
    pub preflight_commitment: Option<Commitment>,
    pub max_retries: Option<usize>,
    pub min_context_slot: Option<u64>,
}

/// Transaction signed against a specific blockhash by the external builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    /// First signature; the dedup fingerprint
    pub signature: Signature,
    /// Base64 wire encoding produced by the codec
    pub payload: String,
}

/// How a confirmation attempt decides it has given up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationStrategy {
    /// Bare signature: a flat timeout bounds the wait
    Signature(String),
    /// Signature plus the blockhash it was signed with: expires with the blockhash
    BlockHeight {
        signature: String,
        blockhash: Blockhash,
        last_valid_block_height: u64,
    },
}

impl ConfirmationStrategy {
    pub fn raw_signature(&self) -> &str {
        match self {
            ConfirmationStrategy::Signature(signature) => signature,
            ConfirmationStrategy::BlockHeight { signature, .. } => signature,
        }
    }
}

/// Exactly one per confirmation attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfirmationOutcome {
    Confirmed {
        context: RpcContext,
        result: SignatureResult,
    },
    Expired,
    TimedOut {
        elapsed_ms: u64,
    },
}

/// Local handle returned to each subscriber; many map to one server subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientSubscriptionId(pub u64);

impl fmt::Display for ClientSubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier assigned by the node to an active push subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerSubscriptionId(pub u64);

impl fmt::Display for ServerSubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commitment_resolution() {
        assert_eq!(Commitment::resolve(None, None), Commitment::Finalized);
        assert_eq!(
            Commitment::resolve(None, Some(Commitment::Confirmed)),
            Commitment::Confirmed
        );
        assert_eq!(
            Commitment::resolve(Some(Commitment::Processed), Some(Commitment::Confirmed)),
            Commitment::Processed
        );
    }

    #[test]
    fn test_commitment_ordering() {
        assert!(Commitment::Processed < Commitment::Confirmed);
        assert!(Commitment::Confirmed < Commitment::Finalized);
        assert_eq!(
            serde_json::to_value(Commitment::Confirmed).unwrap(),
            serde_json::json!("confirmed")
        );
    }

    #[test]
    fn test_signature_accepts_64_bytes() {
        let sig = Signature::from_bytes(&[7u8; 64]);
        let parsed: Signature = sig.as_str().parse().unwrap();
        assert_eq!(parsed, sig);
    }

    #[test]
    fn test_signature_rejects_wrong_length() {
        let short = bs58::encode([1u8; 32]).into_string();
        assert!(matches!(
            short.parse::<Signature>(),
            Err(ClientError::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_signature_rejects_bad_alphabet() {
        // '0', 'O', 'I' and 'l' are not in the base58 alphabet
        assert!("0OIl".parse::<Signature>().is_err());
    }

    #[test]
    fn test_signature_status_satisfies() {
        let status = SignatureStatus {
            slot: 10,
            confirmations: Some(3),
            err: None,
            confirmation_status: Some(Commitment::Confirmed),
        };
        assert!(status.satisfies(Commitment::Processed));
        assert!(status.satisfies(Commitment::Confirmed));
        assert!(!status.satisfies(Commitment::Finalized));

        let rooted = SignatureStatus {
            slot: 10,
            confirmations: None,
            err: None,
            confirmation_status: None,
        };
        assert!(rooted.satisfies(Commitment::Finalized));
    }

    #[test]
    fn test_blockhash_with_expiry_parsing() {
        let value: BlockhashWithExpiry = serde_json::from_value(serde_json::json!({
            "blockhash": "EkSnNWid2cvwEVnVx9aBqawnmiCNiDgp3gUdkDPTKN1N",
            "lastValidBlockHeight": 3090
        }))
        .unwrap();
        assert_eq!(value.last_valid_block_height, 3090);
        assert_eq!(
            value.blockhash.to_string(),
            "EkSnNWid2cvwEVnVx9aBqawnmiCNiDgp3gUdkDPTKN1N"
        );
    }

    #[test]
    fn test_logs_filter_values() {
        assert_eq!(LogsFilter::All.to_value(), serde_json::json!("all"));
        assert_eq!(
            LogsFilter::Mentions("abc".into()).to_value(),
            serde_json::json!({ "mentions": ["abc"] })
        );
    }
}
