//! Signature decorators and the signer / resolver seams.
//!
//! Every protocol signature is an `ed25519Sha512_single` decorator:
//! `sig_data` is the URL-safe base64 of an 8-byte big-endian Unix
//! timestamp followed by the canonical JSON of the signed payload, and
//! `signature` the URL-safe base64 of the Ed25519 signature over those
//! bytes. Verification recomputes over `sig_data` and checks the claimed
//! `signer` against the verkey the DID table reports.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use parking_lot::RwLock;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::canonical::canonical_value_bytes;
use crate::error::ConsensusError;

pub const SIGNATURE_TYPE: &str =
    "did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/signature/1.0/ed25519Sha512_single";

/// Timestamp skew beyond which a verified envelope is flagged. Skew is
/// never fatal by itself: the per-stage `timeout_sec` already bounds a
/// protocol run, so the enclosing state machine decides.
pub const MAX_SKEW_SEC: u64 = 300;

/// Signing and verification capability, keyed by base58 verkey.
pub trait Crypto: Send + Sync + 'static {
    fn sign(&self, verkey: &str, data: &[u8]) -> Result<Vec<u8>, ConsensusError>;

    fn verify(&self, verkey: &str, data: &[u8], signature: &[u8])
    -> Result<bool, ConsensusError>;
}

/// DID → verkey resolution. The binding is assumed stable for the
/// bounded lifetime of any protocol run.
pub trait DidResolver: Send + Sync + 'static {
    fn verkey_of(&self, did: &str) -> Option<String>;
}

/// In-process Ed25519 keyring. Holds the signing keys for local
/// identities and verifies against any base58 verkey.
#[derive(Default)]
pub struct Keyring {
    keys: RwLock<HashMap<String, SigningKey>>,
}

impl Keyring {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate a fresh keypair and return its base58 verkey.
    pub fn generate(&self) -> String {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verkey = bs58::encode(signing_key.verifying_key().as_bytes()).into_string();
        self.keys.write().insert(verkey.clone(), signing_key);
        verkey
    }

    pub fn insert(&self, signing_key: SigningKey) -> String {
        let verkey = bs58::encode(signing_key.verifying_key().as_bytes()).into_string();
        self.keys.write().insert(verkey.clone(), signing_key);
        verkey
    }
}

fn decode_verkey(verkey: &str) -> Result<VerifyingKey, ConsensusError> {
    let bytes: [u8; 32] = bs58::decode(verkey)
        .into_vec()
        .map_err(|e| ConsensusError::MalformedEnvelope(format!("bad verkey base58: {e}")))?
        .try_into()
        .map_err(|_| ConsensusError::MalformedEnvelope("verkey must be 32 bytes".to_string()))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| ConsensusError::MalformedEnvelope(format!("bad verkey: {e}")))
}

impl Crypto for Keyring {
    fn sign(&self, verkey: &str, data: &[u8]) -> Result<Vec<u8>, ConsensusError> {
        let keys = self.keys.read();
        let signing_key = keys
            .get(verkey)
            .ok_or_else(|| ConsensusError::UnknownSigningKey(verkey.to_string()))?;
        Ok(signing_key.sign(data).to_bytes().to_vec())
    }

    fn verify(
        &self,
        verkey: &str,
        data: &[u8],
        signature: &[u8],
    ) -> Result<bool, ConsensusError> {
        let verifying_key = decode_verkey(verkey)?;
        let signature = Signature::from_slice(signature)
            .map_err(|_| ConsensusError::MalformedEnvelope("signature must be 64 bytes".into()))?;
        Ok(verifying_key.verify(data, &signature).is_ok())
    }
}

/// Fixed DID → verkey table, loaded once per protocol run.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    table: HashMap<String, String>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, did: &str, verkey: &str) {
        self.table.insert(did.to_string(), verkey.to_string());
    }
}

impl FromIterator<(String, String)> for StaticResolver {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            table: iter.into_iter().collect(),
        }
    }
}

impl DidResolver for StaticResolver {
    fn verkey_of(&self, did: &str) -> Option<String> {
        self.table.get(did).cloned()
    }
}

/// Detached signature over a canonical payload, `ed25519Sha512_single`
/// shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureEnvelope {
    #[serde(rename = "@type")]
    pub message_type: String,
    pub signer: String,
    pub sig_data: String,
    pub signature: String,
}

/// Outcome of a successful envelope verification.
#[derive(Debug, Clone)]
pub struct VerifiedPayload {
    pub payload: Value,
    pub timestamp: u64,
    /// Envelope timestamp deviated from local time by more than
    /// [`MAX_SKEW_SEC`].
    pub skewed: bool,
}

fn now_secs() -> Result<u64, ConsensusError> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}

/// Sign `payload` with the key behind `verkey`, producing a decorator
/// envelope.
pub fn sign_payload(
    crypto: &dyn Crypto,
    verkey: &str,
    payload: &Value,
) -> Result<SignatureEnvelope, ConsensusError> {
    let mut sig_data = now_secs()?.to_be_bytes().to_vec();
    sig_data.extend_from_slice(&canonical_value_bytes(payload));
    let signature = crypto.sign(verkey, &sig_data)?;
    Ok(SignatureEnvelope {
        message_type: SIGNATURE_TYPE.to_string(),
        signer: verkey.to_string(),
        sig_data: URL_SAFE.encode(&sig_data),
        signature: URL_SAFE.encode(&signature),
    })
}

/// Verify an envelope against the verkey the DID table reports for the
/// claimed participant. Returns the decoded payload and its timestamp.
pub fn verify_envelope(
    crypto: &dyn Crypto,
    envelope: &SignatureEnvelope,
    expected_verkey: &str,
) -> Result<VerifiedPayload, ConsensusError> {
    if envelope.signer != expected_verkey {
        return Err(ConsensusError::InvalidSignature(envelope.signer.clone()));
    }
    let sig_data = URL_SAFE
        .decode(&envelope.sig_data)
        .map_err(|e| ConsensusError::MalformedEnvelope(format!("bad sig_data base64: {e}")))?;
    if sig_data.len() < 8 {
        return Err(ConsensusError::MalformedEnvelope(
            "sig_data shorter than its timestamp prefix".to_string(),
        ));
    }
    let signature = URL_SAFE
        .decode(&envelope.signature)
        .map_err(|e| ConsensusError::MalformedEnvelope(format!("bad signature base64: {e}")))?;
    if !crypto.verify(&envelope.signer, &sig_data, &signature)? {
        return Err(ConsensusError::InvalidSignature(envelope.signer.clone()));
    }

    // First 8 bytes are a big-endian Unix timestamp; length was checked.
    let timestamp = u64::from_be_bytes(sig_data[..8].try_into().unwrap_or_default());
    let payload: Value = serde_json::from_slice(&sig_data[8..])
        .map_err(|e| ConsensusError::MalformedEnvelope(format!("bad signed payload: {e}")))?;

    let skewed = now_secs()?.abs_diff(timestamp) > MAX_SKEW_SEC;
    if skewed {
        warn!(signer = %envelope.signer, timestamp, "signature timestamp outside skew window");
    }
    Ok(VerifiedPayload {
        payload,
        timestamp,
        skewed,
    })
}
