//! Typed envelopes for the Simple Consensus protocol.
//!
//! Seven message kinds (six protocol messages plus the problem report)
//! and the closing ack, discriminated on `@type`. Every message carries
//! `~thread.thid`; the actor mints the thid and the whole protocol run
//! reuses it. Unknown top-level keys ride along in a flattened map so a
//! participant re-signing a structure preserves extensions it does not
//! understand.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::canonical::canonical_value_bytes;
use crate::crypto::SignatureEnvelope;
use crate::error::{ConsensusError, ProblemCode};
use crate::ledger::{LedgerState, Transaction};

pub const PROTOCOL_URI: &str = "did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/simple-consensus/1.0/";
pub const ACK_TYPE: &str = "did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/notification/1.0/ack";

pub fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

/// `~thread` decorator: correlates all messages of one protocol run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thread {
    pub thid: String,
}

/// The `ledger` object of an initialize exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerDescriptor {
    pub name: String,
    pub root_hash: String,
    pub genesis: Vec<Transaction>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `ledger~hash`: digest of the canonical `ledger` object under a named
/// hash function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashDescriptor {
    pub func: String,
    pub base58: String,
}

impl HashDescriptor {
    pub fn of(ledger: &LedgerDescriptor) -> Result<Self, ConsensusError> {
        let value = serde_json::to_value(ledger)?;
        let digest = Sha256::digest(canonical_value_bytes(&value));
        Ok(Self {
            func: "sha256".to_string(),
            base58: bs58::encode(digest).into_string(),
        })
    }
}

/// One participant's signature over the `ledger~hash`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantSignature {
    pub participant: String,
    pub signature: SignatureEnvelope,
}

/// Replace-or-append semantics: a participant signing twice keeps only
/// its latest signature.
fn upsert_signature(signatures: &mut Vec<ParticipantSignature>, entry: ParticipantSignature) {
    signatures.retain(|s| s.participant != entry.participant);
    signatures.push(entry);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitializeRequest {
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "~thread")]
    pub thread: Thread,
    pub participants: Vec<String>,
    pub timeout_sec: u64,
    pub ledger: LedgerDescriptor,
    #[serde(rename = "ledger~hash")]
    pub ledger_hash: HashDescriptor,
    pub signatures: Vec<ParticipantSignature>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl InitializeRequest {
    pub fn add_signature(&mut self, participant: &str, signature: SignatureEnvelope) {
        upsert_signature(
            &mut self.signatures,
            ParticipantSignature {
                participant: participant.to_string(),
                signature,
            },
        );
    }

    pub fn validate(&self) -> Result<(), ConsensusError> {
        if self.ledger.name.is_empty() {
            return Err(ConsensusError::MalformedMessage(
                "ledger name is empty".to_string(),
            ));
        }
        if self.ledger.genesis.is_empty() {
            return Err(ConsensusError::MalformedMessage(
                "genesis is empty".to_string(),
            ));
        }
        if self.ledger_hash.func != "sha256" {
            return Err(ConsensusError::MalformedMessage(format!(
                "unsupported ledger~hash func '{}'",
                self.ledger_hash.func
            )));
        }
        if self.participants.len() < 2 {
            return Err(ConsensusError::TooFewParticipants);
        }
        Ok(())
    }
}

/// Mirror of the request, carrying the cumulative signature list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitializeResponse {
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "~thread")]
    pub thread: Thread,
    pub participants: Vec<String>,
    pub timeout_sec: u64,
    pub ledger: LedgerDescriptor,
    #[serde(rename = "ledger~hash")]
    pub ledger_hash: HashDescriptor,
    pub signatures: Vec<ParticipantSignature>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl InitializeResponse {
    pub fn from_request(request: &InitializeRequest) -> Self {
        Self {
            id: new_message_id(),
            thread: request.thread.clone(),
            participants: request.participants.clone(),
            timeout_sec: request.timeout_sec,
            ledger: request.ledger.clone(),
            ledger_hash: request.ledger_hash.clone(),
            signatures: request.signatures.clone(),
            extra: request.extra.clone(),
        }
    }

    pub fn add_signature(&mut self, participant: &str, signature: SignatureEnvelope) {
        upsert_signature(
            &mut self.signatures,
            ParticipantSignature {
                participant: participant.to_string(),
                signature,
            },
        );
    }

    pub fn signature_of(&self, participant: &str) -> Option<&ParticipantSignature> {
        self.signatures.iter().find(|s| s.participant == participant)
    }
}

/// Stage 1 of a block commit: the actor's staged batch and resulting
/// state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagePropose {
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "~thread")]
    pub thread: Thread,
    pub participants: Vec<String>,
    pub timeout_sec: u64,
    pub transactions: Vec<Transaction>,
    pub state: LedgerState,
    pub hash: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StagePropose {
    pub fn validate(&self) -> Result<(), ConsensusError> {
        if self.participants.len() < 2 {
            return Err(ConsensusError::TooFewParticipants);
        }
        if self.transactions.is_empty() {
            return Err(ConsensusError::MalformedMessage(
                "empty transaction batch".to_string(),
            ));
        }
        if self.hash.is_empty() {
            return Err(ConsensusError::MalformedMessage(
                "missing state hash".to_string(),
            ));
        }
        Ok(())
    }
}

/// Stage 2: a participant's signature over its own recomputation of the
/// state hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagePreCommit {
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "~thread")]
    pub thread: Thread,
    pub hash: String,
    #[serde(rename = "hash~sig")]
    pub hash_sig: SignatureEnvelope,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Stage 3: the actor's commit order, carrying every pre-commit as a
/// quorum certificate in the making.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageCommit {
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "~thread")]
    pub thread: Thread,
    pub participants: Vec<String>,
    pub pre_commits: BTreeMap<String, SignatureEnvelope>,
    #[serde(rename = "commit~sig")]
    pub commit_sig: Option<SignatureEnvelope>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StageCommit {
    /// The payload the actor's outer signature (and every post-commit
    /// signature) covers. `@id` and the signature itself are excluded so
    /// all parties sign the same bytes.
    pub fn signable_payload(&self) -> Result<Value, ConsensusError> {
        let mut payload = Map::new();
        payload.insert(
            "participants".to_string(),
            serde_json::to_value(&self.participants)?,
        );
        payload.insert(
            "pre_commits".to_string(),
            serde_json::to_value(&self.pre_commits)?,
        );
        payload.insert("~thread".to_string(), serde_json::to_value(&self.thread)?);
        for (key, value) in &self.extra {
            payload.insert(key.clone(), value.clone());
        }
        Ok(Value::Object(payload))
    }

    pub fn validate(&self) -> Result<(), ConsensusError> {
        if self.participants.len() < 2 {
            return Err(ConsensusError::TooFewParticipants);
        }
        if self.pre_commits.is_empty() {
            return Err(ConsensusError::MalformedMessage(
                "commit without pre-commits".to_string(),
            ));
        }
        if self.commit_sig.is_none() {
            return Err(ConsensusError::MalformedMessage(
                "commit without outer signature".to_string(),
            ));
        }
        Ok(())
    }
}

/// Stage 4: commit witnesses. Participants send their own signature;
/// the actor's final multicast aggregates all of them into the quorum
/// certificate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagePostCommit {
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "~thread")]
    pub thread: Thread,
    pub commits: Vec<SignatureEnvelope>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemReport {
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "~thread")]
    pub thread: Thread,
    #[serde(rename = "problem-code")]
    pub problem_code: ProblemCode,
    pub explain: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ProblemReport {
    pub fn new(thid: &str, problem_code: ProblemCode, explain: impl Into<String>) -> Self {
        Self {
            id: new_message_id(),
            thread: Thread {
                thid: thid.to_string(),
            },
            problem_code,
            explain: explain.into(),
            extra: Map::new(),
        }
    }
}

/// acks@v1-style closing acknowledgement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "~thread")]
    pub thread: Thread,
    pub status: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Ack {
    pub fn ok(thid: &str) -> Self {
        Self {
            id: new_message_id(),
            thread: Thread {
                thid: thid.to_string(),
            },
            status: "OK".to_string(),
            extra: Map::new(),
        }
    }
}

/// All message kinds of the protocol, discriminated on `@type`.
///
/// The discriminator is handled explicitly in [`encode`] / [`decode`]
/// rather than by a tagged-enum derive: the structs flatten unknown
/// top-level keys, and `@type` must not leak into those maps (a re-sign
/// would then emit it twice).
///
/// [`encode`]: ConsensusMessage::encode
/// [`decode`]: ConsensusMessage::decode
#[derive(Debug, Clone, PartialEq)]
pub enum ConsensusMessage {
    InitializeRequest(InitializeRequest),
    InitializeResponse(InitializeResponse),
    StagePropose(StagePropose),
    StagePreCommit(StagePreCommit),
    StageCommit(StageCommit),
    StagePostCommit(StagePostCommit),
    ProblemReport(ProblemReport),
    Ack(Ack),
}

impl ConsensusMessage {
    /// Full `@type` URI of this message.
    pub fn message_type(&self) -> String {
        match self {
            ConsensusMessage::Ack(_) => ACK_TYPE.to_string(),
            other => format!("{PROTOCOL_URI}{}", other.type_name()),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            ConsensusMessage::InitializeRequest(m) => &m.id,
            ConsensusMessage::InitializeResponse(m) => &m.id,
            ConsensusMessage::StagePropose(m) => &m.id,
            ConsensusMessage::StagePreCommit(m) => &m.id,
            ConsensusMessage::StageCommit(m) => &m.id,
            ConsensusMessage::StagePostCommit(m) => &m.id,
            ConsensusMessage::ProblemReport(m) => &m.id,
            ConsensusMessage::Ack(m) => &m.id,
        }
    }

    pub fn thid(&self) -> &str {
        match self {
            ConsensusMessage::InitializeRequest(m) => &m.thread.thid,
            ConsensusMessage::InitializeResponse(m) => &m.thread.thid,
            ConsensusMessage::StagePropose(m) => &m.thread.thid,
            ConsensusMessage::StagePreCommit(m) => &m.thread.thid,
            ConsensusMessage::StageCommit(m) => &m.thread.thid,
            ConsensusMessage::StagePostCommit(m) => &m.thread.thid,
            ConsensusMessage::ProblemReport(m) => &m.thread.thid,
            ConsensusMessage::Ack(m) => &m.thread.thid,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ConsensusMessage::InitializeRequest(_) => "initialize-request",
            ConsensusMessage::InitializeResponse(_) => "initialize-response",
            ConsensusMessage::StagePropose(_) => "stage-propose",
            ConsensusMessage::StagePreCommit(_) => "stage-pre-commit",
            ConsensusMessage::StageCommit(_) => "stage-commit",
            ConsensusMessage::StagePostCommit(_) => "stage-post-commit",
            ConsensusMessage::ProblemReport(_) => "problem_report",
            ConsensusMessage::Ack(_) => "ack",
        }
    }

    pub fn to_value(&self) -> Result<Value, ConsensusError> {
        let mut value = match self {
            ConsensusMessage::InitializeRequest(m) => serde_json::to_value(m)?,
            ConsensusMessage::InitializeResponse(m) => serde_json::to_value(m)?,
            ConsensusMessage::StagePropose(m) => serde_json::to_value(m)?,
            ConsensusMessage::StagePreCommit(m) => serde_json::to_value(m)?,
            ConsensusMessage::StageCommit(m) => serde_json::to_value(m)?,
            ConsensusMessage::StagePostCommit(m) => serde_json::to_value(m)?,
            ConsensusMessage::ProblemReport(m) => serde_json::to_value(m)?,
            ConsensusMessage::Ack(m) => serde_json::to_value(m)?,
        };
        if let Value::Object(map) = &mut value {
            map.insert("@type".to_string(), Value::from(self.message_type()));
        }
        Ok(value)
    }

    pub fn from_value(value: Value) -> Result<Self, ConsensusError> {
        let Value::Object(mut map) = value else {
            return Err(ConsensusError::MalformedMessage(
                "message must be a JSON object".to_string(),
            ));
        };
        let Some(Value::String(message_type)) = map.remove("@type") else {
            return Err(ConsensusError::MalformedMessage(
                "missing @type".to_string(),
            ));
        };
        let body = Value::Object(map);
        let decoded = if message_type == ACK_TYPE {
            ConsensusMessage::Ack(serde_json::from_value(body)?)
        } else {
            match message_type.strip_prefix(PROTOCOL_URI) {
                Some("initialize-request") => {
                    ConsensusMessage::InitializeRequest(serde_json::from_value(body)?)
                }
                Some("initialize-response") => {
                    ConsensusMessage::InitializeResponse(serde_json::from_value(body)?)
                }
                Some("stage-propose") => {
                    ConsensusMessage::StagePropose(serde_json::from_value(body)?)
                }
                Some("stage-pre-commit") => {
                    ConsensusMessage::StagePreCommit(serde_json::from_value(body)?)
                }
                Some("stage-commit") => {
                    ConsensusMessage::StageCommit(serde_json::from_value(body)?)
                }
                Some("stage-post-commit") => {
                    ConsensusMessage::StagePostCommit(serde_json::from_value(body)?)
                }
                Some("problem_report") => {
                    ConsensusMessage::ProblemReport(serde_json::from_value(body)?)
                }
                _ => {
                    return Err(ConsensusError::MalformedMessage(format!(
                        "unknown @type '{message_type}'"
                    )));
                }
            }
        };
        Ok(decoded)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ConsensusError> {
        Ok(serde_json::to_vec(&self.to_value()?)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ConsensusError> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| ConsensusError::MalformedMessage(format!("undecodable envelope: {e}")))?;
        Self::from_value(value)
    }
}
