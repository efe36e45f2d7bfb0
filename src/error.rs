use std::fmt;

use serde::{Deserialize, Serialize};

/// Externally visible problem codes carried by `problem_report` messages.
///
/// The set is closed and stable: peers key their abort handling off these
/// strings, so renaming one is a wire-format break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProblemCode {
    /// A request arrived in a state that forbids it (duplicate ledger name,
    /// unknown participant, bad structure).
    #[serde(rename = "request_not_accepted")]
    RequestNotAccepted,
    /// The request was accepted but local processing failed (hash mismatch,
    /// seqNo gap, invalid genesis).
    #[serde(rename = "request_processing_error")]
    RequestProcessingError,
    /// A response arrived out of protocol or carried an invalid signature.
    #[serde(rename = "response_not_accepted")]
    ResponseNotAccepted,
    /// A response was accepted but induced an inconsistency (a pre-commit
    /// hash disagreeing with the actor's).
    #[serde(rename = "response_processing_error")]
    ResponseProcessingError,
}

impl ProblemCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProblemCode::RequestNotAccepted => "request_not_accepted",
            ProblemCode::RequestProcessingError => "request_processing_error",
            ProblemCode::ResponseNotAccepted => "response_not_accepted",
            ProblemCode::ResponseProcessingError => "response_processing_error",
        }
    }
}

impl fmt::Display for ProblemCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    // Ledger store errors
    #[error("ledger '{0}' already exists")]
    LedgerAlreadyExists(String),
    #[error("ledger '{0}' not found")]
    LedgerNotFound(String),
    #[error("ledger '{0}' is not empty")]
    LedgerNotEmpty(String),
    #[error("seqNo conflict: expected {expected}, got {actual}")]
    SeqNoConflict { expected: u64, actual: u64 },
    #[error("invalid genesis: {0}")]
    InvalidGenesis(String),
    #[error("no transaction with seqNo {0}")]
    NoSuchTransaction(u64),

    // Crypto / signature errors
    #[error("unknown signing key '{0}'")]
    UnknownSigningKey(String),
    #[error("no verkey known for DID '{0}'")]
    UnknownDid(String),
    #[error("invalid signature from '{0}'")]
    InvalidSignature(String),
    #[error("malformed signature envelope: {0}")]
    MalformedEnvelope(String),

    // Message errors
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("participant set must contain at least 2 DIDs")]
    TooFewParticipants,
    #[error("DID '{0}' is not a participant")]
    NotAParticipant(String),

    // Protocol run errors
    #[error("ledger '{0}' is locked by another state machine")]
    LedgerLocked(String),
    #[error("consensus terminated [{code}]: {explain}")]
    Terminated { code: ProblemCode, explain: String },
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to get current time")]
    FailedToGetCurrentTime(#[from] std::time::SystemTimeError),
}
