//! Microledger: an append-only transaction log with a committed /
//! uncommitted partition.
//!
//! Transactions are opaque JSON objects; the store only interprets the
//! reserved `txnMetadata` sub-object (`seqNo`, optionally `txnTime`).
//! Committed entries are covered by one Merkle root, committed plus
//! staged entries by a second; the MD5 digest of the canonical state
//! snapshot is the cheap equality check exchanged during consensus
//! rounds. Staged entries either all commit atomically or are all
//! discarded.

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::canonical::{canonical_bytes, canonical_value_bytes};
use crate::error::ConsensusError;
use crate::merkle::{MerkleTree, leaf_hash};

pub const METADATA_ATTR: &str = "txnMetadata";
pub const ATTR_SEQ_NO: &str = "seqNo";
pub const ATTR_TIME: &str = "txnTime";

/// An application-supplied transaction. The body is opaque except for the
/// reserved `txnMetadata` sub-object, which the store manages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Transaction(Map<String, Value>);

impl Transaction {
    /// Wrap a JSON object, installing an empty `txnMetadata` if absent.
    pub fn new(mut body: Map<String, Value>) -> Self {
        body.entry(METADATA_ATTR.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        Self(body)
    }

    pub fn from_value(value: Value) -> Result<Self, ConsensusError> {
        match value {
            Value::Object(map) => Ok(Self::new(map)),
            other => Err(ConsensusError::MalformedMessage(format!(
                "transaction must be a JSON object, got {other}"
            ))),
        }
    }

    fn metadata(&self) -> Option<&Map<String, Value>> {
        self.0.get(METADATA_ATTR).and_then(Value::as_object)
    }

    fn metadata_mut(&mut self) -> &mut Map<String, Value> {
        let entry = self
            .0
            .entry(METADATA_ATTR.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        // Just ensured the entry is an object.
        entry.as_object_mut().unwrap()
    }

    pub fn has_metadata(&self) -> bool {
        self.metadata().is_some_and(|m| !m.is_empty())
    }

    pub fn seq_no(&self) -> Option<u64> {
        self.metadata()?.get(ATTR_SEQ_NO)?.as_u64()
    }

    pub(crate) fn set_seq_no(&mut self, seq_no: u64) {
        self.metadata_mut()
            .insert(ATTR_SEQ_NO.to_string(), Value::from(seq_no));
    }

    pub fn txn_time(&self) -> Option<&str> {
        self.metadata()?.get(ATTR_TIME)?.as_str()
    }

    pub fn set_txn_time(&mut self, time: &str) {
        self.metadata_mut()
            .insert(ATTR_TIME.to_string(), Value::from(time));
    }

    pub fn canonical_bytes(&self) -> Vec<u8> {
        canonical_value_bytes(&Value::Object(self.0.clone()))
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

/// Snapshot of a microledger's observable state. The MD5 hex digest of
/// its canonical encoding is the `hash` exchanged in propose and
/// pre-commit messages; collision resistance is not load-bearing there
/// (commit signatures cover the full snapshot indirectly), only cheap
/// equality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerState {
    pub name: String,
    pub seq_no: u64,
    pub size: u64,
    pub uncommitted_size: u64,
    pub root_hash: String,
    pub uncommitted_root_hash: String,
}

impl LedgerState {
    pub fn hash(&self) -> String {
        // canonical_bytes on a plain struct of strings/ints cannot fail
        let bytes = canonical_bytes(self).unwrap_or_default();
        hex::encode(Md5::digest(&bytes))
    }
}

/// Inclusion proof for a single committed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditProof {
    pub root_hash: String,
    pub audit_path: Vec<String>,
    pub ledger_size: u64,
}

/// In-memory model of one microledger. Durability is the storage
/// layer's concern; staged entries never leave memory.
#[derive(Debug, Clone)]
pub struct Microledger {
    name: String,
    committed: Vec<Transaction>,
    staged: Vec<Transaction>,
    tree: MerkleTree,
}

impl Microledger {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            committed: Vec::new(),
            staged: Vec::new(),
            tree: MerkleTree::new(),
        }
    }

    /// Rebuild from an ordered committed list (storage `open` path).
    /// SeqNos must be dense from 1.
    pub fn from_committed(
        name: &str,
        committed: Vec<Transaction>,
    ) -> Result<Self, ConsensusError> {
        let mut ledger = Self::new(name);
        for (pos, txn) in committed.iter().enumerate() {
            let expected = pos as u64 + 1;
            match txn.seq_no() {
                Some(actual) if actual != expected => {
                    return Err(ConsensusError::SeqNoConflict { expected, actual });
                }
                None => {
                    return Err(ConsensusError::SeqNoConflict {
                        expected,
                        actual: 0,
                    });
                }
                Some(_) => {}
            }
            ledger.tree.push(leaf_hash(&txn.canonical_bytes()));
        }
        ledger.committed = committed;
        Ok(ledger)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    pub fn size(&self) -> u64 {
        self.committed.len() as u64
    }

    pub fn uncommitted_size(&self) -> u64 {
        (self.committed.len() + self.staged.len()) as u64
    }

    /// Highest assigned seqNo, staged entries included.
    pub fn seq_no(&self) -> u64 {
        self.uncommitted_size()
    }

    pub fn root_hash(&self) -> String {
        self.tree.root_hex()
    }

    pub fn uncommitted_root_hash(&self) -> String {
        self.uncommitted_tree().root_hex()
    }

    fn uncommitted_tree(&self) -> MerkleTree {
        let mut tree = self.tree.clone();
        for txn in &self.staged {
            tree.push(leaf_hash(&txn.canonical_bytes()));
        }
        tree
    }

    pub fn state(&self) -> LedgerState {
        LedgerState {
            name: self.name.clone(),
            seq_no: self.seq_no(),
            size: self.size(),
            uncommitted_size: self.uncommitted_size(),
            root_hash: self.root_hash(),
            uncommitted_root_hash: self.uncommitted_root_hash(),
        }
    }

    /// Install the genesis block. This is the only path that places a
    /// non-empty initial committed set and is refused on a non-empty
    /// ledger. Returns the stamped transactions.
    pub fn reset(&mut self, genesis: Vec<Transaction>) -> Result<Vec<Transaction>, ConsensusError> {
        if self.size() > 0 {
            return Err(ConsensusError::LedgerNotEmpty(self.name.clone()));
        }
        if genesis.is_empty() {
            return Err(ConsensusError::InvalidGenesis("empty genesis".to_string()));
        }
        let mut stamped = Vec::with_capacity(genesis.len());
        for (pos, mut txn) in genesis.into_iter().enumerate() {
            let expected = pos as u64 + 1;
            match txn.seq_no() {
                Some(actual) if actual != expected => {
                    return Err(ConsensusError::InvalidGenesis(format!(
                        "genesis seqNo {actual} at position {expected}"
                    )));
                }
                Some(_) => {}
                None => txn.set_seq_no(expected),
            }
            stamped.push(txn);
        }
        self.staged.clear();
        self.tree = MerkleTree::new();
        for txn in &stamped {
            self.tree.push(leaf_hash(&txn.canonical_bytes()));
        }
        self.committed = stamped.clone();
        Ok(stamped)
    }

    /// Append one transaction straight to committed state, bypassing
    /// consensus staging. Refused while a staging area is open, since
    /// the staged entries already claim the following seqNos.
    pub fn append_committed(
        &mut self,
        txn: Transaction,
    ) -> Result<Transaction, ConsensusError> {
        let expected = self.size() + 1;
        if !self.staged.is_empty() {
            return Err(ConsensusError::SeqNoConflict {
                expected: self.seq_no() + 1,
                actual: expected,
            });
        }
        let mut txn = txn;
        match txn.seq_no() {
            Some(actual) if actual != expected => {
                return Err(ConsensusError::SeqNoConflict { expected, actual });
            }
            Some(_) => {}
            None => txn.set_seq_no(expected),
        }
        self.tree.push(leaf_hash(&txn.canonical_bytes()));
        self.committed.push(txn.clone());
        Ok(txn)
    }

    /// Stage a batch. Each transaction is assigned the next seqNo (or
    /// checked against it, when the batch arrives pre-stamped from the
    /// actor) and optionally stamped with `txn_time`. Committed state is
    /// untouched. Returns `(start, end, stamped)`.
    pub fn stage(
        &mut self,
        transactions: &[Transaction],
        txn_time: Option<&str>,
    ) -> Result<(u64, u64, Vec<Transaction>), ConsensusError> {
        let start = self.uncommitted_size() + 1;
        let mut stamped = Vec::with_capacity(transactions.len());
        for (offset, txn) in transactions.iter().enumerate() {
            let expected = start + offset as u64;
            let mut txn = txn.clone();
            match txn.seq_no() {
                Some(actual) if actual != expected => {
                    return Err(ConsensusError::SeqNoConflict { expected, actual });
                }
                Some(_) => {}
                None => txn.set_seq_no(expected),
            }
            if let Some(time) = txn_time
                && txn.txn_time().is_none()
            {
                txn.set_txn_time(time);
            }
            stamped.push(txn);
        }
        self.staged.extend(stamped.iter().cloned());
        let end = self.uncommitted_size();
        Ok((start, end, stamped))
    }

    /// Atomically promote the whole staging area. Returns the promoted
    /// transactions so the storage layer can make them durable.
    pub fn commit_staged(&mut self) -> Vec<Transaction> {
        let promoted: Vec<Transaction> = std::mem::take(&mut self.staged);
        for txn in &promoted {
            self.tree.push(leaf_hash(&txn.canonical_bytes()));
        }
        self.committed.extend(promoted.iter().cloned());
        promoted
    }

    pub fn discard_staged(&mut self) {
        self.staged.clear();
    }

    pub fn audit_path(&self, seq_no: u64) -> Result<AuditProof, ConsensusError> {
        if seq_no == 0 || seq_no > self.size() {
            return Err(ConsensusError::NoSuchTransaction(seq_no));
        }
        let index = (seq_no - 1) as usize;
        // Index bounds were just checked against the committed length.
        let path = self.tree.audit_path(index).unwrap_or_default();
        Ok(AuditProof {
            root_hash: self.root_hash(),
            audit_path: path.iter().map(hex::encode).collect(),
            ledger_size: self.size(),
        })
    }

    pub fn get_transaction(&self, seq_no: u64) -> Result<&Transaction, ConsensusError> {
        if seq_no == 0 || seq_no > self.size() {
            return Err(ConsensusError::NoSuchTransaction(seq_no));
        }
        Ok(&self.committed[(seq_no - 1) as usize])
    }

    /// Fetch by seqNo from the combined sequence, staged tail included.
    pub fn get_uncommitted_transaction(
        &self,
        seq_no: u64,
    ) -> Result<&Transaction, ConsensusError> {
        if seq_no == 0 || seq_no > self.uncommitted_size() {
            return Err(ConsensusError::NoSuchTransaction(seq_no));
        }
        let index = (seq_no - 1) as usize;
        if index < self.committed.len() {
            Ok(&self.committed[index])
        } else {
            Ok(&self.staged[index - self.committed.len()])
        }
    }

    pub fn last_committed_transaction(&self) -> Option<&Transaction> {
        self.committed.last()
    }

    pub fn last_transaction(&self) -> Option<&Transaction> {
        self.staged.last().or_else(|| self.committed.last())
    }

    pub fn committed_transactions(&self) -> &[Transaction] {
        &self.committed
    }

    pub fn uncommitted_transactions(&self) -> &[Transaction] {
        &self.staged
    }
}
