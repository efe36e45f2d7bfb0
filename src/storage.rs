//! Ledger registry and durability.
//!
//! Implement [`LedgerStorage`] to use your own backend. The default
//! [`InMemoryLedgerStorage`] keeps everything in RAM, which is fine for
//! testing or ephemeral peers. [`FileLedgerStorage`] persists one append
//! log plus a small root header per ledger and survives a crash in the
//! middle of a commit: reopening yields either the pre-commit or the
//! post-commit snapshot, never a torn state.
//!
//! All operations are synchronous and must not yield; consensus state
//! machines call into the store between protocol suspension points.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ConsensusError;
use crate::ledger::{Microledger, Transaction};

/// Registry metadata for one ledger. The participant set is fixed at
/// genesis for the life of the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerMeta {
    pub name: String,
    pub uid: String,
    pub created: String,
    #[serde(default)]
    pub participants: Vec<String>,
}

fn new_meta(name: &str) -> LedgerMeta {
    let created = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_default();
    LedgerMeta {
        name: name.to_string(),
        uid: Uuid::new_v4().simple().to_string(),
        created,
        participants: Vec::new(),
    }
}

/// Storage backend for microledgers.
///
/// The registry only ever holds committed state; staging lives inside the
/// [`Microledger`] value owned by whichever state machine checked the
/// ledger out. The scheduler guarantees a single live machine per ledger,
/// so load-modify-persist sequences here are race-free.
pub trait LedgerStorage: Send + Sync + 'static {
    /// Register an empty ledger under `name`.
    fn create(&self, name: &str) -> Result<(), ConsensusError>;

    /// Load the committed state of a ledger.
    fn load(&self, name: &str) -> Result<Microledger, ConsensusError>;

    /// Durably install the genesis block of a freshly created ledger
    /// and record its fixed participant set.
    fn install_genesis(
        &self,
        name: &str,
        transactions: &[Transaction],
        root_hash: &str,
        participants: &[String],
    ) -> Result<(), ConsensusError>;

    /// Registry metadata, participant set included.
    fn meta(&self, name: &str) -> Result<LedgerMeta, ConsensusError>;

    /// Durably append a committed batch. The entries must be fully
    /// written before the recorded root moves to `root_hash`.
    fn append_commit(
        &self,
        name: &str,
        transactions: &[Transaction],
        root_hash: &str,
    ) -> Result<(), ConsensusError>;

    fn remove(&self, name: &str) -> Result<(), ConsensusError>;

    fn is_exists(&self, name: &str) -> bool;

    fn rename(&self, name: &str, new_name: &str) -> Result<(), ConsensusError>;

    fn list(&self) -> Vec<LedgerMeta>;
}

/// In-memory ledger storage. Data is lost when the process exits.
#[derive(Default)]
pub struct InMemoryLedgerStorage {
    ledgers: RwLock<HashMap<String, (LedgerMeta, Vec<Transaction>)>>,
}

impl InMemoryLedgerStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LedgerStorage for InMemoryLedgerStorage {
    fn create(&self, name: &str) -> Result<(), ConsensusError> {
        let mut ledgers = self.ledgers.write();
        if ledgers.contains_key(name) {
            return Err(ConsensusError::LedgerAlreadyExists(name.to_string()));
        }
        ledgers.insert(name.to_string(), (new_meta(name), Vec::new()));
        Ok(())
    }

    fn load(&self, name: &str) -> Result<Microledger, ConsensusError> {
        let ledgers = self.ledgers.read();
        let (_, committed) = ledgers
            .get(name)
            .ok_or_else(|| ConsensusError::LedgerNotFound(name.to_string()))?;
        Microledger::from_committed(name, committed.clone())
    }

    fn install_genesis(
        &self,
        name: &str,
        transactions: &[Transaction],
        _root_hash: &str,
        participants: &[String],
    ) -> Result<(), ConsensusError> {
        let mut ledgers = self.ledgers.write();
        let (meta, committed) = ledgers
            .get_mut(name)
            .ok_or_else(|| ConsensusError::LedgerNotFound(name.to_string()))?;
        if !committed.is_empty() {
            return Err(ConsensusError::LedgerNotEmpty(name.to_string()));
        }
        meta.participants = participants.to_vec();
        committed.extend(transactions.iter().cloned());
        Ok(())
    }

    fn meta(&self, name: &str) -> Result<LedgerMeta, ConsensusError> {
        let ledgers = self.ledgers.read();
        ledgers
            .get(name)
            .map(|(meta, _)| meta.clone())
            .ok_or_else(|| ConsensusError::LedgerNotFound(name.to_string()))
    }

    fn append_commit(
        &self,
        name: &str,
        transactions: &[Transaction],
        _root_hash: &str,
    ) -> Result<(), ConsensusError> {
        let mut ledgers = self.ledgers.write();
        let (_, committed) = ledgers
            .get_mut(name)
            .ok_or_else(|| ConsensusError::LedgerNotFound(name.to_string()))?;
        committed.extend(transactions.iter().cloned());
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<(), ConsensusError> {
        let mut ledgers = self.ledgers.write();
        ledgers
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ConsensusError::LedgerNotFound(name.to_string()))
    }

    fn is_exists(&self, name: &str) -> bool {
        self.ledgers.read().contains_key(name)
    }

    fn rename(&self, name: &str, new_name: &str) -> Result<(), ConsensusError> {
        let mut ledgers = self.ledgers.write();
        if ledgers.contains_key(new_name) {
            return Err(ConsensusError::LedgerAlreadyExists(new_name.to_string()));
        }
        let (mut meta, committed) = ledgers
            .remove(name)
            .ok_or_else(|| ConsensusError::LedgerNotFound(name.to_string()))?;
        meta.name = new_name.to_string();
        ledgers.insert(new_name.to_string(), (meta, committed));
        Ok(())
    }

    fn list(&self) -> Vec<LedgerMeta> {
        let mut metas: Vec<LedgerMeta> = self
            .ledgers
            .read()
            .values()
            .map(|(meta, _)| meta.clone())
            .collect();
        metas.sort_by(|a, b| a.name.cmp(&b.name));
        metas
    }
}

/// Header recorded next to each append log. `size` is authoritative: log
/// entries past it are a torn commit tail and are dropped on open.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RootHeader {
    size: u64,
    root_hash: String,
    #[serde(flatten)]
    meta: LedgerMeta,
}

/// Durable ledger storage: per ledger, `<name>.log` holds one
/// canonical-JSON committed transaction per line and `<name>.root` the
/// header. Commits append to the log and fsync before the header is
/// atomically rotated (tmp + rename), so the header never references
/// entries that are not on disk.
pub struct FileLedgerStorage {
    base_dir: PathBuf,
}

impl FileLedgerStorage {
    pub fn open(base_dir: impl AsRef<Path>) -> Result<Self, ConsensusError> {
        fs::create_dir_all(base_dir.as_ref())?;
        Ok(Self {
            base_dir: base_dir.as_ref().to_path_buf(),
        })
    }

    fn log_path(&self, name: &str) -> PathBuf {
        self.base_dir.join(format!("{name}.log"))
    }

    fn root_path(&self, name: &str) -> PathBuf {
        self.base_dir.join(format!("{name}.root"))
    }

    fn read_header(&self, name: &str) -> Result<RootHeader, ConsensusError> {
        let path = self.root_path(name);
        if !path.exists() {
            return Err(ConsensusError::LedgerNotFound(name.to_string()));
        }
        let bytes = fs::read(&path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn write_header(&self, name: &str, header: &RootHeader) -> Result<(), ConsensusError> {
        let path = self.root_path(name);
        let tmp = path.with_extension("root.tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&serde_json::to_vec(header)?)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn append_log(&self, name: &str, transactions: &[Transaction]) -> Result<(), ConsensusError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(name))?;
        for txn in transactions {
            file.write_all(&txn.canonical_bytes())?;
            file.write_all(b"\n")?;
        }
        file.sync_all()?;
        Ok(())
    }
}

impl LedgerStorage for FileLedgerStorage {
    fn create(&self, name: &str) -> Result<(), ConsensusError> {
        if self.is_exists(name) {
            return Err(ConsensusError::LedgerAlreadyExists(name.to_string()));
        }
        let header = RootHeader {
            size: 0,
            root_hash: String::new(),
            meta: new_meta(name),
        };
        File::create(self.log_path(name))?;
        self.write_header(name, &header)
    }

    fn load(&self, name: &str) -> Result<Microledger, ConsensusError> {
        let header = self.read_header(name)?;
        let file = File::open(self.log_path(name))?;
        let reader = BufReader::new(file);
        let mut committed = Vec::new();
        for line in reader.lines() {
            if committed.len() as u64 == header.size {
                // Entries past the recorded size were appended by a
                // commit that never moved the header. Drop them.
                break;
            }
            let line = line?;
            if line.is_empty() {
                continue;
            }
            committed.push(Transaction::from_value(serde_json::from_str(&line)?)?);
        }
        if (committed.len() as u64) < header.size {
            return Err(ConsensusError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "ledger '{name}' log holds {} entries, header records {}",
                    committed.len(),
                    header.size
                ),
            )));
        }
        Microledger::from_committed(name, committed)
    }

    fn install_genesis(
        &self,
        name: &str,
        transactions: &[Transaction],
        root_hash: &str,
        participants: &[String],
    ) -> Result<(), ConsensusError> {
        let mut header = self.read_header(name)?;
        if header.size != 0 {
            return Err(ConsensusError::LedgerNotEmpty(name.to_string()));
        }
        self.append_log(name, transactions)?;
        header.size = transactions.len() as u64;
        header.root_hash = root_hash.to_string();
        header.meta.participants = participants.to_vec();
        self.write_header(name, &header)
    }

    fn meta(&self, name: &str) -> Result<LedgerMeta, ConsensusError> {
        Ok(self.read_header(name)?.meta)
    }

    fn append_commit(
        &self,
        name: &str,
        transactions: &[Transaction],
        root_hash: &str,
    ) -> Result<(), ConsensusError> {
        let mut header = self.read_header(name)?;
        self.append_log(name, transactions)?;
        header.size += transactions.len() as u64;
        header.root_hash = root_hash.to_string();
        self.write_header(name, &header)
    }

    fn remove(&self, name: &str) -> Result<(), ConsensusError> {
        if !self.is_exists(name) {
            return Err(ConsensusError::LedgerNotFound(name.to_string()));
        }
        fs::remove_file(self.root_path(name))?;
        fs::remove_file(self.log_path(name))?;
        Ok(())
    }

    fn is_exists(&self, name: &str) -> bool {
        self.root_path(name).exists()
    }

    fn rename(&self, name: &str, new_name: &str) -> Result<(), ConsensusError> {
        if self.is_exists(new_name) {
            return Err(ConsensusError::LedgerAlreadyExists(new_name.to_string()));
        }
        let mut header = self.read_header(name)?;
        header.meta.name = new_name.to_string();
        fs::rename(self.log_path(name), self.log_path(new_name))?;
        self.write_header(new_name, &header)?;
        fs::remove_file(self.root_path(name))?;
        Ok(())
    }

    fn list(&self) -> Vec<LedgerMeta> {
        let mut metas = Vec::new();
        let Ok(entries) = fs::read_dir(&self.base_dir) else {
            return metas;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("root") {
                continue;
            }
            if let Ok(bytes) = fs::read(&path)
                && let Ok(header) = serde_json::from_slice::<RootHeader>(&bytes)
            {
                metas.push(header.meta);
            }
        }
        metas.sort_by(|a, b| a.name.cmp(&b.name));
        metas
    }
}
