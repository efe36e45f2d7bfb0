use std::sync::Arc;

use crate::error::ConsensusError;
use crate::ledger::Transaction;

/// Selects which ledgers an inbound handler covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerFilter {
    Any,
    Named(String),
}

impl LedgerFilter {
    pub fn matches(&self, ledger: &str) -> bool {
        match self {
            LedgerFilter::Any => true,
            LedgerFilter::Named(name) => name == ledger,
        }
    }
}

/// Application hook deciding whether this peer participates in an
/// inbound protocol run. Outcomes are reported through the event bus.
pub trait InboundHandler: Send + Sync + 'static {
    /// Accept or decline a run on `ledger` initiated by `actor`.
    fn accept(&self, ledger: &str, actor: &str) -> bool;
}

/// Handler accepting every inbound run it is registered for.
pub struct AcceptAll;

impl InboundHandler for AcceptAll {
    fn accept(&self, _ledger: &str, _actor: &str) -> bool {
        true
    }
}

/// Application-facing entry points of the consensus SDK.
pub trait ConsensusApi {
    /// Actor entry point: propose a new microledger with the given
    /// genesis block to `participants` and drive the run to unanimity.
    fn initialize_ledger(
        &self,
        name: &str,
        participants: Vec<String>,
        genesis: Vec<Transaction>,
        timeout_sec: u64,
    ) -> impl Future<Output = Result<(), ConsensusError>> + Send;

    /// Actor entry point: drive a four-stage commit of `transactions`
    /// onto an existing ledger. Returns the committed batch with its
    /// assigned metadata.
    fn commit_block(
        &self,
        name: &str,
        transactions: Vec<Transaction>,
        timeout_sec: u64,
    ) -> impl Future<Output = Result<Vec<Transaction>, ConsensusError>> + Send;

    /// Subscribe this peer as a participant: inbound protocol runs on
    /// matching ledgers are routed to a fresh participant state machine.
    fn register_inbound_handler(&self, filter: LedgerFilter, handler: Arc<dyn InboundHandler>);
}
