//! The scheduler: routes inbound messages to state-machine instances,
//! enforces the one-live-machine-per-ledger invariant and drives each
//! machine with per-stage receive deadlines.
//!
//! Instances are identified by thread id; a thid first seen on an
//! `initialize-request` or `stage-propose` spawns a participant machine
//! (subject to the registered inbound handlers), everything else is
//! delivered to the live instance or dropped as spurious. Machines
//! themselves never suspend: the service owns every `await`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant, timeout_at};
use tracing::{info, warn};

use crate::api::{ConsensusApi, InboundHandler, LedgerFilter};
use crate::commit_block::{CommitActor, CommitActorState, CommitParticipant};
use crate::crypto::{Crypto, DidResolver};
use crate::error::{ConsensusError, ProblemCode};
use crate::events::{ConsensusEvent, ConsensusEventBus};
use crate::init_ledger::{InitActor, InitActorState, InitParticipant, InitParticipantState};
use crate::ledger::{LedgerState, Transaction};
use crate::machine::{Input, Outbound, ProtocolMachine};
use crate::messages::{ConsensusMessage, InitializeRequest, ProblemReport, StagePropose};
use crate::storage::LedgerStorage;
use crate::transport::Transport;

pub const DEFAULT_TIMEOUT_SEC: u64 = 60;

type Inbox = mpsc::UnboundedReceiver<(String, ConsensusMessage)>;
type InboxSender = mpsc::UnboundedSender<(String, ConsensusMessage)>;

/// Consensus service for one peer: the application API on the actor
/// side and the participant scheduler on the inbound side.
pub struct ConsensusService<S, T, E>
where
    S: LedgerStorage,
    T: Transport,
    E: ConsensusEventBus,
{
    me: String,
    my_verkey: String,
    crypto: Arc<dyn Crypto>,
    resolver: Arc<dyn DidResolver>,
    storage: Arc<S>,
    transport: Arc<T>,
    event_bus: E,
    locks: Arc<Mutex<HashSet<String>>>,
    inboxes: Arc<Mutex<HashMap<String, InboxSender>>>,
    handlers: Arc<Mutex<Vec<(LedgerFilter, Arc<dyn InboundHandler>)>>>,
}

impl<S, T, E> Clone for ConsensusService<S, T, E>
where
    S: LedgerStorage,
    T: Transport,
    E: ConsensusEventBus,
{
    fn clone(&self) -> Self {
        Self {
            me: self.me.clone(),
            my_verkey: self.my_verkey.clone(),
            crypto: Arc::clone(&self.crypto),
            resolver: Arc::clone(&self.resolver),
            storage: Arc::clone(&self.storage),
            transport: Arc::clone(&self.transport),
            event_bus: self.event_bus.clone(),
            locks: Arc::clone(&self.locks),
            inboxes: Arc::clone(&self.inboxes),
            handlers: Arc::clone(&self.handlers),
        }
    }
}

/// Releases the per-ledger machine slot when a protocol run ends.
struct LedgerLock {
    name: String,
    locks: Arc<Mutex<HashSet<String>>>,
}

impl LedgerLock {
    fn acquire(
        locks: &Arc<Mutex<HashSet<String>>>,
        name: &str,
    ) -> Result<Self, ConsensusError> {
        if !locks.lock().insert(name.to_string()) {
            return Err(ConsensusError::LedgerLocked(name.to_string()));
        }
        Ok(Self {
            name: name.to_string(),
            locks: Arc::clone(locks),
        })
    }
}

impl Drop for LedgerLock {
    fn drop(&mut self) {
        self.locks.lock().remove(&self.name);
    }
}

/// Removes a thid's inbox registration when its machine terminates.
struct InboxGuard {
    thid: String,
    inboxes: Arc<Mutex<HashMap<String, InboxSender>>>,
}

impl Drop for InboxGuard {
    fn drop(&mut self) {
        self.inboxes.lock().remove(&self.thid);
    }
}

impl<S, T, E> ConsensusService<S, T, E>
where
    S: LedgerStorage,
    T: Transport,
    E: ConsensusEventBus,
{
    pub fn new(
        me: &str,
        crypto: Arc<dyn Crypto>,
        resolver: Arc<dyn DidResolver>,
        storage: Arc<S>,
        transport: Arc<T>,
        event_bus: E,
    ) -> Result<Self, ConsensusError> {
        let my_verkey = resolver
            .verkey_of(me)
            .ok_or_else(|| ConsensusError::UnknownDid(me.to_string()))?;
        Ok(Self {
            me: me.to_string(),
            my_verkey,
            crypto,
            resolver,
            storage,
            transport,
            event_bus,
            locks: Arc::new(Mutex::new(HashSet::new())),
            inboxes: Arc::new(Mutex::new(HashMap::new())),
            handlers: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn did(&self) -> &str {
        &self.me
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub fn subscribe_to_events(&self) -> E::Receiver {
        self.event_bus.subscribe()
    }

    /// Current committed state of a local ledger.
    pub fn ledger_state(&self, name: &str) -> Result<LedgerState, ConsensusError> {
        Ok(self.storage.load(name)?.state())
    }

    /// Start the inbound router. Runs until the transport closes.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move { service.route_loop().await })
    }

    async fn route_loop(&self) {
        while let Some((from, bytes)) = self.transport.recv().await {
            let message = match ConsensusMessage::decode(&bytes) {
                Ok(message) => message,
                Err(e) => {
                    warn!(%from, error = %e, "dropping undecodable envelope");
                    continue;
                }
            };
            let thid = message.thid().to_string();

            let delivered = {
                let inboxes = self.inboxes.lock();
                match inboxes.get(&thid) {
                    Some(tx) => tx.send((from.clone(), message.clone())).is_ok(),
                    None => false,
                }
            };
            if delivered {
                continue;
            }

            // Fresh thid: only the two opening requests may spawn a
            // participant machine.
            match message {
                ConsensusMessage::InitializeRequest(request) => {
                    self.spawn_init_participant(from, request);
                }
                ConsensusMessage::StagePropose(propose) => {
                    self.spawn_commit_participant(from, propose);
                }
                other => {
                    warn!(%from, thid = %thid, kind = other.type_name(),
                        "message for unknown thread, dropped");
                }
            }
        }
        info!(me = %self.me, "transport closed, router stopped");
    }

    fn handler_accepts(&self, ledger: &str, actor: &str) -> bool {
        let handlers = self.handlers.lock();
        handlers
            .iter()
            .find(|(filter, _)| filter.matches(ledger))
            .is_some_and(|(_, handler)| handler.accept(ledger, actor))
    }

    fn register_inbox(&self, thid: &str) -> (Inbox, InboxGuard) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.lock().insert(thid.to_string(), tx);
        let guard = InboxGuard {
            thid: thid.to_string(),
            inboxes: Arc::clone(&self.inboxes),
        };
        (rx, guard)
    }

    async fn send_outbound(&self, outbound: Vec<Outbound>) {
        for out in outbound {
            let bytes = match out.message.encode() {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(error = %e, "failed to encode outbound message");
                    continue;
                }
            };
            // Best-effort: peers that miss a message converge through
            // their own deadlines.
            if let Err(e) = self.transport.send(&out.to, bytes).await {
                warn!(to = %out.to, error = %e, "outbound delivery failed");
            }
        }
    }

    async fn reject_inbound(&self, to: &str, thid: &str, explain: String) {
        let report = ProblemReport::new(thid, ProblemCode::RequestNotAccepted, explain);
        self.send_outbound(vec![Outbound {
            to: to.to_string(),
            message: ConsensusMessage::ProblemReport(report),
        }])
        .await;
    }

    /// Take the per-ledger machine slot, waiting up to `timeout_sec`
    /// for a live run to finish. One machine owns a ledger at a time;
    /// a slot that never frees up means the run is refused.
    async fn acquire_lock(
        &self,
        name: &str,
        timeout_sec: u64,
    ) -> Result<LedgerLock, ConsensusError> {
        let timeout_sec = if timeout_sec == 0 {
            DEFAULT_TIMEOUT_SEC
        } else {
            timeout_sec
        };
        let deadline = Instant::now() + Duration::from_secs(timeout_sec);
        loop {
            match LedgerLock::acquire(&self.locks, name) {
                Ok(lock) => return Ok(lock),
                Err(e) => {
                    if Instant::now() >= deadline {
                        return Err(e);
                    }
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            }
        }
    }

    /// Drive one machine to a terminal state. The receive deadline is
    /// re-armed at the start of every wait and whenever the machine
    /// moves to a new phase; `after_step` runs synchronously after each
    /// step, before the outbound messages leave.
    async fn drive<M: ProtocolMachine>(
        &self,
        machine: &mut M,
        inbox: &mut Inbox,
        timeout_sec: u64,
        mut after_step: impl FnMut(&mut M) + Send,
    ) {
        let timeout_sec = if timeout_sec == 0 {
            DEFAULT_TIMEOUT_SEC
        } else {
            timeout_sec
        };
        let mut phase = machine.phase();
        let mut deadline = Instant::now() + Duration::from_secs(timeout_sec);
        while !machine.is_terminal() {
            let input = match timeout_at(deadline, inbox.recv()).await {
                Ok(Some((from, message))) => Input::Message { from, message },
                // A closed inbox means the router is gone; treat it as
                // cancellation from outside.
                Ok(None) | Err(_) => Input::Timeout,
            };
            let outbound = machine.handle(input);
            after_step(machine);
            self.send_outbound(outbound).await;
            if machine.phase() != phase {
                phase = machine.phase();
                deadline = Instant::now() + Duration::from_secs(timeout_sec);
            }
        }
    }

    fn spawn_init_participant(&self, from: String, request: InitializeRequest) {
        let ledger_name = request.ledger.name.clone();
        let thid = request.thread.thid.clone();
        if !self.handler_accepts(&ledger_name, &from) {
            info!(ledger = %ledger_name, actor = %from,
                "no handler accepted inbound genesis, ignored");
            return;
        }
        let (mut inbox, inbox_guard) = self.register_inbox(&thid);

        let service = self.clone();
        tokio::spawn(async move {
            let _guard = inbox_guard;
            let timeout_sec = request.timeout_sec;
            let lock = match service.acquire_lock(&ledger_name, timeout_sec).await {
                Ok(lock) => lock,
                Err(e) => {
                    service.reject_inbound(&from, &thid, e.to_string()).await;
                    return;
                }
            };
            let (mut machine, outbound) = InitParticipant::accept(
                &service.me,
                &service.my_verkey,
                service.crypto.as_ref(),
                service.resolver.as_ref(),
                &from,
                request,
                service.storage.is_exists(&ledger_name),
            );
            service.send_outbound(outbound).await;
            service.drive(&mut machine, &mut inbox, timeout_sec, |_| {}).await;

            match machine.state() {
                InitParticipantState::Committed => {
                    let participants = machine.participants().to_vec();
                    let persisted = machine.ledger().map_or(Ok(()), |ledger| {
                        service.storage.create(&ledger_name)?;
                        service.storage.install_genesis(
                            &ledger_name,
                            ledger.committed_transactions(),
                            &ledger.root_hash(),
                            &participants,
                        )
                    });
                    drop(lock);
                    match persisted {
                        Ok(()) => service.event_bus.publish(ConsensusEvent::LedgerInitialized {
                            ledger: ledger_name,
                            thid,
                        }),
                        Err(e) => warn!(ledger = %ledger_name, error = %e,
                            "failed to persist agreed genesis"),
                    }
                }
                _ => {
                    let (code, explain) = machine
                        .problem_report()
                        .map(|r| (r.problem_code, r.explain.clone()))
                        .unwrap_or((ProblemCode::RequestProcessingError, String::new()));
                    drop(lock);
                    service.event_bus.publish(ConsensusEvent::Aborted {
                        ledger: ledger_name,
                        thid,
                        code,
                        explain,
                    });
                }
            }
        });
    }

    fn spawn_commit_participant(&self, from: String, propose: StagePropose) {
        let ledger_name = propose.state.name.clone();
        let thid = propose.thread.thid.clone();
        if !self.handler_accepts(&ledger_name, &from) {
            info!(ledger = %ledger_name, actor = %from,
                "no handler accepted inbound commit, ignored");
            return;
        }
        let (mut inbox, inbox_guard) = self.register_inbox(&thid);

        let service = self.clone();
        tokio::spawn(async move {
            let _guard = inbox_guard;
            let timeout_sec = propose.timeout_sec;
            let lock = match service.acquire_lock(&ledger_name, timeout_sec).await {
                Ok(lock) => lock,
                Err(e) => {
                    service.reject_inbound(&from, &thid, e.to_string()).await;
                    return;
                }
            };
            let ledger = match service.storage.load(&ledger_name) {
                Ok(ledger) => ledger,
                Err(e) => {
                    service.reject_inbound(&from, &thid, e.to_string()).await;
                    return;
                }
            };
            let (mut machine, outbound) = CommitParticipant::accept(
                &service.me,
                &service.my_verkey,
                Arc::clone(&service.crypto),
                Arc::clone(&service.resolver),
                &from,
                propose,
                ledger,
            );
            service.send_outbound(outbound).await;

            let storage = Arc::clone(&service.storage);
            let bus = service.event_bus.clone();
            let name = ledger_name.clone();
            let thread = thid.clone();
            service
                .drive(&mut machine, &mut inbox, timeout_sec, move |m| {
                    if let Some(batch) = m.take_committed() {
                        // Post-commit store failures are fatal locally
                        // and never trigger a distributed abort.
                        match storage.append_commit(&name, &batch.transactions, &batch.root_hash)
                        {
                            Ok(()) => bus.publish(ConsensusEvent::BlockCommitted {
                                ledger: name.clone(),
                                thid: thread.clone(),
                                count: batch.transactions.len(),
                                root_hash: batch.root_hash.clone(),
                            }),
                            Err(e) => warn!(ledger = %name, error = %e,
                                "failed to persist committed batch"),
                        }
                    }
                })
                .await;

            drop(lock);
            if let Some(report) = machine.problem_report() {
                service.event_bus.publish(ConsensusEvent::Aborted {
                    ledger: ledger_name,
                    thid,
                    code: report.problem_code,
                    explain: report.explain.clone(),
                });
            }
        });
    }
}

impl<S, T, E> ConsensusApi for ConsensusService<S, T, E>
where
    S: LedgerStorage,
    T: Transport,
    E: ConsensusEventBus,
{
    async fn initialize_ledger(
        &self,
        name: &str,
        participants: Vec<String>,
        genesis: Vec<Transaction>,
        timeout_sec: u64,
    ) -> Result<(), ConsensusError> {
        if self.storage.is_exists(name) {
            return Err(ConsensusError::LedgerAlreadyExists(name.to_string()));
        }
        let _lock = self.acquire_lock(name, timeout_sec).await?;

        self.storage.create(name)?;
        let mut ledger = self.storage.load(name)?;
        let result = async {
            ledger.reset(genesis)?;
            self.storage.install_genesis(
                name,
                ledger.committed_transactions(),
                &ledger.root_hash(),
                &participants,
            )?;

            let (mut machine, outbound) = InitActor::start(
                &self.me,
                &self.my_verkey,
                Arc::clone(&self.crypto),
                Arc::clone(&self.resolver),
                &ledger,
                participants,
                timeout_sec,
            )?;
            let thid = machine.thid().to_string();
            let (mut inbox, _guard) = self.register_inbox(&thid);
            self.send_outbound(outbound).await;
            self.drive(&mut machine, &mut inbox, timeout_sec, |_| {}).await;

            match machine.state() {
                InitActorState::Committed => {
                    self.event_bus.publish(ConsensusEvent::LedgerInitialized {
                        ledger: name.to_string(),
                        thid,
                    });
                    Ok(())
                }
                _ => {
                    let (code, explain) = machine
                        .problem_report()
                        .map(|r| (r.problem_code, r.explain.clone()))
                        .unwrap_or((ProblemCode::ResponseNotAccepted, String::new()));
                    self.event_bus.publish(ConsensusEvent::Aborted {
                        ledger: name.to_string(),
                        thid,
                        code,
                        explain: explain.clone(),
                    });
                    Err(ConsensusError::Terminated { code, explain })
                }
            }
        }
        .await;

        if result.is_err() {
            // No peer-wide agreement was reached; the local ledger must
            // not outlive the run.
            if let Err(e) = self.storage.remove(name) {
                warn!(ledger = %name, error = %e, "failed to remove aborted ledger");
            }
        }
        result
    }

    async fn commit_block(
        &self,
        name: &str,
        transactions: Vec<Transaction>,
        timeout_sec: u64,
    ) -> Result<Vec<Transaction>, ConsensusError> {
        let _lock = self.acquire_lock(name, timeout_sec).await?;
        let ledger = self.storage.load(name)?;
        let participants = self.storage.meta(name)?.participants;

        let (mut machine, outbound) = CommitActor::start(
            &self.me,
            &self.my_verkey,
            Arc::clone(&self.crypto),
            Arc::clone(&self.resolver),
            ledger,
            transactions,
            participants,
            timeout_sec,
        )?;
        let thid = machine.thid().to_string();
        let (mut inbox, _guard) = self.register_inbox(&thid);
        self.send_outbound(outbound).await;

        let storage = Arc::clone(&self.storage);
        let mut committed: Option<Vec<Transaction>> = None;
        let mut persist_error: Option<ConsensusError> = None;
        self.drive(&mut machine, &mut inbox, timeout_sec, |m| {
            if let Some(batch) = m.take_committed() {
                if let Err(e) = storage.append_commit(name, &batch.transactions, &batch.root_hash)
                {
                    persist_error = Some(e);
                } else {
                    committed = Some(batch.transactions);
                }
            }
        })
        .await;

        if let Some(e) = persist_error {
            // The round reached consensus; only local durability failed.
            return Err(e);
        }
        match machine.state() {
            CommitActorState::Done => {
                let transactions = committed.unwrap_or_default();
                self.event_bus.publish(ConsensusEvent::BlockCommitted {
                    ledger: name.to_string(),
                    thid,
                    count: transactions.len(),
                    root_hash: self.storage.load(name)?.root_hash(),
                });
                Ok(transactions)
            }
            _ => {
                let (code, explain) = machine
                    .problem_report()
                    .map(|r| (r.problem_code, r.explain.clone()))
                    .unwrap_or((ProblemCode::ResponseProcessingError, String::new()));
                self.event_bus.publish(ConsensusEvent::Aborted {
                    ledger: name.to_string(),
                    thid,
                    code,
                    explain: explain.clone(),
                });
                Err(ConsensusError::Terminated { code, explain })
            }
        }
    }

    fn register_inbound_handler(&self, filter: LedgerFilter, handler: Arc<dyn InboundHandler>) {
        self.handlers.lock().push((filter, handler));
    }
}
