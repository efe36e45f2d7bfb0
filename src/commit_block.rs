//! Accept-block protocol: four-stage commit of a transaction batch.
//!
//! The actor stages the batch and multicasts `stage-propose`; each
//! participant restages it independently and answers `stage-pre-commit`
//! with a signature over its *own* recomputation of the state hash. Once
//! every pre-commit is in, the actor multicasts a signed `stage-commit`
//! carrying the full pre-commit map; participants verify it, promote
//! their staging area and witness the commit in `stage-post-commit`. The
//! collected witnesses form a quorum certificate any participant can
//! later show a third party.
//!
//! Once the actor holds all pre-commits, a commit can go through even if
//! a later participant aborts: the non-committed peers time out and
//! discard staging while committed ones keep their state. The divergence
//! surfaces as a seqNo mismatch on the next propose and repair is out of
//! band. That is the accepted limitation of the simple scheme.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::crypto::{Crypto, DidResolver, SignatureEnvelope, sign_payload, verify_envelope};
use crate::error::{ConsensusError, ProblemCode};
use crate::ledger::{Microledger, Transaction};
use crate::machine::{Input, Outbound, ProtocolMachine, multicast};
use crate::messages::{
    ConsensusMessage, ProblemReport, StageCommit, StagePostCommit, StagePreCommit, StagePropose,
    Thread, new_message_id,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitActorState {
    Idle,
    Proposed,
    AwaitingPreCommits,
    Committing,
    AwaitingPostCommits,
    Done,
    Aborted,
}

/// A batch promoted to committed state, ready for durable storage.
#[derive(Debug, Clone)]
pub struct CommittedBatch {
    pub transactions: Vec<Transaction>,
    pub root_hash: String,
}

fn txn_time_now() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_default()
}

/// Actor side of the four-stage commit.
pub struct CommitActor {
    me: String,
    my_verkey: String,
    crypto: Arc<dyn Crypto>,
    resolver: Arc<dyn DidResolver>,
    participants: Vec<String>,
    thid: String,
    ledger: Microledger,
    propose: StagePropose,
    hash: String,
    pre_commits: BTreeMap<String, SignatureEnvelope>,
    commit_payload: Option<Value>,
    witnesses: BTreeMap<String, SignatureEnvelope>,
    committed: Option<CommittedBatch>,
    state: CommitActorState,
    problem: Option<ProblemReport>,
}

impl CommitActor {
    /// Stage the batch on the actor's ledger and open the round with a
    /// `stage-propose` to every other participant.
    pub fn start(
        me: &str,
        my_verkey: &str,
        crypto: Arc<dyn Crypto>,
        resolver: Arc<dyn DidResolver>,
        mut ledger: Microledger,
        transactions: Vec<Transaction>,
        participants: Vec<String>,
        timeout_sec: u64,
    ) -> Result<(Self, Vec<Outbound>), ConsensusError> {
        if participants.len() < 2 {
            return Err(ConsensusError::TooFewParticipants);
        }
        if !participants.iter().any(|did| did == me) {
            return Err(ConsensusError::NotAParticipant(me.to_string()));
        }

        let thid = format!("simple-consensus-commit-{}", Uuid::new_v4().simple());
        let txn_time = txn_time_now();
        let (_, _, stamped) = ledger.stage(&transactions, Some(&txn_time))?;
        let state = ledger.state();
        let hash = state.hash();

        let propose = StagePropose {
            id: new_message_id(),
            thread: Thread { thid: thid.clone() },
            participants: participants.clone(),
            timeout_sec,
            transactions: stamped,
            state,
            hash: hash.clone(),
            extra: Default::default(),
        };

        // The actor's own pre-commit goes into the map up front so the
        // eventual stage-commit always carries it.
        let own_pre_commit =
            sign_payload(crypto.as_ref(), my_verkey, &Value::String(hash.clone()))?;
        let mut pre_commits = BTreeMap::new();
        pre_commits.insert(me.to_string(), own_pre_commit);

        let mut actor = Self {
            me: me.to_string(),
            my_verkey: my_verkey.to_string(),
            crypto,
            resolver,
            participants,
            thid,
            ledger,
            propose,
            hash,
            pre_commits,
            commit_payload: None,
            witnesses: BTreeMap::new(),
            committed: None,
            state: CommitActorState::Idle,
            problem: None,
        };
        actor.state = CommitActorState::Proposed;
        let outbound = multicast(
            actor.others(),
            ConsensusMessage::StagePropose(actor.propose.clone()),
        );
        actor.state = CommitActorState::AwaitingPreCommits;
        Ok((actor, outbound))
    }

    fn others(&self) -> Vec<String> {
        self.participants
            .iter()
            .filter(|did| *did != &self.me)
            .cloned()
            .collect()
    }

    pub fn thid(&self) -> &str {
        &self.thid
    }

    pub fn ledger_name(&self) -> &str {
        self.ledger.name()
    }

    pub fn state(&self) -> CommitActorState {
        self.state
    }

    pub fn problem_report(&self) -> Option<&ProblemReport> {
        self.problem.as_ref()
    }

    /// The quorum certificate: every participant's signature over the
    /// canonical stage-commit payload, own included.
    pub fn witnesses(&self) -> &BTreeMap<String, SignatureEnvelope> {
        &self.witnesses
    }

    /// Batch promoted by this round, handed over once for persistence.
    pub fn take_committed(&mut self) -> Option<CommittedBatch> {
        self.committed.take()
    }

    pub fn into_ledger(self) -> Microledger {
        self.ledger
    }

    fn abort(&mut self, code: ProblemCode, explain: String) -> Vec<Outbound> {
        warn!(thid = %self.thid, %explain, "commit round aborted");
        self.ledger.discard_staged();
        let report = ProblemReport::new(&self.thid, code, explain);
        // A report received from a peer stays the authoritative cause.
        if self.problem.is_none() {
            self.problem = Some(report.clone());
        }
        self.state = CommitActorState::Aborted;
        multicast(self.others(), ConsensusMessage::ProblemReport(report))
    }

    fn on_pre_commit(&mut self, from: String, pre_commit: StagePreCommit) -> Vec<Outbound> {
        if self.state != CommitActorState::AwaitingPreCommits {
            return Vec::new();
        }
        if !self.participants.contains(&from) || from == self.me {
            warn!(thid = %self.thid, %from, "stage-pre-commit from non-participant");
            return Vec::new();
        }
        if self.pre_commits.contains_key(&from) {
            // Replay of an already-processed pre-commit.
            return Vec::new();
        }

        if let Err(explain) = self.verify_pre_commit(&from, &pre_commit) {
            return self.abort(ProblemCode::ResponseProcessingError, explain);
        }
        self.pre_commits.insert(from, pre_commit.hash_sig);
        if self.pre_commits.len() < self.participants.len() {
            return Vec::new();
        }

        self.state = CommitActorState::Committing;
        match self.build_commit() {
            Ok(commit) => {
                info!(thid = %self.thid, ledger = %self.ledger.name(),
                    "all pre-commits collected, sending commit");
                let outbound =
                    multicast(self.others(), ConsensusMessage::StageCommit(commit));
                self.state = CommitActorState::AwaitingPostCommits;
                outbound
            }
            Err(e) => self.abort(
                ProblemCode::RequestProcessingError,
                format!("failed to build commit: {e}"),
            ),
        }
    }

    fn verify_pre_commit(
        &self,
        from: &str,
        pre_commit: &StagePreCommit,
    ) -> Result<(), String> {
        if pre_commit.hash != self.hash {
            return Err(format!("non-consistent ledger state for participant {from}"));
        }
        let verkey = self
            .resolver
            .verkey_of(from)
            .ok_or_else(|| format!("no verkey known for {from}"))?;
        let verified = verify_envelope(self.crypto.as_ref(), &pre_commit.hash_sig, &verkey)
            .map_err(|e| format!("pre-commit signature of {from} did not verify: {e}"))?;
        if verified.payload != Value::String(self.hash.clone()) {
            return Err(format!("{from} signed a hash different from its message"));
        }
        Ok(())
    }

    fn build_commit(&mut self) -> Result<StageCommit, ConsensusError> {
        let mut commit = StageCommit {
            id: new_message_id(),
            thread: Thread {
                thid: self.thid.clone(),
            },
            participants: self.participants.clone(),
            pre_commits: self.pre_commits.clone(),
            commit_sig: None,
            extra: Default::default(),
        };
        let payload = commit.signable_payload()?;
        commit.commit_sig = Some(sign_payload(
            self.crypto.as_ref(),
            &self.my_verkey,
            &payload,
        )?);
        // The actor witnesses its own commit with a dedicated signature,
        // distinct from the outer commit~sig.
        let own_witness = sign_payload(self.crypto.as_ref(), &self.my_verkey, &payload)?;
        self.witnesses.insert(self.me.clone(), own_witness);
        self.commit_payload = Some(payload);
        Ok(commit)
    }

    /// Commit locally although not every witness arrived. Only reachable
    /// after stage-commit was multicast: from there, peers may already
    /// have promoted their staging, so rolling back would diverge from
    /// them. The certificate stays incomplete and stragglers surface as
    /// a size mismatch on the next propose.
    fn finalize_incomplete(&mut self, reason: String) -> Vec<Outbound> {
        warn!(thid = %self.thid, %reason,
            "committing with incomplete certificate");
        let transactions = self.ledger.commit_staged();
        self.committed = Some(CommittedBatch {
            transactions,
            root_hash: self.ledger.root_hash(),
        });
        self.state = CommitActorState::Done;
        Vec::new()
    }

    fn on_post_commit(&mut self, from: String, post_commit: StagePostCommit) -> Vec<Outbound> {
        if self.state != CommitActorState::AwaitingPostCommits {
            return Vec::new();
        }
        if !self.participants.contains(&from) || from == self.me {
            warn!(thid = %self.thid, %from, "stage-post-commit from non-participant");
            return Vec::new();
        }
        if self.witnesses.contains_key(&from) {
            return Vec::new();
        }

        let Some(payload) = self.commit_payload.clone() else {
            return Vec::new();
        };
        let verdict = (|| -> Result<SignatureEnvelope, String> {
            let verkey = self
                .resolver
                .verkey_of(&from)
                .ok_or_else(|| format!("no verkey known for {from}"))?;
            let envelope = post_commit
                .commits
                .iter()
                .find(|env| env.signer == verkey)
                .ok_or_else(|| format!("no commit signature from {from}"))?;
            let verified = verify_envelope(self.crypto.as_ref(), envelope, &verkey)
                .map_err(|e| format!("commit signature of {from} did not verify: {e}"))?;
            if verified.payload != payload {
                return Err(format!("{from} witnessed a different commit payload"));
            }
            Ok(envelope.clone())
        })();

        match verdict {
            // No rollback after stage-commit went out; a bad witness is
            // excluded from the certificate and the deadline decides.
            Err(explain) => {
                warn!(thid = %self.thid, %explain, "invalid commit witness ignored");
                Vec::new()
            }
            Ok(envelope) => {
                self.witnesses.insert(from, envelope);
                if self.witnesses.len() < self.participants.len() {
                    return Vec::new();
                }
                let aggregated = StagePostCommit {
                    id: new_message_id(),
                    thread: Thread {
                        thid: self.thid.clone(),
                    },
                    commits: self.witnesses.values().cloned().collect(),
                    extra: Default::default(),
                };
                let outbound = multicast(
                    self.others(),
                    ConsensusMessage::StagePostCommit(aggregated),
                );
                let transactions = self.ledger.commit_staged();
                info!(thid = %self.thid, ledger = %self.ledger.name(),
                    count = transactions.len(), "batch committed");
                self.committed = Some(CommittedBatch {
                    transactions,
                    root_hash: self.ledger.root_hash(),
                });
                self.state = CommitActorState::Done;
                outbound
            }
        }
    }
}

impl ProtocolMachine for CommitActor {
    fn handle(&mut self, input: Input) -> Vec<Outbound> {
        if self.is_terminal() {
            return Vec::new();
        }
        match input {
            Input::Message {
                from,
                message: ConsensusMessage::StagePreCommit(pre_commit),
            } => self.on_pre_commit(from, pre_commit),
            Input::Message {
                from,
                message: ConsensusMessage::StagePostCommit(post_commit),
            } => self.on_post_commit(from, post_commit),
            Input::Message {
                from,
                message: ConsensusMessage::ProblemReport(report),
            } => {
                if self.state == CommitActorState::AwaitingPostCommits {
                    // Past the point of no return: some peers hold the
                    // batch as committed already. The reporter discarded
                    // its staging and will fall behind.
                    return self.finalize_incomplete(format!(
                        "participant {from} dropped out post-commit: \"{}\"",
                        report.explain
                    ));
                }
                let explain = format!(
                    "participant {from} declined with \"{}\"",
                    report.explain
                );
                self.problem = Some(report);
                // The sender already knows; tell everyone else.
                let mut outbound =
                    self.abort(ProblemCode::ResponseNotAccepted, explain);
                outbound.retain(|out| out.to != from);
                outbound
            }
            Input::Message { from, message } => {
                warn!(thid = %self.thid, %from, kind = message.type_name(),
                    "unexpected message during commit round, ignored");
                Vec::new()
            }
            Input::Timeout => match self.state {
                CommitActorState::AwaitingPostCommits => {
                    let missing: Vec<String> = self
                        .others()
                        .into_iter()
                        .filter(|did| !self.witnesses.contains_key(did))
                        .collect();
                    self.finalize_incomplete(format!(
                        "post-commits missing from [{}]",
                        missing.join(",")
                    ))
                }
                _ => {
                    let missing: Vec<String> = self
                        .others()
                        .into_iter()
                        .filter(|did| !self.pre_commits.contains_key(did))
                        .collect();
                    self.abort(
                        ProblemCode::RequestProcessingError,
                        format!("participants [{}] unreachable", missing.join(",")),
                    )
                }
            },
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            CommitActorState::Done | CommitActorState::Aborted
        )
    }

    fn phase(&self) -> &'static str {
        match self.state {
            CommitActorState::Idle => "idle",
            CommitActorState::Proposed => "proposed",
            CommitActorState::AwaitingPreCommits => "awaiting-pre-commits",
            CommitActorState::Committing => "committing",
            CommitActorState::AwaitingPostCommits => "awaiting-post-commits",
            CommitActorState::Done => "done",
            CommitActorState::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitParticipantState {
    Idle,
    ValidatedPropose,
    PreCommitted,
    AwaitingCommit,
    PostCommitted,
    Done,
    Aborted,
}

/// Participant side of the four-stage commit.
pub struct CommitParticipant {
    me: String,
    my_verkey: String,
    crypto: Arc<dyn Crypto>,
    resolver: Arc<dyn DidResolver>,
    actor: String,
    participants: Vec<String>,
    thid: String,
    ledger: Microledger,
    hash: String,
    last_pre_commit: Option<StagePreCommit>,
    commit_payload: Option<Value>,
    certificate: Option<Vec<SignatureEnvelope>>,
    committed: Option<CommittedBatch>,
    state: CommitParticipantState,
    problem: Option<ProblemReport>,
}

impl CommitParticipant {
    /// Validate an inbound `stage-propose`, restage its batch locally
    /// and answer with a pre-commit over the recomputed hash. On any
    /// failure the machine starts out aborted with the problem report as
    /// its only outbound message.
    pub fn accept(
        me: &str,
        my_verkey: &str,
        crypto: Arc<dyn Crypto>,
        resolver: Arc<dyn DidResolver>,
        actor: &str,
        propose: StagePropose,
        ledger: Microledger,
    ) -> (Self, Vec<Outbound>) {
        let thid = propose.thread.thid.clone();
        let mut participant = Self {
            me: me.to_string(),
            my_verkey: my_verkey.to_string(),
            crypto,
            resolver,
            actor: actor.to_string(),
            participants: propose.participants.clone(),
            thid,
            ledger,
            hash: String::new(),
            last_pre_commit: None,
            commit_payload: None,
            certificate: None,
            committed: None,
            state: CommitParticipantState::Idle,
            problem: None,
        };

        match participant.validate_and_stage(&propose) {
            Err((code, explain)) => {
                let outbound = participant.abort(code, explain);
                (participant, outbound)
            }
            Ok(pre_commit) => {
                info!(thid = %participant.thid, ledger = %participant.ledger.name(),
                    "propose validated, pre-commit sent");
                participant.state = CommitParticipantState::PreCommitted;
                let outbound = vec![Outbound {
                    to: participant.actor.clone(),
                    message: ConsensusMessage::StagePreCommit(pre_commit.clone()),
                }];
                participant.last_pre_commit = Some(pre_commit);
                participant.state = CommitParticipantState::AwaitingCommit;
                (participant, outbound)
            }
        }
    }

    fn validate_and_stage(
        &mut self,
        propose: &StagePropose,
    ) -> Result<StagePreCommit, (ProblemCode, String)> {
        let reject = |explain: String| (ProblemCode::RequestNotAccepted, explain);

        propose.validate().map_err(|e| reject(e.to_string()))?;
        if !propose.participants.iter().any(|did| did == &self.me) {
            return Err(reject(format!("{} is not a participant", self.me)));
        }
        if !propose.participants.iter().any(|did| did == &self.actor) {
            return Err(reject(format!(
                "sender {} is not a participant",
                self.actor
            )));
        }
        self.state = CommitParticipantState::ValidatedPropose;

        // Restage locally: seqNos must continue our committed size and
        // the recomputed snapshot must reproduce the proposed hash. The
        // signature we return witnesses our own recomputation.
        self.ledger
            .stage(&propose.transactions, None)
            .map_err(|e| (ProblemCode::RequestProcessingError, e.to_string()))?;
        let state = self.ledger.state();
        let hash = state.hash();
        if state != propose.state || hash != propose.hash {
            self.ledger.discard_staged();
            return Err((
                ProblemCode::RequestProcessingError,
                format!(
                    "recomputed state diverges from propose (local size {}, proposed size {})",
                    state.size, propose.state.size
                ),
            ));
        }
        self.hash = hash.clone();

        let hash_sig = sign_payload(
            self.crypto.as_ref(),
            &self.my_verkey,
            &Value::String(hash.clone()),
        )
        .map_err(|e| (ProblemCode::RequestProcessingError, e.to_string()))?;
        Ok(StagePreCommit {
            id: new_message_id(),
            thread: Thread {
                thid: self.thid.clone(),
            },
            hash,
            hash_sig,
            extra: Default::default(),
        })
    }

    fn abort(&mut self, code: ProblemCode, explain: String) -> Vec<Outbound> {
        warn!(thid = %self.thid, %explain, "commit round aborted");
        self.ledger.discard_staged();
        let report = ProblemReport::new(&self.thid, code, explain);
        if self.problem.is_none() {
            self.problem = Some(report.clone());
        }
        self.state = CommitParticipantState::Aborted;
        vec![Outbound {
            to: self.actor.clone(),
            message: ConsensusMessage::ProblemReport(report),
        }]
    }

    pub fn thid(&self) -> &str {
        &self.thid
    }

    pub fn ledger_name(&self) -> &str {
        self.ledger.name()
    }

    pub fn state(&self) -> CommitParticipantState {
        self.state
    }

    pub fn problem_report(&self) -> Option<&ProblemReport> {
        self.problem.as_ref()
    }

    /// The quorum certificate received from the actor, if the round got
    /// that far.
    pub fn certificate(&self) -> Option<&[SignatureEnvelope]> {
        self.certificate.as_deref()
    }

    pub fn take_committed(&mut self) -> Option<CommittedBatch> {
        self.committed.take()
    }

    pub fn into_ledger(self) -> Microledger {
        self.ledger
    }

    fn on_commit(&mut self, commit: StageCommit) -> Vec<Outbound> {
        if self.state != CommitParticipantState::AwaitingCommit {
            return Vec::new();
        }
        match self.verify_commit(&commit) {
            Err(explain) => self.abort(ProblemCode::ResponseNotAccepted, explain),
            Ok(payload) => {
                // Promote first, then witness: the signature states that
                // this peer holds the batch as committed.
                let transactions = self.ledger.commit_staged();
                info!(thid = %self.thid, ledger = %self.ledger.name(),
                    count = transactions.len(), "batch committed");
                self.committed = Some(CommittedBatch {
                    transactions,
                    root_hash: self.ledger.root_hash(),
                });

                let witness =
                    match sign_payload(self.crypto.as_ref(), &self.my_verkey, &payload) {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            // Already committed; failing to witness is
                            // local-fatal, not a distributed abort.
                            warn!(thid = %self.thid, error = %e,
                                "failed to sign commit witness");
                            self.state = CommitParticipantState::Done;
                            return Vec::new();
                        }
                    };
                self.commit_payload = Some(payload);
                self.state = CommitParticipantState::PostCommitted;
                vec![Outbound {
                    to: self.actor.clone(),
                    message: ConsensusMessage::StagePostCommit(StagePostCommit {
                        id: new_message_id(),
                        thread: Thread {
                            thid: self.thid.clone(),
                        },
                        commits: vec![witness],
                        extra: Default::default(),
                    }),
                }]
            }
        }
    }

    fn verify_commit(&self, commit: &StageCommit) -> Result<Value, String> {
        commit.validate().map_err(|e| e.to_string())?;

        let mut expected = self.participants.clone();
        expected.sort_unstable();
        let mut actual = commit.participants.clone();
        actual.sort_unstable();
        if expected != actual {
            return Err("non-consistent participants".to_string());
        }

        let payload = commit
            .signable_payload()
            .map_err(|e| format!("unencodable commit payload: {e}"))?;
        let actor_verkey = self
            .resolver
            .verkey_of(&self.actor)
            .ok_or_else(|| format!("no verkey known for {}", self.actor))?;
        let Some(commit_sig) = &commit.commit_sig else {
            return Err("commit without outer signature".to_string());
        };
        let verified = verify_envelope(self.crypto.as_ref(), commit_sig, &actor_verkey)
            .map_err(|e| format!("actor commit signature did not verify: {e}"))?;
        if verified.payload != payload {
            return Err("actor signed a different commit payload".to_string());
        }

        // Our own and the actor's pre-commit must be enclosed, and every
        // enclosed pre-commit must cover the hash we recomputed.
        for required in [&self.me, &self.actor] {
            if !commit.pre_commits.contains_key(required) {
                return Err(format!("commit lacks pre-commit of {required}"));
            }
        }
        for (did, envelope) in &commit.pre_commits {
            let verkey = self
                .resolver
                .verkey_of(did)
                .ok_or_else(|| format!("no verkey known for {did}"))?;
            let verified = verify_envelope(self.crypto.as_ref(), envelope, &verkey)
                .map_err(|e| format!("pre-commit of {did} did not verify: {e}"))?;
            if verified.payload != Value::String(self.hash.clone()) {
                return Err(format!("pre-commit of {did} covers a different hash"));
            }
        }
        Ok(payload)
    }

    fn on_aggregated_post_commit(&mut self, aggregated: StagePostCommit) -> Vec<Outbound> {
        if self.state != CommitParticipantState::PostCommitted {
            return Vec::new();
        }
        let Some(payload) = self.commit_payload.clone() else {
            self.state = CommitParticipantState::Done;
            return Vec::new();
        };

        // Already committed: an incomplete certificate is logged, never
        // rolled back.
        let mut verified_all = true;
        for did in &self.participants {
            let Some(verkey) = self.resolver.verkey_of(did) else {
                verified_all = false;
                break;
            };
            let found = aggregated.commits.iter().any(|env| {
                env.signer == verkey
                    && verify_envelope(self.crypto.as_ref(), env, &verkey)
                        .map(|v| v.payload == payload)
                        .unwrap_or(false)
            });
            if !found {
                verified_all = false;
                break;
            }
        }
        if verified_all {
            self.certificate = Some(aggregated.commits);
        } else {
            warn!(thid = %self.thid,
                "aggregated post-commit is not a complete quorum certificate");
        }
        self.state = CommitParticipantState::Done;
        Vec::new()
    }
}

impl ProtocolMachine for CommitParticipant {
    fn handle(&mut self, input: Input) -> Vec<Outbound> {
        if self.is_terminal() {
            return Vec::new();
        }
        match input {
            Input::Message {
                from,
                message: ConsensusMessage::StagePropose(_),
            } if from == self.actor => {
                // Duplicate propose on the same thread: resend the
                // stored pre-commit, do not stage twice.
                match &self.last_pre_commit {
                    Some(pre_commit) => vec![Outbound {
                        to: self.actor.clone(),
                        message: ConsensusMessage::StagePreCommit(pre_commit.clone()),
                    }],
                    None => Vec::new(),
                }
            }
            Input::Message {
                from,
                message: ConsensusMessage::StageCommit(commit),
            } if from == self.actor => self.on_commit(commit),
            Input::Message {
                from,
                message: ConsensusMessage::StagePostCommit(aggregated),
            } if from == self.actor => self.on_aggregated_post_commit(aggregated),
            Input::Message {
                from,
                message: ConsensusMessage::ProblemReport(report),
            } if from == self.actor => {
                warn!(thid = %self.thid, code = %report.problem_code,
                    explain = %report.explain, "actor aborted commit round");
                if self.state == CommitParticipantState::PostCommitted {
                    // The batch is already durable here; a late report
                    // cannot roll it back.
                    self.state = CommitParticipantState::Done;
                } else {
                    self.problem = Some(report);
                    self.ledger.discard_staged();
                    self.state = CommitParticipantState::Aborted;
                }
                Vec::new()
            }
            Input::Message { from, message } => {
                warn!(thid = %self.thid, %from, kind = message.type_name(),
                    "unexpected message during commit round, ignored");
                Vec::new()
            }
            Input::Timeout => match self.state {
                CommitParticipantState::PostCommitted => {
                    // Commit already durable; the certificate is
                    // derivable from our own record.
                    warn!(thid = %self.thid,
                        "aggregated post-commit never arrived, keeping commit");
                    self.state = CommitParticipantState::Done;
                    Vec::new()
                }
                _ => self.abort(
                    ProblemCode::RequestProcessingError,
                    format!(
                        "commit awaiting terminated by timeout for actor {}",
                        self.actor
                    ),
                ),
            },
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            CommitParticipantState::Done | CommitParticipantState::Aborted
        )
    }

    fn phase(&self) -> &'static str {
        match self.state {
            CommitParticipantState::Idle => "idle",
            CommitParticipantState::ValidatedPropose => "validated-propose",
            CommitParticipantState::PreCommitted => "pre-committed",
            CommitParticipantState::AwaitingCommit => "awaiting-commit",
            CommitParticipantState::PostCommitted => "post-committed",
            CommitParticipantState::Done => "done",
            CommitParticipantState::Aborted => "aborted",
        }
    }
}
