//! Initialize-ledger protocol: unanimous agreement on the genesis of a
//! new microledger.
//!
//! The actor installs the genesis locally, sends `initialize-request` to
//! every participant and collects one signature per participant over the
//! shared `ledger~hash`. Unanimity commits; any dissent, timeout or
//! problem report aborts, and an aborting peer deletes the ledger it
//! created so no one is left with a half-agreed genesis.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::crypto::{Crypto, DidResolver, SignatureEnvelope, sign_payload, verify_envelope};
use crate::error::{ConsensusError, ProblemCode};
use crate::ledger::Microledger;
use crate::machine::{Input, Outbound, ProtocolMachine, multicast};
use crate::messages::{
    Ack, ConsensusMessage, HashDescriptor, InitializeRequest, InitializeResponse,
    LedgerDescriptor, ProblemReport, Thread, new_message_id,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitActorState {
    Idle,
    Proposed,
    AwaitingResponses,
    Verifying,
    Committed,
    Aborted,
}

/// Actor side of the genesis protocol.
pub struct InitActor {
    me: String,
    crypto: Arc<dyn Crypto>,
    resolver: Arc<dyn DidResolver>,
    participants: Vec<String>,
    thid: String,
    request: InitializeRequest,
    collected: BTreeMap<String, SignatureEnvelope>,
    state: InitActorState,
    problem: Option<ProblemReport>,
}

impl InitActor {
    /// Build the `initialize-request` from a ledger that already holds
    /// its genesis block and address it to every other participant.
    pub fn start(
        me: &str,
        my_verkey: &str,
        crypto: Arc<dyn Crypto>,
        resolver: Arc<dyn DidResolver>,
        ledger: &Microledger,
        participants: Vec<String>,
        timeout_sec: u64,
    ) -> Result<(Self, Vec<Outbound>), ConsensusError> {
        if participants.len() < 2 {
            return Err(ConsensusError::TooFewParticipants);
        }
        if !participants.iter().any(|did| did == me) {
            return Err(ConsensusError::NotAParticipant(me.to_string()));
        }

        let thid = format!("simple-consensus-init-{}", Uuid::new_v4().simple());
        let descriptor = LedgerDescriptor {
            name: ledger.name().to_string(),
            root_hash: ledger.root_hash(),
            genesis: ledger.committed_transactions().to_vec(),
            extra: Default::default(),
        };
        let ledger_hash = HashDescriptor::of(&descriptor)?;
        let signature = sign_payload(
            crypto.as_ref(),
            my_verkey,
            &serde_json::to_value(&ledger_hash)?,
        )?;

        let mut request = InitializeRequest {
            id: new_message_id(),
            thread: Thread { thid: thid.clone() },
            participants: participants.clone(),
            timeout_sec,
            ledger: descriptor,
            ledger_hash,
            signatures: Vec::new(),
            extra: Default::default(),
        };
        request.add_signature(me, signature);

        let mut actor = Self {
            me: me.to_string(),
            crypto,
            resolver,
            participants,
            thid,
            request,
            collected: BTreeMap::new(),
            state: InitActorState::Idle,
            problem: None,
        };
        actor.state = InitActorState::Proposed;
        let outbound = multicast(
            actor.others(),
            ConsensusMessage::InitializeRequest(actor.request.clone()),
        );
        actor.state = InitActorState::AwaitingResponses;
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
        &self.request.ledger.name
    }

    pub fn state(&self) -> InitActorState {
        self.state
    }

    pub fn problem_report(&self) -> Option<&ProblemReport> {
        self.problem.as_ref()
    }

    /// All collected signatures over the `ledger~hash`, own included.
    pub fn signatures(&self) -> &BTreeMap<String, SignatureEnvelope> {
        &self.collected
    }

    fn abort(&mut self, explain: String, recipients: Vec<String>) -> Vec<Outbound> {
        warn!(thid = %self.thid, %explain, "genesis aborted");
        let report = ProblemReport::new(&self.thid, ProblemCode::ResponseNotAccepted, explain);
        // A report received from a peer stays the authoritative cause.
        if self.problem.is_none() {
            self.problem = Some(report.clone());
        }
        self.state = InitActorState::Aborted;
        multicast(recipients, ConsensusMessage::ProblemReport(report))
    }

    fn on_response(&mut self, from: String, response: InitializeResponse) -> Vec<Outbound> {
        if !self.participants.contains(&from) || from == self.me {
            warn!(thid = %self.thid, %from, "initialize-response from non-participant");
            return Vec::new();
        }
        if self.collected.contains_key(&from) {
            // Replay of an already-processed response.
            return Vec::new();
        }

        self.state = InitActorState::Verifying;
        let verdict = self.verify_response(&from, &response);
        match verdict {
            Err(explain) => self.abort(explain, self.others()),
            Ok(signature) => {
                self.collected.insert(from, signature);
                if self.collected.len() == self.others().len() {
                    info!(thid = %self.thid, ledger = %self.ledger_name(),
                        "all participants accepted genesis");
                    self.state = InitActorState::Committed;
                    multicast(
                        self.others(),
                        ConsensusMessage::Ack(Ack::ok(&self.thid)),
                    )
                } else {
                    self.state = InitActorState::AwaitingResponses;
                    Vec::new()
                }
            }
        }
    }

    fn verify_response(
        &self,
        from: &str,
        response: &InitializeResponse,
    ) -> Result<SignatureEnvelope, String> {
        if response.ledger_hash != self.request.ledger_hash {
            return Err(format!("divergent ledger~hash from {from}"));
        }
        let entry = response
            .signature_of(from)
            .ok_or_else(|| format!("no signature from {from} in response"))?;
        let verkey = self
            .resolver
            .verkey_of(from)
            .ok_or_else(|| format!("no verkey known for {from}"))?;
        let verified = verify_envelope(self.crypto.as_ref(), &entry.signature, &verkey)
            .map_err(|e| format!("signature of {from} did not verify: {e}"))?;
        let expected: Value = serde_json::to_value(&self.request.ledger_hash)
            .map_err(|e| format!("unencodable ledger~hash: {e}"))?;
        if verified.payload != expected {
            return Err(format!("{from} signed a different ledger~hash"));
        }
        Ok(entry.signature.clone())
    }
}

impl ProtocolMachine for InitActor {
    fn handle(&mut self, input: Input) -> Vec<Outbound> {
        if self.is_terminal() {
            return Vec::new();
        }
        match input {
            Input::Message {
                from,
                message: ConsensusMessage::InitializeResponse(response),
            } => self.on_response(from, response),
            Input::Message {
                from,
                message: ConsensusMessage::ProblemReport(report),
            } => {
                let remaining: Vec<String> =
                    self.others().into_iter().filter(|did| did != &from).collect();
                let explain = format!(
                    "participant {from} declined genesis: \"{}\"",
                    report.explain
                );
                self.problem = Some(report);
                self.abort(explain, remaining)
            }
            Input::Message { from, message } => {
                warn!(thid = %self.thid, %from, kind = message.type_name(),
                    "unexpected message during genesis, ignored");
                Vec::new()
            }
            Input::Timeout => {
                let missing: Vec<String> = self
                    .others()
                    .into_iter()
                    .filter(|did| !self.collected.contains_key(did))
                    .collect();
                self.abort(
                    format!("genesis timed out waiting for [{}]", missing.join(",")),
                    self.others(),
                )
            }
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            InitActorState::Committed | InitActorState::Aborted
        )
    }

    fn phase(&self) -> &'static str {
        match self.state {
            InitActorState::Idle => "idle",
            InitActorState::Proposed => "proposed",
            InitActorState::AwaitingResponses => "awaiting-responses",
            InitActorState::Verifying => "verifying",
            InitActorState::Committed => "committed",
            InitActorState::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitParticipantState {
    Idle,
    ReceivedPropose,
    Verifying,
    Responded,
    AwaitingAck,
    Committed,
    Aborted,
}

/// Participant side of the genesis protocol. Holds the freshly created
/// ledger until the actor's ack arrives; an abort drops it.
pub struct InitParticipant {
    me: String,
    actor: String,
    thid: String,
    participants: Vec<String>,
    ledger: Option<Microledger>,
    last_response: Option<InitializeResponse>,
    state: InitParticipantState,
    problem: Option<ProblemReport>,
}

impl InitParticipant {
    /// Validate an inbound `initialize-request` and answer it. On any
    /// validation failure the machine starts out aborted and the single
    /// outbound message is the problem report.
    pub fn accept(
        me: &str,
        my_verkey: &str,
        crypto: &dyn Crypto,
        resolver: &dyn DidResolver,
        actor: &str,
        request: InitializeRequest,
        ledger_exists: bool,
    ) -> (Self, Vec<Outbound>) {
        let thid = request.thread.thid.clone();
        let mut participant = Self {
            me: me.to_string(),
            actor: actor.to_string(),
            thid,
            participants: request.participants.clone(),
            ledger: None,
            last_response: None,
            state: InitParticipantState::ReceivedPropose,
            problem: None,
        };

        participant.state = InitParticipantState::Verifying;
        match participant.validate_and_build(my_verkey, crypto, resolver, &request, ledger_exists)
        {
            Err((code, explain)) => {
                let outbound = participant.abort(code, explain);
                (participant, outbound)
            }
            Ok((ledger, response)) => {
                info!(thid = %participant.thid, ledger = %ledger.name(),
                    "genesis accepted, awaiting ack");
                participant.ledger = Some(ledger);
                participant.state = InitParticipantState::Responded;
                let outbound = vec![Outbound {
                    to: participant.actor.clone(),
                    message: ConsensusMessage::InitializeResponse(response.clone()),
                }];
                participant.last_response = Some(response);
                participant.state = InitParticipantState::AwaitingAck;
                (participant, outbound)
            }
        }
    }

    fn validate_and_build(
        &self,
        my_verkey: &str,
        crypto: &dyn Crypto,
        resolver: &dyn DidResolver,
        request: &InitializeRequest,
        ledger_exists: bool,
    ) -> Result<(Microledger, InitializeResponse), (ProblemCode, String)> {
        let reject = |explain: String| (ProblemCode::RequestNotAccepted, explain);

        request.validate().map_err(|e| reject(e.to_string()))?;
        if !request.participants.iter().any(|did| did == &self.me) {
            return Err(reject(format!("{} is not a participant", self.me)));
        }
        if !request.participants.iter().any(|did| did == &self.actor) {
            return Err(reject(format!("sender {} is not a participant", self.actor)));
        }
        if ledger_exists {
            return Err(reject(format!(
                "ledger '{}' already exists",
                request.ledger.name
            )));
        }

        // The actor's signature must cover the ledger~hash we recompute,
        // not merely the one the message states.
        let recomputed = HashDescriptor::of(&request.ledger)
            .map_err(|e| (ProblemCode::RequestProcessingError, e.to_string()))?;
        if recomputed != request.ledger_hash {
            return Err((
                ProblemCode::RequestProcessingError,
                "ledger~hash does not recompute from the ledger object".to_string(),
            ));
        }
        let actor_entry = request
            .signatures
            .iter()
            .find(|s| s.participant == self.actor)
            .ok_or_else(|| reject(format!("no signature from actor {}", self.actor)))?;
        let actor_verkey = resolver
            .verkey_of(&self.actor)
            .ok_or_else(|| reject(format!("no verkey known for {}", self.actor)))?;
        let verified = verify_envelope(crypto, &actor_entry.signature, &actor_verkey)
            .map_err(|e| reject(format!("actor signature did not verify: {e}")))?;
        let expected = serde_json::to_value(&recomputed)
            .map_err(|e| (ProblemCode::RequestProcessingError, e.to_string()))?;
        if verified.payload != expected {
            return Err(reject("actor signed a different ledger~hash".to_string()));
        }

        let mut ledger = Microledger::new(&request.ledger.name);
        ledger
            .reset(request.ledger.genesis.clone())
            .map_err(|e| (ProblemCode::RequestProcessingError, e.to_string()))?;
        if ledger.root_hash() != request.ledger.root_hash {
            return Err((
                ProblemCode::RequestProcessingError,
                "root_hash does not recompute from genesis".to_string(),
            ));
        }

        let my_signature = sign_payload(crypto, my_verkey, &expected)
            .map_err(|e| (ProblemCode::RequestProcessingError, e.to_string()))?;
        let mut response = InitializeResponse::from_request(request);
        response.add_signature(&self.me, my_signature);
        Ok((ledger, response))
    }

    fn abort(&mut self, code: ProblemCode, explain: String) -> Vec<Outbound> {
        warn!(thid = %self.thid, %explain, "genesis declined");
        let report = ProblemReport::new(&self.thid, code, explain);
        self.problem = Some(report.clone());
        self.ledger = None;
        self.state = InitParticipantState::Aborted;
        vec![Outbound {
            to: self.actor.clone(),
            message: ConsensusMessage::ProblemReport(report),
        }]
    }

    pub fn state(&self) -> InitParticipantState {
        self.state
    }

    pub fn thid(&self) -> &str {
        &self.thid
    }

    pub fn problem_report(&self) -> Option<&ProblemReport> {
        self.problem.as_ref()
    }

    /// Participant set fixed by the request, actor included.
    pub fn participants(&self) -> &[String] {
        &self.participants
    }

    /// The agreed ledger, available once the machine committed.
    pub fn into_ledger(self) -> Option<Microledger> {
        self.ledger
    }

    pub fn ledger(&self) -> Option<&Microledger> {
        self.ledger.as_ref()
    }
}

impl ProtocolMachine for InitParticipant {
    fn handle(&mut self, input: Input) -> Vec<Outbound> {
        if self.is_terminal() {
            return Vec::new();
        }
        match input {
            Input::Message {
                from,
                message: ConsensusMessage::InitializeRequest(_),
            } if from == self.actor => {
                // Duplicate propose on the same thread: resend, do not
                // re-stage.
                match &self.last_response {
                    Some(response) => vec![Outbound {
                        to: self.actor.clone(),
                        message: ConsensusMessage::InitializeResponse(response.clone()),
                    }],
                    None => Vec::new(),
                }
            }
            Input::Message {
                from,
                message: ConsensusMessage::Ack(_),
            } if from == self.actor => {
                info!(thid = %self.thid, "genesis committed");
                self.state = InitParticipantState::Committed;
                Vec::new()
            }
            Input::Message {
                from,
                message: ConsensusMessage::ProblemReport(report),
            } if from == self.actor => {
                warn!(thid = %self.thid, code = %report.problem_code,
                    explain = %report.explain, "actor aborted genesis");
                self.problem = Some(report);
                self.ledger = None;
                self.state = InitParticipantState::Aborted;
                Vec::new()
            }
            Input::Message { from, message } => {
                warn!(thid = %self.thid, %from, kind = message.type_name(),
                    "unexpected message during genesis, ignored");
                Vec::new()
            }
            Input::Timeout => {
                self.abort(
                    ProblemCode::RequestProcessingError,
                    format!("ack awaiting terminated by timeout for actor {}", self.actor),
                )
            }
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            InitParticipantState::Committed | InitParticipantState::Aborted
        )
    }

    fn phase(&self) -> &'static str {
        match self.state {
            InitParticipantState::Idle => "idle",
            InitParticipantState::ReceivedPropose => "received-propose",
            InitParticipantState::Verifying => "verifying",
            InitParticipantState::Responded => "responded",
            InitParticipantState::AwaitingAck => "awaiting-ack",
            InitParticipantState::Committed => "committed",
            InitParticipantState::Aborted => "aborted",
        }
    }
}
