use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;

use microledger_consensus::api::{AcceptAll, ConsensusApi, LedgerFilter};
use microledger_consensus::crypto::{Keyring, StaticResolver, sign_payload};
use microledger_consensus::error::{ConsensusError, ProblemCode};
use microledger_consensus::events::{BroadcastEventBus, ConsensusEvent};
use microledger_consensus::init_ledger::{
    InitActor, InitActorState, InitParticipant, InitParticipantState,
};
use microledger_consensus::ledger::{Microledger, Transaction};
use microledger_consensus::machine::{Input, ProtocolMachine};
use microledger_consensus::messages::{
    ConsensusMessage, HashDescriptor, InitializeRequest, LedgerDescriptor, Thread,
    new_message_id,
};
use microledger_consensus::service::ConsensusService;
use microledger_consensus::storage::{InMemoryLedgerStorage, LedgerStorage};
use microledger_consensus::transport::{ChannelNetwork, ChannelTransport};

const DID_A: &str = "did:peer:alice";
const DID_B: &str = "did:peer:bob";
const DID_C: &str = "did:peer:carol";

type Service = ConsensusService<InMemoryLedgerStorage, ChannelTransport, BroadcastEventBus>;

fn txn(id: u64) -> Transaction {
    Transaction::from_value(json!({ "id": id })).expect("object")
}

fn three_peers() -> (Vec<(Arc<Keyring>, String)>, Arc<StaticResolver>) {
    let mut resolver = StaticResolver::new();
    let peers = [DID_A, DID_B, DID_C]
        .iter()
        .map(|did| {
            let keyring = Keyring::new();
            let verkey = keyring.generate();
            resolver.register(did, &verkey);
            (Arc::new(keyring), verkey)
        })
        .collect();
    (peers, Arc::new(resolver))
}

async fn make_services() -> Vec<Service> {
    let (peers, resolver) = three_peers();
    let network = ChannelNetwork::new();
    let mut services = Vec::new();
    for (did, (keyring, _)) in [DID_A, DID_B, DID_C].into_iter().zip(peers) {
        let transport = Arc::new(network.join(did).await);
        let service = ConsensusService::new(
            did,
            keyring,
            Arc::clone(&resolver) as Arc<dyn microledger_consensus::crypto::DidResolver>,
            Arc::new(InMemoryLedgerStorage::new()),
            transport,
            BroadcastEventBus::default(),
        )
        .expect("service");
        let _router = service.start();
        services.push(service);
    }
    services
}

async fn wait_event(
    rx: &mut broadcast::Receiver<ConsensusEvent>,
    pred: impl Fn(&ConsensusEvent) -> bool,
) -> ConsensusEvent {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("event within deadline")
}

#[tokio::test]
async fn happy_genesis_across_three_peers() {
    let services = make_services().await;
    let participants: Vec<String> =
        vec![DID_A.to_string(), DID_B.to_string(), DID_C.to_string()];

    let mut events_b = services[1].subscribe_to_events();
    let mut events_c = services[2].subscribe_to_events();
    for service in &services[1..] {
        service.register_inbound_handler(LedgerFilter::Any, Arc::new(AcceptAll));
    }

    services[0]
        .initialize_ledger("L", participants, vec![txn(1)], 5)
        .await
        .expect("genesis should reach unanimity");

    wait_event(&mut events_b, |e| {
        matches!(e, ConsensusEvent::LedgerInitialized { ledger, .. } if ledger == "L")
    })
    .await;
    wait_event(&mut events_c, |e| {
        matches!(e, ConsensusEvent::LedgerInitialized { ledger, .. } if ledger == "L")
    })
    .await;

    let mut hasher = Sha256::new();
    hasher.update([0x00]);
    hasher.update(br#"{"id":1,"txnMetadata":{"seqNo":1}}"#);
    let expected_root = hex::encode(hasher.finalize());

    for service in &services {
        let state = service.ledger_state("L").expect("ledger exists");
        assert_eq!(state.size, 1);
        assert_eq!(state.seq_no, 1);
        assert_eq!(state.root_hash, expected_root);
    }
}

#[tokio::test]
async fn genesis_is_refused_without_a_handler() {
    let services = make_services().await;
    let participants: Vec<String> =
        vec![DID_A.to_string(), DID_B.to_string(), DID_C.to_string()];
    // Nobody registered a handler, so every participant stays silent and
    // the actor times out.
    let err = services[0]
        .initialize_ledger("L", participants, vec![txn(1)], 2)
        .await
        .expect_err("no participant can respond");
    assert!(matches!(err, ConsensusError::Terminated { .. }));
    assert!(!services[0].storage().is_exists("L"));
}

/// Builds the request a correct actor would send, then tampers the
/// stated root hash while keeping `ledger~hash` and the signature
/// consistent with the tampered object.
fn tampered_request(keyring: &Keyring, actor_verkey: &str) -> InitializeRequest {
    let mut ledger = Microledger::new("L");
    let genesis = ledger.reset(vec![txn(1)]).expect("genesis");
    let mut root_hash = ledger.root_hash();
    root_hash.replace_range(0..2, if root_hash.starts_with("00") { "01" } else { "00" });

    let descriptor = LedgerDescriptor {
        name: "L".to_string(),
        root_hash,
        genesis,
        extra: Default::default(),
    };
    let ledger_hash = HashDescriptor::of(&descriptor).expect("hash");
    let signature = sign_payload(
        keyring,
        actor_verkey,
        &serde_json::to_value(&ledger_hash).expect("value"),
    )
    .expect("sign");

    let mut request = InitializeRequest {
        id: new_message_id(),
        thread: Thread {
            thid: "init-tampered".to_string(),
        },
        participants: vec![DID_A.to_string(), DID_B.to_string(), DID_C.to_string()],
        timeout_sec: 5,
        ledger: descriptor,
        ledger_hash,
        signatures: Vec::new(),
        extra: Default::default(),
    };
    request.add_signature(DID_A, signature);
    request
}

#[tokio::test]
async fn divergent_genesis_root_aborts_everywhere() {
    let (peers, resolver) = three_peers();
    let request = tampered_request(&peers[0].0, &peers[0].1);

    // Both acceptors reject with a processing error and keep no ledger.
    let mut reports = Vec::new();
    for (index, did) in [(1usize, DID_B), (2usize, DID_C)] {
        let (participant, outbound) = InitParticipant::accept(
            did,
            &peers[index].1,
            peers[index].0.as_ref(),
            resolver.as_ref(),
            DID_A,
            request.clone(),
            false,
        );
        assert_eq!(participant.state(), InitParticipantState::Aborted);
        assert!(participant.ledger().is_none());
        let report = participant.problem_report().expect("problem").clone();
        assert_eq!(report.problem_code, ProblemCode::RequestProcessingError);
        assert_eq!(outbound.len(), 1);
        reports.push(report);
    }

    // The actor folds the first report into its own abort.
    let mut ledger = Microledger::new("L");
    ledger.reset(vec![txn(1)]).expect("genesis");
    let (mut actor, _) = InitActor::start(
        DID_A,
        &peers[0].1,
        peers[0].0.clone(),
        resolver.clone(),
        &ledger,
        vec![DID_A.to_string(), DID_B.to_string(), DID_C.to_string()],
        5,
    )
    .expect("actor starts");
    let outbound = actor.handle(Input::Message {
        from: DID_B.to_string(),
        message: ConsensusMessage::ProblemReport(reports[0].clone()),
    });
    assert_eq!(actor.state(), InitActorState::Aborted);
    // The remaining peer gets told, the reporter does not.
    assert_eq!(outbound.len(), 1);
    assert_eq!(outbound[0].to, DID_C);
}

#[tokio::test]
async fn duplicate_request_is_answered_idempotently() {
    let (peers, resolver) = three_peers();
    let mut ledger = Microledger::new("L");
    ledger.reset(vec![txn(1)]).expect("genesis");
    let (_, outbound) = InitActor::start(
        DID_A,
        &peers[0].1,
        peers[0].0.clone(),
        resolver.clone(),
        &ledger,
        vec![DID_A.to_string(), DID_B.to_string()],
        5,
    )
    .expect("actor starts");
    let ConsensusMessage::InitializeRequest(request) = outbound[0].message.clone() else {
        panic!("first outbound must be the request");
    };

    let (mut participant, first) = InitParticipant::accept(
        DID_B,
        &peers[1].1,
        peers[1].0.as_ref(),
        resolver.as_ref(),
        DID_A,
        request.clone(),
        false,
    );
    assert_eq!(participant.state(), InitParticipantState::AwaitingAck);

    let replayed = participant.handle(Input::Message {
        from: DID_A.to_string(),
        message: ConsensusMessage::InitializeRequest(request),
    });
    assert_eq!(replayed.len(), 1);
    assert_eq!(
        first[0].message.encode().expect("encode"),
        replayed[0].message.encode().expect("encode"),
        "the stored response is resent verbatim"
    );
}

#[tokio::test]
async fn outsider_request_is_not_accepted() {
    let (peers, resolver) = three_peers();
    let mut ledger = Microledger::new("L");
    ledger.reset(vec![txn(1)]).expect("genesis");
    let (_, outbound) = InitActor::start(
        DID_A,
        &peers[0].1,
        peers[0].0.clone(),
        resolver.clone(),
        &ledger,
        // Carol is not invited.
        vec![DID_A.to_string(), DID_B.to_string()],
        5,
    )
    .expect("actor starts");
    let ConsensusMessage::InitializeRequest(request) = outbound[0].message.clone() else {
        panic!("first outbound must be the request");
    };

    let (participant, _) = InitParticipant::accept(
        DID_C,
        &peers[2].1,
        peers[2].0.as_ref(),
        resolver.as_ref(),
        DID_A,
        request,
        false,
    );
    assert_eq!(participant.state(), InitParticipantState::Aborted);
    assert_eq!(
        participant.problem_report().expect("problem").problem_code,
        ProblemCode::RequestNotAccepted
    );
}

#[tokio::test]
async fn actor_timeout_aborts_and_notifies_everyone() {
    let (peers, resolver) = three_peers();
    let mut ledger = Microledger::new("L");
    ledger.reset(vec![txn(1)]).expect("genesis");
    let (mut actor, _) = InitActor::start(
        DID_A,
        &peers[0].1,
        peers[0].0.clone(),
        resolver.clone(),
        &ledger,
        vec![DID_A.to_string(), DID_B.to_string(), DID_C.to_string()],
        5,
    )
    .expect("actor starts");

    let outbound = actor.handle(Input::Timeout);
    assert_eq!(actor.state(), InitActorState::Aborted);
    assert_eq!(outbound.len(), 2);
    for out in outbound {
        assert!(matches!(out.message, ConsensusMessage::ProblemReport(_)));
    }
}
