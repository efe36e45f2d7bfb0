use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use serde_json::{Value, json};
use sha2::Digest;

use microledger_consensus::canonical::canonical_value_bytes;
use microledger_consensus::crypto::{
    Crypto, Keyring, SIGNATURE_TYPE, SignatureEnvelope, sign_payload, verify_envelope,
};
use microledger_consensus::error::ConsensusError;
use microledger_consensus::messages::{HashDescriptor, LedgerDescriptor};

#[test]
fn sign_verify_round_trip() {
    let keyring = Keyring::new();
    let verkey = keyring.generate();
    let payload = json!({"name": "L", "root_hash": "abc"});

    let envelope = sign_payload(&keyring, &verkey, &payload).expect("sign");
    assert_eq!(envelope.message_type, SIGNATURE_TYPE);
    assert_eq!(envelope.signer, verkey);

    let verified = verify_envelope(&keyring, &envelope, &verkey).expect("verify");
    assert_eq!(verified.payload, payload);
    assert!(!verified.skewed);
    assert!(verified.timestamp > 0);
}

#[test]
fn verification_is_bound_to_the_expected_signer() {
    let keyring = Keyring::new();
    let signer = keyring.generate();
    let someone_else = keyring.generate();
    let envelope = sign_payload(&keyring, &signer, &json!("hash")).expect("sign");

    assert!(matches!(
        verify_envelope(&keyring, &envelope, &someone_else),
        Err(ConsensusError::InvalidSignature(_))
    ));
}

#[test]
fn tampered_sig_data_is_rejected() {
    let keyring = Keyring::new();
    let verkey = keyring.generate();
    let mut envelope = sign_payload(&keyring, &verkey, &json!("original")).expect("sign");

    let mut raw = URL_SAFE.decode(&envelope.sig_data).expect("decode");
    let tampered_payload = canonical_value_bytes(&json!("tampered"));
    raw.truncate(8);
    raw.extend_from_slice(&tampered_payload);
    envelope.sig_data = URL_SAFE.encode(&raw);

    assert!(matches!(
        verify_envelope(&keyring, &envelope, &verkey),
        Err(ConsensusError::InvalidSignature(_))
    ));
}

#[test]
fn ancient_timestamp_is_flagged_not_fatal() {
    let keyring = Keyring::new();
    let verkey = keyring.generate();

    // Handcraft an envelope whose timestamp predates the skew window.
    let payload = json!("hash-under-test");
    let mut sig_data = 1_000u64.to_be_bytes().to_vec();
    sig_data.extend_from_slice(&canonical_value_bytes(&payload));
    let signature = keyring.sign(&verkey, &sig_data).expect("raw sign");
    let envelope = SignatureEnvelope {
        message_type: SIGNATURE_TYPE.to_string(),
        signer: verkey.clone(),
        sig_data: URL_SAFE.encode(&sig_data),
        signature: URL_SAFE.encode(&signature),
    };

    let verified = verify_envelope(&keyring, &envelope, &verkey).expect("verify");
    assert!(verified.skewed);
    assert_eq!(verified.timestamp, 1_000);
    assert_eq!(verified.payload, payload);
}

#[test]
fn truncated_sig_data_is_malformed() {
    let keyring = Keyring::new();
    let verkey = keyring.generate();
    let envelope = SignatureEnvelope {
        message_type: SIGNATURE_TYPE.to_string(),
        signer: verkey.clone(),
        sig_data: URL_SAFE.encode(b"tiny"),
        signature: URL_SAFE.encode([0u8; 64]),
    };
    assert!(matches!(
        verify_envelope(&keyring, &envelope, &verkey),
        Err(ConsensusError::MalformedEnvelope(_))
    ));
}

#[test]
fn ledger_hash_recomputes_deterministically() {
    let descriptor = LedgerDescriptor {
        name: "L".to_string(),
        root_hash: "00ff".to_string(),
        genesis: vec![],
        extra: Default::default(),
    };
    let first = HashDescriptor::of(&descriptor).expect("hash");
    let second = HashDescriptor::of(&descriptor).expect("hash");
    assert_eq!(first, second);
    assert_eq!(first.func, "sha256");

    let mut altered = descriptor;
    altered.root_hash = "00fe".to_string();
    let third = HashDescriptor::of(&altered).expect("hash");
    assert_ne!(first.base58, third.base58);

    // The digest is the SHA-256 of the canonical descriptor encoding.
    let canonical = canonical_value_bytes(&serde_json::to_value(&altered).expect("value"));
    let expected = bs58::encode(sha2::Sha256::digest(&canonical)).into_string();
    assert_eq!(third.base58, expected);
}

#[test]
fn empty_genesis_descriptor_still_encodes_genesis_key() {
    // Guard against the canonicalizer dropping empty collections: the
    // signed bytes must include every present key.
    let descriptor = LedgerDescriptor {
        name: "L".to_string(),
        root_hash: String::new(),
        genesis: vec![],
        extra: Default::default(),
    };
    let value: Value = serde_json::to_value(&descriptor).expect("value");
    let text = String::from_utf8(canonical_value_bytes(&value)).expect("utf8");
    assert_eq!(text, r#"{"genesis":[],"name":"L","root_hash":""}"#);
}
