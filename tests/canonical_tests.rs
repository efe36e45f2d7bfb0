use serde_json::{Value, json};

use microledger_consensus::canonical::{canonical_value_bytes, canonical_value_string};
use microledger_consensus::messages::ConsensusMessage;

#[test]
fn keys_are_sorted_and_whitespace_free() {
    let value = json!({
        "zebra": 1,
        "alpha": {"nested_z": true, "nested_a": [1, 2, 3]},
        "mid": "x"
    });
    assert_eq!(
        canonical_value_string(&value),
        r#"{"alpha":{"nested_a":[1,2,3],"nested_z":true},"mid":"x","zebra":1}"#
    );
}

#[test]
fn scalars_and_escapes() {
    let value = json!({
        "quote": "say \"hi\"",
        "newline": "a\nb",
        "unicode": "héllo",
        "int": 42,
        "neg": -7,
        "null": null,
        "bool": false
    });
    let encoded = canonical_value_string(&value);
    assert_eq!(
        encoded,
        "{\"bool\":false,\"int\":42,\"neg\":-7,\"newline\":\"a\\nb\",\
         \"null\":null,\"quote\":\"say \\\"hi\\\"\",\"unicode\":\"héllo\"}"
    );
}

#[test]
fn encode_decode_reencode_is_fixed_point() {
    let value = json!({
        "b": [{"y": 2, "x": 1}, "s", 0],
        "a": {"k": "v", "t": "tab\there"},
        "n": 12345678901234567890u64
    });
    let first = canonical_value_bytes(&value);
    let reparsed: Value = serde_json::from_slice(&first).expect("canonical output parses");
    let second = canonical_value_bytes(&reparsed);
    assert_eq!(first, second);
}

#[test]
fn canonical_output_is_valid_json() {
    let value = json!({"ctrl": "\u{01}\u{1f}", "tab": "\t"});
    let encoded = canonical_value_bytes(&value);
    let parsed: Value = serde_json::from_slice(&encoded).expect("escapes are standard");
    assert_eq!(parsed, value);
}

#[test]
fn unknown_top_level_keys_survive_decode_encode() {
    let wire = json!({
        "@type": "did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/simple-consensus/1.0/problem_report",
        "@id": "abc-123",
        "~thread": {"thid": "t-1"},
        "problem-code": "request_not_accepted",
        "explain": "nope",
        "x-extension": {"future": true}
    });
    let message =
        ConsensusMessage::decode(&serde_json::to_vec(&wire).expect("encodes")).expect("decodes");
    let reencoded: Value =
        serde_json::from_slice(&message.encode().expect("re-encodes")).expect("parses");
    assert_eq!(reencoded.get("x-extension"), wire.get("x-extension"));
    assert_eq!(reencoded.get("@type"), wire.get("@type"));
    assert_eq!(reencoded.get("problem-code"), wire.get("problem-code"));
}
