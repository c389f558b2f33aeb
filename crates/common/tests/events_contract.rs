use std::collections::BTreeSet;

use atelier_common::protocol::events::{
    decode_client_event, encode_server_event, ClientEvent, ServerEvent, UsageTimePayload,
};
use atelier_common::usage::{FeatureModule, Session};
use chrono::{Duration, TimeZone, Utc};
use serde_json::{json, Map, Value};
use uuid::Uuid;

fn load_contract() -> Value {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../contracts/realtime-events.json");
    let content = std::fs::read_to_string(path).expect("contract file should be readable");
    serde_json::from_str(&content).expect("contract file should be valid JSON")
}

fn string_set<'a>(contract: &'a Value, key: &str) -> BTreeSet<&'a str> {
    contract[key]
        .as_array()
        .unwrap_or_else(|| panic!("{key} should be an array"))
        .iter()
        .map(|v| v.as_str().expect("entry should be a string"))
        .collect()
}

fn object_keys(value: &Value) -> BTreeSet<String> {
    value.as_object().expect("value should be an object").keys().cloned().collect()
}

#[test]
fn client_event_names_match_contract() {
    let payload = UsageTimePayload { module: FeatureModule::Gallery, socket_id: "tab-1".into() };
    let samples = [
        ClientEvent::Join { tenant_id: Uuid::new_v4(), user_id: Uuid::new_v4() },
        ClientEvent::BroadcastMessage { tenant_id: Uuid::new_v4(), payload: Map::new() },
        ClientEvent::SendDm { recipient_id: Uuid::new_v4(), payload: Map::new() },
        ClientEvent::UsageTimeStart(payload.clone()),
        ClientEvent::UsageTimeEnd(payload),
    ];

    let mut actual = BTreeSet::new();
    for sample in &samples {
        let value = serde_json::to_value(sample).expect("client event should serialize");
        assert_eq!(value["event"], sample.name());
        assert_eq!(object_keys(&value), BTreeSet::from(["data".to_string(), "event".to_string()]));
        actual.insert(sample.name());
    }

    assert_eq!(actual, string_set(&load_contract(), "client_events"));
}

#[test]
fn server_event_names_match_contract() {
    let samples = [
        ServerEvent::ReceiveBroadcast(json!({ "text": "hi" })),
        ServerEvent::ReceiveDm(json!({ "text": "hi" })),
        ServerEvent::Error { code: "AUTH_INVALID_TOKEN".into(), message: "nope".into() },
    ];

    let actual: BTreeSet<String> = samples
        .iter()
        .map(|sample| {
            let encoded = encode_server_event(sample).expect("server event should encode");
            let value: Value = serde_json::from_str(&encoded).expect("encoded event is json");
            value["event"].as_str().expect("event name should be a string").to_string()
        })
        .collect();
    let expected: BTreeSet<String> =
        string_set(&load_contract(), "server_events").into_iter().map(str::to_string).collect();

    assert_eq!(actual, expected);
}

#[test]
fn feature_modules_match_contract() {
    let actual: BTreeSet<&str> = FeatureModule::ALL.iter().map(|module| module.as_str()).collect();
    assert_eq!(actual, string_set(&load_contract(), "feature_modules"));

    for module in FeatureModule::ALL {
        let wire = serde_json::to_value(module).expect("module should serialize");
        assert_eq!(wire, module.as_str());
    }
}

#[test]
fn usage_events_accept_every_contract_module() {
    let contract = load_contract();
    for module in string_set(&contract, "feature_modules") {
        let raw = json!({
            "event": "usage-time-start",
            "data": { "module": module, "socketId": "tab-1" }
        })
        .to_string();
        assert!(decode_client_event(&raw).is_ok(), "module {module} should decode");
    }
}

#[test]
fn session_documents_match_contract() {
    let contract = load_contract();
    let t0 = Utc.with_ymd_and_hms(2026, 3, 14, 9, 0, 0).unwrap();

    let closed = Session::Closed {
        connect_time: t0,
        disconnect_time: t0 + Duration::minutes(5),
        duration_ms: 300_000,
    };
    let merged = Session::Merged {
        connect_time: t0,
        disconnect_time: t0 + Duration::hours(1),
        duration_ms: 3_000,
        merged_count: 3,
    };

    let closed_value = serde_json::to_value(&closed).expect("closed session should serialize");
    let merged_value = serde_json::to_value(&merged).expect("merged session should serialize");

    let expected_closed: BTreeSet<String> =
        string_set(&contract, "session_fields").into_iter().map(str::to_string).collect();
    let expected_merged: BTreeSet<String> =
        string_set(&contract, "merged_session_fields").into_iter().map(str::to_string).collect();

    assert_eq!(object_keys(&closed_value), expected_closed);
    assert_eq!(object_keys(&merged_value), expected_merged);
    assert_eq!(closed_value["duration"], 300_000);
    assert_eq!(merged_value["is_merged"], true);
    assert_eq!(merged_value["merged_count"], 3);
}
