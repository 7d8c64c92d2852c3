//! Chat protocol tests
//!
//! Exercise the wire types the way a client and a cross-node fabric would
//! see them.

use lms_chat_shared::{inbox_address, parse_inbound, GroupEvent, OutboundFrame, GROUP_PREFIX};

#[test]
fn test_client_decodes_outbound_frame() {
    let event = GroupEvent::chat_message("see you in the lecture", "prof_smith");
    let text = event.to_outbound().to_json().unwrap();

    let frame: OutboundFrame = serde_json::from_str(&text).unwrap();
    assert_eq!(frame.message, "see you in the lecture");
    assert_eq!(frame.sender, "prof_smith");
}

#[test]
fn test_group_event_crosses_nodes_as_json() {
    // A pub/sub backed fabric ships events between nodes as JSON
    let event = GroupEvent::chat_message("hi", "alice");
    let wire = serde_json::to_string(&event).unwrap();
    let received: GroupEvent = serde_json::from_str(&wire).unwrap();
    assert_eq!(received, event);

    let unknown = serde_json::from_str::<GroupEvent>(r#"{"type":"presence","user":"bob"}"#);
    assert!(unknown.is_err());
}

#[test]
fn test_unicode_content_survives() {
    let inbound = parse_inbound(r#"{"message":"привет 👋 \"quoted\""}"#).unwrap();
    let text = inbound.chat_text().unwrap();
    assert_eq!(text, "привет 👋 \"quoted\"");

    let out = GroupEvent::chat_message(text, "ivan").to_outbound().to_json().unwrap();
    let frame: OutboundFrame = serde_json::from_str(&out).unwrap();
    assert_eq!(frame.message, text);
}

#[test]
fn test_inbox_addresses_are_distinct_per_user() {
    assert!(inbox_address("alice").starts_with(GROUP_PREFIX));
    assert_ne!(inbox_address("alice"), inbox_address("bob"));
    assert_eq!(inbox_address(""), GROUP_PREFIX);
}
