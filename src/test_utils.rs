// =============================================================================
// Conflux Matrix Sync Engine - Test Utilities
// =============================================================================
//
// Project: Conflux - Matrix Sync Read Path Engine
// License: Apache 2.0 / MIT
//
// Description:
//   PDU constructors for tests. Not part of the stable API.
//
// =============================================================================

use ruma::{events::TimelineEventType, EventId, OwnedEventId, RoomId, UInt, UserId};
use serde_json::value::RawValue as RawJsonValue;

use crate::PduEvent;

fn raw(json: &str) -> Box<RawJsonValue> {
    RawJsonValue::from_string(json.to_owned()).expect("test json is valid")
}

fn owned_event_id(event_id: &str) -> OwnedEventId {
    EventId::parse(event_id).expect("test event id is valid")
}

/// A plain `m.room.message` event.
pub fn message_pdu(
    room_id: &RoomId,
    sender: &UserId,
    depth: u64,
    event_id: &str,
    body: &str,
) -> PduEvent {
    PduEvent {
        event_id: owned_event_id(event_id),
        room_id: room_id.to_owned(),
        sender: sender.to_owned(),
        origin_server_ts: UInt::from(1u32),
        kind: TimelineEventType::RoomMessage,
        content: raw(&serde_json::json!({ "msgtype": "m.text", "body": body }).to_string()),
        state_key: None,
        prev_events: Vec::new(),
        depth: UInt::try_from(depth).expect("test depth fits"),
        redacts: None,
        unsigned: None,
    }
}

/// A state event of arbitrary type and content.
pub fn state_pdu(
    room_id: &RoomId,
    sender: &UserId,
    depth: u64,
    event_id: &str,
    event_type: &str,
    state_key: &str,
    content: &str,
) -> PduEvent {
    PduEvent {
        event_id: owned_event_id(event_id),
        room_id: room_id.to_owned(),
        sender: sender.to_owned(),
        origin_server_ts: UInt::from(1u32),
        kind: TimelineEventType::from(event_type.to_owned()),
        content: raw(content),
        state_key: Some(state_key.to_owned()),
        prev_events: Vec::new(),
        depth: UInt::try_from(depth).expect("test depth fits"),
        redacts: None,
        unsigned: None,
    }
}

/// An `m.room.member` event for `target`, with the previous membership in
/// `unsigned.prev_content` when given.
pub fn member_pdu(
    room_id: &RoomId,
    sender: &UserId,
    target: &UserId,
    depth: u64,
    event_id: &str,
    membership: &str,
    prev_membership: Option<&str>,
) -> PduEvent {
    let mut pdu = state_pdu(
        room_id,
        sender,
        depth,
        event_id,
        "m.room.member",
        target.as_str(),
        &serde_json::json!({ "membership": membership }).to_string(),
    );
    pdu.unsigned = prev_membership.map(|prev| {
        raw(
            &serde_json::json!({ "prev_content": { "membership": prev } })
                .to_string(),
        )
    });
    pdu
}
