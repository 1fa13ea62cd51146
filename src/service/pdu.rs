// =============================================================================
// Conflux Matrix Sync Engine - PDU
// =============================================================================
//
// Project: Conflux - Matrix Sync Read Path Engine
// License: Apache 2.0 / MIT
//
// Description:
//   The persistent event type flowing through the sync read path, plus the
//   builder used by writers and tests to assemble one.
//
// =============================================================================

use std::collections::BTreeMap;

use ruma::{
    events::{
        room::member::MembershipState, AnySyncStateEvent, AnySyncTimelineEvent, StateEventType,
        TimelineEventType,
    },
    serde::Raw,
    OwnedEventId, OwnedRoomId, OwnedUserId, UInt,
};
use serde::{Deserialize, Serialize};
use serde_json::value::{to_raw_value, RawValue as RawJsonValue};

use crate::{Error, Result};

#[derive(Clone, Deserialize, Serialize, Debug)]
pub struct PduEvent {
    pub event_id: OwnedEventId,
    pub room_id: OwnedRoomId,
    pub sender: OwnedUserId,
    pub origin_server_ts: UInt,
    #[serde(rename = "type")]
    pub kind: TimelineEventType,
    pub content: Box<RawJsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    pub prev_events: Vec<OwnedEventId>,
    pub depth: UInt,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redacts: Option<OwnedEventId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsigned: Option<Box<RawJsonValue>>,
}

#[derive(Deserialize)]
struct MemberContent {
    membership: MembershipState,
}

#[derive(Deserialize)]
struct MemberUnsigned {
    prev_content: Option<MemberContent>,
}

impl PduEvent {
    /// State events are the events that contribute to current room state.
    pub fn is_state(&self) -> bool {
        self.state_key.is_some()
    }

    pub fn state_event_type(&self) -> Option<StateEventType> {
        self.is_state()
            .then(|| StateEventType::from(self.kind.to_string()))
    }

    /// The membership this event carries, if it is an `m.room.member` event
    /// with parseable content.
    pub fn membership(&self) -> Option<MembershipState> {
        if self.kind != TimelineEventType::RoomMember {
            return None;
        }

        serde_json::from_str::<MemberContent>(self.content.get())
            .ok()
            .map(|content| content.membership)
    }

    /// The membership this event replaced, read from `unsigned.prev_content`.
    pub fn prev_membership(&self) -> Option<MembershipState> {
        if self.kind != TimelineEventType::RoomMember {
            return None;
        }

        self.unsigned
            .as_ref()
            .and_then(|unsigned| serde_json::from_str::<MemberUnsigned>(unsigned.get()).ok())
            .and_then(|unsigned| unsigned.prev_content)
            .map(|content| content.membership)
    }

    /// True when the content carries a `url` key, used by filters.
    pub fn contains_url(&self) -> bool {
        serde_json::from_str::<BTreeMap<String, serde_json::Value>>(self.content.get())
            .map(|content| content.contains_key("url"))
            .unwrap_or(false)
    }

    /// Returns a copy with `unsigned.transaction_id` set, so the sending
    /// device can deduplicate its own echo.
    pub fn with_transaction_id(&self, transaction_id: &str) -> Result<PduEvent> {
        let mut unsigned: BTreeMap<String, serde_json::Value> = self
            .unsigned
            .as_ref()
            .map(|unsigned| serde_json::from_str(unsigned.get()))
            .transpose()
            .map_err(|_| Error::bad_database("Invalid unsigned in pdu."))?
            .unwrap_or_default();

        unsigned.insert(
            "transaction_id".to_owned(),
            serde_json::Value::String(transaction_id.to_owned()),
        );

        let mut pdu = self.clone();
        pdu.unsigned = Some(to_raw_value(&unsigned).expect("unsigned is valid json"));
        Ok(pdu)
    }

    pub fn to_sync_room_event(&self) -> Raw<AnySyncTimelineEvent> {
        let mut json = serde_json::json!({
            "content": self.content,
            "type": self.kind,
            "event_id": self.event_id,
            "sender": self.sender,
            "origin_server_ts": self.origin_server_ts,
        });

        if let Some(unsigned) = &self.unsigned {
            json["unsigned"] = serde_json::json!(unsigned);
        }
        if let Some(state_key) = &self.state_key {
            json["state_key"] = serde_json::json!(state_key);
        }
        if let Some(redacts) = &self.redacts {
            json["redacts"] = serde_json::json!(redacts);
        }

        serde_json::from_value(json).expect("Raw::from_value always works")
    }

    pub fn to_sync_state_event(&self) -> Raw<AnySyncStateEvent> {
        let mut json = serde_json::json!({
            "content": self.content,
            "type": self.kind,
            "event_id": self.event_id,
            "sender": self.sender,
            "origin_server_ts": self.origin_server_ts,
            "state_key": self.state_key,
        });

        if let Some(unsigned) = &self.unsigned {
            json["unsigned"] = serde_json::json!(unsigned);
        }

        serde_json::from_value(json).expect("Raw::from_value always works")
    }
}

impl PartialEq for PduEvent {
    fn eq(&self, other: &Self) -> bool {
        self.event_id == other.event_id
    }
}

impl Eq for PduEvent {}

/// Assembles a `PduEvent`. Writers fill in the fields the room DAG
/// determines; the stream position is assigned at append time, not here.
#[derive(Debug, Default)]
pub struct PduBuilder {
    pub event_type: Option<TimelineEventType>,
    pub content: Option<Box<RawJsonValue>>,
    pub unsigned: Option<Box<RawJsonValue>>,
    pub state_key: Option<String>,
    pub redacts: Option<OwnedEventId>,
    pub depth: u64,
    pub prev_events: Vec<OwnedEventId>,
}

impl PduBuilder {
    pub fn build(
        self,
        event_id: OwnedEventId,
        room_id: OwnedRoomId,
        sender: OwnedUserId,
    ) -> Result<PduEvent> {
        Ok(PduEvent {
            event_id,
            room_id,
            sender,
            origin_server_ts: UInt::try_from(crate::utils::millis_since_unix_epoch())
                .map_err(|_| Error::BadRequest("Timestamp out of range"))?,
            kind: self.event_type.ok_or(Error::BadRequest("Missing event type"))?,
            content: self
                .content
                .unwrap_or_else(|| to_raw_value(&serde_json::json!({})).expect("empty object")),
            state_key: self.state_key,
            prev_events: self.prev_events,
            depth: UInt::try_from(self.depth)
                .map_err(|_| Error::BadRequest("Depth out of range"))?,
            redacts: self.redacts,
            unsigned: self.unsigned,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ruma::{event_id, room_id, user_id};

    fn member_pdu(content: &str, unsigned: Option<&str>) -> PduEvent {
        PduEvent {
            event_id: event_id!("$member:test").to_owned(),
            room_id: room_id!("!room:test").to_owned(),
            sender: user_id!("@alice:test").to_owned(),
            origin_server_ts: UInt::from(1u32),
            kind: TimelineEventType::RoomMember,
            content: serde_json::value::RawValue::from_string(content.to_owned()).unwrap(),
            state_key: Some("@alice:test".to_owned()),
            prev_events: Vec::new(),
            depth: UInt::from(1u32),
            redacts: None,
            unsigned: unsigned
                .map(|u| serde_json::value::RawValue::from_string(u.to_owned()).unwrap()),
        }
    }

    #[test]
    fn membership_parses_content() {
        let pdu = member_pdu(r#"{"membership":"join"}"#, None);
        assert_eq!(pdu.membership(), Some(MembershipState::Join));
        assert_eq!(pdu.prev_membership(), None);
    }

    #[test]
    fn prev_membership_reads_unsigned() {
        let pdu = member_pdu(
            r#"{"membership":"leave"}"#,
            Some(r#"{"prev_content":{"membership":"join"}}"#),
        );
        assert_eq!(pdu.membership(), Some(MembershipState::Leave));
        assert_eq!(pdu.prev_membership(), Some(MembershipState::Join));
    }

    #[test]
    fn transaction_id_lands_in_unsigned() {
        let pdu = member_pdu(r#"{"membership":"join"}"#, None);
        let with_txn = pdu.with_transaction_id("m12345").unwrap();
        assert!(with_txn.unsigned.unwrap().get().contains("m12345"));
    }

    #[test]
    fn builder_requires_an_event_type() {
        let built = PduBuilder {
            event_type: Some(TimelineEventType::RoomMessage),
            content: Some(
                serde_json::value::to_raw_value(&serde_json::json!({ "body": "hi" })).unwrap(),
            ),
            depth: 4,
            ..Default::default()
        }
        .build(
            event_id!("$built:test").to_owned(),
            room_id!("!room:test").to_owned(),
            user_id!("@alice:test").to_owned(),
        )
        .unwrap();
        assert_eq!(u64::from(built.depth), 4);
        assert!(!built.is_state());

        assert!(PduBuilder::default()
            .build(
                event_id!("$untyped:test").to_owned(),
                room_id!("!room:test").to_owned(),
                user_id!("@alice:test").to_owned(),
            )
            .is_err());
    }

    #[test]
    fn contains_url_checks_content() {
        let mut pdu = member_pdu(r#"{"url":"mxc://test/abc"}"#, None);
        pdu.kind = TimelineEventType::RoomMessage;
        assert!(pdu.contains_url());
        let plain = member_pdu(r#"{"membership":"join"}"#, None);
        assert!(!plain.contains_url());
    }
}
