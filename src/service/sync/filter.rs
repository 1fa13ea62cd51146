// =============================================================================
// Conflux Matrix Sync Engine - Request Filters
// =============================================================================
//
// Project: Conflux - Matrix Sync Read Path Engine
// License: Apache 2.0 / MIT
//
// Description:
//   Per-request filter vocabulary applied by the event store: event types
//   (with `*` wildcards), senders, rooms, URL presence and limits.
//
// =============================================================================

use ruma::{OwnedRoomId, OwnedUserId, RoomId, UserId};
use serde::Deserialize;

use crate::PduEvent;

fn default_limit() -> usize {
    20
}

/// Filter for positioned, non-room streams (account data, presence).
#[derive(Clone, Debug, Deserialize)]
pub struct EventFilter {
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Allowlist; `None` admits every type.
    #[serde(default)]
    pub types: Option<Vec<String>>,
    #[serde(default)]
    pub not_types: Vec<String>,
    #[serde(default)]
    pub senders: Option<Vec<OwnedUserId>>,
    #[serde(default)]
    pub not_senders: Vec<OwnedUserId>,
}

impl Default for EventFilter {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            types: None,
            not_types: Vec::new(),
            senders: None,
            not_senders: Vec::new(),
        }
    }
}

impl EventFilter {
    pub fn type_allowed(&self, event_type: &str) -> bool {
        if self.not_types.iter().any(|t| wildcard_matches(t, event_type)) {
            return false;
        }

        match &self.types {
            Some(types) => types.iter().any(|t| wildcard_matches(t, event_type)),
            None => true,
        }
    }

    pub fn sender_allowed(&self, sender: &UserId) -> bool {
        if self.not_senders.iter().any(|s| s == sender) {
            return false;
        }

        match &self.senders {
            Some(senders) => senders.iter().any(|s| s == sender),
            None => true,
        }
    }
}

/// Filter for room timeline queries.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RoomEventFilter {
    #[serde(flatten)]
    pub base: EventFilter,
    #[serde(default)]
    pub rooms: Option<Vec<OwnedRoomId>>,
    #[serde(default)]
    pub not_rooms: Vec<OwnedRoomId>,
    /// `Some(true)` keeps only events carrying a content `url`,
    /// `Some(false)` only events without one.
    #[serde(default)]
    pub contains_url: Option<bool>,
}

impl RoomEventFilter {
    pub fn limit(&self) -> usize {
        self.base.limit
    }

    pub fn room_allowed(&self, room_id: &RoomId) -> bool {
        if self.not_rooms.iter().any(|r| r == room_id) {
            return false;
        }

        match &self.rooms {
            Some(rooms) => rooms.iter().any(|r| r == room_id),
            None => true,
        }
    }

    pub fn matches(&self, pdu: &PduEvent) -> bool {
        if !self.base.type_allowed(&pdu.kind.to_string()) {
            return false;
        }
        if !self.base.sender_allowed(&pdu.sender) {
            return false;
        }
        if !self.room_allowed(&pdu.room_id) {
            return false;
        }
        if let Some(contains_url) = self.contains_url {
            if pdu.contains_url() != contains_url {
                return false;
            }
        }

        true
    }
}

/// Filter for state queries: types and state keys only, no limit.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct StateFilter {
    #[serde(default)]
    pub types: Option<Vec<String>>,
    #[serde(default)]
    pub not_types: Vec<String>,
    #[serde(default)]
    pub senders: Option<Vec<OwnedUserId>>,
    #[serde(default)]
    pub not_senders: Vec<OwnedUserId>,
    #[serde(default)]
    pub contains_url: Option<bool>,
}

impl StateFilter {
    pub fn matches(&self, pdu: &PduEvent) -> bool {
        let event_type = pdu.kind.to_string();
        if self.not_types.iter().any(|t| wildcard_matches(t, &event_type)) {
            return false;
        }
        if let Some(types) = &self.types {
            if !types.iter().any(|t| wildcard_matches(t, &event_type)) {
                return false;
            }
        }
        if self.not_senders.iter().any(|s| s == &pdu.sender) {
            return false;
        }
        if let Some(senders) = &self.senders {
            if !senders.iter().any(|s| s == &pdu.sender) {
                return false;
            }
        }
        if let Some(contains_url) = self.contains_url {
            if pdu.contains_url() != contains_url {
                return false;
            }
        }

        true
    }
}

/// Matrix filter patterns treat `*` as "any sequence of characters".
fn wildcard_matches(pattern: &str, value: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == value;
    }

    let mut remainder = value;
    let mut parts = pattern.split('*');

    if let Some(first) = parts.next() {
        let Some(rest) = remainder.strip_prefix(first) else {
            return false;
        };
        remainder = rest;
    }

    let mut parts = parts.peekable();
    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            // Last fragment anchors at the end.
            return part.is_empty() || remainder.ends_with(part);
        }
        match remainder.find(part) {
            Some(index) => remainder = &remainder[index + part.len()..],
            None => return false,
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_matching() {
        assert!(wildcard_matches("m.room.*", "m.room.message"));
        assert!(wildcard_matches("*", "anything"));
        assert!(wildcard_matches("m.*.member", "m.room.member"));
        assert!(!wildcard_matches("m.room.*", "m.presence"));
        assert!(!wildcard_matches("m.room.message", "m.room.message2"));
    }

    #[test]
    fn not_types_overrides_types() {
        let filter = EventFilter {
            types: Some(vec!["m.room.*".to_owned()]),
            not_types: vec!["m.room.message".to_owned()],
            ..Default::default()
        };
        assert!(filter.type_allowed("m.room.topic"));
        assert!(!filter.type_allowed("m.room.message"));
        assert!(!filter.type_allowed("m.presence"));
    }

    #[test]
    fn filters_deserialize_from_request_json() {
        let filter: RoomEventFilter = serde_json::from_str(
            r#"{"limit": 5, "types": ["m.room.message"], "contains_url": true}"#,
        )
        .unwrap();
        assert_eq!(filter.limit(), 5);
        assert_eq!(filter.contains_url, Some(true));

        let state: StateFilter =
            serde_json::from_str(r#"{"not_types": ["m.room.member"]}"#).unwrap();
        assert_eq!(state.not_types.len(), 1);
    }
}
