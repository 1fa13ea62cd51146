// =============================================================================
// Conflux Matrix Sync Engine - Snapshot Session
// =============================================================================
//
// Project: Conflux - Matrix Sync Read Path Engine
// License: Apache 2.0 / MIT
//
// Description:
//   The sync transaction: a read-consistent view across all eight streams,
//   exposing the query vocabulary the delta and pagination engines are
//   built on. One session lives for one request and is released on
//   completion, success or not.
//
// =============================================================================

pub mod deltas;
pub mod filter;
pub mod pagination;
pub mod token;

use std::{fmt, sync::Arc};

use ruma::{
    events::room::member::MembershipState, OwnedDeviceId, OwnedEventId, OwnedRoomId, OwnedUserId,
};
use serde::{Deserialize, Serialize};

use crate::{
    database::{abstraction::KvSnapshot, tables, KeyValueDatabase},
    Error, PduEvent, Result,
};
use self::token::{StreamKind, StreamPosition, SyncToken};

/// A user's relationship to a room. `Peek` is a server-side
/// pseudo-membership for non-members subscribed to a world-readable room;
/// it never appears in the room DAG.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Membership {
    Join,
    Invite,
    Leave,
    Ban,
    Knock,
    Peek,
}

impl Membership {
    pub fn as_str(&self) -> &'static str {
        match self {
            Membership::Join => "join",
            Membership::Invite => "invite",
            Membership::Leave => "leave",
            Membership::Ban => "ban",
            Membership::Knock => "knock",
            Membership::Peek => "peek",
        }
    }

    /// Maps the protocol-level membership. Unknown (custom) states map to
    /// `None` and are ignored by the delta engine.
    pub fn from_state(state: &MembershipState) -> Option<Self> {
        Some(match state {
            MembershipState::Join => Membership::Join,
            MembershipState::Invite => Membership::Invite,
            MembershipState::Leave => Membership::Leave,
            MembershipState::Ban => Membership::Ban,
            MembershipState::Knock => Membership::Knock,
            _ => return None,
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(match bytes {
            b"join" => Membership::Join,
            b"invite" => Membership::Invite,
            b"leave" => Membership::Leave,
            b"ban" => Membership::Ban,
            b"knock" => Membership::Knock,
            b"peek" => Membership::Peek,
            _ => return Err(Error::bad_database("Invalid membership bytes in db.")),
        })
    }
}

impl fmt::Display for Membership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client-side deduplication handle attached to an event by the device
/// that sent it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionId {
    pub session_id: u64,
    pub transaction_id: String,
}

/// The device a sync request is served for. Transaction IDs are only
/// echoed back to the session that created them.
#[derive(Clone, Debug)]
pub struct Device {
    pub user_id: OwnedUserId,
    pub device_id: OwnedDeviceId,
    pub session_id: u64,
}

/// An event bundled with the stream position at which it became visible.
/// Position zero denotes "state as of snapshot open" rather than "event
/// appeared in the window".
#[derive(Clone, Debug)]
pub struct StreamEvent {
    pub pdu: Arc<PduEvent>,
    pub position: StreamPosition,
    pub transaction_id: Option<TransactionId>,
}

/// Per-room diff shipped to the client: "apply these events on top of
/// what you had".
#[derive(Clone, Debug)]
pub struct StateDelta {
    pub room_id: OwnedRoomId,
    pub membership: Membership,
    /// Set when the membership changed inside the window.
    pub membership_pos: Option<StreamPosition>,
    pub state_events: Vec<StreamEvent>,
    pub newly_joined: bool,
}

/// A peek subscription as seen by one sync window.
#[derive(Clone, Debug)]
pub struct Peek {
    pub room_id: OwnedRoomId,
    /// Created or replaced inside the window.
    pub new: bool,
    pub deleted: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutputReceiptEvent {
    pub room_id: OwnedRoomId,
    pub receipt_type: String,
    pub user_id: OwnedUserId,
    pub event_id: OwnedEventId,
    pub origin_server_ts: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SendToDeviceEvent {
    pub sender: OwnedUserId,
    pub event_type: String,
    pub content: serde_json::Value,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadNotificationCounts {
    pub notification_count: u64,
    pub highlight_count: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub user_id: OwnedUserId,
    pub presence: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_msg: Option<String>,
    pub last_active_ts: u64,
    pub currently_active: bool,
    pub stream_position: StreamPosition,
}

/// The sync transaction: a read-consistent view across every stream and
/// index, exposing the queries of the read path. Closed read-only.
/// Dropping the session releases the underlying view, so cancellation
/// (dropping the request future) cannot leak it.
pub struct SyncSnapshot<'a> {
    pub(crate) db: &'a KeyValueDatabase,
    pub(crate) kv: Box<dyn KvSnapshot>,
}

impl KeyValueDatabase {
    #[tracing::instrument(skip(self))]
    pub fn sync_snapshot(&self) -> Result<SyncSnapshot<'_>> {
        Ok(SyncSnapshot {
            db: self,
            kv: self.open_snapshot()?,
        })
    }
}

impl<'a> SyncSnapshot<'a> {
    /// Write no-op; releases the session.
    pub fn commit(self) -> Result<()> {
        Ok(())
    }

    /// Discards the session. Equivalent to dropping it.
    pub fn rollback(self) -> Result<()> {
        Ok(())
    }

    fn max_position_for(&self, kind: StreamKind, context: &'static str) -> Result<StreamPosition> {
        self.kv
            .counter(tables::STREAMKIND_COUNT, kind.as_bytes())
            .map_err(|e| Error::Database(format!("{context}: {e}")))
    }

    pub fn max_position_for_pdus(&self) -> Result<StreamPosition> {
        self.max_position_for(StreamKind::Pdu, "streams.max_position_for_pdus")
    }

    pub fn max_position_for_receipts(&self) -> Result<StreamPosition> {
        self.max_position_for(StreamKind::Receipt, "streams.max_position_for_receipts")
    }

    pub fn max_position_for_invites(&self) -> Result<StreamPosition> {
        self.max_position_for(StreamKind::Invite, "streams.max_position_for_invites")
    }

    pub fn max_position_for_send_to_device(&self) -> Result<StreamPosition> {
        self.max_position_for(
            StreamKind::SendToDevice,
            "streams.max_position_for_send_to_device",
        )
    }

    pub fn max_position_for_account_data(&self) -> Result<StreamPosition> {
        self.max_position_for(
            StreamKind::AccountData,
            "streams.max_position_for_account_data",
        )
    }

    pub fn max_position_for_notification_data(&self) -> Result<StreamPosition> {
        self.max_position_for(
            StreamKind::NotificationData,
            "streams.max_position_for_notification_data",
        )
    }

    pub fn max_position_for_presence(&self) -> Result<StreamPosition> {
        self.max_position_for(StreamKind::Presence, "streams.max_position_for_presence")
    }

    pub fn max_position_for_typing(&self) -> Result<StreamPosition> {
        self.max_position_for(StreamKind::Typing, "streams.max_position_for_typing")
    }

    /// The upper bound of this session on every stream; serialised, this
    /// is the response's *next-since* token.
    #[tracing::instrument(skip(self))]
    pub fn max_positions(&self) -> Result<SyncToken> {
        Ok(SyncToken {
            pdu_position: self.max_position_for_pdus()?,
            receipt_position: self.max_position_for_receipts()?,
            invite_position: self.max_position_for_invites()?,
            send_to_device_position: self.max_position_for_send_to_device()?,
            account_data_position: self.max_position_for_account_data()?,
            notification_data_position: self.max_position_for_notification_data()?,
            presence_position: self.max_position_for_presence()?,
            typing_position: self.max_position_for_typing()?,
        })
    }

    /// Attaches transaction IDs to events sent by `device`. Only called
    /// with a device during incremental sync; elsewhere the events pass
    /// through untouched.
    pub fn stream_events_to_events(
        &self,
        device: Option<&Device>,
        events: Vec<StreamEvent>,
    ) -> Vec<StreamEvent> {
        events
            .into_iter()
            .map(|mut event| {
                if let (Some(device), Some(txn)) = (device, event.transaction_id.as_ref()) {
                    if event.pdu.sender == device.user_id && txn.session_id == device.session_id {
                        if let Ok(pdu) = event.pdu.with_transaction_id(&txn.transaction_id) {
                            event.pdu = Arc::new(pdu);
                        }
                    }
                }
                event
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;

    #[test]
    fn membership_round_trips_through_bytes() {
        for membership in [
            Membership::Join,
            Membership::Invite,
            Membership::Leave,
            Membership::Ban,
            Membership::Knock,
            Membership::Peek,
        ] {
            assert_eq!(
                Membership::from_bytes(membership.as_str().as_bytes()).unwrap(),
                membership
            );
        }
        assert!(Membership::from_bytes(b"lurk").is_err());
    }

    #[test]
    fn snapshot_token_ignores_later_writes() {
        let db = KeyValueDatabase::load_or_create(&Config::default()).unwrap();
        db.next_position(StreamKind::Pdu).unwrap();

        let snapshot = db.sync_snapshot().unwrap();
        let token = snapshot.max_positions().unwrap();
        assert_eq!(token.pdu_position, 1);

        db.next_position(StreamKind::Pdu).unwrap();
        db.next_position(StreamKind::Presence).unwrap();

        // The open session still observes the frozen frontier.
        let again = snapshot.max_positions().unwrap();
        assert_eq!(again, token);

        // A new session observes the writes.
        let later = db.sync_snapshot().unwrap().max_positions().unwrap();
        assert_eq!(later.pdu_position, 2);
        assert_eq!(later.presence_position, 1);
    }
}
