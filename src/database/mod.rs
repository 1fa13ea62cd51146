// =============================================================================
// Conflux Matrix Sync Engine - Database
// =============================================================================
//
// Project: Conflux - Matrix Sync Read Path Engine
// License: Apache 2.0 / MIT
//
// Description:
//   The storage handle of the sync read path: one tree per index, eight
//   stream counters, and the wakeup primitive the long-poll layer builds
//   on. Writers append through the methods in `key_value`; readers open a
//   `SyncSnapshot` and never touch the trees directly.
//
// =============================================================================

pub mod abstraction;
pub mod key_value;

use std::sync::{Arc, Mutex};

use futures_util::{stream::FuturesUnordered, StreamExt};
use lru_cache::LruCache;
use ruma::{DeviceId, OwnedEventId, UserId};
use tracing::info;

use crate::{
    service::sync::token::{StreamKind, StreamPosition, SyncToken},
    utils, Config, Error, PduEvent, Result,
};
use self::abstraction::{KeyValueDatabaseEngine, KvSnapshot, KvTree};

/// Tree names, shared between the write handles below and snapshot reads.
pub(crate) mod tables {
    pub const STREAMKIND_COUNT: &str = "streamkind_count";

    pub const PDUID_PDU: &str = "pduid_pdu";
    pub const EVENTID_PDUID: &str = "eventid_pduid";
    pub const STREAMID_PDUID: &str = "streamid_pduid";
    pub const PDUID_TXNID: &str = "pduid_txnid";
    pub const EXCLUDEDSYNCPDUIDS: &str = "excludedsyncpduids";

    pub const ROOMSTATEID_PDUID: &str = "roomstateid_pduid";
    pub const USERROOMID_MEMBERSHIP: &str = "userroomid_membership";
    pub const ROOMUSERID_MEMBERSHIP: &str = "roomuserid_membership";

    pub const ROOMTOPOLOGYID_EVENTID: &str = "roomtopologyid_eventid";
    pub const EVENTID_TOPOLOGYID: &str = "eventid_topologyid";
    pub const ROOMEVENTID_BACKWARDEXTREMITY: &str = "roomeventid_backwardextremity";

    pub const RECEIPTID_RECEIPT: &str = "receiptid_receipt";
    pub const ROOMTYPEUSERID_RECEIPTID: &str = "roomtypeuserid_receiptid";
    pub const USERINVITEID_INVITE: &str = "userinviteid_invite";
    pub const USERROOMID_INVITEID: &str = "userroomid_inviteid";
    pub const USERDEVICEPEEKID_PEEK: &str = "userdevicepeekid_peek";
    pub const USERDEVICEROOMID_PEEKID: &str = "userdeviceroomid_peekid";
    pub const TODEVICEID_EVENTS: &str = "todeviceid_events";
    pub const USERACCOUNTDATAID_TYPE: &str = "useraccountdataid_type";
    pub const USERROOMID_NOTIFICATIONDATA: &str = "userroomid_notificationdata";
    pub const USERID_PRESENCE: &str = "userid_presence";
    pub const PRESENCEID_USERID: &str = "presenceid_userid";
}

pub struct KeyValueDatabase {
    _db: Arc<dyn KeyValueDatabaseEngine>,

    /// One big-endian u64 counter per stream; see `StreamKind::as_bytes`.
    pub(crate) streamkind_count: Arc<dyn KvTree>,

    pub(crate) pduid_pdu: Arc<dyn KvTree>, // PduId = RoomId + Count
    pub(crate) eventid_pduid: Arc<dyn KvTree>,
    pub(crate) streamid_pduid: Arc<dyn KvTree>, // Count -> PduId
    pub(crate) pduid_txnid: Arc<dyn KvTree>,    // TxnId = SessionId + TransactionId
    pub(crate) excludedsyncpduids: Arc<dyn KvTree>,

    pub(crate) roomstateid_pduid: Arc<dyn KvTree>, // RoomStateId = RoomId + EventType + StateKey
    pub(crate) userroomid_membership: Arc<dyn KvTree>,
    pub(crate) roomuserid_membership: Arc<dyn KvTree>,

    pub(crate) roomtopologyid_eventid: Arc<dyn KvTree>, // TopologyId = RoomId + Depth + Count
    pub(crate) eventid_topologyid: Arc<dyn KvTree>,     // TopologyId without the room prefix
    pub(crate) roomeventid_backwardextremity: Arc<dyn KvTree>, // RoomId + EventId + PrevEventId

    pub(crate) receiptid_receipt: Arc<dyn KvTree>, // Count -> receipt row
    pub(crate) roomtypeuserid_receiptid: Arc<dyn KvTree>,
    pub(crate) userinviteid_invite: Arc<dyn KvTree>, // InviteId = UserId + Count
    pub(crate) userroomid_inviteid: Arc<dyn KvTree>,
    pub(crate) userdevicepeekid_peek: Arc<dyn KvTree>, // PeekId = UserId + DeviceId + Count
    pub(crate) userdeviceroomid_peekid: Arc<dyn KvTree>,
    pub(crate) todeviceid_events: Arc<dyn KvTree>, // ToDeviceId = UserId + DeviceId + Count
    pub(crate) useraccountdataid_type: Arc<dyn KvTree>, // UserId + Count -> room + data type
    pub(crate) userroomid_notificationdata: Arc<dyn KvTree>,
    pub(crate) userid_presence: Arc<dyn KvTree>,
    pub(crate) presenceid_userid: Arc<dyn KvTree>, // Count -> UserId

    pub(crate) pdu_cache: Mutex<LruCache<OwnedEventId, Arc<PduEvent>>>,
}

impl KeyValueDatabase {
    pub fn load_or_create(config: &Config) -> Result<Self> {
        let builder: Arc<dyn KeyValueDatabaseEngine> = match config.database_backend.as_str() {
            "memory" => Arc::new(abstraction::memory::Engine::open(config)?),
            _ => {
                return Err(Error::BadConfig(
                    "Database backend not found. memory is the only backend built into conflux.",
                ));
            }
        };

        info!(
            backend = %config.database_backend,
            "Opening sync database"
        );

        Ok(Self {
            streamkind_count: builder.open_tree(tables::STREAMKIND_COUNT)?,

            pduid_pdu: builder.open_tree(tables::PDUID_PDU)?,
            eventid_pduid: builder.open_tree(tables::EVENTID_PDUID)?,
            streamid_pduid: builder.open_tree(tables::STREAMID_PDUID)?,
            pduid_txnid: builder.open_tree(tables::PDUID_TXNID)?,
            excludedsyncpduids: builder.open_tree(tables::EXCLUDEDSYNCPDUIDS)?,

            roomstateid_pduid: builder.open_tree(tables::ROOMSTATEID_PDUID)?,
            userroomid_membership: builder.open_tree(tables::USERROOMID_MEMBERSHIP)?,
            roomuserid_membership: builder.open_tree(tables::ROOMUSERID_MEMBERSHIP)?,

            roomtopologyid_eventid: builder.open_tree(tables::ROOMTOPOLOGYID_EVENTID)?,
            eventid_topologyid: builder.open_tree(tables::EVENTID_TOPOLOGYID)?,
            roomeventid_backwardextremity: builder
                .open_tree(tables::ROOMEVENTID_BACKWARDEXTREMITY)?,

            receiptid_receipt: builder.open_tree(tables::RECEIPTID_RECEIPT)?,
            roomtypeuserid_receiptid: builder.open_tree(tables::ROOMTYPEUSERID_RECEIPTID)?,
            userinviteid_invite: builder.open_tree(tables::USERINVITEID_INVITE)?,
            userroomid_inviteid: builder.open_tree(tables::USERROOMID_INVITEID)?,
            userdevicepeekid_peek: builder.open_tree(tables::USERDEVICEPEEKID_PEEK)?,
            userdeviceroomid_peekid: builder.open_tree(tables::USERDEVICEROOMID_PEEKID)?,
            todeviceid_events: builder.open_tree(tables::TODEVICEID_EVENTS)?,
            useraccountdataid_type: builder.open_tree(tables::USERACCOUNTDATAID_TYPE)?,
            userroomid_notificationdata: builder
                .open_tree(tables::USERROOMID_NOTIFICATIONDATA)?,
            userid_presence: builder.open_tree(tables::USERID_PRESENCE)?,
            presenceid_userid: builder.open_tree(tables::PRESENCEID_USERID)?,

            pdu_cache: Mutex::new(LruCache::new(config.pdu_cache_capacity())),

            _db: builder,
        })
    }

    /// Issues the next position on `kind`. Issued positions are never
    /// retracted; a writer that aborts leaves a gap.
    pub fn next_position(&self, kind: StreamKind) -> Result<StreamPosition> {
        utils::u64_from_bytes(&self.streamkind_count.increment(kind.as_bytes())?)
            .map_err(|_| Error::bad_database("Invalid stream counter bytes."))
    }

    /// Maximum position issued so far on `kind`, reflecting every write
    /// committed before this call started.
    pub fn max_position(&self, kind: StreamKind) -> Result<StreamPosition> {
        Ok(match self.streamkind_count.get(kind.as_bytes())? {
            Some(bytes) => utils::u64_from_bytes(&bytes)
                .map_err(|_| Error::bad_database("Invalid stream counter bytes."))?,
            None => 0,
        })
    }

    /// A frozen view across every tree, consistent at one instant.
    pub(crate) fn open_snapshot(&self) -> Result<Box<dyn KvSnapshot>> {
        self._db.snapshot()
    }

    pub fn flush(&self) -> Result<()> {
        self._db.flush()
    }

    pub fn memory_usage(&self) -> Result<String> {
        self._db.memory_usage()
    }

    /// Resolves once something this user/device syncs on has changed:
    /// timeline events in joined rooms, membership, invites, peeks,
    /// account data, notification counts, send-to-device traffic,
    /// receipts or presence. The long-poll layer races this against its
    /// deadline; on deadline it replays the *since* token with empty
    /// results.
    #[tracing::instrument(skip(self))]
    pub async fn watch(&self, user_id: &UserId, device_id: &DeviceId) -> Result<()> {
        let userid_prefix = [user_id.as_bytes(), &[0xff][..]].concat();
        let userdeviceid_prefix = [
            user_id.as_bytes(),
            &[0xff][..],
            device_id.as_bytes(),
            &[0xff][..],
        ]
        .concat();

        let mut futures = FuturesUnordered::new();

        futures.push(self.todeviceid_events.watch_prefix(&userdeviceid_prefix));
        futures.push(self.userdevicepeekid_peek.watch_prefix(&userdeviceid_prefix));
        futures.push(self.userinviteid_invite.watch_prefix(&userid_prefix));
        futures.push(self.userroomid_membership.watch_prefix(&userid_prefix));
        futures.push(self.useraccountdataid_type.watch_prefix(&userid_prefix));
        futures.push(
            self.userroomid_notificationdata
                .watch_prefix(&userid_prefix),
        );

        for room_id in self.rooms_joined(user_id)? {
            let roomid_prefix = [room_id.as_bytes(), &[0xff][..]].concat();
            futures.push(self.pduid_pdu.watch_prefix(&roomid_prefix));
        }

        // Receipts and presence are keyed by position alone, so any write
        // wakes the watcher; the sync pass scopes what is actually sent.
        futures.push(self.receiptid_receipt.watch_prefix(b""));
        futures.push(self.presenceid_userid.watch_prefix(b""));

        futures.next().await;

        Ok(())
    }

    /// Reads the token a response produced against the current frontier
    /// would carry, outside of any snapshot. Only useful for tests and
    /// wakeup short-circuits; sessions read their own token.
    pub fn current_token(&self) -> Result<SyncToken> {
        Ok(SyncToken {
            pdu_position: self.max_position(StreamKind::Pdu)?,
            receipt_position: self.max_position(StreamKind::Receipt)?,
            invite_position: self.max_position(StreamKind::Invite)?,
            send_to_device_position: self.max_position(StreamKind::SendToDevice)?,
            account_data_position: self.max_position(StreamKind::AccountData)?,
            notification_data_position: self.max_position(StreamKind::NotificationData)?,
            presence_position: self.max_position(StreamKind::Presence)?,
            typing_position: self.max_position(StreamKind::Typing)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_backend_is_rejected() {
        let config = Config {
            database_backend: "cuneiform".to_owned(),
            ..Config::default()
        };
        assert!(KeyValueDatabase::load_or_create(&config).is_err());
    }

    #[test]
    fn stream_counters_are_independent() {
        let db = KeyValueDatabase::load_or_create(&Config::default()).unwrap();

        assert_eq!(db.max_position(StreamKind::Pdu).unwrap(), 0);
        assert_eq!(db.next_position(StreamKind::Pdu).unwrap(), 1);
        assert_eq!(db.next_position(StreamKind::Pdu).unwrap(), 2);
        assert_eq!(db.next_position(StreamKind::Receipt).unwrap(), 1);
        assert_eq!(db.max_position(StreamKind::Pdu).unwrap(), 2);
        assert_eq!(db.max_position(StreamKind::Typing).unwrap(), 0);
    }

    #[test]
    fn maintenance_entry_points_pass_through() {
        let db = KeyValueDatabase::load_or_create(&Config::default()).unwrap();
        db.next_position(StreamKind::Pdu).unwrap();

        db.flush().unwrap();
        assert!(db.memory_usage().unwrap().contains("entries"));
    }
}
