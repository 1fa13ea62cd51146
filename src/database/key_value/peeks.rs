// =============================================================================
// Conflux Matrix Sync Engine - Peeks
// =============================================================================
//
// Project: Conflux - Matrix Sync Read Path Engine
// License: Apache 2.0 / MIT
//
// Description:
//   Server-side peek subscriptions: one live row per (user, device, room),
//   re-keyed on every change so a sync window can tell new peeks from
//   standing ones. Peek rows ride the PDU stream clock, like the events
//   they make visible.
//
// =============================================================================

use std::collections::BTreeMap;

use ruma::{DeviceId, OwnedDeviceId, OwnedRoomId, OwnedUserId, RoomId, UserId};
use serde::{Deserialize, Serialize};

use crate::{
    database::{tables, KeyValueDatabase},
    service::sync::{
        token::{Range, StreamKind, StreamPosition},
        Peek, SyncSnapshot,
    },
    utils, Error, Result,
};

#[derive(Serialize, Deserialize)]
struct PeekRow {
    room_id: OwnedRoomId,
    deleted: bool,
}

fn userdevice_prefix(user_id: &UserId, device_id: &DeviceId) -> Vec<u8> {
    let mut prefix = user_id.as_bytes().to_vec();
    prefix.push(0xff);
    prefix.extend_from_slice(device_id.as_bytes());
    prefix.push(0xff);
    prefix
}

fn userdeviceroomid(user_id: &UserId, device_id: &DeviceId, room_id: &RoomId) -> Vec<u8> {
    let mut key = userdevice_prefix(user_id, device_id);
    key.extend_from_slice(room_id.as_bytes());
    key
}

impl KeyValueDatabase {
    fn replace_peek_row(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        room_id: &RoomId,
        deleted: bool,
    ) -> Result<StreamPosition> {
        let index_key = userdeviceroomid(user_id, device_id, room_id);
        if let Some(old_id) = self.userdeviceroomid_peekid.get(&index_key)? {
            let mut old_key = userdevice_prefix(user_id, device_id);
            old_key.extend_from_slice(&old_id);
            self.userdevicepeekid_peek.remove(&old_key)?;
        }

        let position = self.next_position(StreamKind::Pdu)?;
        let mut key = userdevice_prefix(user_id, device_id);
        key.extend_from_slice(&position.to_be_bytes());

        let row = PeekRow {
            room_id: room_id.to_owned(),
            deleted,
        };
        self.userdevicepeekid_peek.insert(
            &key,
            &serde_json::to_vec(&row).expect("PeekRow::to_vec always works"),
        )?;
        self.userdeviceroomid_peekid
            .insert(&index_key, &position.to_be_bytes())?;

        Ok(position)
    }

    /// Subscribes a non-member device to a world-readable room.
    #[tracing::instrument(skip(self))]
    pub fn create_peek(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        room_id: &RoomId,
    ) -> Result<StreamPosition> {
        self.replace_peek_row(user_id, device_id, room_id, false)
    }

    /// Ends a peek. The tombstone row keeps its own position so windows
    /// spanning the deletion drop the room client-side.
    #[tracing::instrument(skip(self))]
    pub fn delete_peek(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        room_id: &RoomId,
    ) -> Result<StreamPosition> {
        self.replace_peek_row(user_id, device_id, room_id, true)
    }
}

impl SyncSnapshot<'_> {
    /// Peeks visible to one sync window: standing subscriptions from
    /// before the window plus everything that changed inside it, the
    /// latter flagged `new`.
    #[tracing::instrument(skip(self))]
    pub fn select_peeks_in_range(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        range: Range,
    ) -> Result<Vec<Peek>> {
        let prefix = userdevice_prefix(user_id, device_id);

        let mut peeks = Vec::new();
        for (key, value) in self
            .kv
            .scan_prefix(tables::USERDEVICEPEEKID_PEEK, prefix.clone())
        {
            let position = utils::u64_from_bytes(&key[prefix.len()..])
                .map_err(|_| Error::bad_database("Invalid peek id bytes in db."))?;
            let row: PeekRow = serde_json::from_slice(&value)
                .map_err(|_| Error::bad_database("Invalid peek row in db."))?;

            if position <= range.low() {
                if !row.deleted {
                    peeks.push(Peek {
                        room_id: row.room_id,
                        new: false,
                        deleted: false,
                    });
                }
            } else if position <= range.high() {
                peeks.push(Peek {
                    room_id: row.room_id,
                    new: true,
                    deleted: row.deleted,
                });
            }
        }

        Ok(peeks)
    }

    /// Every live peek on the server, grouped by room. Federation uses
    /// this to keep remote peeks renewed.
    pub fn peeking_devices_in_rooms(
        &self,
    ) -> Result<BTreeMap<OwnedRoomId, Vec<(OwnedUserId, OwnedDeviceId)>>> {
        let mut devices: BTreeMap<OwnedRoomId, Vec<(OwnedUserId, OwnedDeviceId)>> =
            BTreeMap::new();

        for (key, value) in self.kv.iter(tables::USERDEVICEPEEKID_PEEK) {
            let row: PeekRow = serde_json::from_slice(&value)
                .map_err(|_| Error::bad_database("Invalid peek row in db."))?;
            if row.deleted {
                continue;
            }

            let mut parts = key.split(|&b| b == 0xff);
            let user_id = UserId::parse(
                utils::string_from_bytes(
                    parts
                        .next()
                        .ok_or_else(|| Error::bad_database("Invalid peek key in db."))?,
                )
                .map_err(|_| Error::bad_database("Invalid user id bytes in db."))?,
            )
            .map_err(|_| Error::bad_database("Invalid user id in db."))?;
            let device_id: OwnedDeviceId = utils::string_from_bytes(
                parts
                    .next()
                    .ok_or_else(|| Error::bad_database("Invalid peek key in db."))?,
            )
            .map_err(|_| Error::bad_database("Invalid device id bytes in db."))?
            .into();

            devices
                .entry(row.room_id)
                .or_default()
                .push((user_id, device_id));
        }

        Ok(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;
    use ruma::{device_id, room_id, user_id};

    #[test]
    fn windows_classify_new_standing_and_deleted_peeks() {
        let db = KeyValueDatabase::load_or_create(&Config::default()).unwrap();
        let alice = user_id!("@alice:test");
        let device = device_id!("PHONE");
        let room = room_id!("!world:test");

        let created_at = db.create_peek(alice, device, room).unwrap();

        let snapshot = db.sync_snapshot().unwrap();

        // Window containing the creation: new.
        let peeks = snapshot
            .select_peeks_in_range(alice, device, Range::new(0, created_at))
            .unwrap();
        assert_eq!(peeks.len(), 1);
        assert!(peeks[0].new);
        assert!(!peeks[0].deleted);

        // Window after the creation: standing.
        let peeks = snapshot
            .select_peeks_in_range(alice, device, Range::new(created_at, created_at + 10))
            .unwrap();
        assert_eq!(peeks.len(), 1);
        assert!(!peeks[0].new);

        // Deletion replaces the row; a window spanning it sees the
        // tombstone.
        let deleted_at = db.delete_peek(alice, device, room).unwrap();
        let snapshot = db.sync_snapshot().unwrap();
        let peeks = snapshot
            .select_peeks_in_range(alice, device, Range::new(created_at, deleted_at))
            .unwrap();
        assert_eq!(peeks.len(), 1);
        assert!(peeks[0].new);
        assert!(peeks[0].deleted);

        // A later window no longer reports the dead peek.
        let peeks = snapshot
            .select_peeks_in_range(alice, device, Range::new(deleted_at, deleted_at + 10))
            .unwrap();
        assert!(peeks.is_empty());
    }

    #[test]
    fn peeking_devices_lists_live_rows_only() {
        let db = KeyValueDatabase::load_or_create(&Config::default()).unwrap();
        let alice = user_id!("@alice:test");
        let room = room_id!("!world:test");

        db.create_peek(alice, device_id!("PHONE"), room).unwrap();
        db.create_peek(alice, device_id!("LAPTOP"), room).unwrap();
        db.delete_peek(alice, device_id!("LAPTOP"), room).unwrap();

        let snapshot = db.sync_snapshot().unwrap();
        let devices = snapshot.peeking_devices_in_rooms().unwrap();
        assert_eq!(devices[room].len(), 1);
        assert_eq!(devices[room][0].1, device_id!("PHONE"));
    }
}
