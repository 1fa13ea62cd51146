// =============================================================================
// Conflux Matrix Sync Engine - Notification Data
// =============================================================================
//
// Project: Conflux - Matrix Sync Read Path Engine
// License: Apache 2.0 / MIT
//
// Description:
//   Per-(user, room) unread counters maintained by the push evaluator,
//   positioned on their own stream clock so count-only changes can wake a
//   sync.
//
// =============================================================================

use std::collections::{BTreeMap, HashMap};

use ruma::{OwnedRoomId, RoomId, UserId};
use serde::{Deserialize, Serialize};

use crate::{
    database::{tables, KeyValueDatabase},
    service::sync::{
        token::{StreamKind, StreamPosition},
        Membership, SyncSnapshot, UnreadNotificationCounts,
    },
    Error, Result,
};

#[derive(Serialize, Deserialize)]
struct NotificationRow {
    notification_count: u64,
    highlight_count: u64,
    position: StreamPosition,
}

fn userroomid(user_id: &UserId, room_id: &RoomId) -> Vec<u8> {
    let mut key = user_id.as_bytes().to_vec();
    key.push(0xff);
    key.extend_from_slice(room_id.as_bytes());
    key
}

impl KeyValueDatabase {
    #[tracing::instrument(skip(self))]
    pub fn upsert_notification_counts(
        &self,
        user_id: &UserId,
        room_id: &RoomId,
        notification_count: u64,
        highlight_count: u64,
    ) -> Result<StreamPosition> {
        let position = self.next_position(StreamKind::NotificationData)?;
        let row = NotificationRow {
            notification_count,
            highlight_count,
            position,
        };

        self.userroomid_notificationdata.insert(
            &userroomid(user_id, room_id),
            &serde_json::to_vec(&row).expect("NotificationRow::to_vec always works"),
        )?;

        Ok(position)
    }
}

impl SyncSnapshot<'_> {
    /// Unread counts for the given rooms; rooms without recorded counts
    /// are absent.
    #[tracing::instrument(skip(self, room_ids))]
    pub fn select_unread_counts_for_rooms(
        &self,
        user_id: &UserId,
        room_ids: &[OwnedRoomId],
    ) -> Result<BTreeMap<OwnedRoomId, UnreadNotificationCounts>> {
        let mut counts = BTreeMap::new();

        for room_id in room_ids {
            let Some(bytes) = self
                .kv
                .get(tables::USERROOMID_NOTIFICATIONDATA, &userroomid(user_id, room_id))?
            else {
                continue;
            };
            let row: NotificationRow = serde_json::from_slice(&bytes)
                .map_err(|_| Error::bad_database("Invalid notification row in db."))?;

            counts.insert(
                room_id.clone(),
                UnreadNotificationCounts {
                    notification_count: row.notification_count,
                    highlight_count: row.highlight_count,
                },
            );
        }

        Ok(counts)
    }

    /// Convenience over the membership map: counts for the joined rooms
    /// only, as the response assembler wants them.
    pub fn user_unread_counts_for_joined_rooms(
        &self,
        user_id: &UserId,
        rooms: &HashMap<OwnedRoomId, Membership>,
    ) -> Result<BTreeMap<OwnedRoomId, UnreadNotificationCounts>> {
        let joined: Vec<OwnedRoomId> = rooms
            .iter()
            .filter(|(_, membership)| **membership == Membership::Join)
            .map(|(room_id, _)| room_id.clone())
            .collect();

        self.select_unread_counts_for_rooms(user_id, &joined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;
    use ruma::{room_id, user_id};

    #[test]
    fn latest_counts_win_and_scope_to_requested_rooms() {
        let db = KeyValueDatabase::load_or_create(&Config::default()).unwrap();
        let alice = user_id!("@alice:test");
        let room = room_id!("!room:test");
        let other = room_id!("!other:test");

        db.upsert_notification_counts(alice, room, 3, 1).unwrap();
        db.upsert_notification_counts(alice, room, 5, 2).unwrap();
        db.upsert_notification_counts(alice, other, 7, 0).unwrap();

        let snapshot = db.sync_snapshot().unwrap();
        let counts = snapshot
            .select_unread_counts_for_rooms(alice, &[room.to_owned()])
            .unwrap();

        assert_eq!(counts.len(), 1);
        assert_eq!(
            counts[room],
            UnreadNotificationCounts {
                notification_count: 5,
                highlight_count: 2,
            }
        );
    }

    #[test]
    fn joined_rooms_filter_drops_left_rooms() {
        let db = KeyValueDatabase::load_or_create(&Config::default()).unwrap();
        let alice = user_id!("@alice:test");
        let room = room_id!("!room:test");
        let left = room_id!("!left:test");

        db.upsert_notification_counts(alice, room, 1, 0).unwrap();
        db.upsert_notification_counts(alice, left, 9, 9).unwrap();

        let mut rooms = HashMap::new();
        rooms.insert(room.to_owned(), Membership::Join);
        rooms.insert(left.to_owned(), Membership::Leave);

        let snapshot = db.sync_snapshot().unwrap();
        let counts = snapshot
            .user_unread_counts_for_joined_rooms(alice, &rooms)
            .unwrap();
        assert_eq!(counts.len(), 1);
        assert!(counts.contains_key(room));
    }
}
