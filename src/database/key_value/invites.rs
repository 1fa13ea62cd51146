// =============================================================================
// Conflux Matrix Sync Engine - Invites
// =============================================================================
//
// Project: Conflux - Matrix Sync Read Path Engine
// License: Apache 2.0 / MIT
//
// Description:
//   Invite log on its own stream clock. Invites arrive over federation
//   before the user is in the room, so they are tracked separately from
//   room state: one live row per (user, room), retired in place when the
//   invite is answered or withdrawn.
//
// =============================================================================

use std::collections::BTreeMap;

use ruma::{OwnedRoomId, RoomId, UserId};
use serde::{Deserialize, Serialize};

use crate::{
    database::{tables, KeyValueDatabase},
    service::sync::{
        token::{Range, StreamKind, StreamPosition},
        SyncSnapshot,
    },
    utils, Error, PduEvent, Result,
};

#[derive(Serialize, Deserialize)]
struct InviteRow {
    event: PduEvent,
    retired: bool,
}

fn userroomid(user_id: &UserId, room_id: &RoomId) -> Vec<u8> {
    let mut key = user_id.as_bytes().to_vec();
    key.push(0xff);
    key.extend_from_slice(room_id.as_bytes());
    key
}

impl KeyValueDatabase {
    fn replace_invite_row(
        &self,
        user_id: &UserId,
        room_id: &RoomId,
        row: &InviteRow,
    ) -> Result<StreamPosition> {
        let index_key = userroomid(user_id, room_id);
        if let Some(old_id) = self.userroomid_inviteid.get(&index_key)? {
            let mut old_key = user_id.as_bytes().to_vec();
            old_key.push(0xff);
            old_key.extend_from_slice(&old_id);
            self.userinviteid_invite.remove(&old_key)?;
        }

        let position = self.next_position(StreamKind::Invite)?;
        let mut key = user_id.as_bytes().to_vec();
        key.push(0xff);
        key.extend_from_slice(&position.to_be_bytes());

        self.userinviteid_invite.insert(
            &key,
            &serde_json::to_vec(row).expect("InviteRow::to_vec always works"),
        )?;
        self.userroomid_inviteid
            .insert(&index_key, &position.to_be_bytes())?;

        Ok(position)
    }

    /// Stores a deliverable invite for the event's target user.
    #[tracing::instrument(skip(self, invite_event))]
    pub fn add_invite(&self, invite_event: &PduEvent) -> Result<StreamPosition> {
        let target = invite_event
            .state_key
            .as_deref()
            .and_then(|state_key| UserId::parse(state_key.to_owned()).ok())
            .ok_or(Error::BadRequest("Invite event has no target user."))?;

        self.replace_invite_row(
            &target,
            &invite_event.room_id,
            &InviteRow {
                event: invite_event.clone(),
                retired: false,
            },
        )
    }

    /// Marks the user's invite to `room_id` as retired, so clients drop
    /// it. No-op without a live invite.
    #[tracing::instrument(skip(self))]
    pub fn retire_invite(
        &self,
        user_id: &UserId,
        room_id: &RoomId,
    ) -> Result<Option<StreamPosition>> {
        let Some(old_id) = self.userroomid_inviteid.get(&userroomid(user_id, room_id))? else {
            return Ok(None);
        };

        let mut old_key = user_id.as_bytes().to_vec();
        old_key.push(0xff);
        old_key.extend_from_slice(&old_id);
        let Some(bytes) = self.userinviteid_invite.get(&old_key)? else {
            return Ok(None);
        };
        let mut row: InviteRow = serde_json::from_slice(&bytes)
            .map_err(|_| Error::bad_database("Invalid invite row in db."))?;
        if row.retired {
            return Ok(None);
        }
        row.retired = true;

        self.replace_invite_row(user_id, room_id, &row).map(Some)
    }
}

impl SyncSnapshot<'_> {
    /// Invite changes for one window: rooms with a fresh deliverable
    /// invite, rooms whose invite was retired, and the highest invite
    /// position seen (or the window's lower bound when quiet).
    #[tracing::instrument(skip(self))]
    pub fn select_invite_events_in_range(
        &self,
        user_id: &UserId,
        range: Range,
    ) -> Result<(
        BTreeMap<OwnedRoomId, PduEvent>,
        BTreeMap<OwnedRoomId, PduEvent>,
        StreamPosition,
    )> {
        let mut prefix = user_id.as_bytes().to_vec();
        prefix.push(0xff);

        let mut added = BTreeMap::new();
        let mut retired = BTreeMap::new();
        let mut max_position = range.low();

        for (key, value) in self
            .kv
            .scan_prefix(tables::USERINVITEID_INVITE, prefix.clone())
        {
            let position = utils::u64_from_bytes(&key[prefix.len()..])
                .map_err(|_| Error::bad_database("Invalid invite id bytes in db."))?;
            if position <= range.low() || position > range.high() {
                continue;
            }

            let row: InviteRow = serde_json::from_slice(&value)
                .map_err(|_| Error::bad_database("Invalid invite row in db."))?;

            max_position = max_position.max(position);
            let room_id = row.event.room_id.clone();
            if row.retired {
                added.remove(&room_id);
                retired.insert(room_id, row.event);
            } else {
                retired.remove(&room_id);
                added.insert(room_id, row.event);
            }
        }

        Ok((added, retired, max_position))
    }
}
