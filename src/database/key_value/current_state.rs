// =============================================================================
// Conflux Matrix Sync Engine - Current State Index
// =============================================================================
//
// Project: Conflux - Matrix Sync Read Path Engine
// License: Apache 2.0 / MIT
//
// Description:
//   Per-room (event type, state key) -> latest event projection, with the
//   membership tables as its specialised view. Maintained by `append_pdu`
//   as the deterministic replay of state events in stream order.
//
// =============================================================================

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};

use ruma::{
    events::StateEventType, OwnedEventId, OwnedRoomId, OwnedUserId, RoomId, UserId,
};

use crate::{
    database::{tables, KeyValueDatabase},
    service::sync::{filter::StateFilter, Membership, StreamEvent, SyncSnapshot},
    utils, Error, PduEvent, Result,
};

fn roomstateid(room_id: &RoomId, event_type: &StateEventType, state_key: &str) -> Vec<u8> {
    let mut key = room_id.as_bytes().to_vec();
    key.push(0xff);
    key.extend_from_slice(event_type.to_string().as_bytes());
    key.push(0xff);
    key.extend_from_slice(state_key.as_bytes());
    key
}

fn split_userroomid(key: &[u8]) -> Result<(OwnedUserId, OwnedRoomId)> {
    let separator = key
        .iter()
        .position(|&b| b == 0xff)
        .ok_or_else(|| Error::bad_database("Invalid userroomid key in db."))?;

    let user_id = UserId::parse(
        utils::string_from_bytes(&key[..separator])
            .map_err(|_| Error::bad_database("Invalid user id bytes in db."))?,
    )
    .map_err(|_| Error::bad_database("Invalid user id in db."))?;
    let room_id = RoomId::parse(
        utils::string_from_bytes(&key[separator + 1..])
            .map_err(|_| Error::bad_database("Invalid room id bytes in db."))?,
    )
    .map_err(|_| Error::bad_database("Invalid room id in db."))?;

    Ok((user_id, room_id))
}

impl KeyValueDatabase {
    /// Applies one state event to the projection. Only called from
    /// `append_pdu`, with the writer lock already serialising stream
    /// order.
    pub(crate) fn update_current_state(
        &self,
        pdu: &PduEvent,
        state_key: &str,
        pduid: &[u8],
    ) -> Result<()> {
        let event_type = pdu
            .state_event_type()
            .expect("update_current_state is only called for state events");
        self.roomstateid_pduid
            .insert(&roomstateid(&pdu.room_id, &event_type, state_key), pduid)?;

        if let Some(membership) = pdu.membership().and_then(|m| Membership::from_state(&m)) {
            let Ok(target) = UserId::parse(state_key.to_owned()) else {
                // A member event with a malformed state key never reaches
                // the membership projection.
                return Ok(());
            };

            let mut userroomid = target.as_bytes().to_vec();
            userroomid.push(0xff);
            userroomid.extend_from_slice(pdu.room_id.as_bytes());
            self.userroomid_membership
                .insert(&userroomid, membership.as_str().as_bytes())?;

            let mut roomuserid = pdu.room_id.as_bytes().to_vec();
            roomuserid.push(0xff);
            roomuserid.extend_from_slice(target.as_bytes());
            self.roomuserid_membership
                .insert(&roomuserid, membership.as_str().as_bytes())?;
        }

        Ok(())
    }

    /// Rooms the user is currently joined to, from the write-side view.
    /// The watcher uses this; sessions go through their snapshot.
    pub(crate) fn rooms_joined(&self, user_id: &UserId) -> Result<Vec<OwnedRoomId>> {
        let mut prefix = user_id.as_bytes().to_vec();
        prefix.push(0xff);

        let mut rooms = Vec::new();
        for (key, value) in self.userroomid_membership.scan_prefix(prefix) {
            if value == b"join" {
                rooms.push(split_userroomid(&key)?.1);
            }
        }

        Ok(rooms)
    }
}

impl SyncSnapshot<'_> {
    /// The full current state of `room_id`, minus `exclude_event_ids`,
    /// restricted to what `state_filter` permits.
    #[tracing::instrument(skip(self, state_filter, exclude_event_ids))]
    pub fn select_current_state(
        &self,
        room_id: &RoomId,
        state_filter: &StateFilter,
        exclude_event_ids: &[OwnedEventId],
    ) -> Result<Vec<Arc<PduEvent>>> {
        let excluded: HashSet<&OwnedEventId> = exclude_event_ids.iter().collect();
        let mut prefix = room_id.as_bytes().to_vec();
        prefix.push(0xff);

        let mut events = Vec::new();
        for (_, pduid) in self.kv.scan_prefix(tables::ROOMSTATEID_PDUID, prefix) {
            let Some(bytes) = self.kv.get(tables::PDUID_PDU, &pduid)? else {
                return Err(Error::bad_database("Current state points at missing pdu."));
            };
            let pdu: PduEvent = serde_json::from_slice(&bytes)
                .map_err(|_| Error::bad_database("Invalid pdu bytes in db."))?;

            if excluded.contains(&pdu.event_id.clone()) {
                continue;
            }
            if !state_filter.matches(&pdu) {
                continue;
            }

            events.push(Arc::new(pdu));
        }

        Ok(events)
    }

    /// The current state wrapped as stream events with position zero,
    /// denoting "state as of snapshot open" rather than "appeared in the
    /// window".
    pub(crate) fn current_state_stream_events_for_room(
        &self,
        room_id: &RoomId,
        state_filter: &StateFilter,
    ) -> Result<Vec<StreamEvent>> {
        Ok(self
            .select_current_state(room_id, state_filter, &[])?
            .into_iter()
            .map(|pdu| StreamEvent {
                pdu,
                position: 0,
                transaction_id: None,
            })
            .collect())
    }

    pub fn select_state_event(
        &self,
        room_id: &RoomId,
        event_type: &StateEventType,
        state_key: &str,
    ) -> Result<Option<Arc<PduEvent>>> {
        let Some(pduid) = self
            .kv
            .get(tables::ROOMSTATEID_PDUID, &roomstateid(room_id, event_type, state_key))?
        else {
            return Ok(None);
        };
        let Some(bytes) = self.kv.get(tables::PDUID_PDU, &pduid)? else {
            return Err(Error::bad_database("Current state points at missing pdu."));
        };

        serde_json::from_slice(&bytes)
            .map(|pdu| Some(Arc::new(pdu)))
            .map_err(|_| Error::bad_database("Invalid pdu bytes in db."))
    }

    /// Rooms where `user_id` currently has `membership`.
    #[tracing::instrument(skip(self))]
    pub fn select_room_ids_with_membership(
        &self,
        user_id: &UserId,
        membership: Membership,
    ) -> Result<Vec<OwnedRoomId>> {
        let mut prefix = user_id.as_bytes().to_vec();
        prefix.push(0xff);

        let mut rooms = Vec::new();
        for (key, value) in self.kv.scan_prefix(tables::USERROOMID_MEMBERSHIP, prefix) {
            if Membership::from_bytes(&value)? == membership {
                rooms.push(split_userroomid(&key)?.1);
            }
        }

        Ok(rooms)
    }

    /// Every room the user has ever had a non-vacant membership in, with
    /// the latest membership as value.
    #[tracing::instrument(skip(self))]
    pub fn select_room_ids_with_any_membership(
        &self,
        user_id: &UserId,
    ) -> Result<HashMap<OwnedRoomId, Membership>> {
        let mut prefix = user_id.as_bytes().to_vec();
        prefix.push(0xff);

        let mut memberships = HashMap::new();
        for (key, value) in self.kv.scan_prefix(tables::USERROOMID_MEMBERSHIP, prefix) {
            memberships.insert(split_userroomid(&key)?.1, Membership::from_bytes(&value)?);
        }

        Ok(memberships)
    }

    /// All joined users, grouped by room.
    pub fn select_joined_users(&self) -> Result<HashMap<OwnedRoomId, Vec<OwnedUserId>>> {
        let mut joined: HashMap<OwnedRoomId, Vec<OwnedUserId>> = HashMap::new();

        for (key, value) in self.kv.iter(tables::ROOMUSERID_MEMBERSHIP) {
            if value != b"join" {
                continue;
            }
            let (room_id, user_id) = split_roomuserid(&key)?;
            joined.entry(room_id).or_default().push(user_id);
        }

        Ok(joined)
    }

    pub fn select_joined_users_in_rooms(
        &self,
        room_ids: &[OwnedRoomId],
    ) -> Result<HashMap<OwnedRoomId, Vec<OwnedUserId>>> {
        let mut joined: HashMap<OwnedRoomId, Vec<OwnedUserId>> = HashMap::new();

        for room_id in room_ids {
            let mut prefix = room_id.as_bytes().to_vec();
            prefix.push(0xff);
            for (key, value) in self.kv.scan_prefix(tables::ROOMUSERID_MEMBERSHIP, prefix) {
                if value != b"join" {
                    continue;
                }
                let (room_id, user_id) = split_roomuserid(&key)?;
                joined.entry(room_id).or_default().push(user_id);
            }
        }

        Ok(joined)
    }

    /// The subset of `candidates` sharing at least one joined room with
    /// `user_id`.
    #[tracing::instrument(skip(self, candidates))]
    pub fn select_shared_users(
        &self,
        user_id: &UserId,
        candidates: &[OwnedUserId],
    ) -> Result<Vec<OwnedUserId>> {
        let candidate_set: HashSet<&OwnedUserId> = candidates.iter().collect();
        let mut shared = BTreeMap::new();

        for room_id in self.select_room_ids_with_membership(user_id, Membership::Join)? {
            let mut prefix = room_id.as_bytes().to_vec();
            prefix.push(0xff);
            for (key, value) in self.kv.scan_prefix(tables::ROOMUSERID_MEMBERSHIP, prefix) {
                if value != b"join" {
                    continue;
                }
                let (_, member) = split_roomuserid(&key)?;
                if candidate_set.contains(&member) {
                    shared.insert(member, ());
                }
            }
        }

        Ok(shared.into_keys().collect())
    }

    /// Current number of `membership` members in `room_id`.
    pub fn membership_count(&self, room_id: &RoomId, membership: Membership) -> Result<usize> {
        let mut prefix = room_id.as_bytes().to_vec();
        prefix.push(0xff);

        let mut count = 0;
        for (_, value) in self.kv.scan_prefix(tables::ROOMUSERID_MEMBERSHIP, prefix) {
            if Membership::from_bytes(&value)? == membership {
                count += 1;
            }
        }

        Ok(count)
    }

    /// Up to five members to summarise a nameless room with, excluding
    /// the requesting user.
    pub fn room_heroes(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
        memberships: &[Membership],
    ) -> Result<Vec<OwnedUserId>> {
        let mut prefix = room_id.as_bytes().to_vec();
        prefix.push(0xff);

        let mut heroes = Vec::new();
        for (key, value) in self.kv.scan_prefix(tables::ROOMUSERID_MEMBERSHIP, prefix) {
            if !memberships.contains(&Membership::from_bytes(&value)?) {
                continue;
            }
            let (_, member) = split_roomuserid(&key)?;
            if member == user_id {
                continue;
            }
            heroes.push(member);
            if heroes.len() == 5 {
                break;
            }
        }

        Ok(heroes)
    }
}

fn split_roomuserid(key: &[u8]) -> Result<(OwnedRoomId, OwnedUserId)> {
    let separator = key
        .iter()
        .position(|&b| b == 0xff)
        .ok_or_else(|| Error::bad_database("Invalid roomuserid key in db."))?;

    let room_id = RoomId::parse(
        utils::string_from_bytes(&key[..separator])
            .map_err(|_| Error::bad_database("Invalid room id bytes in db."))?,
    )
    .map_err(|_| Error::bad_database("Invalid room id in db."))?;
    let user_id = UserId::parse(
        utils::string_from_bytes(&key[separator + 1..])
            .map_err(|_| Error::bad_database("Invalid user id bytes in db."))?,
    )
    .map_err(|_| Error::bad_database("Invalid user id in db."))?;

    Ok((room_id, user_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{test_utils, Config};
    use ruma::{room_id, user_id};

    #[test]
    fn membership_projection_replays_stream_order() {
        let db = KeyValueDatabase::load_or_create(&Config::default()).unwrap();
        let room = room_id!("!room:test");
        let alice = user_id!("@alice:test");

        db.append_pdu(
            &test_utils::member_pdu(room, alice, alice, 1, "$j:test", "join", None),
            None,
            false,
        )
        .unwrap();
        db.append_pdu(
            &test_utils::member_pdu(room, alice, alice, 2, "$l:test", "leave", Some("join")),
            None,
            false,
        )
        .unwrap();

        let snapshot = db.sync_snapshot().unwrap();
        let memberships = snapshot.select_room_ids_with_any_membership(alice).unwrap();
        assert_eq!(memberships[room], Membership::Leave);
        assert!(snapshot
            .select_room_ids_with_membership(alice, Membership::Join)
            .unwrap()
            .is_empty());

        // The member event itself is still the current state entry.
        let member = snapshot
            .select_state_event(room, &StateEventType::RoomMember, alice.as_str())
            .unwrap()
            .unwrap();
        assert_eq!(member.event_id.as_str(), "$l:test");
    }

    #[test]
    fn shared_users_and_heroes() {
        let db = KeyValueDatabase::load_or_create(&Config::default()).unwrap();
        let room = room_id!("!room:test");
        let alice = user_id!("@alice:test");
        let bob = user_id!("@bob:test");
        let carol = user_id!("@carol:test");
        let mallory = user_id!("@mallory:test");

        for (i, (user, membership)) in [(alice, "join"), (bob, "join"), (carol, "invite")]
            .into_iter()
            .enumerate()
        {
            db.append_pdu(
                &test_utils::member_pdu(
                    room,
                    user,
                    user,
                    i as u64 + 1,
                    &format!("$m{i}:test"),
                    membership,
                    None,
                ),
                None,
                false,
            )
            .unwrap();
        }

        let snapshot = db.sync_snapshot().unwrap();

        let shared = snapshot
            .select_shared_users(alice, &[bob.to_owned(), carol.to_owned(), mallory.to_owned()])
            .unwrap();
        assert_eq!(shared, vec![bob.to_owned()]);

        assert_eq!(snapshot.membership_count(room, Membership::Join).unwrap(), 2);
        assert_eq!(
            snapshot.membership_count(room, Membership::Invite).unwrap(),
            1
        );

        let heroes = snapshot
            .room_heroes(room, alice, &[Membership::Join, Membership::Invite])
            .unwrap();
        assert_eq!(heroes, vec![bob.to_owned(), carol.to_owned()]);

        let joined = snapshot.select_joined_users().unwrap();
        assert_eq!(joined[room].len(), 2);

        let scoped = snapshot
            .select_joined_users_in_rooms(&[room.to_owned(), room_id!("!empty:test").to_owned()])
            .unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[room].len(), 2);
    }
}
