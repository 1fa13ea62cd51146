// =============================================================================
// Conflux Matrix Sync Engine - State Delta Engine
// =============================================================================
//
// Project: Conflux - Matrix Sync Read Path Engine
// License: Apache 2.0 / MIT
//
// Description:
//   Computes per-room state deltas and membership classifications for a
//   user over one sync window, implementing the established membership
//   change algorithm: classify membership transitions from the window's
//   state events, then add every currently joined room.
//
// =============================================================================

use std::collections::HashMap;

use ruma::{OwnedRoomId, UserId};
use tracing::debug;

use crate::{PduEvent, Result};

use super::{
    filter::StateFilter,
    token::{Range, StreamPosition},
    Device, Membership, StateDelta, SyncSnapshot,
};

/// Extracts `(membership, prev_membership)` when `pdu` is a member event
/// whose state key is `user_id`. Custom membership states are ignored.
fn membership_change(
    pdu: &PduEvent,
    user_id: &UserId,
) -> Option<(Membership, Option<Membership>)> {
    if pdu.state_key.as_deref() != Some(user_id.as_str()) {
        return None;
    }

    let membership = Membership::from_state(&pdu.membership()?)?;
    let prev_membership = pdu
        .prev_membership()
        .and_then(|prev| Membership::from_state(&prev));

    Some((membership, prev_membership))
}

impl SyncSnapshot<'_> {
    /// State deltas between the bounds of `range`, exclusive of the old
    /// position, inclusive of the new, for the rooms in which the user has
    /// new membership events — plus a delta for every currently joined
    /// room. The list of joined room IDs is also returned for callers that
    /// need it. Delta order is unspecified.
    #[tracing::instrument(skip(self, device, state_filter))]
    pub fn incremental_state_deltas(
        &self,
        device: &Device,
        range: Range,
        user_id: &UserId,
        state_filter: &StateFilter,
    ) -> Result<(Vec<StateDelta>, Vec<OwnedRoomId>)> {
        // Membership change algorithm:
        // - Get membership list changes for this user in this sync window.
        // - For each room with changes: a newly joined room gets the full
        //   current state instead of a delta; everything else ships the
        //   window's state events with the membership position.
        // - Add all currently joined rooms to the joined block.
        let memberships = match self.select_room_ids_with_any_membership(user_id) {
            Ok(memberships) => memberships,
            Err(e) if e.is_not_found() => return Ok((Vec::new(), Vec::new())),
            Err(e) => return Err(e),
        };

        let mut all_room_ids = Vec::with_capacity(memberships.len());
        let mut joined_room_ids = Vec::with_capacity(memberships.len());
        for (room_id, membership) in &memberships {
            all_room_ids.push(room_id.clone());
            if *membership == Membership::Join {
                joined_room_ids.push(room_id.clone());
            }
        }

        // Every state event in the window, for every room the user has
        // interacted with.
        let (state_needed, event_map) =
            match self.select_state_in_range(range, state_filter, &all_room_ids) {
                Ok(selected) => selected,
                Err(e) if e.is_not_found() => return Ok((Vec::new(), Vec::new())),
                Err(e) => return Err(e),
            };
        let mut state = match self.fetch_state_events(state_needed, &event_map) {
            Ok(state) => state,
            Err(e) if e.is_not_found() => return Ok((Vec::new(), Vec::new())),
            Err(e) => return Err(e),
        };

        // Peeked rooms come before joins so a later join overwrites the
        // peek's view of the room.
        let peeks = match self.select_peeks_in_range(user_id, &device.device_id, range) {
            Ok(peeks) => peeks,
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => return Err(e),
        };

        let mut deltas = Vec::new();
        for peek in &peeks {
            if peek.new {
                // A fresh peek ships the full current state, not a delta.
                match self.current_state_stream_events_for_room(&peek.room_id, state_filter) {
                    Ok(full_state) => {
                        state.insert(peek.room_id.clone(), full_state);
                    }
                    Err(e) if e.is_not_found() => continue,
                    Err(e) => return Err(e),
                }
            }
            if !peek.deleted {
                deltas.push(StateDelta {
                    room_id: peek.room_id.clone(),
                    membership: Membership::Peek,
                    membership_pos: None,
                    state_events: self.stream_events_to_events(
                        Some(device),
                        state.get(&peek.room_id).cloned().unwrap_or_default(),
                    ),
                    newly_joined: false,
                });
            }
        }

        // Membership classification. The window's state events arrive in
        // stream-ascending order and the first membership hit per room
        // wins.
        let mut newly_joined_rooms: HashMap<OwnedRoomId, StreamPosition> = HashMap::new();
        let room_ids: Vec<OwnedRoomId> = state.keys().cloned().collect();
        for room_id in room_ids {
            let window_events = state.get(&room_id).cloned().unwrap_or_default();
            for event in &window_events {
                let Some((membership, prev_membership)) =
                    membership_change(&event.pdu, user_id)
                else {
                    continue;
                };

                if membership == Membership::Join && prev_membership != Some(Membership::Join) {
                    // Newly joined: send the full current state down and
                    // leave the delta to the joined-rooms pass. Not sound
                    // under duplicate joins, which the protocol permits.
                    match self.current_state_stream_events_for_room(&room_id, state_filter) {
                        Ok(full_state) => {
                            state.insert(room_id.clone(), full_state);
                            newly_joined_rooms.insert(room_id.clone(), event.position);
                        }
                        Err(e) if e.is_not_found() => continue,
                        Err(e) => return Err(e),
                    }
                    continue;
                }

                deltas.push(StateDelta {
                    room_id: room_id.clone(),
                    membership,
                    membership_pos: Some(event.position),
                    state_events: self
                        .stream_events_to_events(Some(device), window_events.clone()),
                    newly_joined: false,
                });
                break;
            }
        }

        // Add in currently joined rooms.
        for room_id in &joined_room_ids {
            deltas.push(StateDelta {
                room_id: room_id.clone(),
                membership: Membership::Join,
                membership_pos: newly_joined_rooms.get(room_id).copied(),
                state_events: self.stream_events_to_events(
                    Some(device),
                    state.get(room_id).cloned().unwrap_or_default(),
                ),
                newly_joined: newly_joined_rooms.contains_key(room_id),
            });
        }

        debug!(
            deltas = deltas.len(),
            joined = joined_room_ids.len(),
            "computed incremental state deltas"
        );

        Ok((deltas, joined_room_ids))
    }

    /// The `full_state=true` variant: equivalent to an incremental sync
    /// that ships the entire current state of every joined room. Keyed by
    /// room, later writes win; the joined overwrite comes last.
    #[tracing::instrument(skip(self, device, state_filter))]
    pub fn full_state_deltas(
        &self,
        device: &Device,
        range: Range,
        user_id: &UserId,
        state_filter: &StateFilter,
    ) -> Result<(Vec<StateDelta>, Vec<OwnedRoomId>)> {
        let memberships = match self.select_room_ids_with_any_membership(user_id) {
            Ok(memberships) => memberships,
            Err(e) if e.is_not_found() => return Ok((Vec::new(), Vec::new())),
            Err(e) => return Err(e),
        };

        let mut all_room_ids = Vec::with_capacity(memberships.len());
        let mut joined_room_ids = Vec::with_capacity(memberships.len());
        for (room_id, membership) in &memberships {
            all_room_ids.push(room_id.clone());
            if *membership == Membership::Join {
                joined_room_ids.push(room_id.clone());
            }
        }

        let mut deltas: HashMap<OwnedRoomId, StateDelta> = HashMap::new();

        let peeks = match self.select_peeks_in_range(user_id, &device.device_id, range) {
            Ok(peeks) => peeks,
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => return Err(e),
        };

        // Full state for every active peek, new or not.
        for peek in &peeks {
            if peek.deleted {
                continue;
            }
            let full_state =
                match self.current_state_stream_events_for_room(&peek.room_id, state_filter) {
                    Ok(full_state) => full_state,
                    Err(e) if e.is_not_found() => continue,
                    Err(e) => return Err(e),
                };
            deltas.insert(
                peek.room_id.clone(),
                StateDelta {
                    room_id: peek.room_id.clone(),
                    membership: Membership::Peek,
                    membership_pos: None,
                    state_events: self.stream_events_to_events(Some(device), full_state),
                    newly_joined: false,
                },
            );
        }

        let (state_needed, event_map) =
            match self.select_state_in_range(range, state_filter, &all_room_ids) {
                Ok(selected) => selected,
                Err(e) if e.is_not_found() => return Ok((Vec::new(), Vec::new())),
                Err(e) => return Err(e),
            };
        let state = match self.fetch_state_events(state_needed, &event_map) {
            Ok(state) => state,
            Err(e) if e.is_not_found() => return Ok((Vec::new(), Vec::new())),
            Err(e) => return Err(e),
        };

        for (room_id, window_events) in &state {
            for event in window_events {
                let Some((membership, _)) = membership_change(&event.pdu, user_id) else {
                    continue;
                };

                // Joined rooms get their full state below.
                if membership != Membership::Join {
                    deltas.insert(
                        room_id.clone(),
                        StateDelta {
                            room_id: room_id.clone(),
                            membership,
                            membership_pos: Some(event.position),
                            state_events: self
                                .stream_events_to_events(Some(device), window_events.clone()),
                            newly_joined: false,
                        },
                    );
                }

                break;
            }
        }

        // Full state for every joined room overwrites anything above.
        for room_id in &joined_room_ids {
            let full_state =
                match self.current_state_stream_events_for_room(room_id, state_filter) {
                    Ok(full_state) => full_state,
                    Err(e) if e.is_not_found() => continue,
                    Err(e) => return Err(e),
                };
            deltas.insert(
                room_id.clone(),
                StateDelta {
                    room_id: room_id.clone(),
                    membership: Membership::Join,
                    membership_pos: None,
                    state_events: self.stream_events_to_events(Some(device), full_state),
                    newly_joined: false,
                },
            );
        }

        Ok((deltas.into_values().collect(), joined_room_ids))
    }
}
