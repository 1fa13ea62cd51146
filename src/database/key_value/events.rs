// =============================================================================
// Conflux Matrix Sync Engine - Event Store
// =============================================================================
//
// Project: Conflux - Matrix Sync Read Path Engine
// License: Apache 2.0 / MIT
//
// Description:
//   The persistent event log: keyed by event ID and stream position,
//   secondary-indexed by room. Writers append through `KeyValueDatabase`;
//   the sync session reads range queries out of its frozen view.
//
// =============================================================================

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};

use ruma::{EventId, OwnedEventId, OwnedRoomId, RoomId};

use crate::{
    database::{tables, KeyValueDatabase},
    service::sync::{
        filter::{RoomEventFilter, StateFilter},
        token::{Range, StreamKind, StreamPosition},
        StreamEvent, SyncSnapshot, TransactionId,
    },
    utils, Error, PduEvent, Result,
};

pub(crate) fn pduid(room_id: &RoomId, position: StreamPosition) -> Vec<u8> {
    let mut pduid = room_id.as_bytes().to_vec();
    pduid.push(0xff);
    pduid.extend_from_slice(&position.to_be_bytes());
    pduid
}

fn position_from_pduid(pduid: &[u8]) -> Result<StreamPosition> {
    if pduid.len() < 9 {
        return Err(Error::bad_database("Pdu id is too short."));
    }
    utils::u64_from_bytes(&pduid[pduid.len() - 8..])
        .map_err(|_| Error::bad_database("Invalid position bytes in pdu id."))
}

fn parse_txnid(bytes: &[u8]) -> Result<TransactionId> {
    if bytes.len() < 8 {
        return Err(Error::bad_database("Transaction id bytes are too short."));
    }
    Ok(TransactionId {
        session_id: utils::u64_from_bytes(&bytes[..8])
            .map_err(|_| Error::bad_database("Invalid session id bytes."))?,
        transaction_id: utils::string_from_bytes(&bytes[8..])
            .map_err(|_| Error::bad_database("Invalid transaction id bytes."))?,
    })
}

impl KeyValueDatabase {
    /// Commits one event to the log, assigning its stream position and
    /// maintaining the room, topology and current-state indexes. The
    /// position never changes its room or event-ID binding afterwards.
    #[tracing::instrument(skip(self, pdu, transaction_id))]
    pub fn append_pdu(
        &self,
        pdu: &PduEvent,
        transaction_id: Option<&TransactionId>,
        exclude_from_sync: bool,
    ) -> Result<StreamPosition> {
        let position = self.next_position(StreamKind::Pdu)?;
        let pduid = pduid(&pdu.room_id, position);

        self.pduid_pdu.insert(
            &pduid,
            &serde_json::to_vec(pdu).expect("PduEvent::to_vec always works"),
        )?;
        self.eventid_pduid
            .insert(pdu.event_id.as_bytes(), &pduid)?;
        self.streamid_pduid
            .insert(&position.to_be_bytes(), &pduid)?;

        if let Some(txn) = transaction_id {
            let mut value = txn.session_id.to_be_bytes().to_vec();
            value.extend_from_slice(txn.transaction_id.as_bytes());
            self.pduid_txnid.insert(&pduid, &value)?;
        }

        if exclude_from_sync {
            self.excludedsyncpduids.insert(&pduid, &[])?;
        }

        // Topology index: (depth, stream position) is unique per room and
        // totally orders the room compatibly with the DAG partial order.
        let mut topologyid = pdu.room_id.as_bytes().to_vec();
        topologyid.push(0xff);
        topologyid.extend_from_slice(&u64::from(pdu.depth).to_be_bytes());
        topologyid.push(0xff);
        topologyid.extend_from_slice(&position.to_be_bytes());
        self.roomtopologyid_eventid
            .insert(&topologyid, pdu.event_id.as_bytes())?;

        let mut depth_pos = u64::from(pdu.depth).to_be_bytes().to_vec();
        depth_pos.extend_from_slice(&position.to_be_bytes());
        self.eventid_topologyid
            .insert(pdu.event_id.as_bytes(), &depth_pos)?;

        if let Some(state_key) = &pdu.state_key {
            self.update_current_state(pdu, state_key, &pduid)?;
        }

        Ok(position)
    }
}

impl SyncSnapshot<'_> {
    /// Event lookup by ID through the immutable event-ID binding, which
    /// makes the cache safe across sessions.
    pub(crate) fn get_pdu(&self, event_id: &EventId) -> Result<Option<Arc<PduEvent>>> {
        if let Some(cached) = self.db.pdu_cache.lock().unwrap().get_mut(event_id) {
            return Ok(Some(Arc::clone(cached)));
        }

        let Some(pduid) = self.kv.get(tables::EVENTID_PDUID, event_id.as_bytes())? else {
            return Ok(None);
        };
        let Some(bytes) = self.kv.get(tables::PDUID_PDU, &pduid)? else {
            return Ok(None);
        };

        let pdu: PduEvent = serde_json::from_slice(&bytes)
            .map_err(|_| Error::bad_database("Invalid pdu bytes in db."))?;
        let pdu = Arc::new(pdu);
        self.db
            .pdu_cache
            .lock()
            .unwrap()
            .insert(event_id.to_owned(), Arc::clone(&pdu));

        Ok(Some(pdu))
    }

    pub(crate) fn transaction_id_for_pduid(&self, pduid: &[u8]) -> Result<Option<TransactionId>> {
        self.kv
            .get(tables::PDUID_TXNID, pduid)?
            .map(|bytes| parse_txnid(&bytes))
            .transpose()
    }

    /// Looks up events by ID, silently dropping the ones that are not in
    /// the store. No transaction IDs are attached here; those only exist
    /// once a device context is supplied.
    #[tracing::instrument(skip(self, event_ids))]
    pub fn events_by_id(&self, event_ids: &[OwnedEventId]) -> Result<Vec<StreamEvent>> {
        let mut events = Vec::with_capacity(event_ids.len());

        for event_id in event_ids {
            let Some(pduid) = self.kv.get(tables::EVENTID_PDUID, event_id.as_bytes())? else {
                continue;
            };
            let Some(pdu) = self.get_pdu(event_id)? else {
                continue;
            };

            events.push(StreamEvent {
                pdu,
                position: position_from_pduid(&pduid)?,
                transaction_id: self.transaction_id_for_pduid(&pduid)?,
            });
        }

        Ok(events)
    }

    /// Up to `filter.limit()` events of `room_id` with stream position in
    /// `range`. `limited` is true when more matching events existed than
    /// the limit admitted. Results descend by position unless
    /// `chronological`.
    #[tracing::instrument(skip(self, filter))]
    pub fn recent_events(
        &self,
        room_id: &RoomId,
        range: Range,
        filter: &RoomEventFilter,
        chronological: bool,
        only_sync_events: bool,
    ) -> Result<(Vec<StreamEvent>, bool)> {
        let mut prefix = room_id.as_bytes().to_vec();
        prefix.push(0xff);

        let mut newest_first = prefix.clone();
        newest_first.extend_from_slice(&range.high().to_be_bytes());

        let mut events = Vec::new();
        let mut limited = false;

        for (key, value) in self
            .kv
            .iter_from(tables::PDUID_PDU, &newest_first, true)
            .take_while(|(key, _)| key.starts_with(&prefix))
        {
            let position = position_from_pduid(&key)?;
            if position <= range.low() {
                break;
            }
            if only_sync_events && self.kv.get(tables::EXCLUDEDSYNCPDUIDS, &key)?.is_some() {
                continue;
            }

            let pdu: PduEvent = serde_json::from_slice(&value)
                .map_err(|_| Error::bad_database("Invalid pdu bytes in db."))?;
            if !filter.matches(&pdu) {
                continue;
            }

            if events.len() == filter.limit() {
                limited = true;
                break;
            }

            events.push(StreamEvent {
                pdu: Arc::new(pdu),
                position,
                transaction_id: self.transaction_id_for_pduid(&key)?,
            });
        }

        if chronological {
            events.reverse();
        }

        Ok((events, limited))
    }

    /// Every state event whose stream position lies in `range`, restricted
    /// to `room_ids` and to what `state_filter` permits. Returns the
    /// per-room event-ID lists (in stream order) and the ID-to-event map
    /// to resolve them with.
    #[tracing::instrument(skip(self, state_filter, room_ids))]
    pub fn select_state_in_range(
        &self,
        range: Range,
        state_filter: &StateFilter,
        room_ids: &[OwnedRoomId],
    ) -> Result<(
        BTreeMap<OwnedRoomId, Vec<OwnedEventId>>,
        HashMap<OwnedEventId, StreamEvent>,
    )> {
        let rooms: HashSet<&RoomId> = room_ids.iter().map(AsRef::as_ref).collect();

        let mut state_needed: BTreeMap<OwnedRoomId, Vec<OwnedEventId>> = BTreeMap::new();
        let mut event_map = HashMap::new();

        let oldest_in_window = (range.low() + 1).to_be_bytes();
        for (key, pduid) in self
            .kv
            .iter_from(tables::STREAMID_PDUID, &oldest_in_window, false)
        {
            let position = utils::u64_from_bytes(&key)
                .map_err(|_| Error::bad_database("Invalid stream id bytes in db."))?;
            if position > range.high() {
                break;
            }

            let Some(bytes) = self.kv.get(tables::PDUID_PDU, &pduid)? else {
                continue;
            };
            let pdu: PduEvent = serde_json::from_slice(&bytes)
                .map_err(|_| Error::bad_database("Invalid pdu bytes in db."))?;

            if !pdu.is_state() {
                continue;
            }
            if !rooms.contains(&*pdu.room_id) {
                continue;
            }
            if !state_filter.matches(&pdu) {
                continue;
            }

            let event_id = pdu.event_id.clone();
            state_needed
                .entry(pdu.room_id.clone())
                .or_default()
                .push(event_id.clone());
            event_map.insert(
                event_id,
                StreamEvent {
                    pdu: Arc::new(pdu),
                    position,
                    transaction_id: self.transaction_id_for_pduid(&pduid)?,
                },
            );
        }

        Ok((state_needed, event_map))
    }

    /// Resolves the ID lists of `select_state_in_range`, fetching any
    /// event the map is missing. List order (stream-ascending) carries
    /// through, which is what makes the delta engine's first-membership
    /// scan deterministic.
    pub(crate) fn fetch_state_events(
        &self,
        state_needed: BTreeMap<OwnedRoomId, Vec<OwnedEventId>>,
        event_map: &HashMap<OwnedEventId, StreamEvent>,
    ) -> Result<HashMap<OwnedRoomId, Vec<StreamEvent>>> {
        let mut state = HashMap::new();

        for (room_id, event_ids) in state_needed {
            let mut events = Vec::with_capacity(event_ids.len());
            for event_id in event_ids {
                match event_map.get(&event_id) {
                    Some(event) => events.push(event.clone()),
                    None => events.extend(self.events_by_id(&[event_id])?),
                }
            }
            state.insert(room_id, events);
        }

        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{test_utils, Config};
    use ruma::{room_id, user_id};

    #[test]
    fn events_by_id_drops_missing_ids() {
        let db = KeyValueDatabase::load_or_create(&Config::default()).unwrap();
        let room = room_id!("!room:test");
        let alice = user_id!("@alice:test");

        let pdu = test_utils::message_pdu(room, alice, 1, "$one:test", "hello");
        db.append_pdu(&pdu, None, false).unwrap();

        let snapshot = db.sync_snapshot().unwrap();
        let events = snapshot
            .events_by_id(&[
                pdu.event_id.clone(),
                ruma::event_id!("$missing:test").to_owned(),
            ])
            .unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].pdu.event_id, pdu.event_id);
        assert_eq!(events[0].position, 1);
    }

    #[test]
    fn recent_events_limits_and_orders() {
        let db = KeyValueDatabase::load_or_create(&Config::default()).unwrap();
        let room = room_id!("!room:test");
        let alice = user_id!("@alice:test");

        for i in 1..=5u64 {
            let pdu = test_utils::message_pdu(room, alice, i, &format!("$m{i}:test"), "hi");
            db.append_pdu(&pdu, None, false).unwrap();
        }

        let snapshot = db.sync_snapshot().unwrap();
        let filter = RoomEventFilter {
            base: crate::service::sync::filter::EventFilter {
                limit: 3,
                ..Default::default()
            },
            ..Default::default()
        };

        let (events, limited) = snapshot
            .recent_events(room, Range::new(0, 10), &filter, false, true)
            .unwrap();
        assert!(limited);
        assert_eq!(events.len(), 3);
        // Reverse-chronological by default.
        assert_eq!(events[0].position, 5);
        assert_eq!(events[2].position, 3);

        let (chronological, _) = snapshot
            .recent_events(room, Range::new(0, 10), &filter, true, true)
            .unwrap();
        assert_eq!(chronological[0].position, 3);
        assert_eq!(chronological[2].position, 5);
    }

    #[test]
    fn recent_events_respects_window_and_sync_exclusion() {
        let db = KeyValueDatabase::load_or_create(&Config::default()).unwrap();
        let room = room_id!("!room:test");
        let alice = user_id!("@alice:test");

        let first = test_utils::message_pdu(room, alice, 1, "$a:test", "a");
        db.append_pdu(&first, None, false).unwrap();
        let hidden = test_utils::message_pdu(room, alice, 2, "$b:test", "b");
        db.append_pdu(&hidden, None, true).unwrap();
        let last = test_utils::message_pdu(room, alice, 3, "$c:test", "c");
        db.append_pdu(&last, None, false).unwrap();

        let snapshot = db.sync_snapshot().unwrap();
        let filter = RoomEventFilter::default();

        let (events, _) = snapshot
            .recent_events(room, Range::new(1, 10), &filter, true, true)
            .unwrap();
        // Position 1 is outside the half-open window; position 2 is
        // excluded from sync.
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].position, 3);

        let (all, _) = snapshot
            .recent_events(room, Range::new(1, 10), &filter, true, false)
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn state_in_range_is_scoped_and_stream_ordered() {
        let db = KeyValueDatabase::load_or_create(&Config::default()).unwrap();
        let room = room_id!("!room:test");
        let other = room_id!("!other:test");
        let alice = user_id!("@alice:test");

        db.append_pdu(
            &test_utils::member_pdu(room, alice, alice, 1, "$j1:test", "join", None),
            None,
            false,
        )
        .unwrap();
        db.append_pdu(
            &test_utils::message_pdu(room, alice, 2, "$msg:test", "not state"),
            None,
            false,
        )
        .unwrap();
        db.append_pdu(
            &test_utils::member_pdu(other, alice, alice, 1, "$j2:test", "join", None),
            None,
            false,
        )
        .unwrap();

        let snapshot = db.sync_snapshot().unwrap();
        let (state_needed, event_map) = snapshot
            .select_state_in_range(
                Range::new(0, 10),
                &StateFilter::default(),
                &[room.to_owned()],
            )
            .unwrap();

        assert_eq!(state_needed.len(), 1);
        assert_eq!(state_needed[room].len(), 1);
        assert_eq!(event_map.len(), 1);

        let state = snapshot
            .fetch_state_events(state_needed, &event_map)
            .unwrap();
        assert_eq!(state[room][0].position, 1);
    }
}
