// =============================================================================
// Conflux Matrix Sync Engine - Topology Index
// =============================================================================
//
// Project: Conflux - Matrix Sync Read Path Engine
// License: Apache 2.0 / MIT
//
// Description:
//   Per-room event ID <-> (depth, stream position) mapping. Ordering by
//   that pair totally orders a room compatibly with its DAG, which is what
//   /messages-style pagination walks.
//
// =============================================================================

use std::collections::BTreeMap;

use ruma::{EventId, OwnedEventId, RoomId};

use crate::{
    database::{tables, KeyValueDatabase},
    service::sync::{
        token::{StreamPosition, TopologyToken},
        StreamEvent, SyncSnapshot,
    },
    utils, Error, Result,
};

fn parse_topologyid(value: &[u8]) -> Result<TopologyToken> {
    if value.len() != 16 {
        return Err(Error::bad_database("Invalid topology id length in db."));
    }
    Ok(TopologyToken {
        depth: utils::u64_from_bytes(&value[..8])
            .map_err(|_| Error::bad_database("Invalid depth bytes in db."))?,
        pdu_position: utils::u64_from_bytes(&value[8..])
            .map_err(|_| Error::bad_database("Invalid position bytes in db."))?,
    })
}

/// Splits `roomid 0xff depth8 0xff position8` behind a known prefix.
fn parse_room_topology_key(key: &[u8], prefix_len: usize) -> Result<TopologyToken> {
    let rest = &key[prefix_len..];
    if rest.len() != 17 {
        return Err(Error::bad_database("Invalid topology key length in db."));
    }
    Ok(TopologyToken {
        depth: utils::u64_from_bytes(&rest[..8])
            .map_err(|_| Error::bad_database("Invalid depth bytes in db."))?,
        pdu_position: utils::u64_from_bytes(&rest[9..])
            .map_err(|_| Error::bad_database("Invalid position bytes in db."))?,
    })
}

impl KeyValueDatabase {
    /// Records that `event_id` references the unknown `prev_event_id`,
    /// making it a backward extremity of the room.
    pub fn insert_backward_extremity(
        &self,
        room_id: &RoomId,
        event_id: &EventId,
        prev_event_id: &EventId,
    ) -> Result<()> {
        let mut key = room_id.as_bytes().to_vec();
        key.push(0xff);
        key.extend_from_slice(event_id.as_bytes());
        key.push(0xff);
        key.extend_from_slice(prev_event_id.as_bytes());

        self.roomeventid_backwardextremity.insert(&key, &[])
    }

    /// Drops every backward-extremity record naming `prev_event_id`, once
    /// that event has been fetched.
    pub fn delete_backward_extremity(
        &self,
        room_id: &RoomId,
        prev_event_id: &EventId,
    ) -> Result<()> {
        let mut prefix = room_id.as_bytes().to_vec();
        prefix.push(0xff);

        let stale: Vec<_> = self
            .roomeventid_backwardextremity
            .scan_prefix(prefix)
            .map(|(key, _)| key)
            .filter(|key| key.ends_with(prev_event_id.as_bytes()))
            .collect();
        for key in stale {
            self.roomeventid_backwardextremity.remove(&key)?;
        }

        Ok(())
    }
}

impl SyncSnapshot<'_> {
    /// The topological coordinate of `event_id`. `NotFound` when the
    /// event is not indexed.
    pub fn position_in_topology(&self, event_id: &EventId) -> Result<TopologyToken> {
        let Some(value) = self.kv.get(tables::EVENTID_TOPOLOGYID, event_id.as_bytes())? else {
            return Err(Error::NotFound("Event has no topology position."));
        };

        parse_topologyid(&value)
    }

    /// The latest topological coordinate of the room. `NotFound` for a
    /// room without any indexed event.
    pub fn max_position_in_topology(&self, room_id: &RoomId) -> Result<TopologyToken> {
        let mut prefix = room_id.as_bytes().to_vec();
        prefix.push(0xff);

        let mut last_possible = prefix.clone();
        last_possible.extend_from_slice(&[0xff; 17]);

        self.kv
            .iter_from(tables::ROOMTOPOLOGYID_EVENTID, &last_possible, true)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(key, _)| parse_room_topology_key(&key, prefix.len()))
            .next()
            .unwrap_or(Err(Error::NotFound("Room has no topology entries.")))
    }

    /// Event IDs ordered by `(depth, pdu_position)` inside the half-open
    /// interval bounded below by `(min_depth, min_stream_pos_at_min_depth)`
    /// (exclusive) and above by `max_depth` — inclusive, with the optional
    /// `max_stream_pos_at_max_depth` tiebreak restricting only the
    /// `max_depth` slice so clients can page through many events sharing a
    /// depth.
    #[allow(clippy::too_many_arguments)]
    pub fn event_ids_in_range(
        &self,
        room_id: &RoomId,
        min_depth: StreamPosition,
        min_stream_pos_at_min_depth: StreamPosition,
        max_depth: StreamPosition,
        max_stream_pos_at_max_depth: Option<StreamPosition>,
        limit: usize,
        ascending: bool,
    ) -> Result<Vec<OwnedEventId>> {
        let mut prefix = room_id.as_bytes().to_vec();
        prefix.push(0xff);

        let lower = TopologyToken {
            depth: min_depth,
            pdu_position: min_stream_pos_at_min_depth,
        };
        let upper = TopologyToken {
            depth: max_depth,
            pdu_position: max_stream_pos_at_max_depth.unwrap_or(StreamPosition::MAX),
        };

        let mut from = prefix.clone();
        if ascending {
            from.extend_from_slice(&lower.depth.to_be_bytes());
            from.push(0xff);
            // One past the exclusive lower bound.
            from.extend_from_slice(&(lower.pdu_position.saturating_add(1)).to_be_bytes());
        } else {
            from.extend_from_slice(&upper.depth.to_be_bytes());
            from.push(0xff);
            from.extend_from_slice(&upper.pdu_position.to_be_bytes());
        }

        let mut event_ids = Vec::new();
        for (key, value) in self
            .kv
            .iter_from(tables::ROOMTOPOLOGYID_EVENTID, &from, !ascending)
            .take_while(|(key, _)| key.starts_with(&prefix))
        {
            let token = parse_room_topology_key(&key, prefix.len())?;
            if token <= lower {
                if ascending {
                    continue;
                }
                break;
            }
            if token > upper {
                if ascending {
                    break;
                }
                continue;
            }

            event_ids.push(
                EventId::parse(
                    utils::string_from_bytes(&value)
                        .map_err(|_| Error::bad_database("Invalid event id bytes in db."))?,
                )
                .map_err(|_| Error::bad_database("Invalid event id in db."))?,
            );
            if event_ids.len() == limit {
                break;
            }
        }

        Ok(event_ids)
    }

    /// The topological coordinate corresponding to a stream cursor: the
    /// depth of the nearest event at or across the cursor, keeping the
    /// cursor as the position component. When no event lies at or across
    /// the cursor, going backward yields the `(0, stream_pos)` sentinel
    /// and going forward yields the room's current maximum.
    #[tracing::instrument(skip(self))]
    pub fn stream_to_topological_position(
        &self,
        room_id: &RoomId,
        stream_pos: StreamPosition,
        backward_ordering: bool,
    ) -> Result<TopologyToken> {
        let mut prefix = room_id.as_bytes().to_vec();
        prefix.push(0xff);

        let mut nearest: Option<TopologyToken> = None;
        for (key, _) in self
            .kv
            .scan_prefix(tables::ROOMTOPOLOGYID_EVENTID, prefix.clone())
        {
            let token = parse_room_topology_key(&key, prefix.len())?;
            let candidate = if backward_ordering {
                token.pdu_position <= stream_pos
                    && nearest.map_or(true, |nearest| token.depth > nearest.depth)
            } else {
                token.pdu_position >= stream_pos
                    && nearest.map_or(true, |nearest| token.depth < nearest.depth)
            };
            if candidate {
                nearest = Some(token);
            }
        }

        match nearest {
            Some(token) => Ok(TopologyToken {
                depth: token.depth,
                pdu_position: stream_pos,
            }),
            None if backward_ordering => Ok(TopologyToken {
                depth: 0,
                pdu_position: stream_pos,
            }),
            None => self.max_position_in_topology(room_id).map_err(|e| {
                Error::Database(format!("topology.max_position_in_topology: {e}"))
            }),
        }
    }

    /// Derives the backward pagination token from a window of events: the
    /// topology position of the oldest one, decremented so the token
    /// excludes that event when used as an upper bound.
    pub fn get_backward_topology_pos(&self, events: &[StreamEvent]) -> Result<TopologyToken> {
        let Some(first) = events.first() else {
            return Ok(TopologyToken::default());
        };

        let mut token = self.position_in_topology(&first.pdu.event_id)?;
        token.decrement();
        Ok(token)
    }

    /// Events at the backward edge of what the server has, mapped to the
    /// predecessor IDs it is missing.
    pub fn backward_extremities(
        &self,
        room_id: &RoomId,
    ) -> Result<BTreeMap<OwnedEventId, Vec<OwnedEventId>>> {
        let mut prefix = room_id.as_bytes().to_vec();
        prefix.push(0xff);

        let mut extremities: BTreeMap<OwnedEventId, Vec<OwnedEventId>> = BTreeMap::new();
        for (key, _) in self
            .kv
            .scan_prefix(tables::ROOMEVENTID_BACKWARDEXTREMITY, prefix.clone())
        {
            let rest = &key[prefix.len()..];
            let separator = rest
                .iter()
                .position(|&b| b == 0xff)
                .ok_or_else(|| Error::bad_database("Invalid backward extremity key in db."))?;

            let event_id = EventId::parse(
                utils::string_from_bytes(&rest[..separator])
                    .map_err(|_| Error::bad_database("Invalid event id bytes in db."))?,
            )
            .map_err(|_| Error::bad_database("Invalid event id in db."))?;
            let prev_event_id = EventId::parse(
                utils::string_from_bytes(&rest[separator + 1..])
                    .map_err(|_| Error::bad_database("Invalid event id bytes in db."))?,
            )
            .map_err(|_| Error::bad_database("Invalid event id in db."))?;

            extremities.entry(event_id).or_default().push(prev_event_id);
        }

        Ok(extremities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{test_utils, Config};
    use ruma::{event_id, room_id, user_id};

    fn seeded_db() -> KeyValueDatabase {
        let db = KeyValueDatabase::load_or_create(&Config::default()).unwrap();
        let room = room_id!("!room:test");
        let alice = user_id!("@alice:test");

        // Stream positions 1..=4 at depths 3, 3, 4, 5.
        for (i, depth) in [3u64, 3, 4, 5].into_iter().enumerate() {
            let pdu = test_utils::message_pdu(
                room,
                alice,
                depth,
                &format!("$e{}:test", i + 1),
                "x",
            );
            db.append_pdu(&pdu, None, false).unwrap();
        }
        db
    }

    #[test]
    fn position_in_topology_round_trips() {
        let db = seeded_db();
        let snapshot = db.sync_snapshot().unwrap();

        assert_eq!(
            snapshot
                .position_in_topology(event_id!("$e3:test"))
                .unwrap(),
            TopologyToken {
                depth: 4,
                pdu_position: 3
            }
        );
        assert!(snapshot
            .position_in_topology(event_id!("$unknown:test"))
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn max_position_is_latest_pair() {
        let db = seeded_db();
        let snapshot = db.sync_snapshot().unwrap();

        assert_eq!(
            snapshot
                .max_position_in_topology(room_id!("!room:test"))
                .unwrap(),
            TopologyToken {
                depth: 5,
                pdu_position: 4
            }
        );
        assert!(snapshot
            .max_position_in_topology(room_id!("!empty:test"))
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn backward_token_is_strictly_before_first_event() {
        let db = seeded_db();
        let snapshot = db.sync_snapshot().unwrap();

        let events = snapshot
            .events_by_id(&[event_id!("$e1:test").to_owned()])
            .unwrap();
        let token = snapshot.get_backward_topology_pos(&events).unwrap();
        let first = snapshot
            .position_in_topology(event_id!("$e1:test"))
            .unwrap();
        assert!(token < first);

        assert_eq!(
            snapshot.get_backward_topology_pos(&[]).unwrap(),
            TopologyToken::default()
        );
    }

    #[test]
    fn stream_to_topological_cursor_semantics() {
        let db = seeded_db();
        let snapshot = db.sync_snapshot().unwrap();
        let room = room_id!("!room:test");

        // An event lies across the cursor in both directions.
        assert_eq!(
            snapshot
                .stream_to_topological_position(room, 2, true)
                .unwrap(),
            TopologyToken {
                depth: 3,
                pdu_position: 2
            }
        );
        assert_eq!(
            snapshot
                .stream_to_topological_position(room, 3, false)
                .unwrap(),
            TopologyToken {
                depth: 4,
                pdu_position: 3
            }
        );

        // Past the frontier going forward: the room maximum.
        assert_eq!(
            snapshot
                .stream_to_topological_position(room, 1000, false)
                .unwrap(),
            TopologyToken {
                depth: 5,
                pdu_position: 4
            }
        );

        // Before anything going backward: the lower sentinel keeps the
        // stream cursor.
        let empty = room_id!("!empty:test");
        assert_eq!(
            snapshot
                .stream_to_topological_position(empty, 7, true)
                .unwrap(),
            TopologyToken {
                depth: 0,
                pdu_position: 7
            }
        );
    }

    #[test]
    fn backward_extremities_group_by_event() {
        let db = seeded_db();
        let room = room_id!("!room:test");
        db.insert_backward_extremity(room, event_id!("$e1:test"), event_id!("$gone:test"))
            .unwrap();
        db.insert_backward_extremity(room, event_id!("$e1:test"), event_id!("$gone2:test"))
            .unwrap();

        let snapshot = db.sync_snapshot().unwrap();
        let extremities = snapshot.backward_extremities(room).unwrap();
        assert_eq!(extremities[event_id!("$e1:test")].len(), 2);

        db.delete_backward_extremity(room, event_id!("$gone:test"))
            .unwrap();
        let snapshot = db.sync_snapshot().unwrap();
        assert_eq!(
            snapshot.backward_extremities(room).unwrap()[event_id!("$e1:test")].len(),
            1
        );
    }
}
