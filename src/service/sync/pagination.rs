// =============================================================================
// Conflux Matrix Sync Engine - Pagination Engine
// =============================================================================
//
// Project: Conflux - Matrix Sync Read Path Engine
// License: Apache 2.0 / MIT
//
// Description:
//   /messages-style windows: translates between stream and topological
//   coordinates and yields ordered event ranges out of the session.
//
// =============================================================================

use ruma::RoomId;

use crate::Result;

use super::{filter::RoomEventFilter, token::TopologyToken, StreamEvent, SyncSnapshot};

impl SyncSnapshot<'_> {
    /// Events between two topological tokens, ordered by
    /// `(depth, pdu_position)`; newest-first when `backward_ordering`.
    /// The window excludes `to` going backward (resp. `from` going
    /// forward), so feeding a response token back in does not repeat its
    /// boundary event.
    #[tracing::instrument(skip(self, filter))]
    pub fn events_in_topological_range(
        &self,
        room_id: &RoomId,
        from: &TopologyToken,
        to: &TopologyToken,
        filter: &RoomEventFilter,
        backward_ordering: bool,
    ) -> Result<Vec<StreamEvent>> {
        let (min_depth, min_stream_pos, max_depth, max_stream_pos_for_max_depth);
        if backward_ordering {
            // Backward ordering means the `from` token is deeper than the
            // `to` token. The stream position disambiguates events
            // sharing `from`'s depth: ones past it were not yet seen.
            min_depth = to.depth;
            min_stream_pos = to.pdu_position;
            max_depth = from.depth;
            max_stream_pos_for_max_depth = Some(from.pdu_position);
        } else {
            min_depth = from.depth;
            min_stream_pos = from.pdu_position;
            max_depth = to.depth;
            max_stream_pos_for_max_depth = None;
        }

        let event_ids = self.event_ids_in_range(
            room_id,
            min_depth,
            min_stream_pos,
            max_depth,
            max_stream_pos_for_max_depth,
            filter.limit(),
            !backward_ordering,
        )?;

        // Materialise the IDs, reapplying the room-event filter.
        Ok(self
            .events_by_id(&event_ids)?
            .into_iter()
            .filter(|event| filter.matches(&event.pdu))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        database::KeyValueDatabase,
        service::sync::token::{Range, StreamKind},
        test_utils, Config,
    };
    use ruma::{room_id, user_id};

    /// Room with events at (depth, position) of (3,10), (3,11), (4,12),
    /// (5,13) — stream positions line up by burning 9 positions first.
    fn seeded_db() -> KeyValueDatabase {
        let db = KeyValueDatabase::load_or_create(&Config::default()).unwrap();
        for _ in 0..9 {
            db.next_position(StreamKind::Pdu).unwrap();
        }

        let room = room_id!("!room:test");
        let alice = user_id!("@alice:test");
        for (i, depth) in [3u64, 3, 4, 5].into_iter().enumerate() {
            let position = db
                .append_pdu(
                    &test_utils::message_pdu(
                        room,
                        alice,
                        depth,
                        &format!("$e{}:test", i + 10),
                        "x",
                    ),
                    None,
                    false,
                )
                .unwrap();
            assert_eq!(position, i as u64 + 10);
        }
        db
    }

    #[test]
    fn backward_window_excludes_the_to_event() {
        let db = seeded_db();
        let snapshot = db.sync_snapshot().unwrap();

        let events = snapshot
            .events_in_topological_range(
                room_id!("!room:test"),
                &TopologyToken {
                    depth: 5,
                    pdu_position: 13,
                },
                &TopologyToken {
                    depth: 3,
                    pdu_position: 10,
                },
                &RoomEventFilter::default(),
                true,
            )
            .unwrap();

        // The from-side tiebreak restricts the depth-5 slice; the
        // depth-3 slice keeps events past position 10 but drops the
        // boundary event itself.
        let positions: Vec<_> = events.iter().map(|event| event.position).collect();
        assert_eq!(positions, vec![13, 12, 11]);
    }

    #[test]
    fn backward_tiebreak_restricts_the_from_slice() {
        let db = seeded_db();
        let snapshot = db.sync_snapshot().unwrap();

        // From inside the depth-3 slice: only the earlier same-depth
        // event is left.
        let events = snapshot
            .events_in_topological_range(
                room_id!("!room:test"),
                &TopologyToken {
                    depth: 3,
                    pdu_position: 11,
                },
                &TopologyToken {
                    depth: 3,
                    pdu_position: 9,
                },
                &RoomEventFilter::default(),
                true,
            )
            .unwrap();

        let positions: Vec<_> = events.iter().map(|event| event.position).collect();
        assert_eq!(positions, vec![11, 10]);
    }

    #[test]
    fn forward_window_ascends_from_the_from_token() {
        let db = seeded_db();
        let snapshot = db.sync_snapshot().unwrap();

        let events = snapshot
            .events_in_topological_range(
                room_id!("!room:test"),
                &TopologyToken {
                    depth: 3,
                    pdu_position: 10,
                },
                &TopologyToken {
                    depth: 5,
                    pdu_position: 13,
                },
                &RoomEventFilter::default(),
                false,
            )
            .unwrap();

        let positions: Vec<_> = events.iter().map(|event| event.position).collect();
        assert_eq!(positions, vec![11, 12, 13]);
    }

    #[test]
    fn limit_truncates_the_window() {
        let db = seeded_db();
        let snapshot = db.sync_snapshot().unwrap();

        let filter: RoomEventFilter = serde_json::from_str(r#"{"limit": 2}"#).unwrap();
        let events = snapshot
            .events_in_topological_range(
                room_id!("!room:test"),
                &TopologyToken {
                    depth: 5,
                    pdu_position: 13,
                },
                &TopologyToken {
                    depth: 0,
                    pdu_position: 0,
                },
                &filter,
                true,
            )
            .unwrap();
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn pagination_walk_reaches_the_window_start() {
        let db = seeded_db();
        let snapshot = db.sync_snapshot().unwrap();
        let room = room_id!("!room:test");

        // A client starting from the live frontier pages backward with
        // the tokens the responses hand it.
        let (recent, _) = snapshot
            .recent_events(
                room,
                Range::new(13, 9),
                &RoomEventFilter::default(),
                true,
                true,
            )
            .unwrap();
        let mut from = snapshot.max_position_in_topology(room).unwrap();
        let to = snapshot.get_backward_topology_pos(&recent).unwrap();
        assert_eq!(to, TopologyToken { depth: 3, pdu_position: 9 });

        let filter: RoomEventFilter = serde_json::from_str(r#"{"limit": 2}"#).unwrap();
        let first_page = snapshot
            .events_in_topological_range(room, &from, &to, &filter, true)
            .unwrap();
        assert_eq!(first_page.len(), 2);

        from = snapshot
            .get_backward_topology_pos(&{
                let mut oldest_first = first_page.clone();
                oldest_first.reverse();
                oldest_first
            })
            .unwrap();
        let second_page = snapshot
            .events_in_topological_range(room, &from, &to, &filter, true)
            .unwrap();
        assert_eq!(second_page.len(), 2);
        assert!(second_page.iter().all(|event| event.position <= 11));
    }
}
