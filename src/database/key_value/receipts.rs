// =============================================================================
// Conflux Matrix Sync Engine - Receipts
// =============================================================================
//
// Project: Conflux - Matrix Sync Read Path Engine
// License: Apache 2.0 / MIT
//
// Description:
//   Read receipt log on its own stream clock. One live row per
//   (room, receipt type, user); updates re-key the row so range scans see
//   only the latest position.
//
// =============================================================================

use std::collections::HashSet;

use ruma::{EventId, OwnedRoomId, RoomId, UserId};

use crate::{
    database::{tables, KeyValueDatabase},
    service::sync::{
        token::{StreamKind, StreamPosition},
        OutputReceiptEvent, SyncSnapshot,
    },
    utils, Error, Result,
};

impl KeyValueDatabase {
    /// Records a receipt, replacing the previous one of the same
    /// (room, type, user).
    #[tracing::instrument(skip(self))]
    pub fn store_receipt(
        &self,
        room_id: &RoomId,
        receipt_type: &str,
        user_id: &UserId,
        event_id: &EventId,
    ) -> Result<StreamPosition> {
        let mut index_key = room_id.as_bytes().to_vec();
        index_key.push(0xff);
        index_key.extend_from_slice(receipt_type.as_bytes());
        index_key.push(0xff);
        index_key.extend_from_slice(user_id.as_bytes());

        if let Some(old_id) = self.roomtypeuserid_receiptid.get(&index_key)? {
            self.receiptid_receipt.remove(&old_id)?;
        }

        let position = self.next_position(StreamKind::Receipt)?;
        let receipt = OutputReceiptEvent {
            room_id: room_id.to_owned(),
            receipt_type: receipt_type.to_owned(),
            user_id: user_id.to_owned(),
            event_id: event_id.to_owned(),
            origin_server_ts: utils::millis_since_unix_epoch(),
        };

        self.receiptid_receipt.insert(
            &position.to_be_bytes(),
            &serde_json::to_vec(&receipt).expect("OutputReceiptEvent::to_vec always works"),
        )?;
        self.roomtypeuserid_receiptid
            .insert(&index_key, &position.to_be_bytes())?;

        Ok(position)
    }
}

impl SyncSnapshot<'_> {
    /// Receipts for `room_ids` past `since`, with the highest position
    /// seen (or `since` on a quiet window).
    #[tracing::instrument(skip(self, room_ids))]
    pub fn select_room_receipts_after(
        &self,
        room_ids: &[OwnedRoomId],
        since: StreamPosition,
    ) -> Result<(StreamPosition, Vec<OutputReceiptEvent>)> {
        let rooms: HashSet<&OwnedRoomId> = room_ids.iter().collect();

        let mut max_position = since;
        let mut receipts = Vec::new();
        for (key, value) in self
            .kv
            .iter_from(tables::RECEIPTID_RECEIPT, &(since + 1).to_be_bytes(), false)
        {
            let position = utils::u64_from_bytes(&key)
                .map_err(|_| Error::bad_database("Invalid receipt id bytes in db."))?;
            let receipt: OutputReceiptEvent = serde_json::from_slice(&value)
                .map_err(|_| Error::bad_database("Invalid receipt in db."))?;

            if !rooms.contains(&receipt.room_id) {
                continue;
            }

            max_position = max_position.max(position);
            receipts.push(receipt);
        }

        Ok((max_position, receipts))
    }

    /// Positionless variant for response assembly.
    pub fn room_receipts(
        &self,
        room_ids: &[OwnedRoomId],
        since: StreamPosition,
    ) -> Result<Vec<OutputReceiptEvent>> {
        let (_, receipts) = self.select_room_receipts_after(room_ids, since)?;
        Ok(receipts)
    }
}
