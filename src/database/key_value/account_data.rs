// =============================================================================
// Conflux Matrix Sync Engine - Account Data
// =============================================================================
//
// Project: Conflux - Matrix Sync Read Path Engine
// License: Apache 2.0 / MIT
//
// Description:
//   Account data change log on its own stream clock. Only (room, type)
//   references are tracked here; the payloads live with the user store.
//   Global account data uses the empty room ID.
//
// =============================================================================

use std::collections::BTreeMap;

use ruma::{RoomId, UserId};
use serde::{Deserialize, Serialize};

use crate::{
    database::{tables, KeyValueDatabase},
    service::sync::{
        filter::EventFilter,
        token::{Range, StreamKind, StreamPosition},
        SyncSnapshot,
    },
    utils, Error, Result,
};

#[derive(Serialize, Deserialize)]
struct AccountDataRow {
    /// Empty for global account data.
    room_id: String,
    data_type: String,
}

impl KeyValueDatabase {
    /// Notes that account data of `data_type` changed for the user,
    /// replacing any earlier change record of the same (room, type).
    #[tracing::instrument(skip(self))]
    pub fn update_account_data(
        &self,
        user_id: &UserId,
        room_id: Option<&RoomId>,
        data_type: &str,
    ) -> Result<StreamPosition> {
        let mut prefix = user_id.as_bytes().to_vec();
        prefix.push(0xff);

        let room_key = room_id.map(RoomId::as_str).unwrap_or_default();
        let stale: Vec<_> = self
            .useraccountdataid_type
            .scan_prefix(prefix.clone())
            .filter(|(_, value)| {
                serde_json::from_slice::<AccountDataRow>(value)
                    .map(|row| row.room_id == room_key && row.data_type == data_type)
                    .unwrap_or(false)
            })
            .map(|(key, _)| key)
            .collect();
        for key in stale {
            self.useraccountdataid_type.remove(&key)?;
        }

        let position = self.next_position(StreamKind::AccountData)?;
        let mut key = prefix;
        key.extend_from_slice(&position.to_be_bytes());

        let row = AccountDataRow {
            room_id: room_key.to_owned(),
            data_type: data_type.to_owned(),
        };
        self.useraccountdataid_type.insert(
            &key,
            &serde_json::to_vec(&row).expect("AccountDataRow::to_vec always works"),
        )?;

        Ok(position)
    }
}

impl SyncSnapshot<'_> {
    /// Account data types changed in `range`, grouped by room (the empty
    /// key holds global data), with the highest position seen or the
    /// window's lower bound when quiet.
    #[tracing::instrument(skip(self, filter))]
    pub fn select_account_data_in_range(
        &self,
        user_id: &UserId,
        range: Range,
        filter: &EventFilter,
    ) -> Result<(BTreeMap<String, Vec<String>>, StreamPosition)> {
        let mut prefix = user_id.as_bytes().to_vec();
        prefix.push(0xff);

        let mut data: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut max_position = range.low();
        let mut taken = 0;

        let mut first_possible = prefix.clone();
        first_possible.extend_from_slice(&(range.low() + 1).to_be_bytes());
        for (key, value) in self
            .kv
            .iter_from(tables::USERACCOUNTDATAID_TYPE, &first_possible, false)
            .take_while(|(key, _)| key.starts_with(&prefix))
        {
            let position = utils::u64_from_bytes(&key[prefix.len()..])
                .map_err(|_| Error::bad_database("Invalid account data id bytes in db."))?;
            if position > range.high() {
                break;
            }

            let row: AccountDataRow = serde_json::from_slice(&value)
                .map_err(|_| Error::bad_database("Invalid account data row in db."))?;
            if !filter.type_allowed(&row.data_type) {
                continue;
            }
            if taken == filter.limit {
                break;
            }

            max_position = max_position.max(position);
            data.entry(row.room_id).or_default().push(row.data_type);
            taken += 1;
        }

        Ok((data, max_position))
    }
}
