// =============================================================================
// Conflux Matrix Sync Engine - Send-To-Device
// =============================================================================
//
// Project: Conflux - Matrix Sync Read Path Engine
// License: Apache 2.0 / MIT
//
// Description:
//   Direct device-to-device traffic on its own stream clock. The quiet
//   window returns the upper bound as its cursor so idle devices still
//   advance monotonically.
//
// =============================================================================

use ruma::{DeviceId, UserId};

use crate::{
    database::{tables, KeyValueDatabase},
    service::sync::{
        token::{StreamKind, StreamPosition},
        SendToDeviceEvent, SyncSnapshot,
    },
    utils, Error, Result,
};

fn userdevice_prefix(user_id: &UserId, device_id: &DeviceId) -> Vec<u8> {
    let mut prefix = user_id.as_bytes().to_vec();
    prefix.push(0xff);
    prefix.extend_from_slice(device_id.as_bytes());
    prefix.push(0xff);
    prefix
}

impl KeyValueDatabase {
    #[tracing::instrument(skip(self, event))]
    pub fn add_send_to_device(
        &self,
        target_user: &UserId,
        target_device: &DeviceId,
        event: &SendToDeviceEvent,
    ) -> Result<StreamPosition> {
        let position = self.next_position(StreamKind::SendToDevice)?;
        let mut key = userdevice_prefix(target_user, target_device);
        key.extend_from_slice(&position.to_be_bytes());

        self.todeviceid_events.insert(
            &key,
            &serde_json::to_vec(event).expect("SendToDeviceEvent::to_vec always works"),
        )?;

        Ok(position)
    }
}

impl SyncSnapshot<'_> {
    /// Messages for the device in `(from, to]`. A window with no events
    /// returns `to` as the cursor, advancing past the empty stretch;
    /// otherwise the position of the last delivered message.
    #[tracing::instrument(skip(self))]
    pub fn select_send_to_device_messages(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        from: StreamPosition,
        to: StreamPosition,
    ) -> Result<(StreamPosition, Vec<SendToDeviceEvent>)> {
        let prefix = userdevice_prefix(user_id, device_id);

        let mut last_position = from;
        let mut events = Vec::new();

        let mut first_possible = prefix.clone();
        first_possible.extend_from_slice(&(from + 1).to_be_bytes());
        for (key, value) in self
            .kv
            .iter_from(tables::TODEVICEID_EVENTS, &first_possible, false)
            .take_while(|(key, _)| key.starts_with(&prefix))
        {
            let position = utils::u64_from_bytes(&key[prefix.len()..])
                .map_err(|_| Error::bad_database("Invalid send-to-device id bytes in db."))?;
            if position > to {
                break;
            }

            events.push(
                serde_json::from_slice(&value)
                    .map_err(|_| Error::bad_database("Invalid send-to-device event in db."))?,
            );
            last_position = position;
        }

        if events.is_empty() {
            return Ok((to, Vec::new()));
        }

        Ok((last_position, events))
    }
}
