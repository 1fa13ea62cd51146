// =============================================================================
// Conflux Matrix Sync Engine - Typing Stream
// =============================================================================
//
// Project: Conflux - Matrix Sync Read Path Engine
// License: Apache 2.0 / MIT
//
// Description:
//   In-memory typing notifications. Typing never touches disk; only its
//   clock participates in the sync token, so a typing change can wake a
//   long-poll without a storage write.
//
// =============================================================================

use std::{collections::BTreeMap, sync::Arc};

use ruma::{OwnedRoomId, OwnedUserId, RoomId, UserId};
use tokio::sync::{broadcast, RwLock};

use crate::{
    database::KeyValueDatabase,
    service::sync::token::{StreamKind, StreamPosition},
    utils, Result,
};

pub struct Service {
    db: Arc<KeyValueDatabase>,
    /// Cap on how far in the future a timeout may lie, in millis.
    typing_timeout_max_ms: u64,
    /// room -> user -> timeout timestamp in unix millis
    typing: RwLock<BTreeMap<OwnedRoomId, BTreeMap<OwnedUserId, u64>>>,
    /// room -> position of the last change to its typing set
    last_typing_update: RwLock<BTreeMap<OwnedRoomId, StreamPosition>>,
    typing_update_sender: broadcast::Sender<OwnedRoomId>,
}

impl Service {
    pub fn new(db: Arc<KeyValueDatabase>, config: &crate::Config) -> Self {
        let (typing_update_sender, _) = broadcast::channel(100);
        Self {
            db,
            typing_timeout_max_ms: config.typing_timeout_max_ms,
            typing: RwLock::new(BTreeMap::new()),
            last_typing_update: RwLock::new(BTreeMap::new()),
            typing_update_sender,
        }
    }

    /// Sets a user as typing until the timeout timestamp is reached or
    /// `typing_remove` is called.
    pub async fn typing_add(
        &self,
        user_id: &UserId,
        room_id: &RoomId,
        timeout: u64,
    ) -> Result<StreamPosition> {
        let timeout =
            timeout.min(utils::millis_since_unix_epoch() + self.typing_timeout_max_ms);
        self.typing
            .write()
            .await
            .entry(room_id.to_owned())
            .or_default()
            .insert(user_id.to_owned(), timeout);

        let position = self.db.next_position(StreamKind::Typing)?;
        self.last_typing_update
            .write()
            .await
            .insert(room_id.to_owned(), position);
        let _ = self.typing_update_sender.send(room_id.to_owned());

        Ok(position)
    }

    /// Removes a user from typing before the timeout is reached.
    pub async fn typing_remove(&self, user_id: &UserId, room_id: &RoomId) -> Result<()> {
        let removed = self
            .typing
            .write()
            .await
            .entry(room_id.to_owned())
            .or_default()
            .remove(user_id)
            .is_some();

        if removed {
            let position = self.db.next_position(StreamKind::Typing)?;
            self.last_typing_update
                .write()
                .await
                .insert(room_id.to_owned(), position);
            let _ = self.typing_update_sender.send(room_id.to_owned());
        }

        Ok(())
    }

    pub async fn wait_for_update(&self, room_id: &RoomId) -> Result<()> {
        let mut receiver = self.typing_update_sender.subscribe();
        while let Ok(next) = receiver.recv().await {
            if next == room_id {
                break;
            }
        }

        Ok(())
    }

    /// Makes sure that typing events with old timestamps get removed.
    async fn typings_maintain(&self, room_id: &RoomId) -> Result<()> {
        let current_timestamp = utils::millis_since_unix_epoch();
        let mut removable = Vec::new();
        {
            let typing = self.typing.read().await;
            let Some(room) = typing.get(room_id) else {
                return Ok(());
            };
            for (user, timeout) in room {
                if *timeout < current_timestamp {
                    removable.push(user.clone());
                }
            }
        }

        if !removable.is_empty() {
            let mut typing = self.typing.write().await;
            let room = typing.entry(room_id.to_owned()).or_default();
            for user in removable {
                room.remove(&user);
            }
            let position = self.db.next_position(StreamKind::Typing)?;
            self.last_typing_update
                .write()
                .await
                .insert(room_id.to_owned(), position);
            let _ = self.typing_update_sender.send(room_id.to_owned());
        }

        Ok(())
    }

    /// The position of the last typing change in `room_id`, for deciding
    /// whether a sync window carries its typing set.
    pub async fn last_typing_update(&self, room_id: &RoomId) -> Result<StreamPosition> {
        self.typings_maintain(room_id).await?;
        Ok(self
            .last_typing_update
            .read()
            .await
            .get(room_id)
            .copied()
            .unwrap_or_default())
    }

    /// Users currently typing in `room_id`, expired entries dropped.
    pub async fn typings_for_room(&self, room_id: &RoomId) -> Result<Vec<OwnedUserId>> {
        self.typings_maintain(room_id).await?;
        Ok(self
            .typing
            .read()
            .await
            .get(room_id)
            .map(|room| room.keys().cloned().collect())
            .unwrap_or_default())
    }
}
