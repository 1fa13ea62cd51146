// =============================================================================
// Conflux Matrix Sync Engine - Presence
// =============================================================================
//
// Project: Conflux - Matrix Sync Read Path Engine
// License: Apache 2.0 / MIT
//
// Description:
//   Latest presence per user plus a position log on the presence clock.
//   The log keeps one entry per user; the presence pump replaces it on
//   every update.
//
// =============================================================================

use std::collections::BTreeMap;

use ruma::{OwnedUserId, UserId};

use crate::{
    database::{tables, KeyValueDatabase},
    service::sync::{
        filter::EventFilter,
        token::{StreamKind, StreamPosition},
        PresenceUpdate, SyncSnapshot,
    },
    utils, Error, Result,
};

impl KeyValueDatabase {
    #[tracing::instrument(skip(self, status_msg))]
    pub fn update_presence(
        &self,
        user_id: &UserId,
        presence: &str,
        status_msg: Option<String>,
        currently_active: bool,
    ) -> Result<StreamPosition> {
        if let Some(bytes) = self.userid_presence.get(user_id.as_bytes())? {
            let old: PresenceUpdate = serde_json::from_slice(&bytes)
                .map_err(|_| Error::bad_database("Invalid presence row in db."))?;
            self.presenceid_userid
                .remove(&old.stream_position.to_be_bytes())?;
        }

        let position = self.next_position(StreamKind::Presence)?;
        let update = PresenceUpdate {
            user_id: user_id.to_owned(),
            presence: presence.to_owned(),
            status_msg,
            last_active_ts: utils::millis_since_unix_epoch(),
            currently_active,
            stream_position: position,
        };

        self.userid_presence.insert(
            user_id.as_bytes(),
            &serde_json::to_vec(&update).expect("PresenceUpdate::to_vec always works"),
        )?;
        self.presenceid_userid
            .insert(&position.to_be_bytes(), user_id.as_bytes())?;

        Ok(position)
    }
}

impl SyncSnapshot<'_> {
    pub fn get_presence_for_user(&self, user_id: &UserId) -> Result<Option<PresenceUpdate>> {
        self.kv
            .get(tables::USERID_PRESENCE, user_id.as_bytes())?
            .map(|bytes| {
                serde_json::from_slice(&bytes)
                    .map_err(|_| Error::bad_database("Invalid presence row in db."))
            })
            .transpose()
    }

    /// Latest presence of every user who changed after `since`, filtered
    /// and bounded by `filter`.
    #[tracing::instrument(skip(self, filter))]
    pub fn get_presence_after(
        &self,
        since: StreamPosition,
        filter: &EventFilter,
    ) -> Result<BTreeMap<OwnedUserId, PresenceUpdate>> {
        let mut updates = BTreeMap::new();

        for (_, user_bytes) in self
            .kv
            .iter_from(tables::PRESENCEID_USERID, &(since + 1).to_be_bytes(), false)
        {
            if updates.len() == filter.limit {
                break;
            }

            let user_id = UserId::parse(
                utils::string_from_bytes(&user_bytes)
                    .map_err(|_| Error::bad_database("Invalid user id bytes in db."))?,
            )
            .map_err(|_| Error::bad_database("Invalid user id in db."))?;

            if !filter.sender_allowed(&user_id) {
                continue;
            }

            if let Some(update) = self.get_presence_for_user(&user_id)? {
                updates.insert(user_id, update);
            }
        }

        Ok(updates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;
    use ruma::user_id;

    #[test]
    fn latest_update_replaces_log_entry() {
        let db = KeyValueDatabase::load_or_create(&Config::default()).unwrap();
        let alice = user_id!("@alice:test");

        let first = db.update_presence(alice, "online", None, true).unwrap();
        let second = db
            .update_presence(alice, "unavailable", Some("afk".to_owned()), false)
            .unwrap();
        assert!(second > first);

        let snapshot = db.sync_snapshot().unwrap();
        let current = snapshot.get_presence_for_user(alice).unwrap().unwrap();
        assert_eq!(current.presence, "unavailable");
        assert_eq!(current.status_msg.as_deref(), Some("afk"));

        // The old log entry is gone: a scan from before the first update
        // yields exactly one change for alice.
        let updates = snapshot
            .get_presence_after(0, &EventFilter::default())
            .unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[alice].stream_position, second);

        // Nothing past the frontier.
        assert!(snapshot
            .get_presence_after(second, &EventFilter::default())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn filter_scopes_presence_senders() {
        let db = KeyValueDatabase::load_or_create(&Config::default()).unwrap();
        let alice = user_id!("@alice:test");
        let bob = user_id!("@bob:test");

        db.update_presence(alice, "online", None, true).unwrap();
        db.update_presence(bob, "online", None, true).unwrap();

        let filter = EventFilter {
            not_senders: vec![bob.to_owned()],
            ..Default::default()
        };
        let snapshot = db.sync_snapshot().unwrap();
        let updates = snapshot.get_presence_after(0, &filter).unwrap();
        assert_eq!(updates.len(), 1);
        assert!(updates.contains_key(alice));
    }
}
