// =============================================================================
// Conflux Matrix Sync Engine - Stream Positions and Tokens
// =============================================================================
//
// Project: Conflux - Matrix Sync Read Path Engine
// License: Apache 2.0 / MIT
//
// Description:
//   The coordinate system of the sync read path: per-stream positions, the
//   eight-tuple sync token, topological tokens and half-open ranges.
//
// =============================================================================

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::Error;

/// Server-assigned monotonic sequence number, one logical clock per
/// stream. Zero means "before anything".
pub type StreamPosition = u64;

/// The eight independently-advancing streams composed by a sync response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Pdu,
    Receipt,
    Invite,
    SendToDevice,
    AccountData,
    NotificationData,
    Presence,
    Typing,
}

impl StreamKind {
    pub const ALL: [StreamKind; 8] = [
        StreamKind::Pdu,
        StreamKind::Receipt,
        StreamKind::Invite,
        StreamKind::SendToDevice,
        StreamKind::AccountData,
        StreamKind::NotificationData,
        StreamKind::Presence,
        StreamKind::Typing,
    ];

    /// Counter key in the `streamkind_count` tree.
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            StreamKind::Pdu => b"pdu",
            StreamKind::Receipt => b"receipt",
            StreamKind::Invite => b"invite",
            StreamKind::SendToDevice => b"sendtodevice",
            StreamKind::AccountData => b"accountdata",
            StreamKind::NotificationData => b"notificationdata",
            StreamKind::Presence => b"presence",
            StreamKind::Typing => b"typing",
        }
    }
}

/// A sync cursor: one position per stream. Componentwise comparable only;
/// no total order is defined across the tuple.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncToken {
    pub pdu_position: StreamPosition,
    pub receipt_position: StreamPosition,
    pub invite_position: StreamPosition,
    pub send_to_device_position: StreamPosition,
    pub account_data_position: StreamPosition,
    pub notification_data_position: StreamPosition,
    pub presence_position: StreamPosition,
    pub typing_position: StreamPosition,
}

impl SyncToken {
    /// True when `other` has advanced past `self` on any stream, i.e. a
    /// sync response against `other` can carry new data.
    pub fn any_after(&self, other: &SyncToken) -> bool {
        other.pdu_position > self.pdu_position
            || other.receipt_position > self.receipt_position
            || other.invite_position > self.invite_position
            || other.send_to_device_position > self.send_to_device_position
            || other.account_data_position > self.account_data_position
            || other.notification_data_position > self.notification_data_position
            || other.presence_position > self.presence_position
            || other.typing_position > self.typing_position
    }
}

/// Tokens are opaque on the wire: `s` followed by the eight positions.
impl fmt::Display for SyncToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "s{}_{}_{}_{}_{}_{}_{}_{}",
            self.pdu_position,
            self.receipt_position,
            self.invite_position,
            self.send_to_device_position,
            self.account_data_position,
            self.notification_data_position,
            self.presence_position,
            self.typing_position,
        )
    }
}

impl FromStr for SyncToken {
    type Err = Error;

    fn from_str(token: &str) -> Result<Self, Error> {
        let positions = token
            .strip_prefix('s')
            .ok_or(Error::BadRequest("Invalid sync token."))?
            .split('_')
            .map(|part| {
                part.parse::<StreamPosition>()
                    .map_err(|_| Error::BadRequest("Invalid sync token."))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let [pdu, receipt, invite, send_to_device, account_data, notification_data, presence, typing]: [StreamPosition; 8] =
            positions
                .try_into()
                .map_err(|_| Error::BadRequest("Invalid sync token."))?;

        Ok(SyncToken {
            pdu_position: pdu,
            receipt_position: receipt,
            invite_position: invite,
            send_to_device_position: send_to_device,
            account_data_position: account_data,
            notification_data_position: notification_data,
            presence_position: presence,
            typing_position: typing,
        })
    }
}

/// DAG-consistent pagination coordinate. `depth` is non-unique within a
/// room; `pdu_position` disambiguates events sharing a depth.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopologyToken {
    pub depth: StreamPosition,
    pub pdu_position: StreamPosition,
}

impl TopologyToken {
    /// Moves one slot earlier in topology, so the token excludes the event
    /// it was derived from when used as an upper bound.
    pub fn decrement(&mut self) {
        if self.pdu_position > 0 {
            self.pdu_position -= 1;
        } else if self.depth > 0 {
            self.depth -= 1;
            self.pdu_position = StreamPosition::MAX;
        }
    }
}

impl fmt::Display for TopologyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}-{}", self.depth, self.pdu_position)
    }
}

impl FromStr for TopologyToken {
    type Err = Error;

    fn from_str(token: &str) -> Result<Self, Error> {
        let (depth, pdu_position) = token
            .strip_prefix('t')
            .and_then(|rest| rest.split_once('-'))
            .ok_or(Error::BadRequest("Invalid topology token."))?;

        Ok(TopologyToken {
            depth: depth
                .parse()
                .map_err(|_| Error::BadRequest("Invalid topology token."))?,
            pdu_position: pdu_position
                .parse()
                .map_err(|_| Error::BadRequest("Invalid topology token."))?,
        })
    }
}

/// A half-open `(from, to]` window on a single stream. Backward ranges
/// have `from > to` and yield reverse-chronological results.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Range {
    pub from: StreamPosition,
    pub to: StreamPosition,
}

impl Range {
    pub fn new(from: StreamPosition, to: StreamPosition) -> Self {
        Self { from, to }
    }

    pub fn backwards(&self) -> bool {
        self.from > self.to
    }

    /// The exclusive lower bound of the window.
    pub fn low(&self) -> StreamPosition {
        if self.backwards() {
            self.to
        } else {
            self.from
        }
    }

    /// The inclusive upper bound of the window.
    pub fn high(&self) -> StreamPosition {
        if self.backwards() {
            self.from
        } else {
            self.to
        }
    }

    pub fn contains(&self, position: StreamPosition) -> bool {
        position > self.low() && position <= self.high()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_token_roundtrip() {
        let token = SyncToken {
            pdu_position: 1,
            receipt_position: 2,
            invite_position: 3,
            send_to_device_position: 4,
            account_data_position: 5,
            notification_data_position: 6,
            presence_position: 7,
            typing_position: 8,
        };
        assert_eq!(token.to_string(), "s1_2_3_4_5_6_7_8");
        assert_eq!("s1_2_3_4_5_6_7_8".parse::<SyncToken>().unwrap(), token);
    }

    #[test]
    fn sync_token_rejects_malformed_input() {
        assert!("1_2_3_4_5_6_7_8".parse::<SyncToken>().is_err());
        assert!("s1_2_3".parse::<SyncToken>().is_err());
        assert!("s1_2_3_4_5_6_7_8_9".parse::<SyncToken>().is_err());
        assert!("sa_b_c_d_e_f_g_h".parse::<SyncToken>().is_err());
    }

    #[test]
    fn any_after_is_componentwise() {
        let since = SyncToken::default();
        let mut now = SyncToken::default();
        assert!(!since.any_after(&now));
        now.typing_position = 1;
        assert!(since.any_after(&now));
    }

    #[test]
    fn topology_token_roundtrip() {
        let token = TopologyToken {
            depth: 7,
            pdu_position: 99,
        };
        assert_eq!(token.to_string(), "t7-99");
        assert_eq!("t7-99".parse::<TopologyToken>().unwrap(), token);
        assert!("7-99".parse::<TopologyToken>().is_err());
    }

    #[test]
    fn decrement_moves_one_slot_earlier() {
        let mut token = TopologyToken {
            depth: 3,
            pdu_position: 10,
        };
        token.decrement();
        assert_eq!(token, TopologyToken { depth: 3, pdu_position: 9 });

        let mut edge = TopologyToken {
            depth: 3,
            pdu_position: 0,
        };
        edge.decrement();
        assert_eq!(edge.depth, 2);
        assert_eq!(edge.pdu_position, StreamPosition::MAX);
    }

    #[test]
    fn range_direction_and_bounds() {
        let forward = Range::new(5, 20);
        assert!(!forward.backwards());
        assert!(!forward.contains(5));
        assert!(forward.contains(6));
        assert!(forward.contains(20));
        assert!(!forward.contains(21));

        let backward = Range::new(20, 5);
        assert!(backward.backwards());
        assert_eq!(backward.low(), 5);
        assert_eq!(backward.high(), 20);
    }
}
