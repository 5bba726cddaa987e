//! Wire messages exchanged between peers.
//!
//! Messages are serialized with bincode. Inputs are batched: every `Input`
//! message carries all records from the receiver's last acknowledged frame
//! forward, so any single datagram arriving is enough to catch up.

use serde::{Deserialize, Serialize};

use crate::input::InputRecord;
use crate::{Frame, PlayerHandle};

/// A batch of input records from one player, starting at `start_frame`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputMessage {
    /// The sending player.
    pub player: PlayerHandle,
    /// The frame of the first record in `records`.
    pub start_frame: Frame,
    /// The highest frame the sender has received from us, for retransmit
    /// bookkeeping.
    pub ack_frame: Frame,
    /// Consecutive input records for `start_frame`, `start_frame + 1`, ...
    pub records: Vec<InputRecord>,
}

impl std::fmt::Debug for InputMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputMessage")
            .field("player", &self.player)
            .field("start_frame", &self.start_frame)
            .field("ack_frame", &self.ack_frame)
            .field("records", &self.records.len())
            .finish()
    }
}

/// Everything that can travel between two peers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Handshake: announces the sender's player handle.
    Hello {
        /// The sending player.
        player: PlayerHandle,
    },
    /// Handshake reply.
    HelloAck {
        /// The replying player.
        player: PlayerHandle,
    },
    /// A batch of inputs.
    Input(InputMessage),
    /// Acknowledges inputs up to and including `ack_frame`.
    InputAck {
        /// The highest frame received from the peer.
        ack_frame: Frame,
    },
    /// Periodic link-quality probe.
    QualityReport {
        /// How many frames ahead the sender believes it is running.
        frame_advantage: i16,
        /// Sender timestamp in milliseconds, echoed back for ping
        /// measurement.
        millis: u64,
    },
    /// Echo of a [`Message::QualityReport`] timestamp.
    QualityReply {
        /// The echoed timestamp.
        millis: u64,
    },
    /// Keeps the link warm when there is nothing else to send.
    KeepAlive,
    /// Orderly goodbye; the session is closing.
    Disconnect,
}
