//! Protocol Messages
//!
//! Wire format for peer-to-peer lockstep traffic. Frames are encoded with
//! the state stream codec so every peer produces identical bytes; a JSON
//! rendering is kept for debugging.
//!
//! ```text
//! frame := magic "RTSN", version u16, sender u8, record(kind tag, body)
//! ```

use serde::{Deserialize, Serialize};

use crate::core::hash::StateHash;
use crate::stream::{
    decode_from_slice, CodecError, Decode, Encode, StreamReader, StreamWriter, FORMAT_VERSION,
    NET_MAGIC,
};
use crate::world::command::Command;

/// Longest accepted abort reason, in bytes.
pub const MAX_REASON_BYTES: usize = 256;

const COMMAND_TAG: u16 = 1;
const ACK_TAG: u16 = 2;
const RESYNC_REQUEST_TAG: u16 = 3;
const RESYNC_PAYLOAD_TAG: u16 = 4;
const PEER_JOIN_TAG: u16 = 5;
const PEER_LEAVE_TAG: u16 = 6;
const CHECKSUM_TAG: u16 = 7;
const ABORT_TAG: u16 = 8;

// =============================================================================
// MESSAGES
// =============================================================================

/// Messages exchanged between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NetMessage {
    /// A player command for a future tick.
    Command(Command),

    /// Seals one of `player`'s ticks: exactly `command_count` commands
    /// from that player exist for `tick`.
    Ack {
        /// Player whose tick is sealed.
        player: u8,
        /// Sealed tick.
        tick: u32,
        /// Number of commands the player issued for it.
        command_count: u32,
    },

    /// A joining peer asks for the current world.
    ResyncRequest {
        /// The joining player.
        player: u8,
    },

    /// Everything a joining peer needs to continue in lockstep.
    ResyncPayload(ResyncPayload),

    /// A peer joins. `lockstep_from` is `None` while it is still
    /// synchronizing and set by the provider once the start tick is fixed.
    PeerJoin {
        /// Joining player.
        player: u8,
        /// First tick the player takes part in.
        lockstep_from: Option<u32>,
    },

    /// A peer left. Its commands up to and including `after_tick` are
    /// honoured, later ones are discarded.
    PeerLeave {
        /// Departed player.
        player: u8,
        /// Last tick the player takes part in.
        after_tick: u32,
        /// Why it left.
        reason: LeaveReason,
    },

    /// World hash after `tick` ticks, for desync detection.
    Checksum {
        /// Reporting player.
        player: u8,
        /// Tick counter at the time of hashing.
        tick: u32,
        /// World hash.
        hash: StateHash,
    },

    /// The session is over for everyone.
    Abort {
        /// Human-readable diagnostic.
        reason: String,
    },
}

/// Why a peer left the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaveReason {
    /// The player quit.
    Quit,
    /// Nothing was heard from the peer within the timeout.
    Timeout,
    /// Sends to the peer kept failing.
    SendFailure,
    /// Synchronization was cancelled before it completed.
    Cancelled,
}

impl LeaveReason {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Quit),
            1 => Some(Self::Timeout),
            2 => Some(Self::SendFailure),
            3 => Some(Self::Cancelled),
            _ => None,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Quit => 0,
            Self::Timeout => 1,
            Self::SendFailure => 2,
            Self::Cancelled => 3,
        }
    }
}

/// Participation record of one player inside a resync payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Player index.
    pub player: u8,
    /// First tick the player takes part in.
    pub lockstep_from: u32,
    /// Last tick the player takes part in, if it already left.
    pub leave_after: Option<u32>,
}

/// A sealed tick carried inside a resync payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Seal {
    /// Player whose tick is sealed.
    pub player: u8,
    /// Sealed tick.
    pub tick: u32,
    /// Commands the player issued for it.
    pub command_count: u32,
}

/// Full-state snapshot for a joining or reconnecting peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResyncPayload {
    /// Next tick to execute; equals the tick stored in `state`.
    pub tick: u32,
    /// World encoding (`world::save` layout).
    pub state: Vec<u8>,
    /// Every participating player, the receiver included.
    pub peers: Vec<PeerInfo>,
    /// Known commands for ticks `>= tick`.
    pub pending: Vec<Command>,
    /// Known seals for ticks `>= tick`.
    pub seals: Vec<Seal>,
}

/// A message with the index of the peer that sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Sending peer (not necessarily the message's player when relayed).
    pub sender: u8,
    /// Payload.
    pub message: NetMessage,
}

impl Frame {
    /// Wrap a message.
    pub fn new(sender: u8, message: NetMessage) -> Self {
        Self { sender, message }
    }
}

// =============================================================================
// CODEC
// =============================================================================

impl Encode for PeerInfo {
    fn encode(&self, w: &mut StreamWriter) {
        w.write_u8(self.player);
        w.write_u32(self.lockstep_from);
        w.write_option(self.leave_after.as_ref());
    }
}

impl Decode for PeerInfo {
    fn decode(r: &mut StreamReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            player: r.read_u8()?,
            lockstep_from: r.read_u32()?,
            leave_after: r.read_option()?,
        })
    }
}

impl Encode for Seal {
    fn encode(&self, w: &mut StreamWriter) {
        w.write_u8(self.player);
        w.write_u32(self.tick);
        w.write_u32(self.command_count);
    }
}

impl Decode for Seal {
    fn decode(r: &mut StreamReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            player: r.read_u8()?,
            tick: r.read_u32()?,
            command_count: r.read_u32()?,
        })
    }
}

impl Encode for ResyncPayload {
    fn encode(&self, w: &mut StreamWriter) {
        w.write_u32(self.tick);
        w.write_bytes(&self.state);
        w.write_seq(&self.peers);
        w.write_seq(&self.pending);
        w.write_seq(&self.seals);
    }
}

impl Decode for ResyncPayload {
    fn decode(r: &mut StreamReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            tick: r.read_u32()?,
            state: r.read_bytes()?,
            peers: r.read_seq()?,
            pending: r.read_seq()?,
            seals: r.read_seq()?,
        })
    }
}

impl NetMessage {
    fn tag(&self) -> u16 {
        match self {
            NetMessage::Command(_) => COMMAND_TAG,
            NetMessage::Ack { .. } => ACK_TAG,
            NetMessage::ResyncRequest { .. } => RESYNC_REQUEST_TAG,
            NetMessage::ResyncPayload(_) => RESYNC_PAYLOAD_TAG,
            NetMessage::PeerJoin { .. } => PEER_JOIN_TAG,
            NetMessage::PeerLeave { .. } => PEER_LEAVE_TAG,
            NetMessage::Checksum { .. } => CHECKSUM_TAG,
            NetMessage::Abort { .. } => ABORT_TAG,
        }
    }

    /// Tick the message is about, if it is tick-scoped.
    pub fn tick(&self) -> Option<u32> {
        match self {
            NetMessage::Command(cmd) => Some(cmd.tick),
            NetMessage::Ack { tick, .. } | NetMessage::Checksum { tick, .. } => Some(*tick),
            _ => None,
        }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            NetMessage::Command(_) => "command",
            NetMessage::Ack { .. } => "ack",
            NetMessage::ResyncRequest { .. } => "resync_request",
            NetMessage::ResyncPayload(_) => "resync_payload",
            NetMessage::PeerJoin { .. } => "peer_join",
            NetMessage::PeerLeave { .. } => "peer_leave",
            NetMessage::Checksum { .. } => "checksum",
            NetMessage::Abort { .. } => "abort",
        }
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl Encode for NetMessage {
    fn encode(&self, w: &mut StreamWriter) {
        w.write_record(self.tag(), |w| match self {
            NetMessage::Command(cmd) => cmd.encode(w),
            NetMessage::Ack {
                player,
                tick,
                command_count,
            } => {
                w.write_u8(*player);
                w.write_u32(*tick);
                w.write_u32(*command_count);
            }
            NetMessage::ResyncRequest { player } => w.write_u8(*player),
            NetMessage::ResyncPayload(payload) => payload.encode(w),
            NetMessage::PeerJoin {
                player,
                lockstep_from,
            } => {
                w.write_u8(*player);
                w.write_option(lockstep_from.as_ref());
            }
            NetMessage::PeerLeave {
                player,
                after_tick,
                reason,
            } => {
                w.write_u8(*player);
                w.write_u32(*after_tick);
                w.write_u8(reason.as_u8());
            }
            NetMessage::Checksum { player, tick, hash } => {
                w.write_u8(*player);
                w.write_u32(*tick);
                w.write_raw(hash);
            }
            NetMessage::Abort { reason } => w.write_str(reason),
        });
    }
}

impl Decode for NetMessage {
    fn decode(r: &mut StreamReader<'_>) -> Result<Self, CodecError> {
        let (tag, mut body) = r.read_record_header()?;
        let b = &mut body;
        let message = match tag {
            COMMAND_TAG => NetMessage::Command(Command::decode(b)?),
            ACK_TAG => NetMessage::Ack {
                player: b.read_u8()?,
                tick: b.read_u32()?,
                command_count: b.read_u32()?,
            },
            RESYNC_REQUEST_TAG => NetMessage::ResyncRequest { player: b.read_u8()? },
            RESYNC_PAYLOAD_TAG => NetMessage::ResyncPayload(ResyncPayload::decode(b)?),
            PEER_JOIN_TAG => NetMessage::PeerJoin {
                player: b.read_u8()?,
                lockstep_from: b.read_option()?,
            },
            PEER_LEAVE_TAG => {
                let player = b.read_u8()?;
                let after_tick = b.read_u32()?;
                let raw = b.read_u8()?;
                let reason = LeaveReason::from_u8(raw).ok_or(CodecError::UnknownTag {
                    context: "leave reason",
                    tag: raw as u16,
                })?;
                NetMessage::PeerLeave {
                    player,
                    after_tick,
                    reason,
                }
            }
            CHECKSUM_TAG => {
                let player = b.read_u8()?;
                let tick = b.read_u32()?;
                let mut hash = [0u8; 32];
                hash.copy_from_slice(b.take(32)?);
                NetMessage::Checksum { player, tick, hash }
            }
            ABORT_TAG => {
                let reason = b.read_str()?;
                if reason.len() > MAX_REASON_BYTES {
                    return Err(CodecError::invalid("abort", "reason too long"));
                }
                NetMessage::Abort { reason }
            }
            other => {
                return Err(CodecError::UnknownTag {
                    context: "message",
                    tag: other,
                })
            }
        };
        body.finish("message")?;
        Ok(message)
    }
}

impl Encode for Frame {
    fn encode(&self, w: &mut StreamWriter) {
        write_frame(w, self.sender, &self.message);
    }
}

fn write_frame(w: &mut StreamWriter, sender: u8, message: &NetMessage) {
    w.write_header(&NET_MAGIC, FORMAT_VERSION);
    w.write_u8(sender);
    message.encode(w);
}

impl Decode for Frame {
    fn decode(r: &mut StreamReader<'_>) -> Result<Self, CodecError> {
        r.read_header(&NET_MAGIC, FORMAT_VERSION)?;
        Ok(Self {
            sender: r.read_u8()?,
            message: NetMessage::decode(r)?,
        })
    }
}

/// Encode a frame for the transport.
pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    crate::stream::encode_to_vec(frame)
}

/// Encode a message as a frame from `sender` without taking ownership.
pub fn encode_message(sender: u8, message: &NetMessage) -> Vec<u8> {
    let mut w = StreamWriter::new();
    write_frame(&mut w, sender, message);
    w.into_bytes()
}

/// Decode a frame received from the transport.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, CodecError> {
    decode_from_slice(bytes)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::vec2::FixedVec2;
    use crate::world::command::Action;
    use crate::world::id::ObjectId;
    use proptest::prelude::*;

    fn sample_messages() -> Vec<NetMessage> {
        let cmd = Command::new(
            1,
            42,
            3,
            &Action::Move {
                unit: ObjectId::from_raw(5),
                to: FixedVec2::from_ints(2, -2),
            },
        );
        vec![
            NetMessage::Command(cmd.clone()),
            NetMessage::Ack {
                player: 1,
                tick: 42,
                command_count: 1,
            },
            NetMessage::ResyncRequest { player: 2 },
            NetMessage::ResyncPayload(ResyncPayload {
                tick: 40,
                state: vec![1, 2, 3, 4],
                peers: vec![
                    PeerInfo { player: 0, lockstep_from: 0, leave_after: None },
                    PeerInfo { player: 1, lockstep_from: 0, leave_after: Some(41) },
                    PeerInfo { player: 2, lockstep_from: 44, leave_after: None },
                ],
                pending: vec![cmd],
                seals: vec![Seal { player: 0, tick: 41, command_count: 0 }],
            }),
            NetMessage::PeerJoin { player: 2, lockstep_from: None },
            NetMessage::PeerJoin { player: 2, lockstep_from: Some(44) },
            NetMessage::PeerLeave {
                player: 1,
                after_tick: 50,
                reason: LeaveReason::Timeout,
            },
            NetMessage::Checksum {
                player: 0,
                tick: 60,
                hash: [7; 32],
            },
            NetMessage::Abort {
                reason: "stalled".to_string(),
            },
        ]
    }

    #[test]
    fn test_frame_round_trip() {
        for message in sample_messages() {
            let frame = Frame::new(3, message);
            let bytes = encode_frame(&frame);
            assert_eq!(&bytes[..4], b"RTSN");
            assert_eq!(decode_frame(&bytes).unwrap(), frame);
            assert_eq!(encode_message(3, &frame.message), bytes);
        }
    }

    #[test]
    fn test_json_debug_rendering() {
        for message in sample_messages() {
            let json = message.to_json().unwrap();
            assert_eq!(NetMessage::from_json(&json).unwrap(), message);
        }
        let json = NetMessage::ResyncRequest { player: 1 }.to_json().unwrap();
        assert!(json.contains("\"type\":\"resync_request\""));
    }

    #[test]
    fn test_wrong_magic_rejected() {
        let mut bytes = encode_frame(&Frame::new(0, NetMessage::ResyncRequest { player: 0 }));
        bytes[3] = b'S';
        assert!(matches!(decode_frame(&bytes), Err(CodecError::BadMagic { .. })));
    }

    #[test]
    fn test_unknown_message_tag() {
        let mut w = StreamWriter::new();
        w.write_header(&NET_MAGIC, FORMAT_VERSION);
        w.write_u8(0);
        w.write_record(99, |_| {});
        assert!(matches!(
            decode_frame(&w.into_bytes()),
            Err(CodecError::UnknownTag { context: "message", tag: 99 })
        ));
    }

    #[test]
    fn test_message_tick_scope() {
        let msgs = sample_messages();
        assert_eq!(msgs[0].tick(), Some(42));
        assert_eq!(msgs[1].tick(), Some(42));
        assert_eq!(msgs[2].tick(), None);
        assert_eq!(msgs[7].tick(), Some(60));
    }

    proptest! {
        #[test]
        fn prop_ack_round_trip(sender in any::<u8>(), player in any::<u8>(), tick in any::<u32>(), count in any::<u32>()) {
            let frame = Frame::new(sender, NetMessage::Ack { player, tick, command_count: count });
            prop_assert_eq!(decode_frame(&encode_frame(&frame)).unwrap(), frame);
        }

        #[test]
        fn prop_garbage_frames_never_panic(bytes in prop::collection::vec(any::<u8>(), 0..128)) {
            let _ = decode_frame(&bytes);
        }
    }
}
