//! Player Commands
//!
//! Players never touch objects directly. Everything they do is a
//! [`Command`] scheduled for a future tick, carrying an encoded [`Action`]
//! as opaque payload. The network layer only sees the payload bytes.

use serde::{Deserialize, Serialize};

use crate::core::vec2::FixedVec2;
use crate::stream::{decode_from_slice, encode_to_vec, CodecError, Decode, Encode, StreamReader, StreamWriter};

use super::id::ObjectId;
use super::object::UnitKind;

/// Maximum encoded payload size accepted from the wire.
pub const MAX_PAYLOAD_BYTES: usize = 256;

/// One player action tagged for a future tick.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Command {
    /// House index of the issuing player.
    pub player: u8,
    /// Tick during which the command is applied.
    pub tick: u32,
    /// Issue order within the player's commands.
    pub sequence: u32,
    /// Encoded [`Action`].
    pub payload: Vec<u8>,
}

impl Command {
    /// Build a command around an encoded action.
    pub fn new(player: u8, tick: u32, sequence: u32, action: &Action) -> Self {
        Self {
            player,
            tick,
            sequence,
            payload: encode_to_vec(action),
        }
    }

    /// Decode the payload.
    pub fn action(&self) -> Result<Action, CodecError> {
        decode_from_slice(&self.payload)
    }

    /// Canonical application order: player index, then issue sequence.
    pub fn order_key(&self) -> (u8, u32) {
        (self.player, self.sequence)
    }
}

impl Encode for Command {
    fn encode(&self, w: &mut StreamWriter) {
        w.write_u8(self.player);
        w.write_u32(self.tick);
        w.write_u32(self.sequence);
        w.write_bytes(&self.payload);
    }
}

impl Decode for Command {
    fn decode(r: &mut StreamReader<'_>) -> Result<Self, CodecError> {
        let player = r.read_u8()?;
        let tick = r.read_u32()?;
        let sequence = r.read_u32()?;
        let payload = r.read_bytes()?;
        if payload.len() > MAX_PAYLOAD_BYTES {
            return Err(CodecError::invalid(
                "command",
                format!("payload of {} bytes", payload.len()),
            ));
        }
        Ok(Self {
            player,
            tick,
            sequence,
            payload,
        })
    }
}

/// What a player asked for.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    /// Walk a unit to a position.
    Move {
        /// Unit to move.
        unit: ObjectId,
        /// Destination.
        to: FixedVec2,
    },
    /// Chase and fire at a target.
    Attack {
        /// Attacking unit.
        unit: ObjectId,
        /// Object to attack.
        target: ObjectId,
    },
    /// Cancel move and attack orders.
    Stop {
        /// Unit to stop.
        unit: ObjectId,
    },
    /// Start building a unit.
    Produce {
        /// Factory to build in.
        factory: ObjectId,
        /// What to build.
        kind: UnitKind,
    },
}

impl Action {
    const MOVE: u8 = 0;
    const ATTACK: u8 = 1;
    const STOP: u8 = 2;
    const PRODUCE: u8 = 3;

    /// The object the action is addressed to.
    pub fn subject(&self) -> ObjectId {
        match *self {
            Action::Move { unit, .. } | Action::Attack { unit, .. } | Action::Stop { unit } => unit,
            Action::Produce { factory, .. } => factory,
        }
    }
}

impl Encode for Action {
    fn encode(&self, w: &mut StreamWriter) {
        match self {
            Action::Move { unit, to } => {
                w.write_u8(Self::MOVE);
                unit.encode(w);
                w.write_vec2(*to);
            }
            Action::Attack { unit, target } => {
                w.write_u8(Self::ATTACK);
                unit.encode(w);
                target.encode(w);
            }
            Action::Stop { unit } => {
                w.write_u8(Self::STOP);
                unit.encode(w);
            }
            Action::Produce { factory, kind } => {
                w.write_u8(Self::PRODUCE);
                factory.encode(w);
                kind.encode(w);
            }
        }
    }
}

impl Decode for Action {
    fn decode(r: &mut StreamReader<'_>) -> Result<Self, CodecError> {
        match r.read_u8()? {
            Self::MOVE => Ok(Action::Move {
                unit: ObjectId::decode(r)?,
                to: r.read_vec2()?,
            }),
            Self::ATTACK => Ok(Action::Attack {
                unit: ObjectId::decode(r)?,
                target: ObjectId::decode(r)?,
            }),
            Self::STOP => Ok(Action::Stop {
                unit: ObjectId::decode(r)?,
            }),
            Self::PRODUCE => Ok(Action::Produce {
                factory: ObjectId::decode(r)?,
                kind: UnitKind::decode(r)?,
            }),
            tag => Err(CodecError::UnknownTag {
                context: "action",
                tag: tag as u16,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_payload_round_trip() {
        let actions = [
            Action::Move {
                unit: ObjectId::from_raw(4),
                to: FixedVec2::from_ints(-8, 3),
            },
            Action::Attack {
                unit: ObjectId::from_raw(4),
                target: ObjectId::from_raw(11),
            },
            Action::Stop {
                unit: ObjectId::from_raw(4),
            },
            Action::Produce {
                factory: ObjectId::from_raw(1),
                kind: UnitKind::Tank,
            },
        ];

        for (seq, action) in actions.iter().enumerate() {
            let cmd = Command::new(2, 30, seq as u32, action);
            assert_eq!(&cmd.action().unwrap(), action);

            let decoded: Command = decode_from_slice(&encode_to_vec(&cmd)).unwrap();
            assert_eq!(decoded, cmd);
        }
    }

    #[test]
    fn test_garbage_payload_is_format_error() {
        let cmd = Command {
            player: 0,
            tick: 1,
            sequence: 0,
            payload: vec![9, 1, 2],
        };
        assert!(matches!(
            cmd.action(),
            Err(CodecError::UnknownTag { context: "action", tag: 9 })
        ));

        let trailing = Command {
            payload: {
                let mut p = encode_to_vec(&Action::Stop { unit: ObjectId::FIRST });
                p.push(0);
                p
            },
            ..cmd
        };
        assert!(matches!(trailing.action(), Err(CodecError::TrailingBytes { .. })));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let cmd = Command {
            player: 0,
            tick: 1,
            sequence: 0,
            payload: vec![0; MAX_PAYLOAD_BYTES + 1],
        };
        let err = decode_from_slice::<Command>(&encode_to_vec(&cmd)).unwrap_err();
        assert!(matches!(err, CodecError::Invalid { context: "command", .. }));
    }

    #[test]
    fn test_order_key() {
        let a = Command::new(1, 5, 7, &Action::Stop { unit: ObjectId::FIRST });
        let b = Command::new(0, 5, 9, &Action::Stop { unit: ObjectId::FIRST });
        let mut cmds = vec![a.clone(), b.clone()];
        cmds.sort_by_key(Command::order_key);
        assert_eq!(cmds, vec![b, a]);
    }
}
