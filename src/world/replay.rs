//! Replay Journal
//!
//! A replay is the initial world encoding plus every command that was
//! executed, with world hashes taken at fixed intervals. Re-running the
//! journal must reproduce every checkpoint; the first one that does not
//! pins down the tick where a desync started.
//!
//! Journals are diagnostics, not part of the lockstep state, so they use
//! `bincode` instead of the state stream codec.

use std::fs;
use std::path::Path;

use bincode::Options;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::hash::{short_hex, StateHash};
use crate::stream::{CodecError, FORMAT_VERSION};

use super::command::Command;
use super::save;
use super::sim::Simulation;

/// Upper bound on a journal read back from disk.
const MAX_REPLAY_BYTES: u64 = 256 * 1024 * 1024;

/// Errors from recording, loading or verifying a replay.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    /// File system failure.
    #[error("replay I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// The journal itself could not be (de)serialized.
    #[error("replay encoding failed: {0}")]
    Encoding(#[from] bincode::Error),

    /// The embedded initial world is not a valid encoding.
    #[error("replay initial state: {0}")]
    Format(#[from] CodecError),

    /// The journal was written by an incompatible build.
    #[error("replay format {found} not supported (expected {expected})")]
    Version {
        /// Version this build reads.
        expected: u16,
        /// Version in the journal.
        found: u16,
    },

    /// Re-running the journal produced a different world.
    #[error("replay diverged at tick {tick}: expected {expected}, got {actual}")]
    Mismatch {
        /// Tick count at the failing checkpoint.
        tick: u32,
        /// Hash recorded in the journal (short hex).
        expected: String,
        /// Hash reproduced now (short hex).
        actual: String,
    },
}

/// Descriptive header.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayMetadata {
    /// Session the journal was recorded in.
    pub session_id: Uuid,
    /// Wall-clock start of recording. Never read by the simulation.
    pub recorded_at: DateTime<Utc>,
    /// House names in player order.
    pub houses: Vec<String>,
    /// State stream format of `initial_state`.
    pub format_version: u16,
    /// Crate version that recorded the journal.
    pub recorder_version: String,
}

/// Commands executed in one tick, in application order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayTick {
    /// Executed tick.
    pub tick: u32,
    /// Commands for it.
    pub commands: Vec<Command>,
}

/// World hash once `tick` ticks had been executed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Simulation tick counter at the time of hashing.
    pub tick: u32,
    /// World hash.
    pub hash: StateHash,
}

/// A complete journal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replay {
    /// Descriptive header.
    pub metadata: ReplayMetadata,
    /// World encoding recording started from.
    pub initial_state: Vec<u8>,
    /// Ticks that had at least one command.
    pub ticks: Vec<ReplayTick>,
    /// Periodic hashes, ascending.
    pub checkpoints: Vec<Checkpoint>,
}

/// Result of a successful [`Replay::verify`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VerifyReport {
    /// Ticks re-executed.
    pub ticks_replayed: u32,
    /// Checkpoints that matched.
    pub checkpoints_verified: usize,
}

fn options() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_REPLAY_BYTES)
}

impl Replay {
    /// Serialize with bincode.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ReplayError> {
        Ok(options().serialize(self)?)
    }

    /// Deserialize and check the format version.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ReplayError> {
        let replay: Replay = options().deserialize(bytes)?;
        if replay.metadata.format_version != FORMAT_VERSION {
            return Err(ReplayError::Version {
                expected: FORMAT_VERSION,
                found: replay.metadata.format_version,
            });
        }
        Ok(replay)
    }

    /// Write the journal to disk.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ReplayError> {
        fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    /// Read a journal from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ReplayError> {
        Self::from_bytes(&fs::read(path)?)
    }

    /// Tick count reached by the last checkpoint.
    pub fn final_tick(&self) -> u32 {
        self.checkpoints.last().map_or(0, |c| c.tick)
    }

    /// Re-run the journal and compare every checkpoint.
    pub fn verify(&self) -> Result<VerifyReport, ReplayError> {
        let mut sim = save::decode_world(&self.initial_state)?;
        let start = sim.tick();
        let mut ticks = self.ticks.iter().peekable();
        let mut verified = 0;

        for checkpoint in &self.checkpoints {
            while sim.tick() < checkpoint.tick {
                let now = sim.tick();
                let commands = match ticks.peek() {
                    Some(t) if t.tick == now => ticks.next().map(|t| t.commands.as_slice()),
                    _ => None,
                };
                sim.advance(commands.unwrap_or(&[]));
            }

            let actual = sim.state_hash();
            if actual != checkpoint.hash {
                return Err(ReplayError::Mismatch {
                    tick: checkpoint.tick,
                    expected: short_hex(&checkpoint.hash),
                    actual: short_hex(&actual),
                });
            }
            verified += 1;
        }

        Ok(VerifyReport {
            ticks_replayed: sim.tick() - start,
            checkpoints_verified: verified,
        })
    }
}

/// Builds a [`Replay`] while a session runs.
#[derive(Debug)]
pub struct ReplayRecorder {
    replay: Replay,
    checkpoint_interval: u32,
}

impl ReplayRecorder {
    /// Start recording from the current world.
    pub fn start(sim: &Simulation, session_id: Uuid, checkpoint_interval: u32) -> Self {
        let metadata = ReplayMetadata {
            session_id,
            recorded_at: Utc::now(),
            houses: sim.houses().iter().map(|h| h.name.clone()).collect(),
            format_version: FORMAT_VERSION,
            recorder_version: crate::VERSION.to_string(),
        };

        Self {
            replay: Replay {
                metadata,
                initial_state: save::encode_world(sim),
                ticks: Vec::new(),
                checkpoints: vec![Checkpoint {
                    tick: sim.tick(),
                    hash: sim.state_hash(),
                }],
            },
            checkpoint_interval: checkpoint_interval.max(1),
        }
    }

    /// Record a tick that was just executed on `sim`.
    pub fn record_tick(&mut self, sim: &Simulation, commands: &[Command]) {
        let executed = sim.tick() - 1;
        if !commands.is_empty() {
            let mut commands = commands.to_vec();
            commands.sort_by_key(Command::order_key);
            self.replay.ticks.push(ReplayTick {
                tick: executed,
                commands,
            });
        }
        if sim.tick() % self.checkpoint_interval == 0 {
            self.checkpoint(sim);
        }
    }

    /// Hashes recorded so far.
    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.replay.checkpoints
    }

    /// Close the journal with a final checkpoint.
    pub fn finish(mut self, sim: &Simulation) -> Replay {
        self.checkpoint(sim);
        self.replay
    }

    fn checkpoint(&mut self, sim: &Simulation) {
        if self.replay.checkpoints.last().map(|c| c.tick) == Some(sim.tick()) {
            return;
        }
        self.replay.checkpoints.push(Checkpoint {
            tick: sim.tick(),
            hash: sim.state_hash(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::command::Action;
    use crate::world::id::ObjectId;
    use crate::world::object::UnitKind;
    use crate::core::vec2::FixedVec2;

    fn record(ticks: u32) -> (Simulation, Replay) {
        let mut sim = Simulation::new(77, &["Atreides", "Harkonnen"]);
        sim.setup_skirmish();
        let mut recorder = ReplayRecorder::start(&sim, Uuid::new_v4(), 10);

        for tick in 0..ticks {
            let commands = match tick {
                3 => vec![Command::new(0, tick, 0, &Action::Produce { factory: ObjectId::from_raw(1), kind: UnitKind::Infantry })],
                5 => vec![Command::new(
                    1,
                    tick,
                    0,
                    &Action::Move { unit: ObjectId::from_raw(12), to: FixedVec2::from_ints(0, 0) },
                )],
                _ => Vec::new(),
            };
            sim.advance(&commands);
            recorder.record_tick(&sim, &commands);
        }
        let replay = recorder.finish(&sim);
        (sim, replay)
    }

    #[test]
    fn test_record_and_verify() {
        let (sim, replay) = record(95);
        assert_eq!(replay.ticks.len(), 2);
        // initial + every 10 ticks + final
        assert_eq!(replay.checkpoints.len(), 1 + 9 + 1);
        assert_eq!(replay.final_tick(), sim.tick());

        let report = replay.verify().unwrap();
        assert_eq!(report.ticks_replayed, 95);
        assert_eq!(report.checkpoints_verified, replay.checkpoints.len());
    }

    #[test]
    fn test_tampered_journal_reports_first_mismatch() {
        let (_, mut replay) = record(40);
        replay.ticks[1].commands.clear();

        match replay.verify() {
            Err(ReplayError::Mismatch { tick, .. }) => assert_eq!(tick, 10),
            other => panic!("expected mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_bincode_round_trip() {
        let (_, replay) = record(20);
        let bytes = replay.to_bytes().unwrap();
        let loaded = Replay::from_bytes(&bytes).unwrap();
        assert_eq!(loaded, replay);
        assert!(loaded.verify().is_ok());
    }

    #[test]
    fn test_version_checked() {
        let (_, mut replay) = record(1);
        replay.metadata.format_version = FORMAT_VERSION + 1;
        let bytes = replay.to_bytes().unwrap();
        assert!(matches!(Replay::from_bytes(&bytes), Err(ReplayError::Version { .. })));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(Replay::from_bytes(&[0xff; 8]), Err(ReplayError::Encoding(_))));
    }
}
