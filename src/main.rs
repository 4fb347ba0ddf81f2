//! RTS Lockstep Peer
//!
//! With `LOCKSTEP_LISTEN` set, runs one peer over WebSocket. Otherwise runs
//! an in-process demo session: two players from the start, a third joining
//! late, scripted orders, then save/load and replay verification.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use uuid::Uuid;

use rts_lockstep::{
    core::{hash::short_hex, rng::derive_session_seed},
    network::{
        run_node, LockstepSession, LoopbackNetwork, LoopbackTransport, NodeConfig, PeerState, StepOutcome,
        SyncConfig,
    },
    world::{
        object::{StructureKind, UnitKind},
        save, Action, ObjectId, SimObject, Simulation,
    },
    FixedVec2, StateHash, VERSION,
};

const DEMO_HOUSES: [&str; 3] = ["Atreides", "Harkonnen", "Ordos"];
const DEMO_TICKS: u32 = 360;
const JOIN_ROUND: usize = 120;
const MAX_ROUNDS: usize = 2_000;
const ROUND: Duration = Duration::from_millis(50);

type DemoSession = LockstepSession<LoopbackTransport>;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber).context("failed to set tracing subscriber")?;

    info!("RTS Lockstep v{}", VERSION);
    let sync = SyncConfig::from_env();
    info!(
        lag = sync.lag,
        peer_timeout_ms = sync.peer_timeout_ms,
        checksum_interval = sync.checksum_interval,
        "sync configuration"
    );

    if std::env::var("LOCKSTEP_LISTEN").is_ok() {
        let config = NodeConfig::from_env()?;
        info!(
            player = config.player,
            listen = %config.listen,
            peers = config.peers.len(),
            join = config.join,
            "starting node"
        );
        let report = run_node(config, sync).await?;
        info!("node stats: {}", serde_json::to_string(&report.stats)?);
        return Ok(());
    }

    demo_session(sync)
}

fn units_of(sim: &Simulation, player: u8) -> Vec<ObjectId> {
    sim.registry()
        .iter()
        .filter(|(_, object)| matches!(object, SimObject::Unit(_)) && object.owner() == player)
        .map(|(id, _)| id)
        .collect()
}

fn factory_of(sim: &Simulation, player: u8) -> Option<ObjectId> {
    sim.registry()
        .iter()
        .find(|(_, object)| {
            matches!(object, SimObject::Structure(s) if s.kind == StructureKind::Factory && s.owner == player)
        })
        .map(|(id, _)| id)
}

fn enemy_of(sim: &Simulation, player: u8) -> Option<ObjectId> {
    sim.registry()
        .iter()
        .find(|(_, object)| object.is_targetable() && object.owner() != player)
        .map(|(id, _)| id)
}

/// Scripted orders standing in for player input.
fn scripted_orders(session: &mut DemoSession, round: usize) -> Result<()> {
    let player = session.local_player();
    let Some(sim) = session.simulation() else {
        return Ok(());
    };
    let units = units_of(sim, player);
    let phase = round + player as usize * 7;

    let action = if phase % 100 == 20 {
        factory_of(sim, player).map(|factory| Action::Produce {
            factory,
            kind: UnitKind::Infantry,
        })
    } else if phase % 60 == 30 {
        match (units.first(), enemy_of(sim, player)) {
            (Some(&unit), Some(target)) => Some(Action::Attack { unit, target }),
            _ => None,
        }
    } else if phase % 40 == 5 {
        units.last().map(|&unit| {
            let offset = (phase % 3) as i32 * 10 - 10;
            Action::Move {
                unit,
                to: FixedVec2::from_ints(offset, -offset),
            }
        })
    } else {
        None
    };

    if let Some(action) = action {
        let command = session.issue(&action)?;
        info!(player, tick = command.tick, ?action, "order issued");
    }
    Ok(())
}

/// Demo function to exercise a full session.
fn demo_session(sync: SyncConfig) -> Result<()> {
    info!("=== Starting Demo Session ===");

    let session_id = Uuid::new_v4();
    let founders = [0u8, 1];
    let seed = derive_session_seed(session_id.as_bytes(), &founders);
    info!(%session_id, seed, "session created");

    let mut world = Simulation::new(seed, &DEMO_HOUSES);
    world.setup_skirmish();
    info!(
        objects = world.registry().len(),
        hash = %short_hex(&world.state_hash()),
        "initial world"
    );

    let net = LoopbackNetwork::new();
    let mut now = Instant::now();
    let mut sessions: BTreeMap<u8, DemoSession> = founders
        .iter()
        .map(|&p| {
            let session = LockstepSession::start(p, &founders, world.clone(), sync.clone(), net.endpoint(p), now);
            (p, session)
        })
        .collect();
    if let Some(host) = sessions.get_mut(&0) {
        host.enable_replay(session_id)?;
    }

    let mut at_target: BTreeMap<u8, StateHash> = BTreeMap::new();
    for round in 0..MAX_ROUNDS {
        if round == JOIN_ROUND {
            info!(player = 2, "late joiner connecting");
            let joiner = LockstepSession::join(2, &founders, sync.clone(), net.endpoint(2), now);
            sessions.insert(2, joiner);
        }

        now += ROUND;
        for (&player, session) in sessions.iter_mut() {
            match session.step(now)? {
                StepOutcome::Advanced(result) => {
                    if result.tick % 60 == 0 {
                        if let Some(sim) = session.simulation() {
                            info!(player, tick = result.tick, hash = %short_hex(&sim.state_hash()), "checkpoint");
                        }
                    }
                    if session.tick() == DEMO_TICKS {
                        if let Some(sim) = session.simulation() {
                            at_target.insert(player, sim.state_hash());
                        }
                    }
                }
                StepOutcome::Waiting { .. } | StepOutcome::Synchronizing => {}
                StepOutcome::Disconnected => warn!(player, "session left"),
            }
            if session.state() == PeerState::InLockstep && session.tick() < DEMO_TICKS {
                scripted_orders(session, round)?;
            }
        }

        if at_target.len() == 3 {
            break;
        }
    }

    if at_target.len() < 3 {
        bail!("only {} of 3 players reached tick {}", at_target.len(), DEMO_TICKS);
    }
    let mut hashes = at_target.values();
    let reference = hashes.next().copied().unwrap_or_default();
    if hashes.any(|hash| *hash != reference) {
        bail!("players diverged at tick {}: {:?}", DEMO_TICKS, at_target);
    }
    info!(tick = DEMO_TICKS, hash = %hex::encode(reference), "all players agree");

    for (player, session) in &sessions {
        info!(player, "stats: {}", serde_json::to_string(&session.stats())?);
    }

    // Save and load round trip
    let host = sessions.get_mut(&0).context("host session missing")?;
    let path = std::env::temp_dir().join(format!("rts-lockstep-{session_id}.rtss"));
    host.save(&path)?;
    let loaded = save::load_from_file(&path)?;
    let _ = std::fs::remove_file(&path);
    let live = host.simulation().map(Simulation::state_hash).unwrap_or_default();
    if loaded.state_hash() != live {
        bail!("loaded world does not match the live world");
    }
    info!(tick = loaded.tick(), "save/load round trip matches");

    // Replay verification
    let replay = host.finish_replay().context("replay was not recording")?;
    let report = replay.verify()?;
    info!(
        ticks = report.ticks_replayed,
        checkpoints = report.checkpoints_verified,
        "replay verified"
    );

    info!("=== Demo Session Complete ===");
    Ok(())
}
