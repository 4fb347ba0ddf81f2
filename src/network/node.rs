//! Network Node
//!
//! Runs one peer over WebSocket: connects the links, builds or requests the
//! world, then steps the lockstep session at a fixed tick rate.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::hash::{short_hex, StateHash};
use crate::core::rng::derive_session_seed;
use crate::core::vec2::FixedVec2;
use crate::world::command::Action;
use crate::world::object::SimObject;
use crate::world::sim::Simulation;

use super::lockstep::{LockstepSession, StepOutcome, SyncConfig, SyncError, SyncStats};
use super::transport::TransportError;
use super::ws::WsTransport;

/// Attempts to reach a peer before giving up.
const CONNECT_ATTEMPTS: u32 = 20;

/// Pause between connection attempts.
const CONNECT_BACKOFF: Duration = Duration::from_millis(500);

/// Ticks between scripted patrol orders.
const PATROL_INTERVAL: u32 = 90;

/// Where to reach another peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerAddress {
    /// Player index.
    pub player: u8,
    /// WebSocket URL.
    pub url: String,
}

/// Invalid node configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {key}: {value:?}")]
pub struct ConfigError {
    /// Variable name.
    pub key: &'static str,
    /// Offending value.
    pub value: String,
}

/// Node configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeConfig {
    /// Local player index.
    pub player: u8,
    /// Address to accept peers on.
    pub listen: SocketAddr,
    /// Other peers.
    pub peers: Vec<PeerAddress>,
    /// Session identifier shared by all peers.
    pub session_id: Uuid,
    /// World seed; derived from the session when absent.
    pub seed: Option<u64>,
    /// Ticks per second.
    pub tick_rate: u32,
    /// Save the world here when the node stops.
    pub save_path: Option<PathBuf>,
    /// Join a running session instead of starting one.
    pub join: bool,
    /// Stop after this many ticks.
    pub run_ticks: Option<u32>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            player: 0,
            listen: SocketAddr::from(([0, 0, 0, 0], 7400)),
            peers: Vec::new(),
            session_id: Uuid::nil(),
            seed: None,
            tick_rate: 15,
            save_path: None,
            join: false,
            run_ticks: None,
        }
    }
}

fn parse_var<T: std::str::FromStr>(key: &'static str, value: Option<String>) -> Result<Option<T>, ConfigError> {
    match value {
        None => Ok(None),
        Some(v) => match v.trim().parse() {
            Ok(parsed) => Ok(Some(parsed)),
            Err(_) => Err(ConfigError { key, value: v }),
        },
    }
}

/// Parse `1=ws://host:7401,2=ws://host:7402`.
pub fn parse_peers(list: &str) -> Result<Vec<PeerAddress>, ConfigError> {
    let invalid = || ConfigError {
        key: "LOCKSTEP_PEERS",
        value: list.to_string(),
    };
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (player, url) = entry.split_once('=').ok_or_else(invalid)?;
            let player = player.trim().parse().map_err(|_| invalid())?;
            Ok(PeerAddress {
                player,
                url: url.trim().to_string(),
            })
        })
        .collect()
}

impl NodeConfig {
    /// Load from `LOCKSTEP_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Load from any variable source.
    pub fn from_vars(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let d = Self::default();
        let peers = match get("LOCKSTEP_PEERS") {
            Some(list) => parse_peers(&list)?,
            None => Vec::new(),
        };
        Ok(Self {
            player: parse_var("LOCKSTEP_PLAYER", get("LOCKSTEP_PLAYER"))?.unwrap_or(d.player),
            listen: parse_var("LOCKSTEP_LISTEN", get("LOCKSTEP_LISTEN"))?.unwrap_or(d.listen),
            peers,
            session_id: parse_var("LOCKSTEP_SESSION", get("LOCKSTEP_SESSION"))?.unwrap_or(d.session_id),
            seed: parse_var("LOCKSTEP_SEED", get("LOCKSTEP_SEED"))?,
            tick_rate: parse_var("LOCKSTEP_TICK_RATE", get("LOCKSTEP_TICK_RATE"))?
                .unwrap_or(d.tick_rate)
                .max(1),
            save_path: get("LOCKSTEP_SAVE_PATH").map(PathBuf::from),
            join: get("LOCKSTEP_JOIN").map_or(false, |v| v == "true" || v == "1"),
            run_ticks: parse_var("LOCKSTEP_RUN_TICKS", get("LOCKSTEP_RUN_TICKS"))?,
        })
    }

    /// Every player index, ascending.
    pub fn players(&self) -> Vec<u8> {
        let set: BTreeSet<u8> = self
            .peers
            .iter()
            .map(|p| p.player)
            .chain(std::iter::once(self.player))
            .collect();
        set.into_iter().collect()
    }

    /// Seed every peer agrees on.
    pub fn world_seed(&self) -> u64 {
        self.seed
            .unwrap_or_else(|| derive_session_seed(self.session_id.as_bytes(), &self.players()))
    }

    /// Initial world for a fresh session.
    pub fn initial_world(&self) -> Simulation {
        let houses = self.players().last().map_or(1, |&max| max as usize + 1);
        let names: Vec<String> = (0..houses).map(|i| format!("House {i}")).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let mut sim = Simulation::new(self.world_seed(), &refs);
        sim.setup_skirmish();
        sim
    }
}

/// Node failures.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// Links could not be established.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The session failed.
    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// Summary of a finished node run.
#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    /// Next tick at shutdown.
    pub tick: u32,
    /// World hash at shutdown.
    pub hash: StateHash,
    /// Session counters.
    pub stats: SyncStats,
}

async fn connect_with_retry(transport: &WsTransport, peer: &PeerAddress) -> Result<(), TransportError> {
    let mut last = TransportError::UnknownPeer(peer.player);
    for attempt in 1..=CONNECT_ATTEMPTS {
        match transport.connect(peer.player, &peer.url).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                debug!(player = peer.player, attempt, error = %e, "connect failed");
                last = e;
                sleep(CONNECT_BACKOFF).await;
            }
        }
    }
    Err(last)
}

/// First own unit, for scripted orders.
fn patrol_unit(sim: &Simulation, player: u8) -> Option<crate::world::id::ObjectId> {
    sim.registry()
        .iter()
        .find(|(_, object)| matches!(object, SimObject::Unit(_)) && object.owner() == player)
        .map(|(id, _)| id)
}

/// Run one peer until `run_ticks` or until the session fails.
pub async fn run_node(config: NodeConfig, sync: SyncConfig) -> Result<NodeReport, NodeError> {
    let transport = WsTransport::new(config.player);
    transport.listen(config.listen).await?;

    // Lower indices accept, higher ones dial; a joiner dials everyone.
    for peer in &config.peers {
        if config.join || peer.player < config.player {
            connect_with_retry(&transport, peer).await?;
        }
    }
    let expected: BTreeSet<u8> = config.peers.iter().map(|p| p.player).collect();
    for _ in 0..CONNECT_ATTEMPTS {
        let connected: BTreeSet<u8> = transport.connected().into_iter().collect();
        if connected.is_superset(&expected) {
            break;
        }
        sleep(CONNECT_BACKOFF).await;
    }
    info!(player = config.player, connected = ?transport.connected(), "links ready");

    let peers: Vec<u8> = expected.into_iter().collect();
    let mut session = if config.join {
        LockstepSession::join(config.player, &peers, sync, transport, Instant::now())
    } else {
        LockstepSession::start(
            config.player,
            &config.players(),
            config.initial_world(),
            sync,
            transport,
            Instant::now(),
        )
    };

    let tick_duration = Duration::from_micros(1_000_000 / config.tick_rate as u64);
    let mut ticker = interval(tick_duration);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut patrol_flip = false;

    loop {
        ticker.tick().await;
        match session.step(Instant::now())? {
            StepOutcome::Advanced(result) => {
                for event in &result.events {
                    debug!(tick = result.tick, ?event, "sim event");
                }
                if result.tick % PATROL_INTERVAL == 0 {
                    let unit = session.simulation().and_then(|sim| patrol_unit(sim, config.player));
                    if let Some(unit) = unit {
                        patrol_flip = !patrol_flip;
                        let offset = if patrol_flip { 10 } else { -10 };
                        session.issue(&Action::Move {
                            unit,
                            to: FixedVec2::from_ints(offset, offset),
                        })?;
                    }
                }
                if config.run_ticks.map_or(false, |limit| session.tick() >= limit) {
                    break;
                }
            }
            StepOutcome::Waiting { tick, missing } => {
                debug!(tick, ?missing, "waiting for peers");
            }
            StepOutcome::Synchronizing => {}
            StepOutcome::Disconnected => {
                warn!("left the session");
                break;
            }
        }
    }

    if let Some(path) = &config.save_path {
        session.save(path)?;
        info!(path = %path.display(), "world saved");
    }
    let hash = session
        .simulation()
        .map(Simulation::state_hash)
        .unwrap_or_default();
    info!(tick = session.tick(), hash = %short_hex(&hash), "node finished");
    Ok(NodeReport {
        tick: session.tick(),
        hash,
        stats: session.stats(),
    })
}
