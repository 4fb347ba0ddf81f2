//! Lockstep Session
//!
//! Every peer runs the same simulation. Local commands are scheduled `lag`
//! ticks ahead and broadcast; each peer then seals its ticks with an
//! [`NetMessage::Ack`] declaring how many commands it issued for them. A
//! tick executes once every participant sealed it and all declared commands
//! arrived, so all peers apply identical inputs in identical order.
//!
//! ```text
//! step(now)
//!   ├─ drain inbound frames      (commands, seals, joins, leaves, checksums)
//!   ├─ seal ticks up to tick+lag (Ack broadcast, keepalive when idle)
//!   ├─ advance one tick          (if every participant sealed it)
//!   ├─ checksum every N ticks    (desync detection)
//!   └─ timeouts / send failures / abort ceiling
//! ```
//!
//! Late joiners receive a full world from the lowest-indexed peer, which
//! fixes the first tick the joiner takes part in and relays other peers'
//! traffic for the ticks before it. Transports must deliver frames on each
//! link reliably and in order.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::core::hash::{short_hex, StateHash};
use crate::stream::CodecError;
use crate::world::command::{Action, Command};
use crate::world::replay::{Replay, ReplayRecorder};
use crate::world::save::{self, SaveError};
use crate::world::sim::{Simulation, TickResult};

use super::peer::{Peer, PeerState, TransitionError};
use super::protocol::{
    decode_frame, encode_message, Frame, LeaveReason, NetMessage, PeerInfo, ResyncPayload, Seal,
};
use super::transport::Transport;

/// Commands and seals further ahead than this are refused.
pub const FUTURE_HORIZON: u32 = 1024;

/// Checksums kept for comparison with slower peers, in intervals.
const CHECKSUM_HISTORY: u32 = 8;

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Lockstep tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Ticks between issuing a command and executing it.
    pub lag: u32,
    /// Silence after which a peer is dropped.
    pub peer_timeout_ms: u64,
    /// Stall after which the whole session is abandoned.
    pub abort_timeout_ms: u64,
    /// Extra attempts for a failed send before the peer is dropped.
    pub send_retries: u32,
    /// Ticks between world hash exchanges.
    pub checksum_interval: u32,
    /// Ticks between replay checkpoints.
    pub replay_checkpoint_interval: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            lag: 3,
            peer_timeout_ms: 5_000,
            abort_timeout_ms: 30_000,
            send_retries: 3,
            checksum_interval: 30,
            replay_checkpoint_interval: 60,
        }
    }
}

/// Oldest tick whose local hash is still kept for comparison.
fn checksum_keep_from(tick: u32, interval: u32) -> u32 {
    tick.saturating_sub(interval.saturating_mul(CHECKSUM_HISTORY))
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl SyncConfig {
    /// Load from `LOCKSTEP_*` environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            lag: env_or("LOCKSTEP_LAG", d.lag),
            peer_timeout_ms: env_or("LOCKSTEP_PEER_TIMEOUT_MS", d.peer_timeout_ms),
            abort_timeout_ms: env_or("LOCKSTEP_ABORT_TIMEOUT_MS", d.abort_timeout_ms),
            send_retries: env_or("LOCKSTEP_SEND_RETRIES", d.send_retries),
            checksum_interval: env_or("LOCKSTEP_CHECKSUM_INTERVAL", d.checksum_interval),
            replay_checkpoint_interval: env_or("LOCKSTEP_REPLAY_INTERVAL", d.replay_checkpoint_interval),
        }
    }

    /// Parse a JSON document; missing fields keep their defaults.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Per-peer silence timeout.
    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    /// Absolute stall ceiling.
    pub fn abort_timeout(&self) -> Duration {
        Duration::from_millis(self.abort_timeout_ms)
    }
}

// =============================================================================
// ERRORS / OUTCOMES
// =============================================================================

/// Lockstep failures surfaced to the driver.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// A peer reported a different world for the same tick.
    #[error("desync at tick {tick} against player {player}: local {local}, remote {remote}")]
    Desync {
        /// Tick counter the hashes were taken at.
        tick: u32,
        /// Peer whose hash differs.
        player: u8,
        /// Local hash (short hex).
        local: String,
        /// Remote hash (short hex).
        remote: String,
    },

    /// The session was abandoned, locally or by a peer.
    #[error("session aborted: {reason}")]
    Aborted {
        /// Diagnostic.
        reason: String,
    },

    /// The operation needs the local player to be in lockstep.
    #[error("local player is {state}, not in lockstep")]
    NotInLockstep {
        /// Current local state.
        state: PeerState,
    },

    /// A resync payload could not be applied. Nothing changed.
    #[error("resync payload rejected: {0}")]
    Resync(CodecError),

    /// Illegal peer state change.
    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// Saving the world failed.
    #[error(transparent)]
    Save(#[from] SaveError),
}

/// What one [`LockstepSession::step`] did.
#[derive(Debug)]
pub enum StepOutcome {
    /// One tick was executed.
    Advanced(TickResult),
    /// The next tick is not complete yet.
    Waiting {
        /// Tick being waited on.
        tick: u32,
        /// Players whose seal or commands are missing.
        missing: Vec<u8>,
    },
    /// Still waiting for a resync payload.
    Synchronizing,
    /// The local player left the session.
    Disconnected,
}

/// Session counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    /// Ticks executed.
    pub ticks_advanced: u64,
    /// Commands handed to the simulation.
    pub commands_executed: u64,
    /// Commands discarded because their player no longer took part.
    pub commands_discarded: u64,
    /// Commands that arrived after their tick executed.
    pub stale_dropped: u64,
    /// Frames that failed to decode.
    pub malformed_frames: u64,
    /// Send attempts repeated after a failure.
    pub send_retries: u64,
    /// Sends that failed after every retry.
    pub send_failures: u64,
    /// Checksum mismatches.
    pub desyncs: u64,
    /// Resync payloads served to joiners.
    pub resyncs_served: u64,
    /// Peers dropped for silence or send failures.
    pub peers_dropped: u64,
}

// =============================================================================
// SESSION
// =============================================================================

/// Relay duty of a resync provider for one joiner.
#[derive(Debug, Clone, Copy)]
struct RelayWindow {
    from: u32,
    until: u32,
}

/// One peer's view of a lockstep session.
pub struct LockstepSession<T: Transport> {
    config: SyncConfig,
    transport: T,
    local: Peer,
    peers: BTreeMap<u8, Peer>,
    sim: Option<Simulation>,
    pending: BTreeMap<u32, BTreeMap<(u8, u32), Command>>,
    local_counts: BTreeMap<u32, u32>,
    sealed_through: Option<u32>,
    next_sequence: u32,
    relays: BTreeMap<u8, RelayWindow>,
    hashes: BTreeMap<u32, StateHash>,
    remote_hashes: BTreeMap<(u32, u8), StateHash>,
    failed: BTreeSet<u8>,
    last_sent: Instant,
    last_request: Option<Instant>,
    stalled_since: Option<Instant>,
    abort_reason: Option<String>,
    recorder: Option<ReplayRecorder>,
    stats: SyncStats,
}

impl<T: Transport> LockstepSession<T> {
    /// Start a session from a shared world. Every index in `players` takes
    /// part from the world's current tick.
    pub fn start(
        local: u8,
        players: &[u8],
        sim: Simulation,
        config: SyncConfig,
        transport: T,
        now: Instant,
    ) -> Self {
        let from = sim.tick();
        let peers = players
            .iter()
            .filter(|&&p| p != local)
            .map(|&p| (p, Peer::new(p, PeerState::InLockstep, from, now)))
            .collect();

        info!(player = local, tick = from, players = players.len(), "lockstep session started");
        let mut session = Self::empty(local, PeerState::InLockstep, from, config, transport, now);
        session.peers = peers;
        session.sealed_through = from.checked_sub(1);
        session.sim = Some(sim);
        session
    }

    /// Join a running session. The lowest index in `known_peers` is asked
    /// for the world.
    pub fn join(local: u8, known_peers: &[u8], config: SyncConfig, transport: T, now: Instant) -> Self {
        let mut session = Self::empty(local, PeerState::Connecting, 0, config, transport, now);
        session.peers = known_peers
            .iter()
            .filter(|&&p| p != local)
            .map(|&p| (p, Peer::new(p, PeerState::Connecting, 0, now)))
            .collect();
        session.request_resync(now);
        session
    }

    fn empty(local: u8, state: PeerState, from: u32, config: SyncConfig, transport: T, now: Instant) -> Self {
        let config = SyncConfig {
            lag: config.lag.max(1),
            checksum_interval: config.checksum_interval.max(1),
            ..config
        };
        Self {
            config,
            transport,
            local: Peer::new(local, state, from, now),
            peers: BTreeMap::new(),
            sim: None,
            pending: BTreeMap::new(),
            local_counts: BTreeMap::new(),
            sealed_through: None,
            next_sequence: 0,
            relays: BTreeMap::new(),
            hashes: BTreeMap::new(),
            remote_hashes: BTreeMap::new(),
            failed: BTreeSet::new(),
            last_sent: now,
            last_request: None,
            stalled_since: None,
            abort_reason: None,
            recorder: None,
            stats: SyncStats::default(),
        }
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    /// Local player index.
    pub fn local_player(&self) -> u8 {
        self.local.player()
    }

    /// Local connection state.
    pub fn state(&self) -> PeerState {
        self.local.state()
    }

    /// Next tick to execute (0 before a joiner received the world).
    pub fn tick(&self) -> u32 {
        self.sim.as_ref().map_or(0, Simulation::tick)
    }

    /// The world, once available.
    pub fn simulation(&self) -> Option<&Simulation> {
        self.sim.as_ref()
    }

    /// A remote peer.
    pub fn peer(&self, player: u8) -> Option<&Peer> {
        self.peers.get(&player)
    }

    /// All remote peers by index.
    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    /// First tick the local player takes part in.
    pub fn lockstep_from(&self) -> u32 {
        self.local.lockstep_from()
    }

    /// Counters.
    pub fn stats(&self) -> SyncStats {
        self.stats
    }

    /// Active configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn require_lockstep(&self) -> Result<&Simulation, SyncError> {
        match (&self.sim, self.local.state()) {
            (Some(sim), PeerState::InLockstep) => Ok(sim),
            (_, state) => Err(SyncError::NotInLockstep { state }),
        }
    }

    // -------------------------------------------------------------------------
    // Local input
    // -------------------------------------------------------------------------

    /// Schedule a local action and broadcast it. Returns the command with
    /// the tick it will execute at.
    pub fn issue(&mut self, action: &Action) -> Result<Command, SyncError> {
        let tick = self.require_lockstep()?.tick();
        let floor = self.sealed_through.map_or(0, |s| s + 1);
        let target = (tick + self.config.lag).max(floor).max(self.local.lockstep_from());

        let cmd = Command::new(self.local.player(), target, self.next_sequence, action);
        self.next_sequence += 1;
        *self.local_counts.entry(target).or_default() += 1;
        self.pending
            .entry(target)
            .or_default()
            .insert(cmd.order_key(), cmd.clone());

        debug!(tick = target, sequence = cmd.sequence, "command issued");
        self.broadcast(&NetMessage::Command(cmd.clone()));
        Ok(cmd)
    }

    /// Leave voluntarily. Commands already sealed are still honoured.
    #[instrument(skip(self, now), fields(player = self.local.player()))]
    pub fn leave(&mut self, now: Instant) -> Result<(), SyncError> {
        self.require_lockstep()?;
        self.seal_ahead(now);
        let after = self.sealed_through.unwrap_or(0);
        self.broadcast(&NetMessage::PeerLeave {
            player: self.local.player(),
            after_tick: after,
            reason: LeaveReason::Quit,
        });
        self.local.depart(after)?;
        info!(after_tick = after, "left session");
        Ok(())
    }

    /// Give up on joining.
    pub fn cancel(&mut self) -> Result<(), SyncError> {
        if self.local.state() == PeerState::InLockstep {
            return Err(SyncError::NotInLockstep {
                state: PeerState::InLockstep,
            });
        }
        self.local.transition(PeerState::Disconnected)?;
        self.broadcast(&NetMessage::PeerLeave {
            player: self.local.player(),
            after_tick: 0,
            reason: LeaveReason::Cancelled,
        });
        info!(player = self.local.player(), "join cancelled");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Tick loop
    // -------------------------------------------------------------------------

    /// Process inbound traffic and execute at most one tick.
    pub fn step(&mut self, now: Instant) -> Result<StepOutcome, SyncError> {
        if let Some(reason) = &self.abort_reason {
            return Err(SyncError::Aborted { reason: reason.clone() });
        }
        self.drain(now)?;

        match self.local.state() {
            PeerState::Aborted => {
                let reason = self.abort_reason.clone().unwrap_or_default();
                return Err(SyncError::Aborted { reason });
            }
            PeerState::Disconnected => return Ok(StepOutcome::Disconnected),
            PeerState::Connecting | PeerState::Synchronizing => {
                self.retry_resync(now);
                self.stalled_since.get_or_insert(now);
                self.check_ceiling(now)?;
                return Ok(StepOutcome::Synchronizing);
            }
            PeerState::InLockstep => {}
        }

        self.seal_ahead(now);
        let outcome = match self.try_advance()? {
            Some(result) => {
                self.stalled_since = None;
                StepOutcome::Advanced(result)
            }
            None => {
                self.stalled_since.get_or_insert(now);
                let tick = self.tick();
                StepOutcome::Waiting {
                    tick,
                    missing: self.missing(tick),
                }
            }
        };

        self.check_timeouts(now);
        self.flush_failures();
        self.check_ceiling(now)?;
        Ok(outcome)
    }

    fn seal_ahead(&mut self, now: Instant) {
        let Some(tick) = self.sim.as_ref().map(Simulation::tick) else {
            return;
        };
        let start = self
            .sealed_through
            .map_or(0, |s| s + 1)
            .max(self.local.lockstep_from());
        let target = tick + self.config.lag;

        if start > target {
            self.keepalive(now);
            return;
        }
        for t in start..=target {
            let count = self.local_counts.remove(&t).unwrap_or(0);
            // Local seals are written once per tick.
            let _ = self.local.seal(t, count);
            self.broadcast(&NetMessage::Ack {
                player: self.local.player(),
                tick: t,
                command_count: count,
            });
        }
        self.sealed_through = Some(target);
        self.last_sent = now;
    }

    /// Repeat the latest seal so waiting peers do not time us out.
    fn keepalive(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_sent) < self.config.peer_timeout() / 4 {
            return;
        }
        let Some(tick) = self.sealed_through else {
            return;
        };
        let count = self.local.sealed(tick).unwrap_or(0);
        let recipients: Vec<u8> = self
            .peers
            .values()
            .filter(|p| p.state() == PeerState::InLockstep)
            .map(Peer::player)
            .collect();
        let message = NetMessage::Ack {
            player: self.local.player(),
            tick,
            command_count: count,
        };
        self.send_many(&recipients, &message);
        self.last_sent = now;
    }

    fn participant(&self, player: u8, tick: u32) -> bool {
        if player == self.local.player() {
            self.local.participates(tick)
        } else {
            self.peers.get(&player).map_or(false, |p| p.participates(tick))
        }
    }

    fn participants(&self, tick: u32) -> impl Iterator<Item = &Peer> + '_ {
        std::iter::once(&self.local)
            .chain(self.peers.values())
            .filter(move |p| p.participates(tick))
    }

    fn arrived(&self, player: u8, tick: u32) -> u32 {
        self.pending.get(&tick).map_or(0, |cmds| {
            cmds.range((player, 0)..=(player, u32::MAX)).count() as u32
        })
    }

    fn missing(&self, tick: u32) -> Vec<u8> {
        self.participants(tick)
            .filter(|p| match p.sealed(tick) {
                Some(count) => self.arrived(p.player(), tick) < count,
                None => true,
            })
            .map(Peer::player)
            .collect()
    }

    fn try_advance(&mut self) -> Result<Option<TickResult>, SyncError> {
        let Some(tick) = self.sim.as_ref().map(Simulation::tick) else {
            return Ok(None);
        };
        if !self.missing(tick).is_empty() {
            return Ok(None);
        }
        for peer in self.participants(tick) {
            let arrived = self.arrived(peer.player(), tick);
            let declared = peer.sealed(tick).unwrap_or(0);
            if arrived > declared {
                warn!(tick, player = peer.player(), arrived, declared, "more commands than sealed");
            }
        }

        let queued = self.pending.remove(&tick).unwrap_or_default();
        let mut commands = Vec::with_capacity(queued.len());
        for cmd in queued.into_values() {
            if self.participant(cmd.player, tick) {
                commands.push(cmd);
            } else {
                debug!(tick, player = cmd.player, "discarding command from non-participant");
                self.stats.commands_discarded += 1;
            }
        }

        let Some(sim) = self.sim.as_mut() else {
            return Ok(None);
        };
        let result = sim.advance(&commands);
        if let Some(recorder) = self.recorder.as_mut() {
            recorder.record_tick(sim, &commands);
        }

        self.local.forget_before(tick + 1);
        for peer in self.peers.values_mut() {
            peer.forget_before(tick + 1);
        }
        self.relays.retain(|_, w| w.until > tick);
        self.stats.ticks_advanced += 1;
        self.stats.commands_executed += commands.len() as u64;

        self.exchange_checksum()?;
        Ok(Some(result))
    }

    // -------------------------------------------------------------------------
    // Checksums
    // -------------------------------------------------------------------------

    fn exchange_checksum(&mut self) -> Result<(), SyncError> {
        let Some(sim) = self.sim.as_ref() else {
            return Ok(());
        };
        let tick = sim.tick();
        if tick % self.config.checksum_interval != 0 {
            return Ok(());
        }
        let hash = sim.state_hash();
        self.hashes.insert(tick, hash);

        self.hashes = self
            .hashes
            .split_off(&checksum_keep_from(tick, self.config.checksum_interval));

        self.broadcast(&NetMessage::Checksum {
            player: self.local.player(),
            tick,
            hash,
        });

        let reported: Vec<(u8, StateHash)> = self
            .remote_hashes
            .range((tick, 0)..=(tick, u8::MAX))
            .map(|(&(_, player), &h)| (player, h))
            .collect();
        self.remote_hashes = self.remote_hashes.split_off(&(tick + 1, 0));
        for (player, remote) in reported {
            self.compare_hash(player, tick, remote)?;
        }
        Ok(())
    }

    fn on_checksum(&mut self, player: u8, tick: u32, hash: StateHash) -> Result<(), SyncError> {
        if player == self.local.player() {
            return Ok(());
        }
        if self.hashes.contains_key(&tick) {
            return self.compare_hash(player, tick, hash);
        }
        let current = self.tick();
        if (self.sim.is_none() || tick > current) && tick <= current + FUTURE_HORIZON {
            self.remote_hashes.insert((tick, player), hash);
        }
        Ok(())
    }

    fn compare_hash(&mut self, player: u8, tick: u32, remote: StateHash) -> Result<(), SyncError> {
        let Some(local) = self.hashes.get(&tick).copied() else {
            return Ok(());
        };
        if local == remote {
            debug!(tick, player, hash = %short_hex(&local), "checksum matched");
            return Ok(());
        }
        self.stats.desyncs += 1;
        error!(
            tick,
            player,
            local = %hex::encode(local),
            remote = %hex::encode(remote),
            "desync detected"
        );
        Err(SyncError::Desync {
            tick,
            player,
            local: short_hex(&local),
            remote: short_hex(&remote),
        })
    }

    // -------------------------------------------------------------------------
    // Sending
    // -------------------------------------------------------------------------

    fn send_bytes(&mut self, to: u8, bytes: &[u8]) -> bool {
        let retries = self.config.send_retries;
        for attempt in 0..=retries {
            match self.transport.send(to, bytes) {
                Ok(()) => return true,
                Err(e) if attempt < retries => {
                    self.stats.send_retries += 1;
                    warn!(to, attempt = attempt + 1, error = %e, "send failed, retrying");
                }
                Err(e) => {
                    warn!(to, error = %e, "send failed, giving up");
                }
            }
        }
        self.stats.send_failures += 1;
        false
    }

    fn send_many(&mut self, recipients: &[u8], message: &NetMessage) {
        if recipients.is_empty() {
            return;
        }
        let bytes = encode_message(self.local.player(), message);
        for &to in recipients {
            if !self.send_bytes(to, &bytes) {
                self.failed.insert(to);
            }
        }
    }

    fn broadcast(&mut self, message: &NetMessage) {
        let recipients: Vec<u8> = self
            .peers
            .values()
            .filter(|p| match message.tick() {
                Some(tick) => p.wants(tick),
                None => matches!(
                    p.state(),
                    PeerState::Connecting | PeerState::Synchronizing | PeerState::InLockstep
                ),
            })
            .map(Peer::player)
            .collect();
        self.send_many(&recipients, message);
    }

    /// Forward another player's tick-scoped traffic to joiners that need it.
    fn relay(&mut self, origin: u8, message: &NetMessage) {
        let tick = message.tick();
        let targets: Vec<u8> = self
            .relays
            .iter()
            .filter(|(&joiner, w)| {
                joiner != origin && tick.map_or(true, |t| t >= w.from && t <= w.until)
            })
            .map(|(&joiner, _)| joiner)
            .collect();
        self.send_many(&targets, message);
    }

    fn flush_failures(&mut self) {
        while let Some(player) = self.failed.pop_first() {
            self.drop_peer(player, LeaveReason::SendFailure);
        }
    }

    // -------------------------------------------------------------------------
    // Failure handling
    // -------------------------------------------------------------------------

    fn check_timeouts(&mut self, now: Instant) {
        let timeout = self.config.peer_timeout();
        let expired: Vec<u8> = self
            .peers
            .values()
            .filter(|p| p.state() == PeerState::InLockstep && p.silent_for(now) >= timeout)
            .map(Peer::player)
            .collect();
        for player in expired {
            self.drop_peer(player, LeaveReason::Timeout);
        }
    }

    /// Stop waiting for `player`. Everything we hold from it is forwarded
    /// first so the other peers honour the same ticks.
    fn drop_peer(&mut self, player: u8, reason: LeaveReason) {
        let tick = self.tick();
        let Some(peer) = self.peers.get_mut(&player) else {
            return;
        };
        if peer.state() != PeerState::InLockstep {
            if let Err(e) = peer.transition(PeerState::Disconnected) {
                debug!(error = %e, "peer already gone");
            }
            self.relays.remove(&player);
            return;
        }

        let from = tick.max(peer.lockstep_from());
        let after = match peer.sealed_through(from) {
            Some(last) => last,
            None if from > 0 => from - 1,
            None => {
                // Nothing can be scheduled for tick 0, so an empty seal is exact.
                let _ = peer.seal(0, 0);
                0
            }
        };
        let after = match peer.depart(after) {
            Ok(after) => after,
            Err(e) => {
                warn!(error = %e, "cannot drop peer");
                return;
            }
        };
        let held: Vec<(u32, u32)> = peer.seals().filter(|&(t, _)| t >= tick).collect();

        warn!(player, after_tick = after, ?reason, "dropping peer");
        self.stats.peers_dropped += 1;
        self.relays.remove(&player);

        // A peer sealed only below the current tick has nothing left to forward.
        let commands: Vec<Command> = if after >= tick {
            self.pending
                .range(tick..=after)
                .flat_map(|(_, cmds)| cmds.values().filter(move |c| c.player == player).cloned())
                .collect()
        } else {
            Vec::new()
        };
        for cmd in commands {
            self.broadcast(&NetMessage::Command(cmd));
        }
        for (t, count) in held {
            self.broadcast(&NetMessage::Ack {
                player,
                tick: t,
                command_count: count,
            });
        }
        self.broadcast(&NetMessage::PeerLeave {
            player,
            after_tick: after,
            reason,
        });
    }

    fn check_ceiling(&mut self, now: Instant) -> Result<(), SyncError> {
        let Some(since) = self.stalled_since else {
            return Ok(());
        };
        let stalled = now.saturating_duration_since(since);
        if stalled < self.config.abort_timeout() {
            return Ok(());
        }
        let reason = format!(
            "no progress at tick {} for {}ms",
            self.tick(),
            stalled.as_millis()
        );
        self.broadcast(&NetMessage::Abort {
            reason: reason.clone(),
        });
        self.enter_aborted(reason.clone());
        Err(SyncError::Aborted { reason })
    }

    fn enter_aborted(&mut self, reason: String) {
        error!(player = self.local.player(), %reason, "session aborted");
        let _ = self.local.transition(PeerState::Aborted);
        for peer in self.peers.values_mut() {
            let _ = peer.transition(PeerState::Aborted);
        }
        self.abort_reason = Some(reason);
    }

    // -------------------------------------------------------------------------
    // Inbound
    // -------------------------------------------------------------------------

    fn drain(&mut self, now: Instant) -> Result<(), SyncError> {
        while let Some(inbound) = self.transport.try_recv() {
            let frame = match decode_frame(&inbound.bytes) {
                Ok(frame) => frame,
                Err(e) => {
                    self.stats.malformed_frames += 1;
                    warn!(from = inbound.from, error = %e, "dropping malformed frame");
                    continue;
                }
            };
            if let Some(peer) = self.peers.get_mut(&frame.sender) {
                peer.heard(now);
            }
            self.handle(frame, now)?;
        }
        Ok(())
    }

    fn handle(&mut self, frame: Frame, now: Instant) -> Result<(), SyncError> {
        let sender = frame.sender;
        match frame.message {
            NetMessage::Command(cmd) => self.on_command(sender, cmd),
            NetMessage::Ack {
                player,
                tick,
                command_count,
            } => self.on_ack(player, tick, command_count, now),
            NetMessage::ResyncRequest { player } => self.on_resync_request(player, now),
            NetMessage::ResyncPayload(payload) => return self.on_resync_payload(payload, now),
            NetMessage::PeerJoin {
                player,
                lockstep_from,
            } => self.on_peer_join(player, lockstep_from, now),
            NetMessage::PeerLeave {
                player,
                after_tick,
                reason,
            } => self.on_peer_leave(player, after_tick, reason),
            NetMessage::Checksum { player, tick, hash } => {
                return self.on_checksum(player, tick, hash)
            }
            NetMessage::Abort { reason } => {
                warn!(from = sender, %reason, "peer aborted the session");
                self.enter_aborted(reason.clone());
                return Err(SyncError::Aborted { reason });
            }
        }
        Ok(())
    }

    fn departed_after(&self, player: u8, tick: u32) -> bool {
        self.peers
            .get(&player)
            .and_then(Peer::leave_after)
            .map_or(false, |after| tick > after)
    }

    fn on_command(&mut self, sender: u8, cmd: Command) {
        if cmd.player == self.local.player() {
            return;
        }
        if let Some(sim) = &self.sim {
            let current = sim.tick();
            if cmd.tick < current {
                if sender == cmd.player {
                    self.stats.stale_dropped += 1;
                    warn!(
                        player = cmd.player,
                        tick = cmd.tick,
                        current,
                        "dropping stale command, desync risk"
                    );
                } else {
                    debug!(player = cmd.player, tick = cmd.tick, "ignoring relayed duplicate");
                }
                return;
            }
            if cmd.tick > current + FUTURE_HORIZON {
                warn!(player = cmd.player, tick = cmd.tick, current, "dropping command beyond horizon");
                return;
            }
        }
        if self.departed_after(cmd.player, cmd.tick) {
            self.stats.commands_discarded += 1;
            debug!(player = cmd.player, tick = cmd.tick, "discarding command after departure");
            return;
        }

        let origin = cmd.player;
        let message = NetMessage::Command(cmd.clone());
        self.pending
            .entry(cmd.tick)
            .or_default()
            .insert(cmd.order_key(), cmd);
        self.relay(origin, &message);
    }

    fn on_ack(&mut self, player: u8, tick: u32, count: u32, now: Instant) {
        if player == self.local.player() {
            return;
        }
        let current = self.tick();
        if self.sim.is_some() && (tick < current || tick > current + FUTURE_HORIZON) {
            return;
        }
        if self.departed_after(player, tick) {
            return;
        }
        if !self.peers.contains_key(&player) {
            if self.sim.is_some() {
                debug!(player, tick, "seal from unknown player");
                return;
            }
            self.peers
                .insert(player, Peer::new(player, PeerState::Connecting, 0, now));
        }
        let Some(peer) = self.peers.get_mut(&player) else {
            return;
        };
        if let Err(conflict) = peer.seal(tick, count) {
            warn!(
                player,
                tick,
                recorded = conflict.recorded,
                received = conflict.received,
                "conflicting seal ignored"
            );
            return;
        }
        self.relay(
            player,
            &NetMessage::Ack {
                player,
                tick,
                command_count: count,
            },
        );
    }

    // -------------------------------------------------------------------------
    // Membership
    // -------------------------------------------------------------------------

    fn request_resync(&mut self, now: Instant) {
        if self.local.state() == PeerState::Connecting {
            if let Err(e) = self.local.transition(PeerState::Synchronizing) {
                warn!(error = %e, "cannot start synchronizing");
                return;
            }
            self.broadcast(&NetMessage::PeerJoin {
                player: self.local.player(),
                lockstep_from: None,
            });
        }
        let provider = self
            .peers
            .values()
            .find(|p| p.state() != PeerState::Disconnected && p.state() != PeerState::Aborted)
            .map(Peer::player);
        let Some(provider) = provider else {
            warn!(player = self.local.player(), "no peer to resync from");
            return;
        };
        info!(player = self.local.player(), provider, "requesting resync");
        let message = NetMessage::ResyncRequest {
            player: self.local.player(),
        };
        self.send_many(&[provider], &message);
        self.failed.clear();
        self.last_request = Some(now);
    }

    fn retry_resync(&mut self, now: Instant) {
        if self.local.state() != PeerState::Synchronizing {
            return;
        }
        let due = self
            .last_request
            .map_or(true, |at| now.saturating_duration_since(at) >= self.config.peer_timeout());
        if due {
            self.request_resync(now);
        }
    }

    #[instrument(skip(self, now), fields(provider = self.local.player()))]
    fn on_resync_request(&mut self, joiner: u8, now: Instant) {
        if joiner == self.local.player() {
            return;
        }
        let Ok(sim) = self.require_lockstep() else {
            debug!("not in lockstep, cannot serve resync");
            return;
        };
        let tick = sim.tick();
        let state = save::encode_world(sim);

        let lockstep_from = match self.relays.get(&joiner) {
            Some(window) if window.until >= tick => window.until + 1,
            Some(_) => {
                warn!(joiner, "repeated resync request after the join tick");
                return;
            }
            None => (tick + self.config.lag + 1).max(self.sealed_through.map_or(0, |s| s + 1)),
        };

        let peer = self
            .peers
            .entry(joiner)
            .or_insert_with(|| Peer::new(joiner, PeerState::Connecting, lockstep_from, now));
        if peer.state() == PeerState::Disconnected {
            if let Err(e) = peer.transition(PeerState::Synchronizing) {
                warn!(error = %e, "cannot resync peer");
                return;
            }
        }
        if peer.state() != PeerState::InLockstep || peer.lockstep_from() != lockstep_from {
            if let Err(e) = peer.join_at(lockstep_from) {
                warn!(error = %e, "cannot admit peer");
                return;
            }
        }
        peer.send_from(tick);
        peer.heard(now);

        let mut peers = vec![PeerInfo {
            player: self.local.player(),
            lockstep_from: self.local.lockstep_from(),
            leave_after: None,
        }];
        peers.extend(
            self.peers
                .values()
                .filter(|p| {
                    p.participates(tick)
                        || (p.lockstep_from() > tick && p.state() == PeerState::InLockstep)
                })
                .map(|p| PeerInfo {
                    player: p.player(),
                    lockstep_from: p.lockstep_from(),
                    leave_after: p.leave_after(),
                }),
        );

        let pending = self
            .pending
            .range(tick..)
            .flat_map(|(_, cmds)| cmds.values().cloned())
            .collect();
        let seals = std::iter::once(&self.local)
            .chain(self.peers.values().filter(|p| p.player() != joiner))
            .flat_map(|p| {
                p.seals().filter(move |&(t, _)| t >= tick).map(move |(t, count)| Seal {
                    player: p.player(),
                    tick: t,
                    command_count: count,
                })
            })
            .collect();

        let payload = NetMessage::ResyncPayload(ResyncPayload {
            tick,
            state,
            peers,
            pending,
            seals,
        });
        self.send_many(&[joiner], &payload);

        let announce: Vec<u8> = self
            .peers
            .values()
            .filter(|p| p.player() != joiner && p.state() == PeerState::InLockstep)
            .map(Peer::player)
            .collect();
        self.send_many(
            &announce,
            &NetMessage::PeerJoin {
                player: joiner,
                lockstep_from: Some(lockstep_from),
            },
        );

        if lockstep_from > tick {
            self.relays.insert(
                joiner,
                RelayWindow {
                    from: tick,
                    until: lockstep_from - 1,
                },
            );
        }
        self.stats.resyncs_served += 1;
        info!(joiner, tick, lockstep_from, "resync served");
    }

    /// Apply a resync payload. Everything is validated before anything
    /// changes, so a rejected payload leaves the session synchronizing.
    fn on_resync_payload(&mut self, payload: ResyncPayload, now: Instant) -> Result<(), SyncError> {
        if self.local.state() != PeerState::Synchronizing {
            debug!(state = %self.local.state(), "ignoring unexpected resync payload");
            return Ok(());
        }
        let sim = save::decode_world(&payload.state).map_err(SyncError::Resync)?;
        if sim.tick() != payload.tick {
            return Err(SyncError::Resync(CodecError::invalid(
                "resync payload",
                format!("world at tick {} but payload claims {}", sim.tick(), payload.tick),
            )));
        }
        let local = self.local.player();
        let start = payload
            .peers
            .iter()
            .find(|info| info.player == local)
            .map(|info| info.lockstep_from)
            .ok_or_else(|| SyncError::Resync(CodecError::invalid("resync payload", "receiver not listed")))?;
        if start < payload.tick {
            return Err(SyncError::Resync(CodecError::invalid(
                "resync payload",
                "join tick already executed",
            )));
        }

        let tick = payload.tick;
        for info in payload.peers.iter().filter(|info| info.player != local) {
            let peer = self
                .peers
                .entry(info.player)
                .or_insert_with(|| Peer::new(info.player, PeerState::Connecting, info.lockstep_from, now));
            if peer.state() == PeerState::Disconnected {
                let _ = peer.transition(PeerState::Synchronizing);
            }
            if let Err(e) = peer.join_at(info.lockstep_from) {
                warn!(error = %e, "cannot adopt peer from payload");
                continue;
            }
            if let Some(after) = info.leave_after {
                let _ = peer.depart(after);
            }
            peer.forget_before(tick);
            peer.heard(now);
        }
        for seal in payload.seals.iter().filter(|s| s.player != local && s.tick >= tick) {
            if let Some(peer) = self.peers.get_mut(&seal.player) {
                if let Err(conflict) = peer.seal(seal.tick, seal.command_count) {
                    warn!(player = seal.player, tick = seal.tick, ?conflict, "conflicting seal in payload");
                }
            }
        }

        self.pending = self.pending.split_off(&tick);
        for cmd in payload.pending.into_iter().filter(|c| c.tick >= tick) {
            self.pending
                .entry(cmd.tick)
                .or_default()
                .insert(cmd.order_key(), cmd);
        }
        self.remote_hashes = self.remote_hashes.split_off(&(tick, 0));
        self.hashes.clear();

        self.local.join_at(start)?;
        self.sealed_through = start.checked_sub(1);
        self.sim = Some(sim);
        self.stalled_since = None;
        self.last_request = None;
        info!(player = local, tick, lockstep_from = start, "resync applied");
        Ok(())
    }

    fn on_peer_join(&mut self, player: u8, lockstep_from: Option<u32>, now: Instant) {
        if player == self.local.player() {
            return;
        }
        let tick = self.tick();
        let peer = self
            .peers
            .entry(player)
            .or_insert_with(|| Peer::new(player, PeerState::Connecting, 0, now));
        peer.heard(now);

        let Some(from) = lockstep_from else {
            let window_open = peer.leave_after().map_or(false, |a| tick <= a);
            if peer.state() == PeerState::InLockstep || window_open {
                debug!(player, "join notice from a participating peer ignored");
                return;
            }
            if let Err(e) = peer.transition(PeerState::Synchronizing) {
                debug!(error = %e, "join notice ignored");
            }
            return;
        };

        if peer.state() == PeerState::Disconnected {
            let _ = peer.transition(PeerState::Synchronizing);
        }
        if let Err(e) = peer.join_at(from) {
            warn!(error = %e, "cannot admit announced peer");
            return;
        }
        info!(player, lockstep_from = from, "peer joining");

        // Our traffic for its ticks may have gone out before we knew it.
        let local = self.local.player();
        let commands: Vec<Command> = self
            .pending
            .range(from..)
            .flat_map(|(_, cmds)| cmds.values().filter(move |c| c.player == local).cloned())
            .collect();
        let seals: Vec<(u32, u32)> = self.local.seals().filter(|&(t, _)| t >= from).collect();
        for cmd in commands {
            self.send_many(&[player], &NetMessage::Command(cmd));
        }
        for (t, count) in seals {
            self.send_many(
                &[player],
                &NetMessage::Ack {
                    player: local,
                    tick: t,
                    command_count: count,
                },
            );
        }
    }

    fn on_peer_leave(&mut self, player: u8, after_tick: u32, reason: LeaveReason) {
        let tick = self.tick();
        if player == self.local.player() {
            if self.local.state() == PeerState::InLockstep {
                warn!(after_tick, ?reason, "dropped by a peer, leaving session");
                let _ = self.local.depart(after_tick);
            }
            return;
        }
        let served = self.relays.contains_key(&player);
        let Some(peer) = self.peers.get_mut(&player) else {
            return;
        };
        let relay = NetMessage::PeerLeave {
            player,
            after_tick,
            reason,
        };

        match peer.state() {
            PeerState::Connecting | PeerState::Synchronizing => {
                let _ = peer.transition(PeerState::Disconnected);
                info!(player, ?reason, "peer gave up joining");
            }
            PeerState::InLockstep => {
                // We may hold more of its traffic than the notice covers.
                let known = peer
                    .sealed_through(tick.max(peer.lockstep_from()))
                    .filter(|&last| last > after_tick && reason != LeaveReason::Quit);
                let after = match peer.depart(known.unwrap_or(after_tick)) {
                    Ok(after) => after,
                    Err(e) => {
                        warn!(error = %e, "cannot record departure");
                        return;
                    }
                };
                info!(player, after_tick = after, ?reason, "peer left");
                let held: Vec<(u32, u32)> = peer
                    .seals()
                    .filter(|&(t, _)| t > after_tick && t <= after)
                    .collect();
                if known.is_none() && served {
                    // Others learned of this peer from our announcement.
                    self.broadcast(&NetMessage::PeerLeave {
                        player,
                        after_tick: after,
                        reason,
                    });
                }
                if let Some(extended) = known {
                    let commands: Vec<Command> = self
                        .pending
                        .range(after_tick + 1..=extended)
                        .flat_map(|(_, cmds)| cmds.values().filter(move |c| c.player == player).cloned())
                        .collect();
                    for cmd in commands {
                        self.broadcast(&NetMessage::Command(cmd));
                    }
                    for (t, count) in held {
                        self.broadcast(&NetMessage::Ack {
                            player,
                            tick: t,
                            command_count: count,
                        });
                    }
                    self.broadcast(&NetMessage::PeerLeave {
                        player,
                        after_tick: extended,
                        reason,
                    });
                }
            }
            PeerState::Disconnected => {
                let previous = peer.leave_after().unwrap_or(0);
                if after_tick > previous {
                    if tick > previous + 1 {
                        error!(player, previous, after_tick, "conflicting departure ticks, desync risk");
                    } else {
                        let _ = peer.depart(after_tick);
                    }
                }
            }
            PeerState::Aborted => {}
        }
        self.relays.remove(&player);
        self.relay(player, &relay);
    }

    // -------------------------------------------------------------------------
    // Persistence and diagnostics
    // -------------------------------------------------------------------------

    /// Save the current world.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), SyncError> {
        let sim = self.sim.as_ref().ok_or(SyncError::NotInLockstep {
            state: self.local.state(),
        })?;
        save::save_to_file(sim, path)?;
        Ok(())
    }

    /// Start journaling executed ticks.
    pub fn enable_replay(&mut self, session_id: Uuid) -> Result<(), SyncError> {
        let sim = self.sim.as_ref().ok_or(SyncError::NotInLockstep {
            state: self.local.state(),
        })?;
        self.recorder = Some(ReplayRecorder::start(
            sim,
            session_id,
            self.config.replay_checkpoint_interval,
        ));
        Ok(())
    }

    /// Stop journaling and return the journal.
    pub fn finish_replay(&mut self) -> Option<Replay> {
        let recorder = self.recorder.take()?;
        self.sim.as_ref().map(|sim| recorder.finish(sim))
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::vec2::FixedVec2;
    use crate::network::protocol::encode_frame;
    use crate::network::transport::{LoopbackNetwork, LoopbackTransport};
    use crate::world::id::ObjectId;
    use crate::world::object::UnitKind;

    const SEED: u64 = 0x5eed;
    const HOUSES: [&str; 3] = ["Atreides", "Harkonnen", "Ordos"];

    type Session = LockstepSession<LoopbackTransport>;

    fn infantry(house: u8) -> ObjectId {
        ObjectId::from_raw(house as u32 * 6 + 3)
    }

    fn factory(house: u8) -> ObjectId {
        ObjectId::from_raw(house as u32 * 6 + 1)
    }

    fn world(seed: u64) -> Simulation {
        let mut sim = Simulation::new(seed, &HOUSES);
        sim.setup_skirmish();
        sim
    }

    struct Cluster {
        net: LoopbackNetwork,
        config: SyncConfig,
        sessions: BTreeMap<u8, Session>,
        history: BTreeMap<u8, BTreeMap<u32, StateHash>>,
        now: Instant,
    }

    impl Cluster {
        fn new(players: &[u8], config: SyncConfig) -> Self {
            let net = LoopbackNetwork::new();
            let now = Instant::now();
            let sessions = players
                .iter()
                .map(|&p| {
                    let session = Session::start(p, players, world(SEED), config.clone(), net.endpoint(p), now);
                    (p, session)
                })
                .collect();
            Self {
                net,
                config,
                sessions,
                history: BTreeMap::new(),
                now,
            }
        }

        fn join(&mut self, player: u8) {
            let known: Vec<u8> = self.sessions.keys().copied().collect();
            let session = Session::join(player, &known, self.config.clone(), self.net.endpoint(player), self.now);
            self.sessions.insert(player, session);
        }

        fn session(&mut self, player: u8) -> &mut Session {
            self.sessions.get_mut(&player).unwrap()
        }

        /// Step the given players once each, recording hashes after every tick.
        fn round(&mut self, active: &[u8]) {
            self.now += Duration::from_millis(50);
            for &p in active {
                let now = self.now;
                let session = self.sessions.get_mut(&p).unwrap();
                if let StepOutcome::Advanced(result) = session.step(now).unwrap() {
                    let sim = session.simulation().unwrap();
                    assert_eq!(sim.tick(), result.tick + 1);
                    self.history.entry(p).or_default().insert(sim.tick(), sim.state_hash());
                }
            }
        }

        fn rounds(&mut self, n: usize, active: &[u8]) {
            for _ in 0..n {
                self.round(active);
            }
        }

        /// Every tick reached by two players produced the same world.
        fn assert_agree(&self, a: u8, b: u8) -> usize {
            let ha = &self.history[&a];
            let hb = &self.history[&b];
            let mut common = 0;
            for (tick, hash) in ha {
                if let Some(other) = hb.get(tick) {
                    assert_eq!(hash, other, "players {a} and {b} diverged at tick {tick}");
                    common += 1;
                }
            }
            common
        }
    }

    fn move_to(house: u8, x: i32, y: i32) -> Action {
        Action::Move {
            unit: infantry(house),
            to: FixedVec2::from_ints(x, y),
        }
    }

    #[test]
    fn test_config_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.lag, 3);
        assert_eq!(config.peer_timeout(), Duration::from_secs(5));
        assert_eq!(config.abort_timeout(), Duration::from_secs(30));
        assert_eq!(config.send_retries, 3);
        assert_eq!(config.checksum_interval, 30);
        assert_eq!(config.replay_checkpoint_interval, 60);
    }

    #[test]
    fn test_config_from_json_keeps_defaults() {
        let config = SyncConfig::from_json(r#"{"lag": 5, "send_retries": 1}"#).unwrap();
        assert_eq!(config.lag, 5);
        assert_eq!(config.send_retries, 1);
        assert_eq!(config.peer_timeout_ms, 5_000);
        assert!(SyncConfig::from_json("{\"lag\": -1}").is_err());
    }

    #[test]
    fn test_config_from_env() {
        std::env::set_var("LOCKSTEP_CHECKSUM_INTERVAL", "15");
        std::env::set_var("LOCKSTEP_ABORT_TIMEOUT_MS", "not a number");
        let config = SyncConfig::from_env();
        std::env::remove_var("LOCKSTEP_CHECKSUM_INTERVAL");
        std::env::remove_var("LOCKSTEP_ABORT_TIMEOUT_MS");
        assert_eq!(config.checksum_interval, 15);
        assert_eq!(config.abort_timeout_ms, 30_000);
    }

    #[test]
    fn test_command_scheduled_lag_ahead() {
        let mut cluster = Cluster::new(&[0, 1], SyncConfig::default());
        let first = cluster.session(0).issue(&move_to(0, 0, 0)).unwrap();
        assert_eq!(first.tick, 3);

        cluster.round(&[0, 1]);
        // Ticks up to 3 are sealed now, so the next command lands after them.
        let second = cluster.session(0).issue(&move_to(0, 1, 1)).unwrap();
        assert_eq!(second.tick, 4);
        assert_eq!(second.sequence, 1);
    }

    #[test]
    fn test_waits_for_every_participant() {
        let mut cluster = Cluster::new(&[0, 1], SyncConfig::default());
        let now = cluster.now + Duration::from_millis(10);
        match cluster.session(0).step(now).unwrap() {
            StepOutcome::Waiting { tick, missing } => {
                assert_eq!(tick, 0);
                assert_eq!(missing, vec![1]);
            }
            other => panic!("expected to wait, got {:?}", other),
        }
        assert_eq!(cluster.session(0).tick(), 0);
    }

    #[test]
    fn test_peers_execute_identical_ticks() {
        let mut cluster = Cluster::new(&[0, 1], SyncConfig::default());
        for round in 0..150u32 {
            if round % 7 == 0 {
                let x = (round % 20) as i32 - 10;
                cluster.session(0).issue(&move_to(0, x, 5)).unwrap();
            }
            if round % 11 == 0 {
                cluster
                    .session(1)
                    .issue(&Action::Produce {
                        factory: factory(1),
                        kind: UnitKind::Infantry,
                    })
                    .unwrap();
            }
            if round == 40 {
                cluster
                    .session(1)
                    .issue(&Action::Attack {
                        unit: ObjectId::from_raw(12),
                        target: ObjectId::from_raw(6),
                    })
                    .unwrap();
            }
            cluster.round(&[0, 1]);
        }

        assert!(cluster.assert_agree(0, 1) > 100);
        let stats = cluster.session(0).stats();
        assert!(stats.ticks_advanced > 100);
        assert!(stats.commands_executed > 20);
        assert_eq!(stats.desyncs, 0);
        assert_eq!(stats.stale_dropped, 0);
    }

    #[test]
    fn test_late_joiner_converges() {
        let mut cluster = Cluster::new(&[0, 1], SyncConfig::default());
        for round in 0..60u32 {
            if round % 5 == 0 {
                cluster.session(0).issue(&move_to(0, round as i32 % 30, -3)).unwrap();
                cluster.session(1).issue(&move_to(1, -3, round as i32 % 30)).unwrap();
            }
            cluster.round(&[0, 1]);
        }

        cluster.join(2);
        assert_eq!(cluster.session(2).state(), PeerState::Synchronizing);
        assert!(matches!(
            cluster.session(2).issue(&move_to(2, 0, 0)),
            Err(SyncError::NotInLockstep { .. })
        ));

        for round in 0..150u32 {
            if round % 6 == 0 {
                cluster.session(0).issue(&move_to(0, 4, round as i32 % 40)).unwrap();
            }
            if round % 9 == 0 && cluster.session(2).state() == PeerState::InLockstep {
                cluster.session(2).issue(&move_to(2, -8, 8)).unwrap();
            }
            cluster.round(&[0, 1, 2]);
        }

        let joiner = cluster.session(2);
        assert_eq!(joiner.state(), PeerState::InLockstep);
        let from = joiner.lockstep_from();
        assert!(from > 60);
        assert_eq!(cluster.session(0).peer(2).unwrap().lockstep_from(), from);
        assert_eq!(cluster.session(1).peer(2).unwrap().lockstep_from(), from);
        assert_eq!(cluster.session(0).stats().resyncs_served, 1);

        assert!(cluster.assert_agree(0, 2) > 100);
        assert!(cluster.assert_agree(1, 2) > 100);
        assert!(cluster.assert_agree(0, 1) > 150);
        for p in 0..3 {
            assert_eq!(cluster.session(p).stats().desyncs, 0);
        }
    }

    #[test]
    fn test_silent_peer_is_dropped() {
        let mut cluster = Cluster::new(&[0, 1, 2], SyncConfig::default());
        cluster.rounds(20, &[0, 1, 2]);
        cluster.session(2).issue(&move_to(2, 1, 1)).unwrap();
        cluster.round(&[0, 1, 2]);

        // 2 goes quiet; 0 and 1 stall, then time it out after 5s.
        cluster.rounds(130, &[0, 1]);
        for p in [0, 1] {
            let peer = cluster.session(p).peer(2).unwrap();
            assert_eq!(peer.state(), PeerState::Disconnected);
            assert_eq!(cluster.session(p).peer(if p == 0 { 1 } else { 0 }).unwrap().state(), PeerState::InLockstep);
        }
        let after_0 = cluster.session(0).peer(2).unwrap().leave_after();
        assert_eq!(after_0, cluster.session(1).peer(2).unwrap().leave_after());

        let before = cluster.session(0).tick();
        cluster.rounds(40, &[0, 1]);
        assert!(cluster.session(0).tick() > before + 30);
        assert!(cluster.assert_agree(0, 1) > 50);
        assert!(cluster.session(0).stats().peers_dropped + cluster.session(1).stats().peers_dropped >= 1);
    }

    #[test]
    fn test_last_peer_dropped_while_sealed_behind() {
        let mut cluster = Cluster::new(&[0, 1], SyncConfig::default());
        cluster.rounds(10, &[0, 1]);
        cluster.session(0).issue(&move_to(0, 4, -4)).unwrap();

        // 1 stops stepping; its seals end before 0's current tick when the timeout hits.
        cluster.rounds(160, &[0]);
        let session = cluster.session(0);
        assert_eq!(session.peer(1).unwrap().state(), PeerState::Disconnected);
        assert!(session.peer(1).unwrap().leave_after().is_some());
        assert_eq!(session.stats().peers_dropped, 1);

        let before = cluster.session(0).tick();
        cluster.rounds(20, &[0]);
        let session = cluster.session(0);
        assert!(session.tick() > before + 10);
        assert!(session.stats().commands_executed >= 1);
    }

    #[test]
    fn test_checksum_history_window() {
        assert_eq!(checksum_keep_from(600, 30), 360);
        assert_eq!(checksum_keep_from(100, 30), 0);
        assert_eq!(checksum_keep_from(u32::MAX, u32::MAX), 0);
        assert_eq!(checksum_keep_from(u32::MAX, 1 << 30), 0);
        assert_eq!(checksum_keep_from(u32::MAX, 30), u32::MAX - 240);
    }

    #[test]
    fn test_voluntary_leave() {
        let mut cluster = Cluster::new(&[0, 1, 2], SyncConfig::default());
        cluster.rounds(10, &[0, 1, 2]);
        cluster.session(2).issue(&move_to(2, 2, 2)).unwrap();
        let now = cluster.now;
        cluster.session(2).leave(now).unwrap();
        assert_eq!(cluster.session(2).state(), PeerState::Disconnected);
        assert!(matches!(cluster.session(2).step(now).unwrap(), StepOutcome::Disconnected));

        cluster.rounds(30, &[0, 1]);
        assert_eq!(cluster.session(0).peer(2).unwrap().state(), PeerState::Disconnected);
        assert!(cluster.session(0).tick() > 30);
        assert!(cluster.assert_agree(0, 1) > 25);
        assert_eq!(cluster.session(0).stats().peers_dropped, 0);
    }

    #[test]
    fn test_abort_after_ceiling() {
        let config = SyncConfig {
            peer_timeout_ms: 120_000,
            abort_timeout_ms: 1_000,
            ..SyncConfig::default()
        };
        let mut cluster = Cluster::new(&[0, 1], config);
        cluster.rounds(5, &[0, 1]);

        let mut aborted = false;
        for _ in 0..40 {
            cluster.now += Duration::from_millis(50);
            let now = cluster.now;
            match cluster.session(0).step(now) {
                Ok(_) => {}
                Err(SyncError::Aborted { .. }) => {
                    aborted = true;
                    break;
                }
                Err(e) => panic!("unexpected error {e}"),
            }
        }
        assert!(aborted);
        assert_eq!(cluster.session(0).state(), PeerState::Aborted);

        let now = cluster.now;
        assert!(matches!(cluster.session(1).step(now), Err(SyncError::Aborted { .. })));
        assert_eq!(cluster.session(1).state(), PeerState::Aborted);
    }

    #[test]
    fn test_stale_command_dropped() {
        let mut cluster = Cluster::new(&[0, 1], SyncConfig::default());
        cluster.rounds(20, &[0, 1]);

        let stale = Command::new(1, 2, 999, &move_to(1, 9, 9));
        let mut intruder = cluster.net.endpoint(7);
        intruder
            .send(0, &encode_frame(&Frame::new(1, NetMessage::Command(stale))))
            .unwrap();
        intruder.send(0, b"garbage").unwrap();

        cluster.rounds(10, &[0, 1]);
        let stats = cluster.session(0).stats();
        assert_eq!(stats.stale_dropped, 1);
        assert_eq!(stats.malformed_frames, 1);
        assert!(cluster.assert_agree(0, 1) > 25);
    }

    #[test]
    fn test_send_failures_retry_then_drop() {
        let mut cluster = Cluster::new(&[0, 1], SyncConfig::default());
        cluster.rounds(3, &[0, 1]);
        cluster.net.cut(0, 1);
        cluster.round(&[0]);

        let session = cluster.session(0);
        let stats = session.stats();
        assert!(stats.send_retries >= 3);
        assert!(stats.send_failures >= 1);
        assert_eq!(session.peer(1).unwrap().state(), PeerState::Disconnected);

        let before = session.tick();
        cluster.rounds(10, &[0]);
        assert!(cluster.session(0).tick() > before);
    }

    #[test]
    fn test_desync_detected_by_checksum() {
        let net = LoopbackNetwork::new();
        let now = Instant::now();
        let config = SyncConfig {
            checksum_interval: 10,
            ..SyncConfig::default()
        };
        let mut a = Session::start(0, &[0, 1], world(1), config.clone(), net.endpoint(0), now);
        let mut b = Session::start(1, &[0, 1], world(2), config, net.endpoint(1), now);

        let mut desync = None;
        for i in 0..60 {
            let t = now + Duration::from_millis(i * 50);
            for session in [&mut a, &mut b] {
                if let Err(e) = session.step(t) {
                    desync = Some(e);
                }
            }
            if desync.is_some() {
                break;
            }
        }
        match desync {
            Some(SyncError::Desync { tick, .. }) => assert_eq!(tick, 10),
            other => panic!("expected desync, got {:?}", other),
        }
        assert!(a.stats().desyncs + b.stats().desyncs >= 1);
    }

    #[test]
    fn test_bad_resync_payload_changes_nothing() {
        let mut cluster = Cluster::new(&[0, 1], SyncConfig::default());
        cluster.rounds(10, &[0, 1]);

        // The joiner asks player 0, but a forged payload arrives first.
        cluster.join(2);
        let mut forger = cluster.net.endpoint(9);
        let forged = NetMessage::ResyncPayload(ResyncPayload {
            tick: 10,
            state: vec![0xde, 0xad],
            peers: vec![PeerInfo { player: 2, lockstep_from: 20, leave_after: None }],
            pending: Vec::new(),
            seals: Vec::new(),
        });
        forger.send(2, &encode_frame(&Frame::new(0, forged))).unwrap();

        let now = cluster.now;
        assert!(matches!(cluster.session(2).step(now), Err(SyncError::Resync(_))));
        assert_eq!(cluster.session(2).state(), PeerState::Synchronizing);
        assert!(cluster.session(2).simulation().is_none());

        cluster.rounds(40, &[0, 1, 2]);
        assert_eq!(cluster.session(2).state(), PeerState::InLockstep);
        assert!(cluster.assert_agree(0, 2) > 10);
    }

    #[test]
    fn test_cancelled_join() {
        let mut cluster = Cluster::new(&[0, 1], SyncConfig::default());
        cluster.join(2);
        cluster.session(2).cancel().unwrap();
        assert_eq!(cluster.session(2).state(), PeerState::Disconnected);
        cluster.rounds(20, &[0, 1]);
        assert!(cluster.session(0).tick() > 10);
    }

    #[test]
    fn test_session_replay_verifies() {
        let mut cluster = Cluster::new(&[0, 1], SyncConfig {
            replay_checkpoint_interval: 10,
            ..SyncConfig::default()
        });
        cluster.session(0).enable_replay(Uuid::new_v4()).unwrap();
        for round in 0..60u32 {
            if round % 10 == 0 {
                cluster.session(1).issue(&move_to(1, 0, round as i32)).unwrap();
            }
            cluster.round(&[0, 1]);
        }
        let replay = cluster.session(0).finish_replay().unwrap();
        assert!(!replay.ticks.is_empty());
        let report = replay.verify().unwrap();
        assert_eq!(report.ticks_replayed, cluster.session(0).tick());
    }
}
