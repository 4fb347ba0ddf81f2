//! Peer State
//!
//! Every participant, the local player included, is tracked as a [`Peer`]:
//! its connection state, the window of ticks it takes part in, and the
//! seals it has sent for ticks not yet executed.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Connection state of a participant.
///
/// ```text
/// Connecting ──► Synchronizing ──► InLockstep
///      │               │               │
///      └───────────────┴───────────────┴──► Disconnected ──► Synchronizing
///                                      (any non-terminal) ──► Aborted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    /// Known but nothing exchanged yet.
    Connecting,
    /// Waiting for, or applying, a resync payload.
    Synchronizing,
    /// Sealing and executing ticks with everyone else.
    InLockstep,
    /// Left or timed out. May come back through a resync.
    Disconnected,
    /// The session was abandoned. Terminal.
    Aborted,
}

impl PeerState {
    /// Whether `self -> to` is a legal transition.
    pub fn can_transition(self, to: PeerState) -> bool {
        use PeerState::*;
        match (self, to) {
            (Aborted, _) => false,
            (_, Aborted) => true,
            (Connecting, Synchronizing) | (Connecting, InLockstep) => true,
            (Synchronizing, InLockstep) => true,
            (Connecting | Synchronizing | InLockstep, Disconnected) => true,
            (Disconnected, Synchronizing) => true,
            _ => false,
        }
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PeerState::Connecting => "connecting",
            PeerState::Synchronizing => "synchronizing",
            PeerState::InLockstep => "in_lockstep",
            PeerState::Disconnected => "disconnected",
            PeerState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Rejected state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("player {player}: illegal transition {from} -> {to}")]
pub struct TransitionError {
    /// Affected player.
    pub player: u8,
    /// State before.
    pub from: PeerState,
    /// Requested state.
    pub to: PeerState,
}

/// A seal that contradicts one already recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SealConflict {
    /// Count recorded first.
    pub recorded: u32,
    /// Count received now.
    pub received: u32,
}

/// One participant as seen by the local session.
#[derive(Debug, Clone)]
pub struct Peer {
    player: u8,
    state: PeerState,
    lockstep_from: u32,
    leave_after: Option<u32>,
    send_from: u32,
    seals: BTreeMap<u32, u32>,
    last_heard: Instant,
}

impl Peer {
    /// Create a peer in `state` that takes part from `lockstep_from` on.
    pub fn new(player: u8, state: PeerState, lockstep_from: u32, now: Instant) -> Self {
        Self {
            player,
            state,
            lockstep_from,
            leave_after: None,
            send_from: lockstep_from,
            seals: BTreeMap::new(),
            last_heard: now,
        }
    }

    /// Player index.
    pub fn player(&self) -> u8 {
        self.player
    }

    /// Current state.
    pub fn state(&self) -> PeerState {
        self.state
    }

    /// First tick this player takes part in.
    pub fn lockstep_from(&self) -> u32 {
        self.lockstep_from
    }

    /// Last tick this player takes part in, once it left.
    pub fn leave_after(&self) -> Option<u32> {
        self.leave_after
    }

    /// Move to `to`, refusing illegal transitions.
    pub fn transition(&mut self, to: PeerState) -> Result<(), TransitionError> {
        if self.state == to {
            return Ok(());
        }
        if !self.state.can_transition(to) {
            return Err(TransitionError {
                player: self.player,
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    /// Enter lockstep starting at `tick`.
    pub fn join_at(&mut self, tick: u32) -> Result<(), TransitionError> {
        self.transition(PeerState::InLockstep)?;
        self.lockstep_from = tick;
        self.send_from = tick;
        self.leave_after = None;
        Ok(())
    }

    /// Mark the peer gone after `after_tick`. Returns the effective tick.
    ///
    /// A later notice can only extend the window.
    pub fn depart(&mut self, after_tick: u32) -> Result<u32, TransitionError> {
        self.transition(PeerState::Disconnected)?;
        let after = self.leave_after.map_or(after_tick, |a| a.max(after_tick));
        self.leave_after = Some(after);
        self.seals.retain(|&tick, _| tick <= after);
        Ok(after)
    }

    /// Whether the session waits for this player's seal at `tick`.
    pub fn participates(&self, tick: u32) -> bool {
        if tick < self.lockstep_from {
            return false;
        }
        match self.state {
            PeerState::InLockstep => true,
            PeerState::Disconnected => self.leave_after.map_or(false, |a| tick <= a),
            _ => false,
        }
    }

    /// Whether tick-scoped traffic about `tick` should be sent to this peer.
    pub fn wants(&self, tick: u32) -> bool {
        self.state == PeerState::InLockstep && tick >= self.send_from
    }

    /// Lower the send threshold, used by a resync provider that also
    /// owes the joiner the ticks before its start.
    pub fn send_from(&mut self, tick: u32) {
        self.send_from = self.send_from.min(tick);
    }

    /// Record a seal. Repeats with the same count are accepted.
    pub fn seal(&mut self, tick: u32, count: u32) -> Result<(), SealConflict> {
        match self.seals.get(&tick) {
            Some(&recorded) if recorded != count => Err(SealConflict {
                recorded,
                received: count,
            }),
            Some(_) => Ok(()),
            None => {
                self.seals.insert(tick, count);
                Ok(())
            }
        }
    }

    /// Declared command count for `tick`, if sealed.
    pub fn sealed(&self, tick: u32) -> Option<u32> {
        self.seals.get(&tick).copied()
    }

    /// Seals still held, ascending by tick.
    pub fn seals(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.seals.iter().map(|(&t, &c)| (t, c))
    }

    /// Highest tick such that every tick from `from` up to it is sealed.
    /// `None` when `from` itself is missing.
    pub fn sealed_through(&self, from: u32) -> Option<u32> {
        let mut last = None;
        let mut expected = from;
        for (&tick, _) in self.seals.range(from..) {
            if tick != expected {
                break;
            }
            last = Some(tick);
            expected = tick.saturating_add(1);
        }
        last
    }

    /// Drop seals for ticks that were executed.
    pub fn forget_before(&mut self, tick: u32) {
        self.seals = self.seals.split_off(&tick);
    }

    /// Something arrived from this peer.
    pub fn heard(&mut self, now: Instant) {
        self.last_heard = now;
    }

    /// Time since the last frame from this peer.
    pub fn silent_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_heard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        use PeerState::*;
        assert!(Connecting.can_transition(Synchronizing));
        assert!(Synchronizing.can_transition(InLockstep));
        assert!(InLockstep.can_transition(Disconnected));
        assert!(Disconnected.can_transition(Synchronizing));
        assert!(InLockstep.can_transition(Aborted));

        assert!(!InLockstep.can_transition(Synchronizing));
        assert!(!Disconnected.can_transition(InLockstep));
        assert!(!Aborted.can_transition(Connecting));
        assert!(!Aborted.can_transition(Aborted));
    }

    #[test]
    fn test_illegal_transition_is_reported() {
        let mut peer = Peer::new(2, PeerState::InLockstep, 0, Instant::now());
        let err = peer.transition(PeerState::Synchronizing).unwrap_err();
        assert_eq!(err.from, PeerState::InLockstep);
        assert_eq!(err.to, PeerState::Synchronizing);
        assert_eq!(peer.state(), PeerState::InLockstep);
        assert_eq!(err.to_string(), "player 2: illegal transition in_lockstep -> synchronizing");
    }

    #[test]
    fn test_participation_window() {
        let now = Instant::now();
        let mut peer = Peer::new(1, PeerState::Synchronizing, 0, now);
        assert!(!peer.participates(5));

        peer.join_at(10).unwrap();
        assert!(!peer.participates(9));
        assert!(peer.participates(10));
        assert!(peer.participates(500));

        assert_eq!(peer.depart(20).unwrap(), 20);
        assert!(peer.participates(20));
        assert!(!peer.participates(21));
    }

    #[test]
    fn test_departure_only_extends() {
        let mut peer = Peer::new(1, PeerState::InLockstep, 0, Instant::now());
        peer.depart(30).unwrap();
        assert_eq!(peer.depart(25).unwrap(), 30);
        assert_eq!(peer.depart(35).unwrap(), 35);
    }

    #[test]
    fn test_departure_discards_later_seals() {
        let mut peer = Peer::new(1, PeerState::InLockstep, 0, Instant::now());
        for tick in 0..10 {
            peer.seal(tick, 0).unwrap();
        }
        peer.depart(4).unwrap();
        assert_eq!(peer.sealed(4), Some(0));
        assert_eq!(peer.sealed(5), None);
    }

    #[test]
    fn test_seal_conflict() {
        let mut peer = Peer::new(1, PeerState::InLockstep, 0, Instant::now());
        peer.seal(3, 2).unwrap();
        peer.seal(3, 2).unwrap();
        assert_eq!(peer.seal(3, 1), Err(SealConflict { recorded: 2, received: 1 }));
    }

    #[test]
    fn test_sealed_through_stops_at_gap() {
        let mut peer = Peer::new(1, PeerState::InLockstep, 0, Instant::now());
        for tick in [4, 5, 6, 8] {
            peer.seal(tick, 0).unwrap();
        }
        assert_eq!(peer.sealed_through(4), Some(6));
        assert_eq!(peer.sealed_through(7), None);
        peer.forget_before(6);
        assert_eq!(peer.seals().map(|(t, _)| t).collect::<Vec<_>>(), vec![6, 8]);
    }

    #[test]
    fn test_send_threshold() {
        let mut peer = Peer::new(3, PeerState::Synchronizing, 0, Instant::now());
        assert!(!peer.wants(50));
        peer.join_at(44).unwrap();
        assert!(!peer.wants(40));
        peer.send_from(40);
        assert!(peer.wants(40));
        assert!(!peer.wants(39));
    }
}
