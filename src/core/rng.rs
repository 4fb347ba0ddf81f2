//! Deterministic Random Number Generator
//!
//! A xoshiro256** core whose 64-bit outputs are split into two 32-bit
//! draws. The low half is returned immediately and the high half is kept
//! as a pending word for the next call, so no entropy is thrown away.
//!
//! The pending word is part of the generator's identity: copying the
//! generator or exporting its [`RandomState`] must carry it along, otherwise
//! a peer restored from a save or resync payload would be one half-word out
//! of phase with everybody else.
//!
//! ## State block
//!
//! ```text
//! byte 0       pending flag (0 or 1)
//! bytes 1..33  core words s0..s3, big-endian u64
//! bytes 33..37 pending half-word, big-endian u32
//! ```

use serde::{Serialize, Deserialize};
use sha2::{Sha256, Digest};

use super::fixed::{Fixed, FIXED_ONE, MAP_HALF_EXTENT};
use super::vec2::FixedVec2;

/// Size of the core generator words in bytes (four big-endian u64).
pub const CORE_BYTES: usize = 32;

/// Size of a full [`RandomState`] block: pending flag, core words, pending word.
pub const STATE_BYTES: usize = 1 + CORE_BYTES + 4;

const CORE_START: usize = 1;
const PENDING_START: usize = CORE_START + CORE_BYTES;

/// Continuation state of a [`DeterministicRng`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RandomState {
    /// Core generator words, big-endian.
    pub core: [u8; CORE_BYTES],
    /// High half-word waiting to be returned by the next draw.
    pub pending: Option<u32>,
}

impl RandomState {
    /// Fixed-size block used in save files and resync payloads.
    ///
    /// Without a pending value the trailing word is written as zero.
    pub fn to_block(&self) -> [u8; STATE_BYTES] {
        let mut block = [0u8; STATE_BYTES];
        block[0] = self.pending.is_some() as u8;
        block[CORE_START..PENDING_START].copy_from_slice(&self.core);
        block[PENDING_START..].copy_from_slice(&self.pending.unwrap_or(0).to_be_bytes());
        block
    }

    /// Split a block into its parts. Returns the raw flag byte alongside so
    /// callers can decide how strict to be about it.
    pub fn split_block(block: &[u8; STATE_BYTES]) -> (u8, [u8; CORE_BYTES], u32) {
        let mut core = [0u8; CORE_BYTES];
        core.copy_from_slice(&block[CORE_START..PENDING_START]);
        let mut word = [0u8; 4];
        word.copy_from_slice(&block[PENDING_START..]);
        (block[0], core, u32::from_be_bytes(word))
    }

    /// Whether the core words can drive the generator (xoshiro is stuck at zero).
    pub fn is_valid(&self) -> bool {
        self.core.iter().any(|b| *b != 0)
    }
}

/// Deterministic PRNG producing 32-bit draws.
///
/// # Determinism Guarantee
///
/// The state is stored and exported as big-endian words, so the sequence
/// is identical on every host regardless of byte order.
///
/// # Example
///
/// ```
/// use rts_lockstep::core::rng::{DeterministicRng, STATE_BYTES};
///
/// let bytes: Vec<u8> = (0..STATE_BYTES as u8).collect();
/// let mut rng = DeterministicRng::from_state_bytes(&bytes);
/// assert_eq!(rng.draw(), 0xbc52e8c6);
/// assert_eq!(rng.draw(), 0x61f88f25);
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeterministicRng {
    state: [u64; 4],
    pending: Option<u32>,
}

impl Default for DeterministicRng {
    fn default() -> Self {
        Self::new(0)
    }
}

impl DeterministicRng {
    /// Create a new RNG from a 64-bit seed.
    ///
    /// SplitMix64 spreads weak seeds over the whole state.
    pub fn new(seed: u64) -> Self {
        let mut s = seed;
        let mut state = [0u64; 4];
        for word in state.iter_mut() {
            *word = splitmix64(&mut s);
        }
        if state == [0; 4] {
            state[0] = 1;
        }

        Self { state, pending: None }
    }

    /// Create an RNG from a raw [`STATE_BYTES`] block.
    ///
    /// The pending word is only honoured when the flag byte is 1; with a
    /// flag of 0 the trailing bytes carry no meaning.
    ///
    /// # Panics
    ///
    /// Panics if `bytes` is not exactly [`STATE_BYTES`] long, if the flag is
    /// neither 0 nor 1, or if the core words are all zero. All of these can
    /// only come from a bug in the caller, never from the wire: stream
    /// decoding validates untrusted blocks before getting here.
    pub fn from_state_bytes(bytes: &[u8]) -> Self {
        assert_eq!(
            bytes.len(),
            STATE_BYTES,
            "random state must be exactly {} bytes",
            STATE_BYTES
        );
        let mut block = [0u8; STATE_BYTES];
        block.copy_from_slice(bytes);
        let (flag, core, word) = RandomState::split_block(&block);
        assert!(flag <= 1, "random state pending flag must be 0 or 1, got {}", flag);

        Self::from_state(RandomState {
            core,
            pending: (flag == 1).then_some(word),
        })
    }

    /// Reconstruct a generator that continues exactly where `state` was taken.
    ///
    /// # Panics
    ///
    /// Panics if the core words are all zero.
    pub fn from_state(state: RandomState) -> Self {
        assert!(state.is_valid(), "random state must not be all zero");

        let mut words = [0u64; 4];
        for (word, chunk) in words.iter_mut().zip(state.core.chunks_exact(8)) {
            let mut be = [0u8; 8];
            be.copy_from_slice(chunk);
            *word = u64::from_be_bytes(be);
        }
        Self {
            state: words,
            pending: state.pending,
        }
    }

    /// Export the continuation state, including the pending half-word.
    pub fn state(&self) -> RandomState {
        let mut core = [0u8; CORE_BYTES];
        for (chunk, word) in core.chunks_exact_mut(8).zip(self.state.iter()) {
            chunk.copy_from_slice(&word.to_be_bytes());
        }
        RandomState {
            core,
            pending: self.pending,
        }
    }

    /// Whether a buffered high half-word will be returned by the next draw.
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Advance the core generator one step.
    #[inline]
    fn step(&mut self) -> u64 {
        let s = &mut self.state;
        let result = s[1].wrapping_mul(5).rotate_left(7).wrapping_mul(9);
        let t = s[1] << 17;

        s[2] ^= s[0];
        s[3] ^= s[1];
        s[1] ^= s[2];
        s[0] ^= s[3];
        s[2] ^= t;
        s[3] = s[3].rotate_left(45);

        result
    }

    /// Next 32-bit value in the sequence.
    #[inline]
    pub fn draw(&mut self) -> u32 {
        if let Some(high) = self.pending.take() {
            return high;
        }
        let word = self.step();
        self.pending = Some((word >> 32) as u32);
        word as u32
    }

    /// Random integer in `[0, max)`. Returns 0 when `max` is 0.
    #[inline]
    pub fn next_int(&mut self, max: u32) -> u32 {
        if max == 0 {
            return 0;
        }
        self.draw() % max
    }

    /// Random integer in `[min, max]`.
    #[inline]
    pub fn next_int_range(&mut self, min: i32, max: i32) -> i32 {
        if min >= max {
            return min;
        }
        let range = (max as i64 - min as i64 + 1) as u32;
        (min as i64 + self.next_int(range) as i64) as i32
    }

    /// Random Fixed in `[0, max)`.
    #[inline]
    pub fn next_fixed(&mut self, max: Fixed) -> Fixed {
        if max <= 0 {
            return 0;
        }
        let raw = self.draw();
        ((raw as i64 * max as i64) >> 32) as Fixed
    }

    /// Random Fixed in `[min, max)`.
    #[inline]
    pub fn next_fixed_range(&mut self, min: Fixed, max: Fixed) -> Fixed {
        if min >= max {
            return min;
        }
        let range = max.wrapping_sub(min);
        min.wrapping_add(self.next_fixed(range))
    }

    /// Random boolean; `probability` is in `[0, FIXED_ONE]`.
    #[inline]
    pub fn next_bool(&mut self, probability: Fixed) -> bool {
        self.next_fixed(FIXED_ONE) < probability
    }

    /// Random position on the map.
    pub fn random_position(&mut self) -> FixedVec2 {
        let x = self.next_fixed_range(-MAP_HALF_EXTENT, MAP_HALF_EXTENT);
        let y = self.next_fixed_range(-MAP_HALF_EXTENT, MAP_HALF_EXTENT);
        FixedVec2::new(x, y)
    }

    /// Shuffle a slice in place (Fisher-Yates).
    pub fn shuffle<T>(&mut self, slice: &mut [T]) {
        let len = slice.len();
        for i in (1..len).rev() {
            let j = self.next_int((i + 1) as u32) as usize;
            slice.swap(i, j);
        }
    }

    /// Select a random element from a slice.
    pub fn choose<'a, T>(&mut self, slice: &'a [T]) -> Option<&'a T> {
        if slice.is_empty() {
            None
        } else {
            let idx = self.next_int(slice.len() as u32) as usize;
            slice.get(idx)
        }
    }
}

/// SplitMix64 for seed initialization.
#[inline]
fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

/// Derive a session seed every peer can compute independently.
///
/// `players` MUST be sorted; the session id keeps seeds unique per game.
pub fn derive_session_seed(session_id: &[u8; 16], players: &[u8]) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(b"RTS_LOCKSTEP_SEED_V1");
    hasher.update(session_id);
    hasher.update(players);
    let hash = hasher.finalize();

    let mut seed = [0u8; 8];
    seed.copy_from_slice(&hash[0..8]);
    u64::from_le_bytes(seed)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn counting_bytes() -> Vec<u8> {
        (0..STATE_BYTES as u8).collect()
    }

    #[test]
    fn test_golden_sequence() {
        // These values must never change: save files and replays depend on them.
        let mut rng = DeterministicRng::from_state_bytes(&counting_bytes());
        assert_eq!(rng.draw(), 0xbc52e8c6);
        assert_eq!(rng.draw(), 0x61f88f25);

        for _ in 0..1000 {
            rng.draw();
        }

        assert_eq!(rng.draw(), 0x492339af);
        assert_eq!(rng.draw(), 0xd8a622fb);
    }

    #[test]
    fn test_seeded_known_values() {
        let mut rng = DeterministicRng::new(12345);
        let values: Vec<u32> = (0..4).map(|_| rng.draw()).collect();
        assert_eq!(values, vec![0x4160d49b, 0xbe6a3637, 0x37a688c6, 0x214aaa06]);
    }

    #[test]
    fn test_draw_halves_core_word() {
        let mut rng = DeterministicRng::new(42);
        assert!(!rng.has_pending());
        rng.draw();
        assert!(rng.has_pending());
        rng.draw();
        assert!(!rng.has_pending());
    }

    #[test]
    fn test_copy_with_pending_word() {
        let mut rng = DeterministicRng::new(777);
        rng.draw();
        assert!(rng.has_pending());

        let mut copy = rng.clone();
        for _ in 0..100 {
            assert_eq!(rng.draw(), copy.draw());
        }
    }

    #[test]
    fn test_state_round_trip_preserves_pending() {
        let mut rng = DeterministicRng::new(5555);
        for _ in 0..51 {
            rng.draw();
        }

        let state = rng.state();
        assert!(state.pending.is_some());

        let mut restored = DeterministicRng::from_state(state);
        for _ in 0..100 {
            assert_eq!(restored.draw(), rng.draw());
        }
    }

    #[test]
    fn test_state_block_layout() {
        let mut rng = DeterministicRng::from_state_bytes(&counting_bytes());
        assert_eq!(rng.state().to_block()[0], 0);
        assert_eq!(&rng.state().to_block()[1..9], &[1, 2, 3, 4, 5, 6, 7, 8]);

        rng.draw();
        let block = rng.state().to_block();
        assert_eq!(block.len(), STATE_BYTES);
        assert_eq!(block[0], 1);
        assert_eq!(&block[PENDING_START..], &0x61f88f25u32.to_be_bytes());

        let mut restored = DeterministicRng::from_state_bytes(&block);
        assert_eq!(restored.draw(), 0x61f88f25);
    }

    #[test]
    fn test_pending_word_ignored_without_flag() {
        let mut block = DeterministicRng::new(3).state().to_block();
        block[PENDING_START..].copy_from_slice(&[9, 9, 9, 9]);
        let mut rng = DeterministicRng::from_state_bytes(&block);
        assert!(!rng.has_pending());
        assert_eq!(rng.draw(), DeterministicRng::new(3).draw());
    }

    #[test]
    #[should_panic(expected = "exactly 37 bytes")]
    fn test_short_state_is_contract_violation() {
        DeterministicRng::from_state_bytes(&[1, 2, 3]);
    }

    #[test]
    #[should_panic(expected = "all zero")]
    fn test_zero_state_is_contract_violation() {
        DeterministicRng::from_state_bytes(&[0; STATE_BYTES]);
    }

    #[test]
    #[should_panic(expected = "pending flag")]
    fn test_bad_flag_is_contract_violation() {
        let mut block = counting_bytes();
        block[0] = 2;
        DeterministicRng::from_state_bytes(&block);
    }

    #[test]
    fn test_next_int_bounds() {
        let mut rng = DeterministicRng::new(1234);
        for _ in 0..1000 {
            assert!(rng.next_int(100) < 100);
        }
        assert_eq!(rng.next_int(0), 0);
        assert_eq!(rng.next_int(1), 0);

        for _ in 0..1000 {
            let val = rng.next_int_range(-10, 10);
            assert!((-10..=10).contains(&val));
        }
        assert_eq!(rng.next_int_range(5, 5), 5);
    }

    #[test]
    fn test_random_position_on_map() {
        let mut rng = DeterministicRng::new(7777);
        for _ in 0..100 {
            assert!(rng.random_position().is_on_map());
        }
    }

    #[test]
    fn test_shuffle_determinism() {
        let mut rng1 = DeterministicRng::new(1111);
        let mut rng2 = DeterministicRng::new(1111);

        let mut arr1 = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10];
        let mut arr2 = arr1;

        rng1.shuffle(&mut arr1);
        rng2.shuffle(&mut arr2);

        assert_eq!(arr1, arr2);
        assert_eq!(rng1.choose(&arr1), rng2.choose(&arr2));
    }

    #[test]
    fn test_derive_session_seed() {
        let session = [7u8; 16];
        let seed1 = derive_session_seed(&session, &[0, 1, 2]);
        let seed2 = derive_session_seed(&session, &[0, 1, 2]);
        assert_eq!(seed1, seed2);

        assert_ne!(seed1, derive_session_seed(&session, &[0, 1]));
        assert_ne!(seed1, derive_session_seed(&[8u8; 16], &[0, 1, 2]));
    }

    proptest! {
        #[test]
        fn prop_copy_law(seed in any::<u64>(), warmup in 0usize..64) {
            let mut rng = DeterministicRng::new(seed);
            for _ in 0..warmup {
                rng.draw();
            }
            let mut copy = rng.clone();
            for _ in 0..100 {
                prop_assert_eq!(rng.draw(), copy.draw());
            }
        }

        #[test]
        fn prop_state_round_trip(seed in any::<u64>(), warmup in 0usize..64) {
            let mut rng = DeterministicRng::new(seed);
            for _ in 0..warmup {
                rng.draw();
            }
            let mut restored = DeterministicRng::from_state(rng.state());
            for _ in 0..100 {
                prop_assert_eq!(restored.draw(), rng.draw());
            }
        }
    }
}
