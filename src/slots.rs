//! Slot-leader sequencer: turns the SMA and beacon random of a source epoch
//! into the ordered slot-leader sequence of an epoch, and serves lookups.
//!
//! When the SMA of an epoch is missing (total stage failure, or a young
//! chain) the sequencer falls back to the genesis material computed at
//! startup, so every node still derives the same sequence.

use std::collections::HashMap;
use std::sync::Arc;

use k256::ProjectivePoint;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::chain::{self, ChainReader};
use crate::crypto::{decode_sec_pubkey, encode_sec_pubkey, keccak256, scalar_from_bytes};
use crate::epoch::EpochSelector;
use crate::errors::{PosError, PosResult};
use crate::params::{PosParams, SEC_PK_LEN};
use crate::storage::PosStore;
use crate::uls::SMA_TAG;

const SLOT_LEADER_TAG: &str = "slotLeader";

/// Cached slot-leader sequence of one epoch.
pub struct SlotSequence {
    pub leaders: Vec<Vec<u8>>,
    /// Epoch-leader index backing each slot; only known for sequences this
    /// node generated itself.
    pub indexes: Option<Vec<u64>>,
}

/// Reduces a big-endian byte string modulo a small modulus.
fn mod_small(bytes: &[u8], modulus: u64) -> u64 {
    let mut acc: u128 = 0;
    for byte in bytes {
        acc = (acc * 256 + u128::from(*byte)) % u128::from(modulus);
    }
    acc as u64
}

/// The unique-leader-selection mapping: a keccak chain seeded by the SMA and
/// the beacon random walks the epoch-leader committee.
///
/// Pure in its inputs; recomputation yields bit-identical output.
pub fn generate_slot_leader_seq(
    sma: &[Vec<u8>],
    leaders: &[Vec<u8>],
    random: &[u8],
    slot_count: u64,
) -> (Vec<Vec<u8>>, Vec<u64>) {
    let mut seed = Vec::with_capacity(sma.len() * SEC_PK_LEN + random.len());
    for piece in sma {
        seed.extend_from_slice(piece);
    }
    seed.extend_from_slice(random);
    let mut cr = keccak256(&seed);

    let ne = leaders.len() as u64;
    let mut sequence = Vec::with_capacity(slot_count as usize);
    let mut indexes = Vec::with_capacity(slot_count as usize);
    for _ in 0..slot_count {
        let idx = mod_small(&cr, ne);
        sequence.push(leaders[idx as usize].clone());
        indexes.push(idx);
        cr = keccak256(&cr);
    }
    (sequence, indexes)
}

pub struct SlotLeaderSequencer {
    params: PosParams,
    store: PosStore,
    chain: Arc<dyn ChainReader>,
    selector: Arc<EpochSelector>,
    genesis_leaders: Vec<Vec<u8>>,
    genesis_sma: Vec<Vec<u8>>,
    genesis_random: Vec<u8>,
    sequences: RwLock<HashMap<u64, Arc<SlotSequence>>>,
    slot_create_status: Mutex<HashMap<u64, bool>>,
}

impl SlotLeaderSequencer {
    /// Builds the sequencer and precomputes the genesis ULS material.
    ///
    /// The genesis key comes from configuration; a malformed value means no
    /// node can agree on epoch 0, so construction fails with
    /// [`PosError::InvalidGenesisPk`].
    pub fn new(
        params: PosParams,
        store: PosStore,
        chain: Arc<dyn ChainReader>,
        selector: Arc<EpochSelector>,
    ) -> PosResult<Self> {
        let genesis_pk = params.genesis_pk_bytes()?;
        decode_sec_pubkey(&genesis_pk).map_err(|_| PosError::InvalidGenesisPk)?;

        // every genesis leader shares the configured key, and each SMA piece
        // is keccak(P0) * G
        let ne = params.epoch_leader_count;
        let alpha = scalar_from_bytes(&keccak256(&genesis_pk));
        let piece = encode_sec_pubkey(&(ProjectivePoint::GENERATOR * alpha));
        let genesis_leaders = vec![genesis_pk; ne];
        let genesis_sma = vec![piece; ne];

        Ok(Self {
            params,
            store,
            chain,
            selector,
            genesis_leaders,
            genesis_sma,
            genesis_random: vec![1],
            sequences: RwLock::new(HashMap::new()),
            slot_create_status: Mutex::new(HashMap::new()),
        })
    }

    pub fn genesis_public_key(&self) -> &[u8] {
        &self.genesis_leaders[0]
    }

    /// SMA pieces for `epoch` plus a flag marking the genesis fallback.
    pub fn get_sma(&self, epoch: u64) -> PosResult<(Vec<Vec<u8>>, bool)> {
        if epoch == 0 {
            return Ok((self.genesis_sma.clone(), true));
        }
        match self.store.get(epoch, SMA_TAG)? {
            Some(blob) if blob.len() % SEC_PK_LEN == 0 && !blob.is_empty() => {
                let pieces = blob.chunks(SEC_PK_LEN).map(<[u8]>::to_vec).collect();
                Ok((pieces, false))
            }
            Some(_) => {
                warn!(epoch, "stored SMA has invalid length, using genesis SMA");
                Ok((self.genesis_sma.clone(), true))
            }
            None => {
                warn!(epoch, "no SMA persisted, using genesis SMA");
                Ok((self.genesis_sma.clone(), true))
            }
        }
    }

    /// Computes and persists the slot-leader sequence of `epoch`.
    pub fn generate_slot_leaders(&self, epoch: u64) -> PosResult<()> {
        let (sma, is_genesis) = self.get_sma(epoch)?;

        let (leaders, random) = if is_genesis || epoch == 0 {
            (self.genesis_leaders.clone(), self.genesis_random.clone())
        } else {
            let previous = self.selector.get_epoch_leaders(epoch - 1)?;
            if previous.is_empty() {
                warn!(
                    epoch,
                    "previous epoch leaders unavailable, using genesis material"
                );
                (self.genesis_leaders.clone(), self.genesis_random.clone())
            } else {
                let head = self.chain.head_block_number()?;
                let state = self.chain.state_at(head)?;
                let random = chain::beacon_random(state.as_ref(), epoch)?.unwrap_or_else(|| {
                    warn!(epoch, "beacon random missing, using default");
                    vec![1]
                });
                (previous, random)
            }
        };

        if leaders.len() != self.params.epoch_leader_count {
            return Err(PosError::Config(format!(
                "epoch leader group has {} members, expected {}",
                leaders.len(),
                self.params.epoch_leader_count
            )));
        }

        let (sequence, indexes) =
            generate_slot_leader_seq(&sma, &leaders, &random, self.params.slot_count);
        for (slot, leader) in sequence.iter().enumerate() {
            self.store
                .put_with_index(epoch, slot as u64, SLOT_LEADER_TAG, leader)?;
        }
        self.sequences.write().insert(
            epoch,
            Arc::new(SlotSequence {
                leaders: sequence,
                indexes: Some(indexes),
            }),
        );
        self.slot_create_status.lock().insert(epoch, true);
        info!(epoch, genesis_fallback = is_genesis, "slot-leader sequence generated");
        Ok(())
    }

    fn load_sequence(&self, epoch: u64) -> PosResult<Arc<SlotSequence>> {
        if let Some(sequence) = self.sequences.read().get(&epoch) {
            return Ok(sequence.clone());
        }
        let mut leaders = Vec::with_capacity(self.params.slot_count as usize);
        for slot in 0..self.params.slot_count {
            match self.store.get_with_index(epoch, slot, SLOT_LEADER_TAG)? {
                Some(leader) => leaders.push(leader),
                None => return Err(PosError::SlotLeaderGroupNotReady(epoch)),
            }
        }
        let sequence = Arc::new(SlotSequence {
            leaders,
            indexes: None,
        });
        self.sequences.write().insert(epoch, sequence.clone());
        self.slot_create_status.lock().insert(epoch, true);
        debug!(epoch, "slot-leader sequence restored from store");
        Ok(sequence)
    }

    /// Serialized public key of the leader of `(epoch, slot)`.
    pub fn get_slot_leader(&self, epoch: u64, slot: u64) -> PosResult<Vec<u8>> {
        if epoch == 0 {
            return Ok(self.genesis_leaders[0].clone());
        }
        if slot >= self.params.slot_count {
            return Err(PosError::SlotIdOutOfRange {
                slot,
                slot_count: self.params.slot_count,
            });
        }
        let sequence = self.load_sequence(epoch)?;
        Ok(sequence.leaders[slot as usize].clone())
    }

    /// Epoch-leader index of the slot, when this node generated the sequence.
    pub fn get_slot_leader_index(&self, epoch: u64, slot: u64) -> PosResult<Option<u64>> {
        if slot >= self.params.slot_count {
            return Err(PosError::SlotIdOutOfRange {
                slot,
                slot_count: self.params.slot_count,
            });
        }
        Ok(self
            .sequences
            .read()
            .get(&epoch)
            .and_then(|sequence| sequence.indexes.as_ref().map(|idxs| idxs[slot as usize])))
    }

    /// Whether the sequence of `epoch` has been generated or restored.
    pub fn slot_leaders_ready(&self, epoch: u64) -> bool {
        *self.slot_create_status.lock().get(&epoch).unwrap_or(&false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leader_set(count: usize) -> Vec<Vec<u8>> {
        (1..=count as u64)
            .map(|seed| {
                encode_sec_pubkey(&(ProjectivePoint::GENERATOR * k256::Scalar::from(seed)))
            })
            .collect()
    }

    #[test]
    fn sequence_is_deterministic_and_closed_over_leaders() {
        let leaders = leader_set(5);
        let sma = leader_set(5);
        let (seq_a, idx_a) = generate_slot_leader_seq(&sma, &leaders, &[7], 64);
        let (seq_b, idx_b) = generate_slot_leader_seq(&sma, &leaders, &[7], 64);
        assert_eq!(seq_a, seq_b);
        assert_eq!(idx_a, idx_b);
        assert_eq!(seq_a.len(), 64);
        for (slot, leader) in seq_a.iter().enumerate() {
            assert!(leaders.contains(leader));
            assert_eq!(*leader, leaders[idx_a[slot] as usize]);
        }
    }

    #[test]
    fn sequence_depends_on_the_random() {
        let leaders = leader_set(5);
        let sma = leader_set(5);
        let (seq_a, _) = generate_slot_leader_seq(&sma, &leaders, &[1], 64);
        let (seq_b, _) = generate_slot_leader_seq(&sma, &leaders, &[2], 64);
        assert_ne!(seq_a, seq_b);
    }

    #[test]
    fn sequence_depends_on_the_sma() {
        let leaders = leader_set(5);
        let (seq_a, _) = generate_slot_leader_seq(&leader_set(5), &leaders, &[1], 64);
        let (seq_b, _) = generate_slot_leader_seq(&leader_set(4), &leaders, &[1], 64);
        assert_ne!(seq_a, seq_b);
    }

    #[test]
    fn mod_small_matches_wide_reduction() {
        let bytes = [0xffu8; 32];
        // 2^256 mod 7 is 2, so 2^256 - 1 reduces to 1
        assert_eq!(mod_small(&bytes, 7), 1);
        assert_eq!(mod_small(&[0], 5), 0);
        assert_eq!(mod_small(&[0x01, 0x00], 256), 0);
    }
}
