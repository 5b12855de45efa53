//! Narrow read capabilities the core needs from the surrounding node.
//!
//! The selector and the ULS coordinator never own chain state; they hold a
//! read-only handle bound at node initialization. Test doubles implement the
//! same capability set.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::crypto::keccak256_concat;
use crate::errors::{PosError, PosResult};
use crate::types::StakerInfo;

/// Contract account holding the staker records.
pub const STAKERS_CONTRACT: [u8; 20] = contract_address(0x10);
/// Contract account holding stage-1/stage-2 transaction data.
pub const SLOT_LEADER_CONTRACT: [u8; 20] = contract_address(0x11);
/// Contract account holding the per-epoch beacon randoms.
pub const RANDOM_BEACON_CONTRACT: [u8; 20] = contract_address(0x12);

const fn contract_address(tail: u8) -> [u8; 20] {
    let mut addr = [0u8; 20];
    addr[19] = tail;
    addr
}

/// Read access to contract storage at one state root.
///
/// The visitor returns `false` to stop the enumeration early.
pub trait StateReader: Send + Sync {
    fn for_each_storage_byte_array(
        &self,
        contract: &[u8; 20],
        visitor: &mut dyn FnMut(&[u8; 32], &[u8]) -> bool,
    ) -> PosResult<()>;

    fn get_state_byte_array(
        &self,
        contract: &[u8; 20],
        key: &[u8; 32],
    ) -> PosResult<Option<Vec<u8>>>;
}

/// Read access to block headers and historical state roots.
pub trait ChainReader: Send + Sync {
    fn head_block_number(&self) -> PosResult<u64>;

    /// Epoch id of a block, taken from the high 32 bits of the header
    /// difficulty field.
    fn block_epoch(&self, number: u64) -> PosResult<u64>;

    fn state_at(&self, number: u64) -> PosResult<Arc<dyn StateReader>>;
}

/// Storage key of a staker record, derived from its 20-byte address.
pub fn staker_key(address: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32];
    let len = address.len().min(32);
    key[32 - len..].copy_from_slice(&address[address.len() - len..]);
    key
}

pub fn beacon_key(epoch: u64) -> [u8; 32] {
    keccak256_concat(&[b"epochRandom", &epoch.to_be_bytes()])
}

pub fn stage1_key(epoch: u64, index: u64) -> [u8; 32] {
    keccak256_concat(&[b"slotLeaderStage1", &epoch.to_be_bytes(), &index.to_be_bytes()])
}

pub fn stage2_key(epoch: u64, index: u64) -> [u8; 32] {
    keccak256_concat(&[b"slotLeaderStage2", &epoch.to_be_bytes(), &index.to_be_bytes()])
}

pub fn stage2_indexes_key(epoch: u64) -> [u8; 32] {
    keccak256_concat(&[b"slotLeaderStage2Indexes", &epoch.to_be_bytes()])
}

/// Enumerates every parseable staker record at the given state.
///
/// Malformed entries are logged and skipped; one corrupt record must not
/// poison committee selection.
pub fn stakers(state: &dyn StateReader) -> PosResult<Vec<StakerInfo>> {
    let mut records = Vec::new();
    state.for_each_storage_byte_array(&STAKERS_CONTRACT, &mut |key, value| {
        match StakerInfo::from_json(value) {
            Ok(staker) => records.push(staker),
            Err(err) => {
                debug!(key = %hex::encode(key), %err, "skipping malformed staker record");
            }
        }
        true
    })?;
    Ok(records)
}

/// Beacon random recorded for `epoch`, or `None` when absent.
pub fn beacon_random(state: &dyn StateReader, epoch: u64) -> PosResult<Option<Vec<u8>>> {
    state.get_state_byte_array(&RANDOM_BEACON_CONTRACT, &beacon_key(epoch))
}

/// In-memory contract storage implementing [`StateReader`].
///
/// Keys are enumerated in byte order, which keeps every consumer of the
/// visitor deterministic across runs.
#[derive(Default)]
pub struct MemoryState {
    slots: RwLock<BTreeMap<[u8; 20], BTreeMap<[u8; 32], Vec<u8>>>>,
}

impl MemoryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_byte_array(&self, contract: [u8; 20], key: [u8; 32], value: Vec<u8>) {
        self.slots
            .write()
            .entry(contract)
            .or_default()
            .insert(key, value);
    }

    pub fn set_staker(&self, staker: &StakerInfo) -> PosResult<()> {
        let address = crate::crypto::address_from_sec_pubkey(&staker.sec_pk)?;
        let raw = hex::decode(&address)
            .map_err(|err| PosError::Config(format!("invalid staker address: {err}")))?;
        self.set_byte_array(STAKERS_CONTRACT, staker_key(&raw), staker.to_json()?);
        Ok(())
    }

    pub fn set_beacon_random(&self, epoch: u64, random: Vec<u8>) {
        self.set_byte_array(RANDOM_BEACON_CONTRACT, beacon_key(epoch), random);
    }
}

impl StateReader for MemoryState {
    fn for_each_storage_byte_array(
        &self,
        contract: &[u8; 20],
        visitor: &mut dyn FnMut(&[u8; 32], &[u8]) -> bool,
    ) -> PosResult<()> {
        let slots = self.slots.read();
        if let Some(entries) = slots.get(contract) {
            for (key, value) in entries {
                if !visitor(key, value) {
                    break;
                }
            }
        }
        Ok(())
    }

    fn get_state_byte_array(
        &self,
        contract: &[u8; 20],
        key: &[u8; 32],
    ) -> PosResult<Option<Vec<u8>>> {
        Ok(self
            .slots
            .read()
            .get(contract)
            .and_then(|entries| entries.get(key))
            .cloned())
    }
}

struct MemoryBlock {
    difficulty: u64,
    state: Arc<MemoryState>,
}

/// In-memory chain implementing [`ChainReader`]; block `n` is the `n`-th
/// pushed block.
#[derive(Default)]
pub struct MemoryChain {
    blocks: RwLock<Vec<MemoryBlock>>,
}

impl MemoryChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a block tagged with `epoch` whose state is `state`.
    pub fn push_block(&self, epoch: u64, state: Arc<MemoryState>) {
        self.blocks.write().push(MemoryBlock {
            difficulty: epoch << 32,
            state,
        });
    }
}

impl ChainReader for MemoryChain {
    fn head_block_number(&self) -> PosResult<u64> {
        let blocks = self.blocks.read();
        if blocks.is_empty() {
            return Err(PosError::Config("chain has no blocks".into()));
        }
        Ok(blocks.len() as u64 - 1)
    }

    fn block_epoch(&self, number: u64) -> PosResult<u64> {
        let blocks = self.blocks.read();
        let block = blocks
            .get(number as usize)
            .ok_or_else(|| PosError::Config(format!("unknown block {number}")))?;
        Ok(block.difficulty >> 32)
    }

    fn state_at(&self, number: u64) -> PosResult<Arc<dyn StateReader>> {
        let blocks = self.blocks.read();
        let block = blocks
            .get(number as usize)
            .ok_or_else(|| PosError::Config(format!("unknown block {number}")))?;
        Ok(block.state.clone())
    }
}
