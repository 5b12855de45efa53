use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{PosError, PosResult};

/// Number of epoch leaders sampled per epoch on the main network.
pub const DEFAULT_EPOCH_LEADER_COUNT: usize = 50;
/// Number of random-beacon proposers sampled per epoch on the main network.
pub const DEFAULT_RANDOM_PROPOSER_COUNT: usize = 25;
/// Slots per epoch on the main network.
pub const DEFAULT_SLOT_COUNT: u64 = 17_280;
/// Slot duration in seconds.
pub const DEFAULT_SLOT_TIME: u64 = 5;
/// Unix timestamp of slot 0 of epoch 0.
pub const DEFAULT_EPOCH_BASE_TIME: u64 = 1_546_272_000;

/// Base-unit divisor applied to staked amounts before weighting.
pub const WAN_UNIT: u128 = 1_000_000_000_000_000_000;

/// Committees are sampled from the state two epochs back.
pub const SNAPSHOT_EPOCH_LAG: u64 = 2;

/// Length of an uncompressed secp256k1 public key on the wire.
pub const SEC_PK_LEN: usize = 65;
/// Length of a BN254 G1 public key on the wire.
pub const BN_PK_LEN: usize = 64;

const DEFAULT_GENESIS_PK: &str = "0479be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798483ada7726a3c4655da4fbfc0e1108a8fd17b448a68554199c47d08ffb10d4b8";

fn default_epoch_leader_count() -> usize {
    DEFAULT_EPOCH_LEADER_COUNT
}

fn default_random_proposer_count() -> usize {
    DEFAULT_RANDOM_PROPOSER_COUNT
}

fn default_slot_count() -> u64 {
    DEFAULT_SLOT_COUNT
}

fn default_slot_time() -> u64 {
    DEFAULT_SLOT_TIME
}

fn default_epoch_base_time() -> u64 {
    DEFAULT_EPOCH_BASE_TIME
}

fn default_genesis_public_key() -> String {
    DEFAULT_GENESIS_PK.to_string()
}

/// Protocol parameters shared by every node of a network.
///
/// The defaults are the main-network values; test networks may shrink the
/// committees, but all nodes of one network must agree on every field.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PosParams {
    #[serde(default = "default_epoch_leader_count")]
    pub epoch_leader_count: usize,
    #[serde(default = "default_random_proposer_count")]
    pub random_proposer_count: usize,
    #[serde(default = "default_slot_count")]
    pub slot_count: u64,
    #[serde(default = "default_slot_time")]
    pub slot_time: u64,
    #[serde(default = "default_epoch_base_time")]
    pub epoch_base_time: u64,
    /// Uncompressed secp256k1 key (hex) that backs epoch 0 and the ULS
    /// genesis fallback.
    #[serde(default = "default_genesis_public_key")]
    pub genesis_public_key: String,
}

impl Default for PosParams {
    fn default() -> Self {
        Self {
            epoch_leader_count: DEFAULT_EPOCH_LEADER_COUNT,
            random_proposer_count: DEFAULT_RANDOM_PROPOSER_COUNT,
            slot_count: DEFAULT_SLOT_COUNT,
            slot_time: DEFAULT_SLOT_TIME,
            epoch_base_time: DEFAULT_EPOCH_BASE_TIME,
            genesis_public_key: default_genesis_public_key(),
        }
    }
}

impl PosParams {
    pub fn load(path: &Path) -> PosResult<Self> {
        let content = fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|err| PosError::Config(format!("unable to parse parameters: {err}")))
    }

    pub fn save(&self, path: &Path) -> PosResult<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let encoded = toml::to_string_pretty(self)
            .map_err(|err| PosError::Config(format!("unable to encode parameters: {err}")))?;
        fs::write(path, encoded)?;
        Ok(())
    }

    /// Unix timestamp of the first slot of `epoch`.
    pub fn epoch_start(&self, epoch: u64) -> u64 {
        self.epoch_base_time + epoch * self.slot_count * self.slot_time
    }

    /// Slot index at which the stage-1 commitment window closes.
    pub fn stage1_end_slot(&self) -> u64 {
        self.slot_count / 10 * 2
    }

    /// Slot index at which the stage-2 share window closes.
    pub fn stage2_end_slot(&self) -> u64 {
        self.slot_count / 10 * 4
    }

    /// Slot index at which collected stage data is validated and the SMA for
    /// the next epoch is assembled.
    pub fn stage3_start_slot(&self) -> u64 {
        self.slot_count / 10 * 8
    }

    /// Upper bound on the backward walk while resolving a snapshot block.
    pub fn snapshot_walk_cap(&self) -> u64 {
        10 * self.slot_count
    }

    /// Decoded genesis public key bytes.
    pub fn genesis_pk_bytes(&self) -> PosResult<Vec<u8>> {
        let bytes = hex::decode(&self.genesis_public_key).map_err(|_| PosError::InvalidGenesisPk)?;
        if bytes.len() != SEC_PK_LEN {
            return Err(PosError::InvalidGenesisPk);
        }
        Ok(bytes)
    }
}
