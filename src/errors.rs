use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PosError {
    #[error("storage error: {0}")]
    Storage(#[from] rocksdb::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("rlp error: {0}")]
    Rlp(#[from] rlp::DecoderError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("cryptography error: {0}")]
    Crypto(String),
    #[error("invalid beacon random")]
    InvalidBeaconRandom,
    #[error("no eligible stakers at snapshot")]
    NoEligibleStakers,
    #[error("snapshot block not found for epoch {0}")]
    SnapshotNotFound(u64),
    #[error("slot leader group not ready for epoch {0}")]
    SlotLeaderGroupNotReady(u64),
    #[error("slot id {slot} out of range (slot count {slot_count})")]
    SlotIdOutOfRange { slot: u64, slot_count: u64 },
    #[error("invalid stage-2 proof at leader index {0}")]
    InvalidStage2Proof(u64),
    #[error("local public key is not in the current epoch leaders")]
    PkNotInCurrentEpochLeaders,
    #[error("invalid genesis public key")]
    InvalidGenesisPk,
}

pub type PosResult<T> = Result<T, PosError>;
