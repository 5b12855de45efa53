#![allow(dead_code)]

use std::sync::Arc;

use k256::{ProjectivePoint, Scalar, SecretKey};
use malachite::Natural;

use pos_core::chain::{MemoryChain, MemoryState};
use pos_core::crypto::{encode_bn_pubkey, encode_sec_pubkey, local_public_key_bytes};
use pos_core::params::{PosParams, WAN_UNIT};
use pos_core::storage::PosStore;
use pos_core::types::{Amount, StakerInfo};

/// Deterministic secp256k1 key so committee draws are reproducible run to run.
pub fn secret_key(seed: u64) -> SecretKey {
    assert!(seed != 0, "zero seed is not a valid secret key");
    SecretKey::new(Scalar::from(seed).into())
}

pub fn public_key_bytes(secret: &SecretKey) -> Vec<u8> {
    local_public_key_bytes(secret)
}

pub fn point_bytes(seed: u64) -> Vec<u8> {
    encode_sec_pubkey(&(ProjectivePoint::GENERATOR * Scalar::from(seed)))
}

/// Valid BN254 G1 key derived from a small scalar.
pub fn bn_pk(seed: u64) -> Vec<u8> {
    use ark_bn254::{Fr, G1Affine, G1Projective};
    use ark_ec::{AffineRepr, CurveGroup};

    let point = (G1Projective::from(G1Affine::generator()) * Fr::from(seed)).into_affine();
    encode_bn_pubkey(&point).expect("bn encode")
}

pub fn staker_for(secret: &SecretKey, units: u128, lock_epochs: u64, staking_epoch: u64) -> StakerInfo {
    StakerInfo {
        sec_pk: public_key_bytes(secret),
        bn256_pk: bn_pk(units as u64 + 1),
        amount: Amount::from_natural(Natural::from(units) * Natural::from(WAN_UNIT)),
        lock_epochs,
        staking_epoch,
        fee_rate: 1_000,
        clients: Vec::new(),
    }
}

/// Small parameter set so the suites stay fast; stage windows keep the
/// protocol proportions.
pub fn test_params() -> PosParams {
    PosParams {
        epoch_leader_count: 4,
        random_proposer_count: 3,
        slot_count: 40,
        ..PosParams::default()
    }
}

pub struct TestChain {
    pub chain: Arc<MemoryChain>,
    pub state: Arc<MemoryState>,
}

/// One shared mutable state behind a chain whose blocks span `epochs`.
///
/// Block numbers are assigned in push order; every block shares the same
/// state object, so data written mid-test is visible at the head.
pub fn chain_spanning(stakers: &[StakerInfo], epochs: &[u64]) -> TestChain {
    let state = Arc::new(MemoryState::new());
    for staker in stakers {
        state.set_staker(staker).expect("set staker");
    }
    state.set_beacon_random(0, vec![0x01]);
    let chain = Arc::new(MemoryChain::new());
    for epoch in epochs {
        chain.push_block(*epoch, state.clone());
    }
    TestChain { chain, state }
}

pub fn open_store(dir: &tempfile::TempDir) -> PosStore {
    PosStore::open(dir.path()).expect("open store")
}
