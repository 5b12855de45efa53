//! Unique-leader-selection coordinator: the per-epoch stage machine that
//! collects commitments and encrypted shares from the epoch leaders and
//! assembles the secret message array consumed by the next epoch.
//!
//! A leader never reveals its secret scalar. Stage 1 publishes
//! `M_i = alpha_i * Pk_i`; stage 2 publishes the share array
//! `A_i = (alpha_i * Pk_0, ..., alpha_i * Pk_{Ne-1})` with a DLEQ proof that
//! one scalar produced every entry. At stage 3 each node validates the
//! collected material, drops invalid indexes, and a node that is itself a
//! leader derives `alpha_i * G` for every valid `i` from its own column.

use std::collections::HashMap;
use std::sync::Arc;

use k256::{ProjectivePoint, Scalar, SecretKey};
use parking_lot::Mutex;
use rlp::{Rlp, RlpStream};
use tracing::{debug, info, warn};

use crate::chain::{self, ChainReader};
use crate::crypto::{
    self, decode_sec_pubkey, encode_sec_pubkey, local_public_key_bytes, scalar_from_bytes,
    scalar_to_bytes, DleqProof,
};
use crate::epoch::EpochSelector;
use crate::errors::{PosError, PosResult};
use crate::params::{PosParams, SEC_PK_LEN};
use crate::storage::PosStore;

const ALPHA_TAG: &str = "alpha";
pub(crate) const SMA_TAG: &str = "sma";

/// Stage of the per-epoch ULS run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UlsStage {
    Init,
    Stage1,
    Stage2,
    Stage3,
    Finished,
}

/// Stage-1 transaction body: `(epochId, index, M_i)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Stage1Payload {
    pub epoch_id: u64,
    pub index: u64,
    pub commitment: Vec<u8>,
}

impl Stage1Payload {
    pub fn to_rlp_bytes(&self) -> Vec<u8> {
        let mut stream = RlpStream::new_list(3);
        stream.append(&self.epoch_id);
        stream.append(&self.index);
        stream.append(&self.commitment);
        stream.out().to_vec()
    }

    pub fn from_rlp_bytes(bytes: &[u8]) -> PosResult<Self> {
        let rlp = Rlp::new(bytes);
        Ok(Self {
            epoch_id: rlp.val_at(0)?,
            index: rlp.val_at(1)?,
            commitment: rlp.val_at(2)?,
        })
    }
}

/// Stage-2 transaction body:
/// `[epochId, index, selfPk, [alpha*Pk_0 .. alpha*Pk_{Ne-1}], [e, z]]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Stage2Payload {
    pub epoch_id: u64,
    pub index: u64,
    pub self_pk: Vec<u8>,
    pub alpha_pk: Vec<Vec<u8>>,
    pub proof: DleqProof,
}

fn minimal_be(bytes: [u8; 32]) -> Vec<u8> {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(31);
    bytes[start..].to_vec()
}

fn scalar_from_minimal_be(bytes: &[u8]) -> PosResult<Scalar> {
    if bytes.len() > 32 {
        return Err(PosError::Crypto("proof scalar exceeds 32 bytes".into()));
    }
    let mut padded = [0u8; 32];
    padded[32 - bytes.len()..].copy_from_slice(bytes);
    Ok(scalar_from_bytes(&padded))
}

impl Stage2Payload {
    pub fn to_rlp_bytes(&self) -> Vec<u8> {
        let mut stream = RlpStream::new_list(5);
        stream.append(&self.epoch_id);
        stream.append(&self.index);
        stream.append(&self.self_pk);
        stream.begin_list(self.alpha_pk.len());
        for pk in &self.alpha_pk {
            stream.append(pk);
        }
        stream.begin_list(2);
        stream.append(&minimal_be(scalar_to_bytes(&self.proof.e)));
        stream.append(&minimal_be(scalar_to_bytes(&self.proof.z)));
        stream.out().to_vec()
    }

    pub fn from_rlp_bytes(bytes: &[u8]) -> PosResult<Self> {
        let rlp = Rlp::new(bytes);
        let proof_parts: Vec<Vec<u8>> = rlp.list_at(4)?;
        if proof_parts.len() != 2 {
            return Err(rlp::DecoderError::RlpIncorrectListLen.into());
        }
        Ok(Self {
            epoch_id: rlp.val_at(0)?,
            index: rlp.val_at(1)?,
            self_pk: rlp.val_at(2)?,
            alpha_pk: rlp.list_at(3)?,
            proof: DleqProof {
                e: scalar_from_minimal_be(&proof_parts[0])?,
                z: scalar_from_minimal_be(&proof_parts[1])?,
            },
        })
    }
}

/// Transactions the node should publish for the current stage.
#[derive(Clone, Debug)]
pub enum UlsTx {
    Stage1(Stage1Payload),
    Stage2(Stage2Payload),
}

/// Encodes the stage-2 participation bitmap the consensus contract stores.
pub fn encode_stage2_indexes(bits: &[bool]) -> Vec<u8> {
    let mut stream = RlpStream::new_list(bits.len());
    for bit in bits {
        stream.append(&u8::from(*bit));
    }
    stream.out().to_vec()
}

pub fn decode_stage2_indexes(bytes: &[u8], expected: usize) -> PosResult<Vec<bool>> {
    let rlp = Rlp::new(bytes);
    let raw: Vec<u8> = rlp.as_list()?;
    if raw.len() != expected {
        return Err(rlp::DecoderError::RlpIncorrectListLen.into());
    }
    Ok(raw.into_iter().map(|bit| bit != 0).collect())
}

struct EpochState {
    working_epoch: u64,
    initialized: bool,
    stage: UlsStage,
    leader_points: Vec<ProjectivePoint>,
    index_map: HashMap<Vec<u8>, Vec<u64>>,
    stage_one_mi: Vec<Option<ProjectivePoint>>,
    stage_two_shares: Vec<Option<Vec<ProjectivePoint>>>,
    stage_two_proofs: Vec<Option<DleqProof>>,
    valid_index: Vec<bool>,
    stage1_sent: bool,
    stage2_sent: bool,
    sma_done: bool,
}

impl EpochState {
    fn empty() -> Self {
        Self {
            working_epoch: 0,
            initialized: false,
            stage: UlsStage::Init,
            leader_points: Vec::new(),
            index_map: HashMap::new(),
            stage_one_mi: Vec::new(),
            stage_two_shares: Vec::new(),
            stage_two_proofs: Vec::new(),
            valid_index: Vec::new(),
            stage1_sent: false,
            stage2_sent: false,
            sma_done: false,
        }
    }
}

pub struct UlsCoordinator {
    params: PosParams,
    store: PosStore,
    chain: Arc<dyn ChainReader>,
    selector: Arc<EpochSelector>,
    local_key: Option<SecretKey>,
    inner: Mutex<EpochState>,
}

impl UlsCoordinator {
    pub fn new(
        params: PosParams,
        store: PosStore,
        chain: Arc<dyn ChainReader>,
        selector: Arc<EpochSelector>,
        local_key: Option<SecretKey>,
    ) -> Self {
        Self {
            params,
            store,
            chain,
            selector,
            local_key,
            inner: Mutex::new(EpochState::empty()),
        }
    }

    pub fn stage(&self) -> UlsStage {
        self.inner.lock().stage
    }

    pub fn local_public_key(&self) -> Option<Vec<u8>> {
        self.local_key.as_ref().map(local_public_key_bytes)
    }

    /// Whether the local key occupies at least one seat of the working
    /// epoch's leader committee.
    pub fn is_local_pk_in_epoch_leaders(&self) -> bool {
        let state = self.inner.lock();
        match self.local_public_key() {
            Some(pk) => state.index_map.contains_key(&pk),
            None => false,
        }
    }

    fn reset_for_epoch(&self, state: &mut EpochState, epoch: u64) -> PosResult<()> {
        let ne = self.params.epoch_leader_count;
        *state = EpochState::empty();
        state.working_epoch = epoch;
        state.initialized = true;
        state.stage = UlsStage::Stage1;
        state.stage_one_mi = vec![None; ne];
        state.stage_two_shares = vec![None; ne];
        state.stage_two_proofs = vec![None; ne];
        state.valid_index = vec![true; ne];

        let leaders = self.selector.get_epoch_leaders(epoch)?;
        if leaders.is_empty() {
            // Without leaders nobody can run the stages; the sequencer will
            // fall back to the genesis SMA for the following epoch.
            warn!(epoch, "no epoch leaders available, ULS idles this epoch");
            return Ok(());
        }
        for (index, pk) in leaders.iter().enumerate() {
            let point = decode_sec_pubkey(pk)?;
            state.leader_points.push(point);
            state
                .index_map
                .entry(pk.clone())
                .or_default()
                .push(index as u64);
        }
        Ok(())
    }

    fn local_indexes(&self, state: &EpochState) -> Vec<u64> {
        self.local_public_key()
            .and_then(|pk| state.index_map.get(&pk).cloned())
            .unwrap_or_default()
    }

    fn load_or_create_alpha(&self, epoch: u64, index: u64) -> PosResult<Scalar> {
        if let Some(bytes) = self.store.get_with_index(epoch, index, ALPHA_TAG)? {
            if bytes.len() == 32 {
                let mut buf = [0u8; 32];
                buf.copy_from_slice(&bytes);
                return Ok(scalar_from_bytes(&buf));
            }
        }
        let alpha = crypto::random_scalar();
        self.store
            .put_with_index(epoch, index, ALPHA_TAG, &scalar_to_bytes(&alpha))?;
        Ok(alpha)
    }

    fn stage1_payloads(&self, state: &EpochState) -> PosResult<Vec<UlsTx>> {
        let indexes = self.local_indexes(state);
        if indexes.is_empty() {
            return Err(PosError::PkNotInCurrentEpochLeaders);
        }
        let mut txs = Vec::with_capacity(indexes.len());
        for index in indexes {
            let alpha = self.load_or_create_alpha(state.working_epoch, index)?;
            let commitment = &state.leader_points[index as usize] * &alpha;
            txs.push(UlsTx::Stage1(Stage1Payload {
                epoch_id: state.working_epoch,
                index,
                commitment: encode_sec_pubkey(&commitment),
            }));
        }
        Ok(txs)
    }

    fn stage2_payloads(&self, state: &EpochState) -> PosResult<Vec<UlsTx>> {
        let indexes = self.local_indexes(state);
        if indexes.is_empty() {
            return Err(PosError::PkNotInCurrentEpochLeaders);
        }
        let self_pk = self
            .local_public_key()
            .ok_or(PosError::PkNotInCurrentEpochLeaders)?;
        let mut txs = Vec::with_capacity(indexes.len());
        for index in indexes {
            let alpha = self.load_or_create_alpha(state.working_epoch, index)?;
            let shares: Vec<ProjectivePoint> = state
                .leader_points
                .iter()
                .map(|leader| leader * &alpha)
                .collect();
            let proof = DleqProof::generate(&alpha, &state.leader_points, &shares);
            txs.push(UlsTx::Stage2(Stage2Payload {
                epoch_id: state.working_epoch,
                index,
                self_pk: self_pk.clone(),
                alpha_pk: shares.iter().map(encode_sec_pubkey).collect(),
                proof,
            }));
        }
        Ok(txs)
    }

    /// Records an observed stage-1 commitment. The first submission for an
    /// index wins; later duplicates are dropped.
    pub fn record_stage1(&self, payload: &Stage1Payload) -> PosResult<()> {
        let mut state = self.inner.lock();
        if payload.epoch_id != state.working_epoch
            || payload.index as usize >= state.stage_one_mi.len()
        {
            return Ok(());
        }
        let slot = &mut state.stage_one_mi[payload.index as usize];
        if slot.is_some() {
            debug!(index = payload.index, "duplicate stage-1 submission ignored");
            return Ok(());
        }
        *slot = Some(decode_sec_pubkey(&payload.commitment)?);
        Ok(())
    }

    /// Records an observed stage-2 share array, first submission wins.
    pub fn record_stage2(&self, payload: &Stage2Payload) -> PosResult<()> {
        let mut state = self.inner.lock();
        if payload.epoch_id != state.working_epoch
            || payload.index as usize >= state.stage_two_shares.len()
        {
            return Ok(());
        }
        if state.stage_two_shares[payload.index as usize].is_some() {
            debug!(index = payload.index, "duplicate stage-2 submission ignored");
            return Ok(());
        }
        let mut shares = Vec::with_capacity(payload.alpha_pk.len());
        for pk in &payload.alpha_pk {
            shares.push(decode_sec_pubkey(pk)?);
        }
        state.stage_two_shares[payload.index as usize] = Some(shares);
        state.stage_two_proofs[payload.index as usize] = Some(payload.proof.clone());
        Ok(())
    }

    /// Loads the participation bitmap and every submitted payload from the
    /// consensus contract at the current head state.
    fn collect_stage_data(&self, state: &mut EpochState) -> PosResult<()> {
        let ne = self.params.epoch_leader_count;
        let head = self.chain.head_block_number()?;
        let chain_state = self.chain.state_at(head)?;
        let epoch = state.working_epoch;

        let bitmap = match chain_state
            .get_state_byte_array(&chain::SLOT_LEADER_CONTRACT, &chain::stage2_indexes_key(epoch))?
        {
            Some(bytes) => decode_stage2_indexes(&bytes, ne)?,
            None => {
                warn!(epoch, "no stage-2 participation bitmap in state");
                vec![false; ne]
            }
        };

        for index in 0..ne {
            if !bitmap[index] {
                state.valid_index[index] = false;
                continue;
            }
            if state.stage_one_mi[index].is_none() {
                if let Some(bytes) = chain_state.get_state_byte_array(
                    &chain::SLOT_LEADER_CONTRACT,
                    &chain::stage1_key(epoch, index as u64),
                )? {
                    match Stage1Payload::from_rlp_bytes(&bytes)
                        .and_then(|payload| decode_sec_pubkey(&payload.commitment))
                    {
                        Ok(commitment) => state.stage_one_mi[index] = Some(commitment),
                        Err(err) => {
                            warn!(index, %err, "malformed stage-1 commitment");
                        }
                    }
                }
            }
            if state.stage_two_shares[index].is_none() {
                let bytes = match chain_state.get_state_byte_array(
                    &chain::SLOT_LEADER_CONTRACT,
                    &chain::stage2_key(epoch, index as u64),
                )? {
                    Some(bytes) => bytes,
                    None => {
                        warn!(index, "bitmap set but stage-2 payload missing");
                        state.valid_index[index] = false;
                        continue;
                    }
                };
                match Stage2Payload::from_rlp_bytes(&bytes) {
                    Ok(payload) => {
                        let mut shares = Vec::with_capacity(payload.alpha_pk.len());
                        let mut ok = true;
                        for pk in &payload.alpha_pk {
                            match decode_sec_pubkey(pk) {
                                Ok(point) => shares.push(point),
                                Err(err) => {
                                    warn!(index, %err, "malformed stage-2 share");
                                    ok = false;
                                    break;
                                }
                            }
                        }
                        if ok {
                            state.stage_two_shares[index] = Some(shares);
                            state.stage_two_proofs[index] = Some(payload.proof);
                        } else {
                            state.valid_index[index] = false;
                        }
                    }
                    Err(err) => {
                        warn!(index, %err, "malformed stage-2 payload");
                        state.valid_index[index] = false;
                    }
                }
            }
        }
        Ok(())
    }

    /// Validates every participating index; a failure marks that index
    /// invalid and never aborts the epoch.
    fn validate_stage_data(&self, state: &mut EpochState) {
        let ne = self.params.epoch_leader_count;
        for index in 0..ne {
            if !state.valid_index[index] {
                continue;
            }
            let shares = match &state.stage_two_shares[index] {
                Some(shares) => shares,
                None => {
                    state.valid_index[index] = false;
                    continue;
                }
            };
            if shares.len() != ne {
                warn!(index, "stage-2 share array has wrong length");
                state.valid_index[index] = false;
                continue;
            }
            // the self entry of the share array must equal the stage-1
            // commitment; without a commitment the index cannot be anchored
            match &state.stage_one_mi[index] {
                Some(commitment) if *commitment == shares[index] => {}
                _ => {
                    warn!(index, "stage-2 shares do not match the stage-1 commitment");
                    state.valid_index[index] = false;
                    continue;
                }
            }
            let proof_ok = state.stage_two_proofs[index]
                .as_ref()
                .map(|proof| proof.verify(&state.leader_points, shares))
                .unwrap_or(false);
            if !proof_ok {
                warn!(
                    index,
                    error = %PosError::InvalidStage2Proof(index as u64),
                    "dropping leader from SMA assembly"
                );
                state.valid_index[index] = false;
            }
        }
    }

    /// Derives and persists the SMA for the following epoch from the local
    /// leader's column of valid shares.
    fn generate_sma(&self, state: &EpochState) -> PosResult<bool> {
        let secret = match &self.local_key {
            Some(secret) => secret,
            None => return Ok(false),
        };
        let indexes = self.local_indexes(state);
        let own_index = match indexes.first() {
            Some(index) => *index as usize,
            None => return Err(PosError::PkNotInCurrentEpochLeaders),
        };
        if !state.valid_index[own_index] {
            warn!(
                index = own_index,
                "local leader invalid this epoch, skipping SMA production"
            );
            return Ok(false);
        }
        let inverse: Option<Scalar> = crypto::secret_scalar(secret).invert().into();
        let inverse =
            inverse.ok_or_else(|| PosError::Crypto("local secret key is not invertible".into()))?;

        let mut pieces = Vec::new();
        for index in 0..self.params.epoch_leader_count {
            if !state.valid_index[index] {
                continue;
            }
            if let Some(shares) = &state.stage_two_shares[index] {
                // alpha_i * Pk_own * sk_own^-1 = alpha_i * G
                pieces.push(&shares[own_index] * &inverse);
            }
        }
        if pieces.is_empty() {
            warn!(epoch = state.working_epoch, "no valid shares, SMA not produced");
            return Ok(false);
        }
        while pieces.len() < self.params.epoch_leader_count {
            let last = *pieces.last().expect("pieces are non-empty");
            pieces.push(last);
        }

        let mut blob = Vec::with_capacity(pieces.len() * SEC_PK_LEN);
        for piece in &pieces {
            blob.extend_from_slice(&encode_sec_pubkey(piece));
        }
        self.store.put(state.working_epoch + 1, SMA_TAG, &blob)?;
        info!(
            epoch = state.working_epoch,
            pieces = pieces.len(),
            "SMA persisted for next epoch"
        );
        Ok(true)
    }

    /// Advances the stage machine for `(epoch, slot)` and returns the
    /// transactions the node should publish, if any.
    ///
    /// Transitions are monotone within an epoch: once stage 3 has run, no
    /// further stage-1/stage-2 material alters the outcome.
    pub fn on_slot(&self, epoch: u64, slot: u64) -> PosResult<Vec<UlsTx>> {
        let mut state = self.inner.lock();
        if !state.initialized || state.working_epoch != epoch {
            self.reset_for_epoch(&mut state, epoch)?;
        }
        if state.leader_points.is_empty() {
            return Ok(Vec::new());
        }

        let mut txs = Vec::new();
        if slot < self.params.stage1_end_slot() {
            if !state.stage1_sent && self.local_key.is_some() {
                match self.stage1_payloads(&state) {
                    Ok(mut payloads) => {
                        state.stage1_sent = true;
                        // a node observes its own submissions like anyone else's
                        for tx in &payloads {
                            if let UlsTx::Stage1(payload) = tx {
                                let index = payload.index as usize;
                                if state.stage_one_mi[index].is_none() {
                                    state.stage_one_mi[index] =
                                        Some(decode_sec_pubkey(&payload.commitment)?);
                                }
                            }
                        }
                        txs.append(&mut payloads);
                    }
                    Err(PosError::PkNotInCurrentEpochLeaders) => {
                        debug!(epoch, "local key not a leader, skipping stage 1");
                        state.stage1_sent = true;
                    }
                    Err(err) => return Err(err),
                }
            }
        } else if slot < self.params.stage2_end_slot() {
            state.stage = UlsStage::Stage2;
            if !state.stage2_sent && self.local_key.is_some() {
                match self.stage2_payloads(&state) {
                    Ok(mut payloads) => {
                        state.stage2_sent = true;
                        txs.append(&mut payloads);
                    }
                    Err(PosError::PkNotInCurrentEpochLeaders) => {
                        debug!(epoch, "local key not a leader, skipping stage 2");
                        state.stage2_sent = true;
                    }
                    Err(err) => return Err(err),
                }
            }
        } else if slot >= self.params.stage3_start_slot() && !state.sma_done {
            state.stage = UlsStage::Stage3;
            self.collect_stage_data(&mut state)?;
            self.validate_stage_data(&mut state);
            match self.generate_sma(&state) {
                Ok(_) | Err(PosError::PkNotInCurrentEpochLeaders) => {}
                Err(err) => return Err(err),
            }
            state.sma_done = true;
            state.stage = UlsStage::Finished;
        }
        Ok(txs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::random_scalar;

    fn sample_proof() -> DleqProof {
        DleqProof {
            e: random_scalar(),
            z: random_scalar(),
        }
    }

    fn point_bytes(seed: u64) -> Vec<u8> {
        encode_sec_pubkey(&(ProjectivePoint::GENERATOR * Scalar::from(seed)))
    }

    #[test]
    fn stage1_payload_rlp_round_trip() {
        let payload = Stage1Payload {
            epoch_id: 12,
            index: 3,
            commitment: point_bytes(9),
        };
        let bytes = payload.to_rlp_bytes();
        let decoded = Stage1Payload::from_rlp_bytes(&bytes).expect("decode");
        assert_eq!(payload, decoded);
    }

    #[test]
    fn stage2_payload_rlp_round_trip() {
        let payload = Stage2Payload {
            epoch_id: 5,
            index: 7,
            self_pk: point_bytes(2),
            alpha_pk: (1..=4u64).map(point_bytes).collect(),
            proof: sample_proof(),
        };
        let bytes = payload.to_rlp_bytes();
        let decoded = Stage2Payload::from_rlp_bytes(&bytes).expect("decode");
        assert_eq!(payload, decoded);
    }

    #[test]
    fn stage2_payload_rejects_truncated_proof() {
        let payload = Stage2Payload {
            epoch_id: 5,
            index: 7,
            self_pk: point_bytes(2),
            alpha_pk: vec![point_bytes(1)],
            proof: sample_proof(),
        };
        let mut bytes = payload.to_rlp_bytes();
        bytes.truncate(bytes.len() - 4);
        assert!(Stage2Payload::from_rlp_bytes(&bytes).is_err());
    }

    #[test]
    fn stage2_bitmap_round_trip() {
        let bits = vec![true, false, true, true, false];
        let bytes = encode_stage2_indexes(&bits);
        let decoded = decode_stage2_indexes(&bytes, 5).expect("decode");
        assert_eq!(bits, decoded);
        assert!(decode_stage2_indexes(&bytes, 6).is_err());
    }

    #[test]
    fn minimal_be_strips_and_restores() {
        let scalar = Scalar::from(0xdead_beefu64);
        let stripped = minimal_be(scalar_to_bytes(&scalar));
        assert_eq!(stripped.len(), 4);
        let restored = scalar_from_minimal_be(&stripped).expect("restore");
        assert_eq!(restored, scalar);
    }
}
