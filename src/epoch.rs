//! Committee selector: derives the epoch-leader and random-beacon-proposer
//! committees for an epoch from the staking state at its snapshot block.
//!
//! Selection is a pure function of the snapshot state root and the epoch id.
//! The beacon random seeds a keccak chain; each draw reduces the chain value
//! modulo the total weight and binary-searches the prefix-sum array, so two
//! independent nodes emit identical committees in identical order.

use std::collections::HashMap;
use std::sync::Arc;

use malachite::Natural;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::chain::{self, ChainReader, StateReader};
use crate::crypto::{self, keccak256, keccak256_concat};
use crate::errors::{PosError, PosResult};
use crate::params::{PosParams, SNAPSHOT_EPOCH_LAG};
use crate::storage::PosStore;
use crate::types::{
    Address, ClientProbability, EpochProbability, Role, StakerInfo, WeightedProposer,
};
use crate::weights::{amount_weight, staker_weight};

const EPOCH_BLOCK_TAG: &str = "epochBlock";

fn natural_from_bytes(bytes: &[u8]) -> Natural {
    let mut value = Natural::from(0u32);
    for byte in bytes {
        value *= Natural::from(256u32);
        value += Natural::from(*byte);
    }
    value
}

pub struct EpochSelector {
    params: PosParams,
    chain: Arc<dyn ChainReader>,
    store: PosStore,
    committee_cache: RwLock<HashMap<(u64, Role), Arc<Vec<WeightedProposer>>>>,
}

impl EpochSelector {
    pub fn new(params: PosParams, chain: Arc<dyn ChainReader>, store: PosStore) -> Self {
        Self {
            params,
            chain,
            store,
            committee_cache: RwLock::new(HashMap::new()),
        }
    }

    /// Number of the block whose state feeds selection for `epoch`.
    ///
    /// Epochs 0 and 1 read genesis state; later epochs read the last block of
    /// epoch `e - 2`, found by walking back from the head. The resolved
    /// number is persisted so the walk runs once per epoch.
    pub fn snapshot_block_number(&self, epoch: u64) -> PosResult<u64> {
        if epoch < SNAPSHOT_EPOCH_LAG {
            return Ok(0);
        }
        let target_epoch = epoch - SNAPSHOT_EPOCH_LAG;
        if let Some(bytes) = self.store.get(target_epoch, EPOCH_BLOCK_TAG)? {
            if bytes.len() == 8 {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes);
                return Ok(u64::from_be_bytes(buf));
            }
        }

        let mut current = self.chain.head_block_number()?;
        let mut walked = 0u64;
        loop {
            if self.chain.block_epoch(current)? <= target_epoch {
                break;
            }
            if current == 0 {
                break;
            }
            current -= 1;
            walked += 1;
            if walked > self.params.snapshot_walk_cap() {
                return Err(PosError::SnapshotNotFound(epoch));
            }
        }
        self.store
            .put(target_epoch, EPOCH_BLOCK_TAG, &current.to_be_bytes())?;
        Ok(current)
    }

    /// Weighted proposer array at `state`, sorted ascending by weight with
    /// the serialized secp256k1 key breaking ties. Zero-weight stakers and
    /// records with malformed keys are dropped.
    pub fn build_proposer_array(
        &self,
        state: &dyn StateReader,
        epoch: u64,
    ) -> PosResult<Vec<WeightedProposer>> {
        let mut proposers = Vec::new();
        for staker in chain::stakers(state)? {
            let weight = staker_weight(&staker, epoch);
            if weight == Natural::from(0u32) {
                continue;
            }
            if let Err(err) = crypto::decode_sec_pubkey(&staker.sec_pk) {
                debug!(%err, "dropping staker with malformed secp256k1 key");
                continue;
            }
            if let Err(err) = crypto::decode_bn_pubkey(&staker.bn256_pk) {
                debug!(%err, "dropping staker with malformed bn254 key");
                continue;
            }
            proposers.push(WeightedProposer {
                sec_pk: staker.sec_pk,
                bn256_pk: staker.bn256_pk,
                weight,
            });
        }
        proposers.sort_by(|a, b| a.weight.cmp(&b.weight).then_with(|| a.sec_pk.cmp(&b.sec_pk)));
        Ok(proposers)
    }

    fn prefix_sums(proposers: &[WeightedProposer]) -> Vec<Natural> {
        let mut sums = Vec::with_capacity(proposers.len());
        let mut acc = Natural::from(0u32);
        for proposer in proposers {
            acc += proposer.weight.clone();
            sums.push(acc.clone());
        }
        sums
    }

    /// Draws `count` committee members with replacement.
    ///
    /// `c_0 = keccak(D || r)`, `x_i = c_i mod T`, member `i` is the first
    /// proposer whose prefix sum exceeds `x_i`, then `c_{i+1} = keccak(c_i)`.
    fn sample_indices(
        r: &[u8],
        role: Role,
        count: usize,
        prefix: &[Natural],
    ) -> PosResult<Vec<usize>> {
        if r.is_empty() || r.iter().all(|byte| *byte == 0) {
            return Err(PosError::InvalidBeaconRandom);
        }
        if prefix.is_empty() {
            return Err(PosError::NoEligibleStakers);
        }
        let total = prefix.last().expect("prefix sums are non-empty").clone();
        let mut c = keccak256_concat(&[&[role.domain_byte()], r]);
        let mut indices = Vec::with_capacity(count);
        for _ in 0..count {
            let mut x = natural_from_bytes(&c);
            x %= total.clone();
            let mut idx = prefix.partition_point(|sum| *sum <= x);
            if idx == prefix.len() {
                idx = prefix.len() - 1;
            }
            indices.push(idx);
            c = keccak256(&c);
        }
        Ok(indices)
    }

    /// Samples and persists both committees of `epoch`.
    pub fn select_leaders(&self, epoch: u64) -> PosResult<()> {
        let snapshot = self.snapshot_block_number(epoch)?;
        let state = self.chain.state_at(snapshot)?;
        let proposers = self.build_proposer_array(state.as_ref(), epoch)?;
        if proposers.is_empty() {
            return Err(PosError::NoEligibleStakers);
        }
        let prefix = Self::prefix_sums(&proposers);

        // The random recorded for the previous epoch seeds this selection;
        // it is absent on young chains, which fall back to one.
        let random_epoch = epoch.saturating_sub(1);
        let r = chain::beacon_random(state.as_ref(), random_epoch)?.unwrap_or_else(|| {
            warn!(epoch, random_epoch, "beacon random missing, using default");
            vec![1]
        });

        for (role, count) in [
            (Role::EpochLeader, self.params.epoch_leader_count),
            (Role::RbProposer, self.params.random_proposer_count),
        ] {
            let indices = Self::sample_indices(&r, role, count, &prefix)?;
            let mut committee = Vec::with_capacity(count);
            for (position, idx) in indices.iter().enumerate() {
                let proposer = &proposers[*idx];
                let encoded = bincode::serialize(proposer)?;
                self.store
                    .put_with_index(epoch, position as u64, role.tag(), &encoded)?;
                debug!(
                    epoch,
                    position,
                    role = role.tag(),
                    pk = %hex::encode(&proposer.sec_pk),
                    "selected committee member"
                );
                committee.push(proposer.clone());
            }
            self.committee_cache
                .write()
                .insert((epoch, role), Arc::new(committee));
        }
        info!(
            epoch,
            snapshot,
            stakers = proposers.len(),
            "epoch committees selected"
        );
        Ok(())
    }

    /// Persisted committee of `(epoch, role)` cycled to the full committee
    /// length; empty when selection has not run.
    pub fn committee(&self, epoch: u64, role: Role) -> PosResult<Arc<Vec<WeightedProposer>>> {
        if let Some(found) = self.committee_cache.read().get(&(epoch, role)) {
            return Ok(found.clone());
        }
        let expected = match role {
            Role::EpochLeader => self.params.epoch_leader_count,
            Role::RbProposer => self.params.random_proposer_count,
        };
        let raw = self.store.get_indexed_by_tag(epoch, role.tag())?;
        let mut members = Vec::with_capacity(raw.len());
        for bytes in &raw {
            members.push(bincode::deserialize::<WeightedProposer>(bytes)?);
        }
        if !members.is_empty() && members.len() < expected {
            // fewer records than the committee length: cycle over what exists
            let available = members.len();
            for position in available..expected {
                let entry = members[position % available].clone();
                members.push(entry);
            }
        }
        let members = Arc::new(members);
        self.committee_cache
            .write()
            .insert((epoch, role), members.clone());
        Ok(members)
    }

    /// Serialized epoch-leader keys of `epoch` in selection order.
    pub fn get_epoch_leaders(&self, epoch: u64) -> PosResult<Vec<Vec<u8>>> {
        Ok(self
            .committee(epoch, Role::EpochLeader)?
            .iter()
            .map(|member| member.sec_pk.clone())
            .collect())
    }

    /// Random-beacon proposer committee of `epoch` in selection order.
    pub fn get_rb_proposer_group(&self, epoch: u64) -> PosResult<Vec<WeightedProposer>> {
        Ok(self.committee(epoch, Role::RbProposer)?.to_vec())
    }

    /// BN254 key of RBP member `index`, if its derived address is `address`.
    pub fn get_proposer_bn254_pk(
        &self,
        epoch: u64,
        index: u64,
        address: &Address,
    ) -> PosResult<Option<Vec<u8>>> {
        let committee = self.committee(epoch, Role::RbProposer)?;
        let member = match committee.get(index as usize) {
            Some(member) => member,
            None => return Ok(None),
        };
        let derived = crypto::address_from_sec_pubkey(&member.sec_pk)?;
        if derived == *address {
            Ok(Some(member.bn256_pk.clone()))
        } else {
            Ok(None)
        }
    }

    fn staker_at_snapshot(&self, epoch: u64, address: &Address) -> PosResult<StakerInfo> {
        let snapshot = self.snapshot_block_number(epoch)?;
        let state = self.chain.state_at(snapshot)?;
        let raw = hex::decode(address)
            .map_err(|err| PosError::Config(format!("invalid address encoding: {err}")))?;
        let bytes = state
            .get_state_byte_array(&chain::STAKERS_CONTRACT, &chain::staker_key(&raw))?
            .ok_or_else(|| PosError::Config(format!("no staker record for address {address}")))?;
        Ok(StakerInfo::from_json(&bytes)?)
    }

    /// Weight breakdown of a staker and its delegations at `epoch`.
    ///
    /// Delegated amounts are weighted with the host staker's lock window and
    /// the client's own registration epoch.
    pub fn get_epoch_probability(
        &self,
        epoch: u64,
        address: &Address,
    ) -> PosResult<EpochProbability> {
        let staker = self.staker_at_snapshot(epoch, address)?;
        let mut entries = Vec::with_capacity(1 + staker.clients.len());
        let own = staker_weight(&staker, epoch);
        let mut total = own.clone();
        entries.push(ClientProbability {
            address: address.clone(),
            probability: own,
        });
        for client in &staker.clients {
            let weight = amount_weight(
                client.amount.as_natural(),
                staker.lock_epochs,
                client.staking_epoch,
                epoch,
            );
            total += weight.clone();
            entries.push(ClientProbability {
                address: client.address.clone(),
                probability: weight,
            });
        }
        Ok(EpochProbability {
            entries,
            fee_rate: staker.fee_rate,
            total,
        })
    }
}
