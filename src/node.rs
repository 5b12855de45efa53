//! Node-wide context owning the leader-selection subsystems.
//!
//! There is no process-global state: the store, the chain handle, and the
//! three subsystems are explicit values owned here and shared through `Arc`.
//! The chain outlives the node; the node holds only read capabilities.

use std::path::Path;
use std::sync::Arc;

use k256::SecretKey;
use tracing::warn;

use crate::chain::ChainReader;
use crate::epoch::EpochSelector;
use crate::errors::{PosError, PosResult};
use crate::params::PosParams;
use crate::slots::SlotLeaderSequencer;
use crate::storage::PosStore;
use crate::types::{Address, EpochProbability, WeightedProposer};
use crate::uls::{Stage1Payload, Stage2Payload, UlsCoordinator, UlsTx};

pub struct PosNode {
    params: PosParams,
    selector: Arc<EpochSelector>,
    coordinator: UlsCoordinator,
    sequencer: SlotLeaderSequencer,
    last_started_epoch: parking_lot::Mutex<Option<u64>>,
}

impl PosNode {
    /// Wires the subsystems over a store opened at `store_path`.
    ///
    /// `local_key` is the node's staking key; a node without one still tracks
    /// committees and slot leaders but never produces ULS transactions.
    pub fn open(
        params: PosParams,
        chain: Arc<dyn ChainReader>,
        store_path: &Path,
        local_key: Option<SecretKey>,
    ) -> PosResult<Self> {
        let store = PosStore::open(store_path)?;
        Self::new(params, chain, store, local_key)
    }

    pub fn new(
        params: PosParams,
        chain: Arc<dyn ChainReader>,
        store: PosStore,
        local_key: Option<SecretKey>,
    ) -> PosResult<Self> {
        let selector = Arc::new(EpochSelector::new(
            params.clone(),
            chain.clone(),
            store.clone(),
        ));
        let coordinator = UlsCoordinator::new(
            params.clone(),
            store.clone(),
            chain.clone(),
            selector.clone(),
            local_key,
        );
        let sequencer =
            SlotLeaderSequencer::new(params.clone(), store, chain, selector.clone())?;
        Ok(Self {
            params,
            selector,
            coordinator,
            sequencer,
            last_started_epoch: parking_lot::Mutex::new(None),
        })
    }

    pub fn params(&self) -> &PosParams {
        &self.params
    }

    pub fn selector(&self) -> &Arc<EpochSelector> {
        &self.selector
    }

    pub fn coordinator(&self) -> &UlsCoordinator {
        &self.coordinator
    }

    pub fn sequencer(&self) -> &SlotLeaderSequencer {
        &self.sequencer
    }

    /// Drives the per-epoch pipeline for an observed `(epoch, slot)`.
    ///
    /// On the first slot of a new epoch the committees are selected and the
    /// slot-leader sequence derived; afterwards the ULS stage machine runs.
    /// Returns the transactions the node should publish.
    pub fn on_slot(&self, epoch: u64, slot: u64) -> PosResult<Vec<UlsTx>> {
        let mut last = self.last_started_epoch.lock();
        if *last != Some(epoch) {
            match self.selector.select_leaders(epoch) {
                Ok(()) => {}
                Err(PosError::NoEligibleStakers) => {
                    warn!(epoch, "no eligible stakers, committees not selected");
                }
                Err(err) => return Err(err),
            }
            if let Err(err) = self.sequencer.generate_slot_leaders(epoch) {
                warn!(epoch, %err, "slot-leader generation failed");
            }
            *last = Some(epoch);
        }
        drop(last);
        self.coordinator.on_slot(epoch, slot)
    }

    /// Feeds an observed stage-1 transaction into the coordinator.
    pub fn observe_stage1(&self, payload: &Stage1Payload) -> PosResult<()> {
        self.coordinator.record_stage1(payload)
    }

    /// Feeds an observed stage-2 transaction into the coordinator.
    pub fn observe_stage2(&self, payload: &Stage2Payload) -> PosResult<()> {
        self.coordinator.record_stage2(payload)
    }

    pub fn get_slot_leader(&self, epoch: u64, slot: u64) -> PosResult<Vec<u8>> {
        self.sequencer.get_slot_leader(epoch, slot)
    }

    pub fn get_epoch_leaders(&self, epoch: u64) -> PosResult<Vec<Vec<u8>>> {
        self.selector.get_epoch_leaders(epoch)
    }

    pub fn get_rb_proposer_group(&self, epoch: u64) -> PosResult<Vec<WeightedProposer>> {
        self.selector.get_rb_proposer_group(epoch)
    }

    pub fn get_sma(&self, epoch: u64) -> PosResult<(Vec<Vec<u8>>, bool)> {
        self.sequencer.get_sma(epoch)
    }

    pub fn get_epoch_probability(
        &self,
        epoch: u64,
        address: &Address,
    ) -> PosResult<EpochProbability> {
        self.selector.get_epoch_probability(epoch, address)
    }
}
