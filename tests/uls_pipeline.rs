use std::sync::Arc;

use anyhow::Result;

use pos_core::chain::{stage1_key, stage2_indexes_key, stage2_key, SLOT_LEADER_CONTRACT};
use pos_core::epoch::EpochSelector;
use pos_core::errors::PosError;
use pos_core::slots::SlotLeaderSequencer;
use pos_core::storage::PosStore;
use pos_core::types::{Role, WeightedProposer};
use pos_core::uls::{encode_stage2_indexes, Stage2Payload, UlsCoordinator, UlsTx};

mod support;

use support::{chain_spanning, open_store, secret_key, staker_for, test_params};

struct TestNode {
    _dir: tempfile::TempDir,
    store: PosStore,
    coordinator: UlsCoordinator,
    sequencer: SlotLeaderSequencer,
}

fn build_node(
    fixture: &support::TestChain,
    secret: Option<k256::SecretKey>,
    committee: &[WeightedProposer],
    epoch: u64,
) -> Result<TestNode> {
    let params = test_params();
    let dir = tempfile::tempdir()?;
    let store = open_store(&dir);
    for (index, proposer) in committee.iter().enumerate() {
        store.put_with_index(
            epoch,
            index as u64,
            Role::EpochLeader.tag(),
            &bincode::serialize(proposer)?,
        )?;
    }
    let selector = Arc::new(EpochSelector::new(
        params.clone(),
        fixture.chain.clone(),
        store.clone(),
    ));
    let coordinator = UlsCoordinator::new(
        params.clone(),
        store.clone(),
        fixture.chain.clone(),
        selector.clone(),
        secret,
    );
    let sequencer = SlotLeaderSequencer::new(params, store.clone(), fixture.chain.clone(), selector)?;
    Ok(TestNode {
        _dir: dir,
        store,
        coordinator,
        sequencer,
    })
}

fn stage2_of(txs: Vec<UlsTx>) -> Vec<Stage2Payload> {
    txs.into_iter()
        .filter_map(|tx| match tx {
            UlsTx::Stage2(payload) => Some(payload),
            UlsTx::Stage1(_) => None,
        })
        .collect()
}

/// Runs the full stage-1/stage-2/stage-3 pipeline for epoch 1 across four
/// leader nodes, with the submission of leader 1 tampered on chain.
#[test]
fn partial_stage2_failure_still_converges() -> Result<()> {
    let params = test_params();
    let secrets: Vec<k256::SecretKey> = (101..=104u64).map(secret_key).collect();
    let stakers: Vec<_> = secrets
        .iter()
        .enumerate()
        .map(|(i, secret)| staker_for(secret, (i as u128 + 1) * 100, 10, 0))
        .collect();
    let fixture = chain_spanning(&stakers, &[0, 1, 2]);
    fixture.state.set_beacon_random(2, vec![0x09]);

    let committee: Vec<WeightedProposer> = stakers
        .iter()
        .map(|staker| WeightedProposer {
            sec_pk: staker.sec_pk.clone(),
            bn256_pk: staker.bn256_pk.clone(),
            weight: staker.amount.as_natural().clone(),
        })
        .collect();

    let nodes: Vec<TestNode> = secrets
        .iter()
        .map(|secret| build_node(&fixture, Some(secret.clone()), &committee, 1))
        .collect::<Result<_>>()?;

    // stage 1: every leader publishes its commitment
    for node in &nodes {
        let txs = node.coordinator.on_slot(1, 0)?;
        for tx in txs {
            if let UlsTx::Stage1(payload) = tx {
                fixture.state.set_byte_array(
                    SLOT_LEADER_CONTRACT,
                    stage1_key(1, payload.index),
                    payload.to_rlp_bytes(),
                );
            }
        }
    }

    // stage 2: publish the share arrays, corrupting leader 1's entry
    for node in &nodes {
        for payload in stage2_of(node.coordinator.on_slot(1, 10)?) {
            let mut published = payload.clone();
            if published.index == 1 {
                // swap two shares; the self entry still matches the stage-1
                // commitment but the DLEQ proof no longer holds
                published.alpha_pk.swap(2, 3);
            }
            fixture.state.set_byte_array(
                SLOT_LEADER_CONTRACT,
                stage2_key(1, published.index),
                published.to_rlp_bytes(),
            );
        }
    }
    fixture.state.set_byte_array(
        SLOT_LEADER_CONTRACT,
        stage2_indexes_key(1),
        encode_stage2_indexes(&[true, true, true, true]),
    );

    // stage 3: every node validates and the valid leaders derive the SMA
    for node in &nodes {
        node.coordinator.on_slot(1, 35)?;
    }

    let (sma_0, genesis_0) = node_sma(&nodes[0])?;
    assert!(!genesis_0, "leader 0 must derive an SMA");
    let (sma_1, genesis_1) = node_sma(&nodes[1])?;
    assert!(genesis_1, "the invalid leader cannot derive an SMA");
    assert_eq!(sma_1.len(), params.epoch_leader_count);

    for node in &nodes[2..] {
        let (sma, genesis) = node_sma(node)?;
        assert!(!genesis);
        assert_eq!(sma, sma_0, "SMA must agree across valid leaders");
    }
    // three valid columns padded to committee length by repeating the last
    assert_eq!(sma_0.len(), params.epoch_leader_count);
    assert_eq!(sma_0[2], sma_0[3]);
    assert_ne!(sma_0[0], sma_0[1]);

    // epoch 2 slot leaders: identical on every valid node, drawn from EL(1)
    let mut sequences = Vec::new();
    for node in [&nodes[0], &nodes[2], &nodes[3]] {
        node.sequencer.generate_slot_leaders(2)?;
        let leaders: Vec<Vec<u8>> = (0..params.slot_count)
            .map(|slot| node.sequencer.get_slot_leader(2, slot))
            .collect::<Result<_, _>>()?;
        for leader in &leaders {
            assert!(committee.iter().any(|member| member.sec_pk == *leader));
        }
        sequences.push(leaders);
    }
    assert_eq!(sequences[0], sequences[1]);
    assert_eq!(sequences[1], sequences[2]);

    // regeneration on the same inputs is bit-identical
    nodes[0].sequencer.generate_slot_leaders(2)?;
    let regenerated: Vec<Vec<u8>> = (0..params.slot_count)
        .map(|slot| nodes[0].sequencer.get_slot_leader(2, slot))
        .collect::<Result<_, _>>()?;
    assert_eq!(regenerated, sequences[0]);

    let index = nodes[0]
        .sequencer
        .get_slot_leader_index(2, 0)?
        .expect("generated sequence caches indexes");
    assert!((index as usize) < params.epoch_leader_count);

    // the node without an SMA falls back to the genesis sequence
    nodes[1].sequencer.generate_slot_leaders(2)?;
    assert_eq!(
        nodes[1].sequencer.get_slot_leader(2, 0)?,
        params.genesis_pk_bytes()?
    );
    Ok(())
}

fn node_sma(node: &TestNode) -> Result<(Vec<Vec<u8>>, bool)> {
    Ok(node.sequencer.get_sma(2)?)
}

#[test]
fn total_stage_failure_uses_genesis_material() -> Result<()> {
    let params = test_params();
    let secret = secret_key(7);
    let staker = staker_for(&secret, 100, 20, 0);
    let fixture = chain_spanning(&[staker.clone()], &[0]);
    let committee = vec![WeightedProposer {
        sec_pk: staker.sec_pk.clone(),
        bn256_pk: staker.bn256_pk.clone(),
        weight: staker.amount.as_natural().clone(),
    }];
    let node = build_node(&fixture, None, &committee, 6)?;

    // epoch 7 saw no stage transactions at all: SMA(7) is absent
    let (sma, is_genesis) = node.sequencer.get_sma(7)?;
    assert!(is_genesis);
    assert_eq!(sma.len(), params.epoch_leader_count);

    node.sequencer.generate_slot_leaders(7)?;
    let genesis_pk = params.genesis_pk_bytes()?;
    assert_eq!(node.sequencer.get_slot_leader(7, 0)?, genesis_pk);
    assert_eq!(
        node.sequencer.get_slot_leader(7, params.slot_count - 1)?,
        genesis_pk
    );
    Ok(())
}

#[test]
fn epoch_zero_always_returns_the_genesis_key() -> Result<()> {
    let params = test_params();
    let fixture = chain_spanning(&[], &[0]);
    let node = build_node(&fixture, None, &[], 0)?;
    let genesis_pk = params.genesis_pk_bytes()?;
    for slot in [0, 1, params.slot_count - 1, params.slot_count + 10] {
        assert_eq!(node.sequencer.get_slot_leader(0, slot)?, genesis_pk);
    }
    Ok(())
}

#[test]
fn slot_lookups_report_bounds_and_readiness() -> Result<()> {
    let params = test_params();
    let fixture = chain_spanning(&[], &[0]);
    let node = build_node(&fixture, None, &[], 0)?;

    assert!(matches!(
        node.sequencer.get_slot_leader(3, params.slot_count),
        Err(PosError::SlotIdOutOfRange { .. })
    ));
    assert!(matches!(
        node.sequencer.get_slot_leader(3, 0),
        Err(PosError::SlotLeaderGroupNotReady(3))
    ));
    assert!(!node.sequencer.slot_leaders_ready(3));
    Ok(())
}

#[test]
fn first_recorded_stage2_submission_wins() -> Result<()> {
    let secret = secret_key(55);
    let staker = staker_for(&secret, 100, 10, 0);
    let others: Vec<_> = (56..=58u64)
        .map(|seed| staker_for(&secret_key(seed), 100, 10, 0))
        .collect();
    let mut all = vec![staker.clone()];
    all.extend(others.clone());
    let fixture = chain_spanning(&all, &[0, 1]);

    let committee: Vec<WeightedProposer> = all
        .iter()
        .map(|entry| WeightedProposer {
            sec_pk: entry.sec_pk.clone(),
            bn256_pk: entry.bn256_pk.clone(),
            weight: entry.amount.as_natural().clone(),
        })
        .collect();
    let node = build_node(&fixture, Some(secret.clone()), &committee, 1)?;

    // stage 1 records the local commitment, stage 2 yields the honest payload
    node.coordinator.on_slot(1, 0)?;
    let honest = stage2_of(node.coordinator.on_slot(1, 10)?)
        .into_iter()
        .find(|payload| payload.index == 0)
        .expect("local leader holds index 0");

    // a bogus submission for the same index arrives first and sticks
    let mut bogus = honest.clone();
    bogus.alpha_pk.rotate_left(1);
    node.coordinator.record_stage2(&bogus)?;
    node.coordinator.record_stage2(&honest)?;

    fixture.state.set_byte_array(
        SLOT_LEADER_CONTRACT,
        stage2_indexes_key(1),
        encode_stage2_indexes(&[true, false, false, false]),
    );
    node.coordinator.on_slot(1, 35)?;

    // the recorded bogus shares fail validation, so the local leader is
    // invalid and no SMA is produced for epoch 2
    let (_, is_genesis) = node.sequencer.get_sma(2)?;
    assert!(is_genesis);
    Ok(())
}
