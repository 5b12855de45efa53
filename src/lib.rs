//! Proof-of-stake leader selection core.
//!
//! From the staking state at an epoch's snapshot block and a beacon random,
//! the crate deterministically derives the epoch-leader and
//! random-beacon-proposer committees, runs the unique-leader-selection
//! stages across the epoch leaders, and turns the resulting secret message
//! array into the slot-leader sequence of the following epoch.
//!
//! `node::PosNode` wires the subsystems together: `epoch` selects and
//! persists committees, `uls` drives the per-epoch commitment/share stages,
//! and `slots` generates and serves the slot-leader sequences. `chain`
//! declares the narrow read capabilities required from the surrounding node,
//! and `storage` provides the durable indexed epoch store.

pub mod chain;
pub mod crypto;
pub mod epoch;
pub mod errors;
pub mod node;
pub mod params;
pub mod slots;
pub mod storage;
pub mod types;
pub mod uls;
pub mod weights;
