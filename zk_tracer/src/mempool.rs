//! Speculative validation of pool transactions, each in isolation.
//!
//! Every candidate is traced on its own, on top of an empty block, and its
//! line counts are checked from zero, spillage included, to find out early
//! whether it could ever fit the prover's limits. Candidates are
//! independent, so they are validated in parallel: each worker builds its own
//! producers from the factory and only the limits and the base world state
//! are shared.

use std::sync::Arc;

use ethereum_types::H256;
use plonky2_maybe_rayon::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::host::{Transaction, WorldState};
use crate::limits::ModuleLimits;
use crate::sequencer::{ColumnProducer, Sequencer, SequencerError, TxOutcome};
use crate::validator::AdmissionVerdict;

/// Block number used for isolated validation.
const SPECULATIVE_BLOCK: u64 = 0;

/// Whether a pool transaction may stay in the pool.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum MempoolDecision {
    /// The transaction fits in an empty block.
    Accept,
    /// The transaction can never be included.
    Reject(AdmissionVerdict),
}

impl MempoolDecision {
    pub const fn is_accept(&self) -> bool {
        matches!(self, MempoolDecision::Accept)
    }
}

/// Validates pool transactions against `limits`, one fresh trace per
/// transaction.
pub struct MempoolValidator<F> {
    limits: Arc<ModuleLimits>,
    factory: F,
    world: WorldState,
}

impl<F> MempoolValidator<F>
where
    F: Fn() -> Vec<Box<dyn ColumnProducer>> + Sync,
{
    /// `factory` must return a fresh set of producers on every call.
    pub fn new(limits: Arc<ModuleLimits>, factory: F) -> Self {
        Self {
            limits,
            factory,
            world: WorldState::default(),
        }
    }

    /// World state every transaction is validated against.
    pub fn with_world(mut self, world: WorldState) -> Self {
        self.world = world;
        self
    }

    /// Traces `tx` on its own and decides whether it may stay in the pool.
    pub fn validate(&self, tx: &Transaction) -> Result<MempoolDecision, SequencerError> {
        let mut sequencer = Sequencer::new(self.limits.clone()).with_world(self.world.clone());
        for producer in (self.factory)() {
            sequencer.register(producer)?;
        }
        sequencer.begin_block(SPECULATIVE_BLOCK)?;

        // Against an all-zero baseline a transaction either fits an empty
        // block or overflows; it is never merely late for this one.
        let decision = match sequencer.process_in_isolation(tx) {
            Ok(TxOutcome::Included) => MempoolDecision::Accept,
            Ok(TxOutcome::Rejected(verdict))
            | Ok(TxOutcome::BlockFull(verdict))
            | Err(SequencerError::Admission(verdict)) => MempoolDecision::Reject(verdict),
            Err(err) => return Err(err),
        };
        debug!("mempool decision for {:?}: {:?}", tx.hash, decision);
        Ok(decision)
    }

    /// Validates every transaction of `txs` in parallel. Results keep the order
    /// of `txs`.
    pub fn validate_all(
        &self,
        txs: &[Transaction],
    ) -> Vec<(H256, Result<MempoolDecision, SequencerError>)> {
        let results: Vec<_> = txs
            .par_iter()
            .map(|tx| (tx.hash, self.validate(tx)))
            .collect();

        let rejected = results
            .iter()
            .filter(|(_, r)| matches!(r, Ok(MempoolDecision::Reject(_))))
            .count();
        info!(
            "validated {} pool transactions, {} rejected",
            results.len(),
            rejected
        );
        results
    }
}
