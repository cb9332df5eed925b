//! Block construction: drives producers through the events of each candidate
//! transaction and decides, from the resulting line counts, whether the
//! transaction is kept.
//!
//! Every transaction runs inside its own transactional segment. Its rows,
//! deferred actions and world-state effects are committed together if the
//! capacity validator accepts it, and dropped together otherwise.

use std::fmt::{self, Display};
use std::io;
use std::sync::Arc;

use ethereum_types::H256;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, debug_span, error, info, info_span, warn};

use crate::defer::{DeferCheckpoint, DeferRegistry};
use crate::error::{TraceError, TraceResult};
use crate::host::{ExecutionEvent, Transaction, WorldState};
use crate::limits::ModuleLimits;
use crate::module::{LineCounts, ModuleLedger, ModuleSpec};
use crate::sink::TraceSink;
use crate::validator::{validate, AdmissionVerdict};

/// Everything producers and deferred actions may read or write while a block
/// is being built.
#[derive(Debug, Default)]
pub struct TraceState {
    pub ledger: ModuleLedger,
    pub world: WorldState,
    pub block_number: u64,
}

/// Registry of deferred actions over the trace state.
pub type Defers = DeferRegistry<TraceState>;

/// A unit that turns execution events into rows of one or more modules.
///
/// Producers should keep any per-transaction state in the ledger, the world
/// state or deferred actions: those are rolled back when a transaction is
/// dropped, the producer itself is not.
pub trait ColumnProducer {
    /// The modules this producer writes to.
    fn modules(&self) -> Vec<ModuleSpec>;

    fn on_block_start(&mut self, _state: &mut TraceState, _defers: &mut Defers) -> TraceResult<()> {
        Ok(())
    }

    fn on_transaction_start(
        &mut self,
        _tx: &Transaction,
        _state: &mut TraceState,
        _defers: &mut Defers,
    ) -> TraceResult<()> {
        Ok(())
    }

    fn on_event(
        &mut self,
        _event: &ExecutionEvent,
        _state: &mut TraceState,
        _defers: &mut Defers,
    ) -> TraceResult<()> {
        Ok(())
    }

    fn on_transaction_end(
        &mut self,
        _tx: &Transaction,
        _state: &mut TraceState,
        _defers: &mut Defers,
    ) -> TraceResult<()> {
        Ok(())
    }

    fn on_block_end(&mut self, _state: &mut TraceState, _defers: &mut Defers) -> TraceResult<()> {
        Ok(())
    }
}

/// An error that stops the construction of the current block.
#[derive(Debug, Error)]
pub enum SequencerError {
    /// The trace engine reached an inconsistent state.
    #[error(transparent)]
    Trace(#[from] TraceError),

    /// A transaction revealed a configuration or accounting fault.
    #[error("block construction aborted: {0}")]
    Admission(AdmissionVerdict),

    /// Cancellation was requested.
    #[error("block construction was cancelled")]
    Aborted,

    #[error("no block is being built")]
    NoOpenBlock,

    /// The sealed trace could not be written out.
    #[error("failed to write trace: {0}")]
    Sink(#[from] io::Error),
}

/// What happened to one candidate transaction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TxOutcome {
    /// The transaction's rows are part of the block.
    Included,
    /// The transaction can never be proven; drop it from the pool.
    Rejected(AdmissionVerdict),
    /// The block has no room left for the transaction; retry it in the next
    /// one.
    BlockFull(AdmissionVerdict),
}

/// A transaction dropped for good, with the reason.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub hash: H256,
    pub verdict: AdmissionVerdict,
}

/// Summary of a sealed block.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct BlockTrace {
    pub block_number: u64,
    /// Number of transactions included.
    pub transactions: usize,
    /// Reported line count per module, spillage included.
    pub line_counts: LineCounts,
}

impl Display for BlockTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "block {} ({} txs): {}",
            self.block_number,
            self.transactions,
            self.line_counts
                .iter()
                .map(|(module, count)| format!("{module}={count}"))
                .join(", ")
        )
    }
}

/// Result of [`Sequencer::build_block`].
#[derive(Clone, Debug)]
pub struct BlockOutcome {
    /// Hashes of the included transactions, in order.
    pub included: Vec<H256>,
    pub rejected: Vec<Rejection>,
    /// Candidates left for the next block, starting with the one that did not
    /// fit.
    pub pending: Vec<Transaction>,
    pub trace: BlockTrace,
}

/// What a transaction's line counts are measured against.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Baseline {
    /// The counts of the block built so far.
    Block,
    /// All zeros: the transaction must fit on its own, spillage and
    /// block-level rows included.
    Empty,
}

/// Builds blocks one transaction at a time under the configured limits.
pub struct Sequencer {
    limits: Arc<ModuleLimits>,
    producers: Vec<Box<dyn ColumnProducer>>,
    state: TraceState,
    defers: Defers,
    /// World state as it was when the current block began. Cloned once per
    /// block; transactions are undone through the world state journal.
    block_world: WorldState,
    open_block: bool,
    included: usize,
}

impl Sequencer {
    pub fn new(limits: Arc<ModuleLimits>) -> Self {
        Self {
            limits,
            producers: vec![],
            state: TraceState::default(),
            defers: DeferRegistry::new(),
            block_world: WorldState::default(),
            open_block: false,
            included: 0,
        }
    }

    /// Sets the world state the first block starts from.
    pub fn with_world(mut self, world: WorldState) -> Self {
        self.state.world = world;
        self
    }

    /// Registers `producer` and every module it declares.
    pub fn register(&mut self, producer: Box<dyn ColumnProducer>) -> TraceResult<()> {
        for spec in producer.modules() {
            if !self.limits.contains(spec.name()) {
                warn!("module {} has no configured line limit", spec.name());
            }
            self.state.ledger.register(spec)?;
        }
        self.producers.push(producer);
        Ok(())
    }

    pub fn limits(&self) -> &Arc<ModuleLimits> {
        &self.limits
    }

    pub fn ledger(&self) -> &ModuleLedger {
        &self.state.ledger
    }

    pub fn world(&self) -> &WorldState {
        &self.state.world
    }

    pub fn defers(&self) -> &Defers {
        &self.defers
    }

    pub const fn is_block_open(&self) -> bool {
        self.open_block
    }

    /// Forgets the previous block and runs the block-start hooks. Rows they
    /// produce are committed right away.
    pub fn begin_block(&mut self, block_number: u64) -> Result<(), SequencerError> {
        if self.open_block {
            warn!(
                "starting block {} while block {} was never sealed",
                block_number, self.state.block_number
            );
        }
        self.state.ledger.reset();
        self.defers.clear_all();
        self.state.world.commit_journal();
        self.block_world = self.state.world.clone();
        self.state.block_number = block_number;
        self.open_block = true;
        self.included = 0;

        self.state.ledger.begin_transaction();
        let res = self
            .producers
            .iter_mut()
            .try_for_each(|p| p.on_block_start(&mut self.state, &mut self.defers))
            .and_then(|()| self.defers.ensure_no_transaction_scope());
        self.close_or_abort(res)?;
        debug!("block {} started", block_number);
        Ok(())
    }

    /// Traces `tx` on top of the current block and classifies it.
    pub fn process_transaction(&mut self, tx: &Transaction) -> Result<TxOutcome, SequencerError> {
        self.process_transaction_with(tx, Baseline::Block, &|| false)
    }

    /// Traces `tx` on top of the current block but measures it against an
    /// all-zero baseline, so that a transaction that cannot fit any block is
    /// rejected rather than reported as [`TxOutcome::BlockFull`].
    ///
    /// Meant for a block holding no transaction yet, as in speculative pool
    /// validation.
    pub fn process_in_isolation(&mut self, tx: &Transaction) -> Result<TxOutcome, SequencerError> {
        if self.included > 0 {
            warn!(
                "isolated validation of {:?} on top of {} transactions",
                tx.hash, self.included
            );
        }
        self.process_transaction_with(tx, Baseline::Empty, &|| false)
    }

    fn process_transaction_with(
        &mut self,
        tx: &Transaction,
        baseline: Baseline,
        should_abort: &dyn Fn() -> bool,
    ) -> Result<TxOutcome, SequencerError> {
        if !self.open_block {
            return Err(SequencerError::NoOpenBlock);
        }
        let _span = debug_span!("tx", hash = ?tx.hash).entered();

        let previous = match baseline {
            Baseline::Block => self.state.ledger.snapshot_counts(),
            Baseline::Empty => LineCounts::new(),
        };
        let checkpoint = match self.defers.checkpoint() {
            Ok(checkpoint) => checkpoint,
            Err(err) => {
                self.abort_block();
                return Err(err.into());
            }
        };
        self.state.world.open_journal();
        self.state.ledger.begin_transaction();

        if let Err(err) = self.run_transaction(tx, should_abort) {
            self.abort_block();
            return Err(err);
        }

        let current = self.state.ledger.snapshot_counts();
        let verdict = validate(&self.limits, &current, &previous);
        if verdict.is_valid() {
            self.state.ledger.commit_transaction()?;
            self.state.world.commit_journal();
            self.included += 1;
            debug!("included transaction {:?}", tx.hash);
            return Ok(TxOutcome::Included);
        }

        self.rollback_transaction(checkpoint)?;
        if verdict.is_fatal() {
            error!("aborting block {}: {}", self.state.block_number, verdict);
            self.abort_block();
            Err(SequencerError::Admission(verdict))
        } else if verdict.is_block_full() {
            info!("block {} is full: {}", self.state.block_number, verdict);
            Ok(TxOutcome::BlockFull(verdict))
        } else {
            warn!("rejected transaction {:?}: {}", tx.hash, verdict);
            Ok(TxOutcome::Rejected(verdict))
        }
    }

    fn run_transaction(
        &mut self,
        tx: &Transaction,
        should_abort: &dyn Fn() -> bool,
    ) -> Result<(), SequencerError> {
        for p in &mut self.producers {
            p.on_transaction_start(tx, &mut self.state, &mut self.defers)?;
        }

        for event in &tx.events {
            if should_abort() {
                info!("cancelled while tracing transaction {:?}", tx.hash);
                return Err(SequencerError::Aborted);
            }
            for p in &mut self.producers {
                p.on_event(event, &mut self.state, &mut self.defers)?;
            }
            match event {
                ExecutionEvent::Opcode { .. } => self.defers.fire_end_of_opcode(&mut self.state)?,
                ExecutionEvent::ContextEnter { parent, .. } => {
                    self.defers.fire_next_context(&mut self.state, *parent)?
                }
                ExecutionEvent::ContextExit { .. } => {}
            }
        }

        for p in &mut self.producers {
            p.on_transaction_end(tx, &mut self.state, &mut self.defers)?;
        }
        self.defers.fire_end_of_transaction(&mut self.state)?;

        let stale = self.defers.clear_transaction_scope();
        if stale > 0 {
            debug!("dropped {} actions targeting finished frames", stale);
        }
        Ok(())
    }

    fn rollback_transaction(&mut self, checkpoint: DeferCheckpoint) -> TraceResult<()> {
        self.state.ledger.discard_transaction()?;
        self.defers.rollback(checkpoint);
        self.state.world.revert_journal();
        Ok(())
    }

    /// Commits the segment opened for block-level hooks, or abandons the
    /// block if a hook failed.
    fn close_or_abort(&mut self, res: TraceResult<()>) -> Result<(), SequencerError> {
        match res.and_then(|()| self.state.ledger.commit_transaction()) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.abort_block();
                Err(err.into())
            }
        }
    }

    /// Drops everything produced since the block began.
    fn abort_block(&mut self) {
        warn!("abandoning block {}", self.state.block_number);
        self.state.ledger.reset();
        self.defers.clear_all();
        self.state.world = self.block_world.clone();
        self.open_block = false;
        self.included = 0;
    }

    /// Runs the block-end hooks and end-of-block actions, then hands the
    /// committed rows of every traced module to `sink`.
    pub fn seal_block<S>(&mut self, sink: &mut S) -> Result<BlockTrace, SequencerError>
    where
        S: TraceSink + ?Sized,
    {
        if !self.open_block {
            return Err(SequencerError::NoOpenBlock);
        }

        self.state.ledger.begin_transaction();
        let res = self
            .producers
            .iter_mut()
            .try_for_each(|p| p.on_block_end(&mut self.state, &mut self.defers))
            .and_then(|()| self.defers.fire_end_of_block(&mut self.state))
            .and_then(|()| self.defers.ensure_no_transaction_scope());
        self.close_or_abort(res)?;

        let line_counts = self.state.ledger.snapshot_counts();
        let overall = validate(&self.limits, &line_counts, &line_counts);
        if !overall.is_valid() {
            warn!("sealed block {} exceeds limits: {}", self.state.block_number, overall);
        }

        let written = self
            .state
            .ledger
            .traced_modules()
            .try_for_each(|(name, schema, rows)| sink.write_module(name, schema, rows))
            .and_then(|()| sink.finish());
        if let Err(err) = written {
            self.abort_block();
            return Err(err.into());
        }

        let trace = BlockTrace {
            block_number: self.state.block_number,
            transactions: self.included,
            line_counts,
        };
        self.open_block = false;
        info!("sealed {}", trace);
        Ok(trace)
    }

    /// Builds and seals a whole block from `candidates`, in order.
    ///
    /// Construction stops at the first transaction that does not fit: it and
    /// every later candidate are returned as pending. A transaction that does
    /// not fit while no transaction was included yet can never fit and is
    /// rejected instead. `should_abort` is polled before each transaction and
    /// each event.
    pub fn build_block<I, S, F>(
        &mut self,
        block_number: u64,
        candidates: I,
        sink: &mut S,
        should_abort: F,
    ) -> Result<BlockOutcome, SequencerError>
    where
        I: IntoIterator<Item = Transaction>,
        S: TraceSink + ?Sized,
        F: Fn() -> bool,
    {
        let _span = info_span!("build_block", block_number).entered();
        self.begin_block(block_number)?;

        let mut included = vec![];
        let mut rejected = vec![];
        let mut pending = vec![];
        let mut candidates = candidates.into_iter();
        while let Some(tx) = candidates.next() {
            if should_abort() {
                info!("cancelled before transaction {:?}", tx.hash);
                self.abort_block();
                return Err(SequencerError::Aborted);
            }

            match self.process_transaction_with(&tx, Baseline::Block, &should_abort)? {
                TxOutcome::Included => included.push(tx.hash),
                TxOutcome::Rejected(verdict) => rejected.push(Rejection {
                    hash: tx.hash,
                    verdict,
                }),
                TxOutcome::BlockFull(verdict) if included.is_empty() => {
                    warn!(
                        "rejected transaction {:?}, it does not fit an empty block: {}",
                        tx.hash, verdict
                    );
                    rejected.push(Rejection {
                        hash: tx.hash,
                        verdict,
                    });
                }
                TxOutcome::BlockFull(_) => {
                    pending.push(tx);
                    pending.extend(candidates);
                    break;
                }
            }
        }

        let trace = self.seal_block(sink)?;
        Ok(BlockOutcome {
            included,
            rejected,
            pending,
            trace,
        })
    }
}
