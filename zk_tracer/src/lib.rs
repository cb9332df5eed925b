//! Trace capture and capacity admission for a zkEVM sequencer.
//!
//! While a block is being built, every transaction is executed by a host
//! interpreter and turned into rows of many *modules* (arithmetic, memory,
//! storage, ...). The prover that later consumes those rows can only handle a
//! bounded number of lines per module, so each transaction must be checked
//! against those bounds before it is accepted into the block.
//!
//! This crate provides:
//! - a [`StackedContainer`](container::StackedContainer) per module, whose
//!   segments let a whole transaction be discarded without touching the rows
//!   already committed;
//! - a [`ModuleLedger`] that opens, commits and discards those segments
//!   across every module at once and snapshots the line counts;
//! - the capacity [`validate`] function, turning counts and
//!   [`ModuleLimits`] into an [`AdmissionVerdict`];
//! - a [`DeferRegistry`] for work that can only run at a later checkpoint;
//! - the [`Sequencer`], which drives [`ColumnProducer`]s through each
//!   candidate transaction and seals the block into a
//!   [`TraceSink`](sink::TraceSink).
//!
//! # Non-Goals
//! - The content of the columns: producers decide what goes in a row.
//! - Proving: the rows are handed over, never checked against constraints.

#![deny(rustdoc::broken_intra_doc_links)]

pub mod cache;
pub mod column;
pub mod container;
pub mod defer;
pub mod error;
pub mod host;
pub mod limits;
pub mod mempool;
pub mod module;
pub mod sequencer;
pub mod sink;
pub mod tracing;
pub mod validator;

pub use column::{ColumnType, ColumnValue, Row, RowBuilder, Schema};
pub use defer::{Checkpoint, DeferRegistry, DeferredAction};
pub use error::{TraceError, TraceResult};
pub use host::{ExecutionEvent, FrameId, Transaction, WorldState};
pub use limits::{LimitsError, ModuleLimits};
pub use mempool::{MempoolDecision, MempoolValidator};
pub use module::{LineCounts, ModuleKind, ModuleLedger, ModuleSpec};
pub use sequencer::{
    BlockOutcome, BlockTrace, ColumnProducer, Defers, Rejection, Sequencer, SequencerError,
    TraceState, TxOutcome,
};
pub use validator::{validate, AdmissionVerdict};
