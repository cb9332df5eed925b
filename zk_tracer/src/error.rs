//! Internal-consistency faults of the trace engine.
//!
//! A [`TraceError`] means the engine itself reached an impossible state: a
//! segment closed that was never opened, a row sealed with holes, a value that
//! does not fit its column. These are never business outcomes; callers
//! propagate them and abandon the block under construction, since a corrupted
//! trace is worse than no trace.

use thiserror::Error;

use crate::column::ColumnType;
use crate::defer::Checkpoint;
use crate::module::ModuleKind;

/// Stores the result of trace operations. Returns a [`TraceError`] upon
/// failure.
pub type TraceResult<T> = Result<T, TraceError>;

/// An error type for programming faults detected while building a trace.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum TraceError {
    /// A segment was popped while no segment was open.
    #[error("asymmetric pop: no open segment to discard")]
    AsymmetricPop,

    /// A segment was committed while no segment was open.
    #[error("asymmetric commit: no open segment to commit")]
    AsymmetricCommit,

    /// An item was appended while no segment was open.
    #[error("cannot append outside of an open segment")]
    NoOpenSegment,

    /// A module was addressed that was never registered in the ledger.
    #[error("module {0} is not registered")]
    UnknownModule(String),

    /// A module was registered twice.
    #[error("module {0} is already registered")]
    DuplicateModule(String),

    /// A write did not match the kind of the addressed module.
    #[error("module {module} is a {found} module, expected a {expected} module")]
    KindMismatch {
        /// Name of the addressed module.
        module: String,
        /// Kind required by the write.
        expected: ModuleKind,
        /// Kind the module was registered with.
        found: ModuleKind,
    },

    /// A row built for one schema was appended to a module with another.
    #[error("row schema {row_schema} does not match the schema of module {module}")]
    SchemaMismatch {
        /// Name of the addressed module.
        module: String,
        /// Name of the schema the row was built against.
        row_schema: String,
    },

    /// A column was assigned twice in the same row.
    #[error("column {0} assigned twice")]
    ColumnAlreadySet(String),

    /// A row was sealed before every column was assigned.
    #[error("row sealed with unassigned columns: {}", .0.join(", "))]
    UnsetColumns(Vec<String>),

    /// A schema declares the same column name twice.
    #[error("column {column} declared twice in schema {schema}")]
    DuplicateColumn {
        /// Name of the schema.
        schema: String,
        /// Name of the duplicated column.
        column: String,
    },

    /// A column name does not exist in the schema.
    #[error("column {column} does not exist in schema {schema}")]
    UnknownColumn {
        /// Name of the schema.
        schema: String,
        /// Name of the missing column.
        column: String,
    },

    /// Transaction-scoped deferred work was queued where no transaction
    /// could run it.
    #[error("{pending} {checkpoint:?} actions queued outside of a transaction")]
    DeferredOutsideTransaction {
        /// Checkpoint the actions wait for.
        checkpoint: Checkpoint,
        /// Number of such actions.
        pending: usize,
    },

    /// A value does not fit the declared type of its column.
    #[error("value for column {column} does not fit type {ty}")]
    ValueOutOfRange {
        /// Name of the column.
        column: String,
        /// Declared type of the column.
        ty: ColumnType,
    },
}
