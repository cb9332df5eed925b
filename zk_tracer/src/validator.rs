//! Admission control: does a transaction's line contribution fit the prover's
//! capacity?
//!
//! The key distinction is between a transaction that can never fit
//! ([`AdmissionVerdict::TxRowOverflow`]: its own contribution exceeds a
//! module's limit) and one that only fails to fit in the current block
//! ([`AdmissionVerdict::BlockModuleFull`]).

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::limits::ModuleLimits;
use crate::module::LineCounts;

/// The classified outcome of one validation call.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdmissionVerdict {
    /// Every module fits.
    Valid,
    /// A module produced lines but has no configured limit.
    ModuleNotDefined { module: String },
    /// A module reported a negative line count.
    InvalidLineCount { module: String, count: i64 },
    /// The transaction alone exceeds the module limit; it can never be
    /// included.
    TxRowOverflow {
        module: String,
        tx_lines: i64,
        limit: u64,
        cumulative: i64,
    },
    /// The transaction fits on its own but not on top of the block built so
    /// far.
    BlockModuleFull {
        module: String,
        tx_lines: i64,
        limit: u64,
        cumulative: i64,
    },
}

impl AdmissionVerdict {
    pub const fn is_valid(&self) -> bool {
        matches!(self, AdmissionVerdict::Valid)
    }

    /// Whether the transaction should be removed from the pool for good.
    pub const fn is_tx_rejection(&self) -> bool {
        matches!(
            self,
            AdmissionVerdict::TxRowOverflow { .. }
                | AdmissionVerdict::ModuleNotDefined { .. }
                | AdmissionVerdict::InvalidLineCount { .. }
        )
    }

    /// Whether the block should be sealed and the transaction retried in the
    /// next one.
    pub const fn is_block_full(&self) -> bool {
        matches!(self, AdmissionVerdict::BlockModuleFull { .. })
    }

    /// Whether the verdict reveals a configuration or accounting fault that
    /// must stop block construction.
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            AdmissionVerdict::ModuleNotDefined { .. } | AdmissionVerdict::InvalidLineCount { .. }
        )
    }

    /// The module responsible for a non-valid verdict.
    pub fn module(&self) -> Option<&str> {
        match self {
            AdmissionVerdict::Valid => None,
            AdmissionVerdict::ModuleNotDefined { module }
            | AdmissionVerdict::InvalidLineCount { module, .. }
            | AdmissionVerdict::TxRowOverflow { module, .. }
            | AdmissionVerdict::BlockModuleFull { module, .. } => Some(module),
        }
    }
}

impl Display for AdmissionVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionVerdict::Valid => write!(f, "valid"),
            AdmissionVerdict::ModuleNotDefined { module } => {
                write!(f, "module {module} is not defined in the limits")
            }
            AdmissionVerdict::InvalidLineCount { module, count } => {
                write!(f, "module {module} reported an invalid line count {count}")
            }
            AdmissionVerdict::TxRowOverflow {
                module,
                tx_lines,
                limit,
                cumulative,
            } => write!(
                f,
                "transaction line count for module {module}={tx_lines} is above the limit {limit} (cumulative {cumulative})"
            ),
            AdmissionVerdict::BlockModuleFull {
                module,
                tx_lines,
                limit,
                cumulative,
            } => write!(
                f,
                "cumulated line count for module {module}={cumulative} is above the limit {limit} (transaction {tx_lines})"
            ),
        }
    }
}

/// Compares `current` line counts against `limits`, using `previous` as the
/// counts before the transaction under test.
///
/// Modules are checked in lexicographic order and the first intolerable one
/// decides the verdict. A module missing from `previous` counts as zero, so an
/// empty `previous` validates a transaction in isolation.
pub fn validate(
    limits: &ModuleLimits,
    current: &LineCounts,
    previous: &LineCounts,
) -> AdmissionVerdict {
    for (module, &count) in current {
        if count < 0 {
            error!("module {} reported a negative line count {}", module, count);
            return AdmissionVerdict::InvalidLineCount {
                module: module.clone(),
                count,
            };
        }

        let Some(limit) = limits.get(module) else {
            error!("module {} is not defined in the line limits", module);
            return AdmissionVerdict::ModuleNotDefined {
                module: module.clone(),
            };
        };
        let bound = i64::try_from(limit).unwrap_or(i64::MAX);

        let before = previous.get(module).copied().unwrap_or_default();
        let tx_lines = count.saturating_sub(before);
        if tx_lines > bound {
            return AdmissionVerdict::TxRowOverflow {
                module: module.clone(),
                tx_lines,
                limit,
                cumulative: count,
            };
        }

        if count > bound {
            return AdmissionVerdict::BlockModuleFull {
                module: module.clone(),
                tx_lines,
                limit,
                cumulative: count,
            };
        }
    }

    AdmissionVerdict::Valid
}
