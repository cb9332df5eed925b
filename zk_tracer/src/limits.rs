//! Prover capacity limits per module.
//!
//! Limits come from a flat, human-editable mapping of module name to maximum
//! cumulative line count, either as TOML (top-level keys or a
//! `[traces-limits]` table) or as a JSON object. They are loaded once and
//! never mutated; share them across threads behind an [`Arc`](std::sync::Arc).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Name of the TOML table holding the limits, when they are not top-level.
pub const TRACES_LIMITS_TABLE: &str = "traces-limits";

/// An error raised while loading module limits.
#[derive(Debug, Error)]
pub enum LimitsError {
    #[error("failed to read limits file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed TOML limits: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("malformed JSON limits: {0}")]
    Json(#[from] serde_path_to_error::Error<serde_json::Error>),

    #[error("limit for module {0} is not a non-negative integer")]
    InvalidLimit(String),

    #[error("unsupported limits file format {}, expected .toml or .json", .0.display())]
    UnsupportedFormat(PathBuf),
}

/// Immutable mapping from module name to its maximum cumulative line count.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModuleLimits {
    limits: BTreeMap<String, u64>,
}

impl ModuleLimits {
    /// Parses limits from TOML.
    pub fn from_toml_str(s: &str) -> Result<Self, LimitsError> {
        let root = s.parse::<toml::Table>()?;
        let table = match root.get(TRACES_LIMITS_TABLE) {
            Some(toml::Value::Table(table)) => table,
            _ => &root,
        };

        let limits = table
            .iter()
            .map(|(module, value)| match value {
                toml::Value::Integer(limit) if *limit >= 0 => Ok((module.clone(), *limit as u64)),
                _ => Err(LimitsError::InvalidLimit(module.clone())),
            })
            .collect::<Result<_, _>>()?;

        Ok(Self { limits })
    }

    /// Parses limits from a JSON object.
    pub fn from_json_str(s: &str) -> Result<Self, LimitsError> {
        let des = &mut serde_json::Deserializer::from_str(s);
        let limits: BTreeMap<String, u64> = serde_path_to_error::deserialize(des)?;
        Ok(Self { limits })
    }

    /// Loads limits from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> Result<Self, LimitsError> {
        let contents = fs::read_to_string(path).map_err(|source| LimitsError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let limits = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&contents)?,
            Some("json") => Self::from_json_str(&contents)?,
            _ => return Err(LimitsError::UnsupportedFormat(path.to_path_buf())),
        };
        info!(
            "loaded limits for {} modules from {}",
            limits.len(),
            path.display()
        );
        Ok(limits)
    }

    /// Limit of `module`, if the module is defined.
    pub fn get(&self, module: &str) -> Option<u64> {
        self.limits.get(module).copied()
    }

    pub fn contains(&self, module: &str) -> bool {
        self.limits.contains_key(module)
    }

    pub fn len(&self) -> usize {
        self.limits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limits.is_empty()
    }

    /// Iterates over `(module, limit)` pairs in lexicographic order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.limits.iter().map(|(m, l)| (m.as_str(), *l))
    }
}

impl FromStr for ModuleLimits {
    type Err = LimitsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_toml_str(s)
    }
}

impl<S: Into<String>> FromIterator<(S, u64)> for ModuleLimits {
    fn from_iter<I: IntoIterator<Item = (S, u64)>>(iter: I) -> Self {
        Self {
            limits: iter.into_iter().map(|(m, l)| (m.into(), l)).collect(),
        }
    }
}
