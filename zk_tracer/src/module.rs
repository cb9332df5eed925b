//! Per-module row accounting.
//!
//! The [`ModuleLedger`] owns one [`StackedContainer`] per registered module and
//! opens, commits or discards a segment in all of them at once, so that the
//! contribution of a whole transaction can be rolled back as a unit.

use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::sync::Arc;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::column::{Row, Schema};
use crate::container::{LineCount, StackedContainer};
use crate::error::{TraceError, TraceResult};

/// Reported line count per module name.
///
/// Counts are signed so that an upstream accounting bug surfaces as a negative
/// value instead of wrapping around.
pub type LineCounts = BTreeMap<String, i64>;

/// How a module accounts for its lines.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum ModuleKind {
    /// Stores complete rows; each row is one line.
    Traced,
    /// Stores line tallies only.
    Counting,
    /// Counts one line per call, and saturates once anything is detected.
    Detecting,
}

impl Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleKind::Traced => write!(f, "traced"),
            ModuleKind::Counting => write!(f, "counting"),
            ModuleKind::Detecting => write!(f, "detecting"),
        }
    }
}

/// The outcome of one call into a detecting module.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Detection(pub bool);

impl LineCount for Detection {
    fn line_count(&self) -> usize {
        if self.0 {
            usize::MAX
        } else {
            1
        }
    }
}

#[derive(Clone, Debug)]
enum Layout {
    Traced(Arc<Schema>),
    Counting,
    Detecting,
}

/// Declaration of a module, as registered in a [`ModuleLedger`].
#[derive(Clone, Debug)]
pub struct ModuleSpec {
    name: String,
    layout: Layout,
    spillage: usize,
    checked: bool,
}

impl ModuleSpec {
    /// A module storing rows of `schema`, named after the schema.
    pub fn traced(schema: Arc<Schema>) -> Self {
        Self {
            name: schema.name().to_string(),
            layout: Layout::Traced(schema),
            spillage: 0,
            checked: true,
        }
    }

    pub fn counting(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            layout: Layout::Counting,
            spillage: 0,
            checked: true,
        }
    }

    pub fn detecting(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            layout: Layout::Detecting,
            spillage: 0,
            checked: true,
        }
    }

    /// Padding lines the prover appends to this module; added to every
    /// reported count.
    pub fn with_spillage(mut self, spillage: usize) -> Self {
        self.spillage = spillage;
        self
    }

    /// Marks the module's own counting as unreliable: it keeps its rows but
    /// always reports a count of zero.
    pub fn unchecked(mut self) -> Self {
        self.checked = false;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ModuleKind {
        match self.layout {
            Layout::Traced(_) => ModuleKind::Traced,
            Layout::Counting => ModuleKind::Counting,
            Layout::Detecting => ModuleKind::Detecting,
        }
    }

    /// Row schema of a traced module.
    pub fn schema(&self) -> Option<&Arc<Schema>> {
        match &self.layout {
            Layout::Traced(schema) => Some(schema),
            _ => None,
        }
    }

    pub const fn spillage(&self) -> usize {
        self.spillage
    }

    pub const fn is_checked(&self) -> bool {
        self.checked
    }
}

#[derive(Debug)]
enum ModuleStore {
    Traced {
        schema: Arc<Schema>,
        rows: StackedContainer<Row>,
    },
    Counting(StackedContainer<usize>),
    Detecting(StackedContainer<Detection>),
}

impl ModuleStore {
    fn new(spec: &ModuleSpec) -> Self {
        match &spec.layout {
            Layout::Traced(schema) => ModuleStore::Traced {
                schema: schema.clone(),
                rows: StackedContainer::new(),
            },
            Layout::Counting => ModuleStore::Counting(StackedContainer::new()),
            Layout::Detecting => ModuleStore::Detecting(StackedContainer::new()),
        }
    }

    fn kind(&self) -> ModuleKind {
        match self {
            ModuleStore::Traced { .. } => ModuleKind::Traced,
            ModuleStore::Counting(_) => ModuleKind::Counting,
            ModuleStore::Detecting(_) => ModuleKind::Detecting,
        }
    }

    fn enter(&mut self) {
        match self {
            ModuleStore::Traced { rows, .. } => rows.enter(),
            ModuleStore::Counting(c) => c.enter(),
            ModuleStore::Detecting(c) => c.enter(),
        }
    }

    fn commit(&mut self) -> TraceResult<()> {
        match self {
            ModuleStore::Traced { rows, .. } => rows.commit(),
            ModuleStore::Counting(c) => c.commit(),
            ModuleStore::Detecting(c) => c.commit(),
        }
    }

    fn pop(&mut self) -> TraceResult<usize> {
        match self {
            ModuleStore::Traced { rows, .. } => rows.pop(),
            ModuleStore::Counting(c) => c.pop(),
            ModuleStore::Detecting(c) => c.pop(),
        }
    }

    fn size(&self) -> usize {
        match self {
            ModuleStore::Traced { rows, .. } => rows.size(),
            ModuleStore::Counting(c) => c.size(),
            ModuleStore::Detecting(c) => c.size(),
        }
    }

    fn clear(&mut self) {
        match self {
            ModuleStore::Traced { rows, .. } => rows.clear(),
            ModuleStore::Counting(c) => c.clear(),
            ModuleStore::Detecting(c) => c.clear(),
        }
    }
}

#[derive(Debug)]
struct ModuleEntry {
    spec: ModuleSpec,
    store: ModuleStore,
}

impl ModuleEntry {
    /// Count as seen by the capacity validator.
    fn reported_count(&self) -> i64 {
        if !self.spec.checked {
            return 0;
        }
        let lines = self.store.size().saturating_add(self.spec.spillage);
        i64::try_from(lines).unwrap_or(i64::MAX)
    }
}

/// Row storage and line accounting for every module of a block.
#[derive(Debug, Default)]
pub struct ModuleLedger {
    modules: Vec<ModuleEntry>,
    index: HashMap<String, usize>,
    depth: usize,
}

impl ModuleLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a module. A module registered while transactions are open
    /// joins them with empty segments.
    pub fn register(&mut self, spec: ModuleSpec) -> TraceResult<()> {
        if self.index.contains_key(spec.name()) {
            return Err(TraceError::DuplicateModule(spec.name.clone()));
        }

        let mut store = ModuleStore::new(&spec);
        for _ in 0..self.depth {
            store.enter();
        }
        debug!("registered {} module {}", spec.kind(), spec.name);
        self.index.insert(spec.name.clone(), self.modules.len());
        self.modules.push(ModuleEntry { spec, store });
        Ok(())
    }

    pub fn contains(&self, module: &str) -> bool {
        self.index.contains_key(module)
    }

    /// Names of the registered modules, in registration order.
    pub fn module_names(&self) -> impl Iterator<Item = &str> {
        self.modules.iter().map(|m| m.spec.name())
    }

    /// Number of open transactional segments.
    pub const fn depth(&self) -> usize {
        self.depth
    }

    /// Opens a segment in every registered module.
    pub fn begin_transaction(&mut self) {
        for m in &mut self.modules {
            m.store.enter();
        }
        self.depth += 1;
    }

    /// Keeps the rows of the innermost transaction.
    pub fn commit_transaction(&mut self) -> TraceResult<()> {
        if self.depth == 0 {
            error!("commit requested without an open transaction");
            return Err(TraceError::AsymmetricCommit);
        }
        for m in &mut self.modules {
            m.store.commit()?;
        }
        self.depth -= 1;
        Ok(())
    }

    /// Drops every row of the innermost transaction.
    pub fn discard_transaction(&mut self) -> TraceResult<()> {
        if self.depth == 0 {
            error!("discard requested without an open transaction");
            return Err(TraceError::AsymmetricPop);
        }
        for m in &mut self.modules {
            let lines = m.store.pop()?;
            if lines > 0 {
                debug!("discarded {} lines from module {}", lines, m.spec.name);
            }
        }
        self.depth -= 1;
        Ok(())
    }

    fn entry(&self, module: &str) -> TraceResult<&ModuleEntry> {
        self.index
            .get(module)
            .map(|&i| &self.modules[i])
            .ok_or_else(|| TraceError::UnknownModule(module.to_string()))
    }

    fn entry_mut(&mut self, module: &str) -> TraceResult<&mut ModuleEntry> {
        match self.index.get(module) {
            Some(&i) => Ok(&mut self.modules[i]),
            None => Err(TraceError::UnknownModule(module.to_string())),
        }
    }

    /// Raw number of lines produced by `module`, committed and open, without
    /// spillage.
    pub fn current_row_count(&self, module: &str) -> TraceResult<usize> {
        Ok(self.entry(module)?.store.size())
    }

    /// Line count of `module` as reported to the capacity validator.
    pub fn line_count(&self, module: &str) -> TraceResult<i64> {
        Ok(self.entry(module)?.reported_count())
    }

    /// Immutable view of every module's reported line count.
    pub fn snapshot_counts(&self) -> LineCounts {
        self.modules
            .iter()
            .map(|m| (m.spec.name.clone(), m.reported_count()))
            .collect()
    }

    /// Appends a sealed row to a traced module.
    pub fn append_row(&mut self, module: &str, row: Row) -> TraceResult<()> {
        let entry = self.entry_mut(module)?;
        match &mut entry.store {
            ModuleStore::Traced { schema, rows } => {
                if !Arc::ptr_eq(schema, row.schema()) && **schema != **row.schema() {
                    return Err(TraceError::SchemaMismatch {
                        module: module.to_string(),
                        row_schema: row.schema().name().to_string(),
                    });
                }
                rows.append(row)
            }
            other => Err(TraceError::KindMismatch {
                module: module.to_string(),
                expected: ModuleKind::Traced,
                found: other.kind(),
            }),
        }
    }

    /// Adds `lines` to a counting module.
    pub fn tally(&mut self, module: &str, lines: usize) -> TraceResult<()> {
        let entry = self.entry_mut(module)?;
        match &mut entry.store {
            ModuleStore::Counting(c) => c.append(lines),
            other => Err(TraceError::KindMismatch {
                module: module.to_string(),
                expected: ModuleKind::Counting,
                found: other.kind(),
            }),
        }
    }

    /// Records one call into a detecting module.
    pub fn detect(&mut self, module: &str, hit: bool) -> TraceResult<()> {
        let entry = self.entry_mut(module)?;
        match &mut entry.store {
            ModuleStore::Detecting(c) => {
                if hit {
                    debug!("module {} detected an unprovable operation", module);
                }
                c.append(Detection(hit))
            }
            other => Err(TraceError::KindMismatch {
                module: module.to_string(),
                expected: ModuleKind::Detecting,
                found: other.kind(),
            }),
        }
    }

    /// Committed rows of a traced module.
    pub fn committed_rows(&self, module: &str) -> TraceResult<&[Row]> {
        match &self.entry(module)?.store {
            ModuleStore::Traced { rows, .. } => Ok(rows.committed()),
            other => Err(TraceError::KindMismatch {
                module: module.to_string(),
                expected: ModuleKind::Traced,
                found: other.kind(),
            }),
        }
    }

    /// Every traced module with its schema and committed rows, in
    /// registration order.
    pub fn traced_modules(&self) -> impl Iterator<Item = (&str, &Arc<Schema>, &[Row])> {
        self.modules.iter().filter_map(|m| match &m.store {
            ModuleStore::Traced { schema, rows } => {
                Some((m.spec.name(), schema, rows.committed()))
            }
            _ => None,
        })
    }

    /// Forgets every row and closes every segment, keeping registrations.
    pub fn reset(&mut self) {
        for m in &mut self.modules {
            m.store.clear();
        }
        self.depth = 0;
    }
}
