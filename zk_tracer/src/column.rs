//! Typed columns, module schemas and rows.
//!
//! A [`Row`] can only be obtained by sealing a [`RowBuilder`], which enforces
//! that every column of the [`Schema`] is assigned exactly once and that every
//! value fits its declared [`ColumnType`].

use std::fmt::{self, Display};
use std::sync::Arc;

use bitvec::prelude::*;
use ethereum_types::U256;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::container::LineCount;
use crate::error::{TraceError, TraceResult};

/// The declared type of a column.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum ColumnType {
    /// An unsigned integer of the given bit width (at most 256).
    Unsigned(u16),
    /// A boolean.
    Bool,
    /// A byte string of exactly the given length.
    Bytes(usize),
}

impl ColumnType {
    /// Number of bytes a single cell of this type occupies once encoded.
    pub const fn byte_width(&self) -> usize {
        match self {
            ColumnType::Unsigned(bits) => (*bits as usize + 7) / 8,
            ColumnType::Bool => 1,
            ColumnType::Bytes(len) => *len,
        }
    }

    pub(crate) fn zero(&self) -> ColumnValue {
        match self {
            ColumnType::Unsigned(_) => ColumnValue::Unsigned(U256::zero()),
            ColumnType::Bool => ColumnValue::Bool(false),
            ColumnType::Bytes(len) => ColumnValue::Bytes(vec![0; *len]),
        }
    }

    /// Whether `value` is of this type and fits its width.
    pub fn admits(&self, value: &ColumnValue) -> bool {
        match (self, value) {
            (ColumnType::Unsigned(bits), ColumnValue::Unsigned(v)) => {
                *bits <= 256 && v.bits() <= *bits as usize
            }
            (ColumnType::Bool, ColumnValue::Bool(_)) => true,
            (ColumnType::Bytes(len), ColumnValue::Bytes(bytes)) => bytes.len() == *len,
            _ => false,
        }
    }
}

impl Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Unsigned(bits) => write!(f, "u{bits}"),
            ColumnType::Bool => write!(f, "bool"),
            ColumnType::Bytes(len) => write!(f, "bytes{len}"),
        }
    }
}

/// The value stored in a single cell.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum ColumnValue {
    Unsigned(U256),
    Bool(bool),
    Bytes(Vec<u8>),
}

macro_rules! impl_unsigned_from_for_column_value {
    ($($type:ty),*) => {
        $(
            impl From<$type> for ColumnValue {
                fn from(v: $type) -> Self {
                    ColumnValue::Unsigned(U256::from(v))
                }
            }
        )*
    };
}

impl_unsigned_from_for_column_value!(u8, u16, u32, u64, u128, usize);

impl From<U256> for ColumnValue {
    fn from(v: U256) -> Self {
        ColumnValue::Unsigned(v)
    }
}

impl From<bool> for ColumnValue {
    fn from(v: bool) -> Self {
        ColumnValue::Bool(v)
    }
}

impl From<Vec<u8>> for ColumnValue {
    fn from(v: Vec<u8>) -> Self {
        ColumnValue::Bytes(v)
    }
}

impl From<&[u8]> for ColumnValue {
    fn from(v: &[u8]) -> Self {
        ColumnValue::Bytes(v.to_vec())
    }
}

/// A named, typed column.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub ty: ColumnType,
}

/// The ordered column set shared by every row of a module.
#[derive(Debug, Eq, PartialEq)]
pub struct Schema {
    name: String,
    columns: Vec<Column>,
    index: HashMap<String, usize>,
}

impl Schema {
    /// Builds a schema from `(column name, type)` pairs, in declaration order.
    pub fn new<I, S>(name: impl Into<String>, columns: I) -> TraceResult<Arc<Self>>
    where
        I: IntoIterator<Item = (S, ColumnType)>,
        S: Into<String>,
    {
        let name = name.into();
        let mut index = HashMap::new();
        let mut cols = Vec::new();
        for (i, (col, ty)) in columns.into_iter().enumerate() {
            let col = col.into();
            if index.insert(col.clone(), i).is_some() {
                return Err(TraceError::DuplicateColumn {
                    schema: name,
                    column: col,
                });
            }
            cols.push(Column { name: col, ty });
        }

        Ok(Arc::new(Self {
            name,
            columns: cols,
            index,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Position of `column` in the schema.
    pub fn position(&self, column: &str) -> TraceResult<usize> {
        self.index
            .get(column)
            .copied()
            .ok_or_else(|| TraceError::UnknownColumn {
                schema: self.name.clone(),
                column: column.to_string(),
            })
    }

    /// Number of bytes one row occupies once encoded.
    pub fn row_width(&self) -> usize {
        self.columns.iter().map(|c| c.ty.byte_width()).sum()
    }

    /// Starts a new row for this schema.
    pub fn row(self: &Arc<Self>) -> RowBuilder {
        RowBuilder::new(self.clone())
    }
}

/// A fully assigned record across every column of a schema.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Row {
    schema: Arc<Schema>,
    cells: Box<[ColumnValue]>,
}

impl Row {
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn cells(&self) -> &[ColumnValue] {
        &self.cells
    }

    /// Value of the named column.
    pub fn get(&self, column: &str) -> TraceResult<&ColumnValue> {
        Ok(&self.cells[self.schema.position(column)?])
    }
}

impl LineCount for Row {
    fn line_count(&self) -> usize {
        1
    }
}

/// Accumulates the cells of one row.
///
/// Assignment order is free; each column may only be set once, and
/// [`RowBuilder::seal`] fails unless all of them were.
#[derive(Debug)]
pub struct RowBuilder {
    schema: Arc<Schema>,
    cells: Vec<ColumnValue>,
    filled: BitVec,
}

impl RowBuilder {
    pub fn new(schema: Arc<Schema>) -> Self {
        let cells = schema.columns.iter().map(|c| c.ty.zero()).collect();
        let filled = bitvec![0; schema.len()];
        Self {
            schema,
            cells,
            filled,
        }
    }

    /// Assigns the named column.
    pub fn set(&mut self, column: &str, value: impl Into<ColumnValue>) -> TraceResult<&mut Self> {
        let i = self.schema.position(column)?;
        self.set_at(i, value)
    }

    /// Assigns the column at position `i` of the schema.
    pub fn set_at(&mut self, i: usize, value: impl Into<ColumnValue>) -> TraceResult<&mut Self> {
        let column = &self.schema.columns[i];
        if self.filled[i] {
            return Err(TraceError::ColumnAlreadySet(column.name.clone()));
        }

        let value = value.into();
        if !column.ty.admits(&value) {
            return Err(TraceError::ValueOutOfRange {
                column: column.name.clone(),
                ty: column.ty,
            });
        }

        self.cells[i] = value;
        self.filled.set(i, true);
        Ok(self)
    }

    /// Finalizes the row.
    pub fn seal(self) -> TraceResult<Row> {
        if !self.filled.all() {
            let unset = self
                .filled
                .iter_zeros()
                .map(|i| self.schema.columns[i].name.clone())
                .collect();
            return Err(TraceError::UnsetColumns(unset));
        }

        Ok(Row {
            schema: self.schema,
            cells: self.cells.into_boxed_slice(),
        })
    }
}
