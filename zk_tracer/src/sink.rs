//! Where sealed block traces go.
//!
//! The binary layout written by [`BinaryTraceWriter`] is:
//!
//! ```text
//! header  := "ZKTR" version:u16
//! module  := name_len:u16 name row_count:u64 column_count:u16 column* cells
//! column  := name_len:u16 name type_tag:u8 type_param:u32
//! cells   := for each column, row_count cells of the column's byte width
//! ```
//!
//! All integers are big-endian. Cells are stored column-major: the prover
//! consumes one column at a time.

use std::io::{self, Write};
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use tracing::debug;

use crate::column::{ColumnType, ColumnValue, Row, Schema};

/// Magic bytes opening every binary trace.
pub const TRACE_MAGIC: &[u8; 4] = b"ZKTR";
/// Version of the binary trace layout.
pub const TRACE_VERSION: u16 = 1;

/// Receives the committed rows of each traced module once a block is sealed.
#[cfg_attr(test, mockall::automock)]
pub trait TraceSink {
    fn write_module(&mut self, name: &str, schema: &Arc<Schema>, rows: &[Row]) -> io::Result<()>;

    /// Called once every module was written.
    fn finish(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// The rows of one module, as kept by a [`MemorySink`].
#[derive(Clone, Debug)]
pub struct ModuleTrace {
    pub name: String,
    pub schema: Arc<Schema>,
    pub rows: Vec<Row>,
}

/// Keeps written modules in memory.
#[derive(Clone, Debug, Default)]
pub struct MemorySink {
    modules: Vec<ModuleTrace>,
    finished: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn modules(&self) -> &[ModuleTrace] {
        &self.modules
    }

    /// Rows written for `name`, if the module was written.
    pub fn rows(&self, name: &str) -> Option<&[Row]> {
        self.modules
            .iter()
            .find(|m| m.name == name)
            .map(|m| m.rows.as_slice())
    }

    pub const fn is_finished(&self) -> bool {
        self.finished
    }
}

impl TraceSink for MemorySink {
    fn write_module(&mut self, name: &str, schema: &Arc<Schema>, rows: &[Row]) -> io::Result<()> {
        self.modules.push(ModuleTrace {
            name: name.to_string(),
            schema: schema.clone(),
            rows: rows.to_vec(),
        });
        Ok(())
    }

    fn finish(&mut self) -> io::Result<()> {
        self.finished = true;
        Ok(())
    }
}

/// Streams modules in the columnar binary layout to `W`.
#[derive(Debug)]
pub struct BinaryTraceWriter<W: Write> {
    out: W,
    header_written: bool,
}

impl<W: Write> BinaryTraceWriter<W> {
    pub const fn new(out: W) -> Self {
        Self {
            out,
            header_written: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write_header(&mut self) -> io::Result<()> {
        if !self.header_written {
            let mut buf = BytesMut::with_capacity(TRACE_MAGIC.len() + 2);
            buf.put_slice(TRACE_MAGIC);
            buf.put_u16(TRACE_VERSION);
            self.out.write_all(&buf)?;
            self.header_written = true;
        }
        Ok(())
    }
}

fn put_name(buf: &mut BytesMut, name: &str) -> io::Result<()> {
    let len = u16::try_from(name.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("name {name} is too long to encode"),
        )
    })?;
    buf.put_u16(len);
    buf.put_slice(name.as_bytes());
    Ok(())
}

fn put_type(buf: &mut BytesMut, ty: ColumnType) -> io::Result<()> {
    let (tag, param) = match ty {
        ColumnType::Unsigned(bits) => (0u8, u32::from(bits)),
        ColumnType::Bool => (1, 0),
        ColumnType::Bytes(len) => (
            2,
            u32::try_from(len).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidInput, "byte column is too wide")
            })?,
        ),
    };
    buf.put_u8(tag);
    buf.put_u32(param);
    Ok(())
}

fn put_cell(buf: &mut BytesMut, ty: ColumnType, value: &ColumnValue) {
    match value {
        ColumnValue::Unsigned(v) => {
            let mut word = [0u8; 32];
            v.to_big_endian(&mut word);
            buf.put_slice(&word[32 - ty.byte_width()..]);
        }
        ColumnValue::Bool(b) => buf.put_u8(u8::from(*b)),
        ColumnValue::Bytes(bytes) => buf.put_slice(bytes),
    }
}

impl<W: Write> TraceSink for BinaryTraceWriter<W> {
    fn write_module(&mut self, name: &str, schema: &Arc<Schema>, rows: &[Row]) -> io::Result<()> {
        self.write_header()?;

        let columns = schema.columns();
        let mut buf = BytesMut::with_capacity(64 + rows.len() * schema.row_width());
        put_name(&mut buf, name)?;
        buf.put_u64(rows.len() as u64);
        let column_count = u16::try_from(columns.len()).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "schema {} has {} columns, too many to encode",
                    schema.name(),
                    columns.len()
                ),
            )
        })?;
        buf.put_u16(column_count);
        for column in columns {
            put_name(&mut buf, &column.name)?;
            put_type(&mut buf, column.ty)?;
        }
        for (i, column) in columns.iter().enumerate() {
            for row in rows {
                put_cell(&mut buf, column.ty, &row.cells()[i]);
            }
        }

        self.out.write_all(&buf)?;
        debug!("wrote {} rows ({} bytes) for module {}", rows.len(), buf.len(), name);
        Ok(())
    }

    fn finish(&mut self) -> io::Result<()> {
        self.write_header()?;
        self.out.flush()
    }
}
