//! A segmented arena giving "enter / commit / pop" semantics over a flat
//! sequence of items.
//!
//! Items live in a single growable vector. Every open segment is described by
//! the index of its first item and the number of lines it holds, so that
//! discarding a segment is a truncation and reading the line count never
//! traverses the items themselves.

use std::slice;

use crate::error::{TraceError, TraceResult};

/// Number of trace lines an item stands for.
pub trait LineCount {
    fn line_count(&self) -> usize;
}

impl LineCount for usize {
    fn line_count(&self) -> usize {
        *self
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct Segment {
    start: usize,
    lines: usize,
}

/// A stack of transactional segments over one flat arena.
#[derive(Clone, Debug)]
pub struct StackedContainer<T> {
    items: Vec<T>,
    /// Lines of every item that no longer belongs to an open segment.
    committed_lines: usize,
    segments: Vec<Segment>,
}

impl<T: LineCount> StackedContainer<T> {
    pub const fn new() -> Self {
        Self {
            items: vec![],
            committed_lines: 0,
            segments: vec![],
        }
    }

    /// Opens a new segment on top of the stack.
    pub fn enter(&mut self) {
        self.segments.push(Segment {
            start: self.items.len(),
            lines: 0,
        });
    }

    /// Discards the top segment and every item it holds, returning the number
    /// of lines removed.
    pub fn pop(&mut self) -> TraceResult<usize> {
        let segment = self.segments.pop().ok_or(TraceError::AsymmetricPop)?;
        self.items.truncate(segment.start);
        Ok(segment.lines)
    }

    /// Folds the top segment into the committed prefix.
    pub fn commit(&mut self) -> TraceResult<()> {
        let segment = self.segments.pop().ok_or(TraceError::AsymmetricCommit)?;
        match self.segments.last_mut() {
            Some(parent) => parent.lines = parent.lines.saturating_add(segment.lines),
            None => self.committed_lines = self.committed_lines.saturating_add(segment.lines),
        }
        Ok(())
    }

    /// Adds `item` to the top-most open segment.
    pub fn append(&mut self, item: T) -> TraceResult<()> {
        let segment = self
            .segments
            .last_mut()
            .ok_or(TraceError::NoOpenSegment)?;
        segment.lines = segment.lines.saturating_add(item.line_count());
        self.items.push(item);
        Ok(())
    }

    /// Total number of lines, committed and open.
    pub fn size(&self) -> usize {
        self.segments
            .iter()
            .fold(self.committed_lines, |acc, s| acc.saturating_add(s.lines))
    }

    /// Number of lines held by the top-most open segment, if any.
    pub fn top_size(&self) -> Option<usize> {
        self.segments.last().map(|s| s.lines)
    }

    /// Number of items, committed and open.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of open segments.
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// Items outside of any open segment.
    pub fn committed(&self) -> &[T] {
        let end = self.segments.first().map_or(self.items.len(), |s| s.start);
        &self.items[..end]
    }

    /// Iterates over all items in insertion order, as if they formed one flat
    /// sequence.
    pub fn iter(&self) -> slice::Iter<'_, T> {
        self.items.iter()
    }

    /// Drops every item and every segment.
    pub fn clear(&mut self) {
        self.items.clear();
        self.segments.clear();
        self.committed_lines = 0;
    }
}

impl<T: LineCount> Default for StackedContainer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, T: LineCount> IntoIterator for &'a StackedContainer<T> {
    type Item = &'a T;
    type IntoIter = slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
