// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Append-only column builder
//!
//! Layers accumulate vertex and instance attributes in typed columns while
//! a model is under construction, then compile each column into one GPU
//! buffer at finalize. Columns that stay mutable afterwards (flags, colors,
//! offsets, instance transforms) keep their CPU copy and accumulate a dirty
//! element span, flushed as a single sub-range write per frame; columns
//! that never change again drop their staging memory at finalize.

use bytemuck::Pod;

use crate::gpu::{BufferId, BufferUsage, GpuContext};

/// One typed attribute column of a layer.
#[derive(Debug)]
pub struct Column<T: Pod> {
    data: Vec<T>,
    buffer: Option<BufferId>,
    /// Dirty element span `[start, end)` awaiting upload.
    dirty: Option<(usize, usize)>,
}

impl<T: Pod> Column<T> {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            buffer: None,
            dirty: None,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn push(&mut self, value: T) {
        debug_assert!(self.buffer.is_none(), "append after finalize");
        self.data.push(value);
    }

    pub fn extend_from_slice(&mut self, values: &[T]) {
        debug_assert!(self.buffer.is_none(), "append after finalize");
        self.data.extend_from_slice(values);
    }

    pub fn extend_repeat(&mut self, value: T, count: usize) {
        debug_assert!(self.buffer.is_none(), "append after finalize");
        self.data.resize(self.data.len() + count, value);
    }

    /// Append `repeats` copies of a multi-element pattern, e.g. one RGBA
    /// quadruple per vertex of a portion.
    pub fn extend_pattern(&mut self, pattern: &[T], repeats: usize) {
        debug_assert!(self.buffer.is_none(), "append after finalize");
        self.data.reserve(pattern.len() * repeats);
        for _ in 0..repeats {
            self.data.extend_from_slice(pattern);
        }
    }

    /// Overwrite `repeats` pattern-sized element groups starting at element
    /// `start` with the same pattern.
    pub fn fill_pattern(&mut self, start: usize, repeats: usize, pattern: &[T]) {
        let end = start + repeats * pattern.len();
        if end > self.data.len() {
            tracing::error!(start, end, len = self.data.len(), "column fill_pattern out of range");
            return;
        }
        for chunk in self.data[start..end].chunks_exact_mut(pattern.len()) {
            chunk.copy_from_slice(pattern);
        }
        self.mark_dirty(start, end);
    }

    /// Overwrite `values.len()` elements starting at `start`, tracking the
    /// span for the next flush when the column is already materialized.
    pub fn write(&mut self, start: usize, values: &[T]) {
        let end = start + values.len();
        if end > self.data.len() {
            tracing::error!(start, end, len = self.data.len(), "column write out of range");
            return;
        }
        self.data[start..end].copy_from_slice(values);
        self.mark_dirty(start, end);
    }

    /// Set `count` elements starting at `start` to `value`.
    pub fn fill(&mut self, start: usize, count: usize, value: T) {
        let end = start + count;
        if end > self.data.len() {
            tracing::error!(start, end, len = self.data.len(), "column fill out of range");
            return;
        }
        self.data[start..end].fill(value);
        self.mark_dirty(start, end);
    }

    fn mark_dirty(&mut self, start: usize, end: usize) {
        if self.buffer.is_none() {
            return;
        }
        self.dirty = Some(match self.dirty {
            Some((s, e)) => (s.min(start), e.max(end)),
            None => (start, end),
        });
    }

    /// Compile the column into a GPU buffer.
    ///
    /// With `retain` the CPU copy stays for later sub-range rewrites;
    /// without it the staging memory is discarded. Empty columns produce no
    /// buffer.
    pub fn finalize(&mut self, gpu: &mut dyn GpuContext, usage: BufferUsage, retain: bool) -> Option<BufferId> {
        if self.data.is_empty() {
            return None;
        }
        let id = gpu.create_buffer(usage, bytemuck::cast_slice(&self.data));
        self.buffer = Some(id);
        if !retain {
            self.data = Vec::new();
        }
        Some(id)
    }

    /// Upload the accumulated dirty span, if any.
    pub fn flush(&mut self, gpu: &mut dyn GpuContext) {
        let (Some(buffer), Some((start, end))) = (self.buffer, self.dirty.take()) else {
            return;
        };
        gpu.write_buffer(
            buffer,
            start * std::mem::size_of::<T>(),
            bytemuck::cast_slice(&self.data[start..end]),
        );
    }

    pub fn buffer(&self) -> Option<BufferId> {
        self.buffer
    }

    pub fn destroy(&mut self, gpu: &mut dyn GpuContext) {
        if let Some(buffer) = self.buffer.take() {
            gpu.destroy_buffer(buffer);
        }
        self.data = Vec::new();
        self.dirty = None;
    }
}

impl<T: Pod> Default for Column<T> {
    fn default() -> Self {
        Self::new()
    }
}
