// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! GPU buffer abstraction
//!
//! The engine never talks to a graphics API directly; it allocates and
//! updates byte buffers through this trait and hands the resulting handles
//! to the external renderer. Splitting creation (`create_buffer`, once per
//! layer finalize) from sub-range updates (`write_buffer`, per state change)
//! mirrors the create-init / queue-write split of the usual device APIs.

use rustc_hash::FxHashMap;

/// Opaque handle to a device buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub u32);

/// What a buffer feeds in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    /// Per-vertex attribute data.
    Vertex,
    /// Index data.
    Index,
    /// Per-instance attribute data.
    Instance,
}

/// The consumed GPU context: typed-buffer allocation and incremental writes.
pub trait GpuContext {
    /// Allocate an immutable-size buffer initialized with `data`.
    fn create_buffer(&mut self, usage: BufferUsage, data: &[u8]) -> BufferId;

    /// Overwrite a byte range of an existing buffer.
    fn write_buffer(&mut self, buffer: BufferId, byte_offset: usize, data: &[u8]);

    /// Release a buffer.
    fn destroy_buffer(&mut self, buffer: BufferId);
}

/// CPU-resident [`GpuContext`] with readable buffers.
///
/// Backs every test in this workspace and lets the whole engine run
/// headless, e.g. for server-side preprocessing of a model before any
/// device exists.
#[derive(Debug, Default)]
pub struct HeadlessContext {
    buffers: FxHashMap<u32, (BufferUsage, Vec<u8>)>,
    next_id: u32,
    write_count: u64,
}

impl HeadlessContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read back the current contents of a buffer.
    pub fn buffer_bytes(&self, buffer: BufferId) -> Option<&[u8]> {
        self.buffers.get(&buffer.0).map(|(_, bytes)| bytes.as_slice())
    }

    /// Number of live buffers.
    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Number of `write_buffer` calls seen, for asserting incremental
    /// update behavior.
    pub fn write_count(&self) -> u64 {
        self.write_count
    }
}

impl GpuContext for HeadlessContext {
    fn create_buffer(&mut self, usage: BufferUsage, data: &[u8]) -> BufferId {
        let id = self.next_id;
        self.next_id += 1;
        self.buffers.insert(id, (usage, data.to_vec()));
        BufferId(id)
    }

    fn write_buffer(&mut self, buffer: BufferId, byte_offset: usize, data: &[u8]) {
        self.write_count += 1;
        match self.buffers.get_mut(&buffer.0) {
            Some((_, bytes)) => {
                let end = byte_offset + data.len();
                if end > bytes.len() {
                    tracing::error!(
                        buffer = buffer.0,
                        offset = byte_offset,
                        len = data.len(),
                        "write past end of buffer ignored"
                    );
                    return;
                }
                bytes[byte_offset..end].copy_from_slice(data);
            }
            None => {
                tracing::error!(buffer = buffer.0, "write to unknown buffer ignored");
            }
        }
    }

    fn destroy_buffer(&mut self, buffer: BufferId) {
        self.buffers.remove(&buffer.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_read_back() {
        let mut gpu = HeadlessContext::new();
        let buf = gpu.create_buffer(BufferUsage::Vertex, &[1, 2, 3, 4]);
        assert_eq!(gpu.buffer_bytes(buf), Some(&[1u8, 2, 3, 4][..]));
        assert_eq!(gpu.buffer_count(), 1);
    }

    #[test]
    fn test_sub_range_write() {
        let mut gpu = HeadlessContext::new();
        let buf = gpu.create_buffer(BufferUsage::Vertex, &[0; 6]);
        gpu.write_buffer(buf, 2, &[9, 9]);
        assert_eq!(gpu.buffer_bytes(buf), Some(&[0u8, 0, 9, 9, 0, 0][..]));
        assert_eq!(gpu.write_count(), 1);
    }

    #[test]
    fn test_out_of_range_write_ignored() {
        let mut gpu = HeadlessContext::new();
        let buf = gpu.create_buffer(BufferUsage::Index, &[0; 4]);
        gpu.write_buffer(buf, 3, &[1, 2]);
        assert_eq!(gpu.buffer_bytes(buf), Some(&[0u8; 4][..]));
    }

    #[test]
    fn test_destroy() {
        let mut gpu = HeadlessContext::new();
        let buf = gpu.create_buffer(BufferUsage::Vertex, &[1]);
        gpu.destroy_buffer(buf);
        assert_eq!(gpu.buffer_bytes(buf), None);
        assert_eq!(gpu.buffer_count(), 0);
    }
}
