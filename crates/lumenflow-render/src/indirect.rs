//! Indirect draw command packing.
//!
//! CPU-side, append-only lists of draw-call parameter structs consumed by a
//! multi-draw-indirect call. Buffers are fully cleared and rebuilt every
//! frame; there is no incremental diffing of GPU-side draw data.
//!
//! The command layouts match wgpu's indirect structs: 16 bytes for
//! non-indexed draws, 20 bytes for indexed draws.

use bytemuck::{Pod, Zeroable};
use indexmap::IndexMap;
use static_assertions::const_assert_eq;

use crate::command::DrawRange;
use crate::driver::GraphicsDriver;
use crate::setting::VertexBufferKey;

/// Indirect draw command for non-indexed geometry.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct DrawIndirectCommand {
    pub vertex_count: u32,
    pub instance_count: u32,
    pub first_vertex: u32,
    pub first_instance: u32,
}

// SAFETY: repr(C) struct of u32s with no padding
unsafe impl Pod for DrawIndirectCommand {}
unsafe impl Zeroable for DrawIndirectCommand {}

/// Indirect draw command for indexed geometry.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct DrawIndexedIndirectCommand {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub base_vertex: i32,
    pub first_instance: u32,
}

// SAFETY: repr(C) struct of u32s and one i32 with no padding
unsafe impl Pod for DrawIndexedIndirectCommand {}
unsafe impl Zeroable for DrawIndexedIndirectCommand {}

const_assert_eq!(std::mem::size_of::<DrawIndirectCommand>(), 16);
const_assert_eq!(std::mem::size_of::<DrawIndexedIndirectCommand>(), 20);

/// Command-slot alignment for capacity growth.
pub const CAPACITY_ALIGN: u32 = 64;

/// Handle to an indirect command buffer within the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndirectBufferId(pub u32);

/// Append-only CPU list of indirect draw commands with a fixed stride.
///
/// Grows in 64-command steps; `clear` keeps the allocation. Upload happens
/// once per frame through the driver facade after all strategies have
/// appended their commands.
pub struct IndirectCommandBuffer {
    id: IndirectBufferId,
    indexed: bool,
    data: Vec<u8>,
    len: u32,
    capacity: u32,
}

impl IndirectCommandBuffer {
    pub fn new(id: IndirectBufferId, indexed: bool) -> Self {
        Self {
            id,
            indexed,
            data: Vec::new(),
            len: 0,
            capacity: 0,
        }
    }

    pub fn id(&self) -> IndirectBufferId {
        self.id
    }

    pub fn indexed(&self) -> bool {
        self.indexed
    }

    /// Stride of one command in bytes: 20 for indexed draws, 16 otherwise.
    pub fn stride(&self) -> u32 {
        if self.indexed {
            std::mem::size_of::<DrawIndexedIndirectCommand>() as u32
        } else {
            std::mem::size_of::<DrawIndirectCommand>() as u32
        }
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.len = 0;
    }

    /// Next capacity that fits `required` commands: the smallest multiple
    /// of [`CAPACITY_ALIGN`] that is >= `required`.
    pub fn grown_capacity(required: u32) -> u32 {
        required.div_ceil(CAPACITY_ALIGN) * CAPACITY_ALIGN
    }

    fn ensure_capacity(&mut self, required: u32) {
        if required > self.capacity {
            self.capacity = Self::grown_capacity(required);
            self.data
                .reserve(self.capacity as usize * self.stride() as usize - self.data.len());
        }
    }

    /// Append one non-indexed draw command.
    ///
    /// # Panics
    ///
    /// Panics when the buffer was created for indexed draws.
    pub fn push_draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        assert!(!self.indexed, "non-indexed command pushed to indexed buffer");
        self.ensure_capacity(self.len + 1);
        let command = DrawIndirectCommand {
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        };
        self.data.extend_from_slice(bytemuck::bytes_of(&command));
        self.len += 1;
    }

    /// Append one indexed draw command.
    ///
    /// # Panics
    ///
    /// Panics when the buffer was created for non-indexed draws.
    pub fn push_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        base_vertex: i32,
        first_instance: u32,
    ) {
        assert!(self.indexed, "indexed command pushed to non-indexed buffer");
        self.ensure_capacity(self.len + 1);
        let command = DrawIndexedIndirectCommand {
            index_count,
            instance_count,
            first_index,
            base_vertex,
            first_instance,
        };
        self.data.extend_from_slice(bytemuck::bytes_of(&command));
        self.len += 1;
    }

    /// Current command index, for bracketing an append run.
    pub fn mark(&self) -> u32 {
        self.len
    }

    /// The interval appended since `mark`.
    pub fn range_since(&self, mark: u32) -> DrawRange {
        DrawRange {
            first: mark,
            count: self.len.saturating_sub(mark),
        }
    }

    pub fn byte_offset(&self, command_index: u32) -> u64 {
        command_index as u64 * self.stride() as u64
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Decoded non-indexed commands, for inspection.
    pub fn draw_commands(&self) -> &[DrawIndirectCommand] {
        assert!(!self.indexed);
        bytemuck::cast_slice(&self.data)
    }

    /// Decoded indexed commands, for inspection.
    pub fn indexed_commands(&self) -> &[DrawIndexedIndirectCommand] {
        assert!(self.indexed);
        bytemuck::cast_slice(&self.data)
    }

    /// Bind once and upload the whole CPU list.
    pub fn bind_and_upload(&self, driver: &mut dyn GraphicsDriver) {
        driver.bind_indirect_buffer(self.id);
        driver.upload_indirect(self.id, &self.data);
    }
}

/// Registry of indirect buffers keyed by vertex-buffer key.
///
/// Buffers persist across frames to keep their allocations; their contents
/// are cleared at frame start.
pub struct IndirectBufferRegistry {
    buffers: IndexMap<VertexBufferKey, IndirectCommandBuffer, ahash::RandomState>,
    next_id: u32,
}

impl IndirectBufferRegistry {
    pub fn new() -> Self {
        Self {
            buffers: IndexMap::default(),
            next_id: 0,
        }
    }

    pub fn get_or_create(&mut self, key: VertexBufferKey) -> &mut IndirectCommandBuffer {
        let next_id = &mut self.next_id;
        self.buffers.entry(key).or_insert_with(|| {
            let id = IndirectBufferId(*next_id);
            *next_id += 1;
            IndirectCommandBuffer::new(id, key.parameter.indexed)
        })
    }

    pub fn get(&self, key: &VertexBufferKey) -> Option<&IndirectCommandBuffer> {
        self.buffers.get(key)
    }

    pub fn by_id(&self, id: IndirectBufferId) -> Option<&IndirectCommandBuffer> {
        self.buffers.values().find(|buffer| buffer.id() == id)
    }

    /// Frame start: clear every buffer's contents, keeping allocations.
    pub fn clear_all(&mut self) {
        for buffer in self.buffers.values_mut() {
            buffer.clear();
        }
    }

    /// Bind and upload every non-empty buffer, once each.
    pub fn upload_touched(&self, driver: &mut dyn GraphicsDriver) -> u32 {
        let mut uploads = 0;
        for buffer in self.buffers.values() {
            if !buffer.is_empty() {
                buffer.bind_and_upload(driver);
                uploads += 1;
            }
        }
        uploads
    }

    pub fn iter(&self) -> impl Iterator<Item = &IndirectCommandBuffer> {
        self.buffers.values()
    }
}

impl Default for IndirectBufferRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_sizes_match_indirect_layouts() {
        assert_eq!(std::mem::size_of::<DrawIndirectCommand>(), 16);
        assert_eq!(std::mem::size_of::<DrawIndexedIndirectCommand>(), 20);
    }

    #[test]
    fn test_capacity_growth_is_64_aligned() {
        for required in [1, 63, 64, 65, 100, 1000] {
            let capacity = IndirectCommandBuffer::grown_capacity(required);
            assert!(capacity >= required);
            assert_eq!(capacity % 64, 0);
        }
        assert_eq!(IndirectCommandBuffer::grown_capacity(1), 64);
        assert_eq!(IndirectCommandBuffer::grown_capacity(65), 128);
    }

    #[test]
    fn test_push_and_decode_non_indexed() {
        let mut buffer = IndirectCommandBuffer::new(IndirectBufferId(0), false);
        buffer.push_draw(6, 1, 0, 0);
        buffer.push_draw(6, 1, 6, 0);

        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.stride(), 16);
        let commands = buffer.draw_commands();
        assert_eq!(commands[0].first_vertex, 0);
        assert_eq!(commands[1].first_vertex, 6);
    }

    #[test]
    fn test_mark_and_range() {
        let mut buffer = IndirectCommandBuffer::new(IndirectBufferId(0), true);
        buffer.push_indexed(36, 1, 0, 0, 0);

        let mark = buffer.mark();
        buffer.push_indexed(36, 1, 36, 0, 0);
        buffer.push_indexed(36, 1, 72, 0, 0);

        let range = buffer.range_since(mark);
        assert_eq!(range, DrawRange { first: 1, count: 2 });
        assert_eq!(buffer.byte_offset(range.first), 20);
    }

    #[test]
    fn test_clear_keeps_capacity() {
        let mut buffer = IndirectCommandBuffer::new(IndirectBufferId(0), false);
        for i in 0..70 {
            buffer.push_draw(6, 1, i * 6, 0);
        }
        assert_eq!(buffer.capacity(), 128);
        buffer.clear();
        assert_eq!(buffer.len(), 0);
        assert_eq!(buffer.capacity(), 128);
    }

    #[test]
    #[should_panic(expected = "indexed command pushed to non-indexed buffer")]
    fn test_stride_mismatch_panics() {
        let mut buffer = IndirectCommandBuffer::new(IndirectBufferId(0), false);
        buffer.push_indexed(36, 1, 0, 0, 0);
    }

    #[test]
    fn test_registry_reuses_buffers_per_key() {
        use crate::setting::{
            BufferUsage, PrimitiveTopology, RenderParameter, SourceId, VertexLayoutId,
        };
        let parameter = RenderParameter {
            topology: PrimitiveTopology::TriangleList,
            layout: VertexLayoutId(0),
            usage: BufferUsage::Dynamic,
            instanced: false,
            indexed: true,
        };
        let key = VertexBufferKey::new(parameter, SourceId::DYNAMIC);

        let mut registry = IndirectBufferRegistry::new();
        let id = registry.get_or_create(key).id();
        registry.get_or_create(key).push_indexed(3, 1, 0, 0, 0);
        assert_eq!(registry.get_or_create(key).id(), id);
        assert_eq!(registry.get(&key).unwrap().len(), 1);

        registry.clear_all();
        assert!(registry.get(&key).unwrap().is_empty());
    }
}
