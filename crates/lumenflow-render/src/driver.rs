//! The graphics driver facade.
//!
//! The engine computes batches, offsets, and command parameters; everything
//! GPU-facing goes through this trait on the render thread. Implementations
//! wrap a real graphics API ([`crate::wgpu_driver`]) or record calls for
//! tests ([`crate::testing::RecordingDriver`]).

use crate::command::DrawShard;
use crate::indirect::IndirectBufferId;
use crate::resource::VertexResourceId;
use crate::setting::{PrimitiveTopology, RenderSetting, ResourceBinding};
use crate::uniform::UniformValueSnapshot;

pub trait GraphicsDriver {
    /// Apply fixed-function state and resource bindings for a setting.
    fn apply_setting(&mut self, setting: &RenderSetting, binding: ResourceBinding);

    /// Upload one deduplicated uniform snapshot.
    fn apply_uniforms(&mut self, snapshot: &UniformValueSnapshot);

    fn bind_vertex_resource(&mut self, resource: VertexResourceId);

    fn upload_vertex_data(&mut self, resource: VertexResourceId, data: &[u8]);

    fn bind_indirect_buffer(&mut self, buffer: IndirectBufferId);

    fn upload_indirect(&mut self, buffer: IndirectBufferId, data: &[u8]);

    /// Issue one direct draw.
    fn draw(
        &mut self,
        topology: PrimitiveTopology,
        shard: DrawShard,
        instance_count: u32,
        base_instance: u32,
        indexed: bool,
    );

    /// Issue one multi-draw-indirect call over `count` commands starting at
    /// `byte_offset` in the bound indirect buffer.
    fn multi_draw_indirect(
        &mut self,
        buffer: IndirectBufferId,
        byte_offset: u64,
        count: u32,
        stride: u32,
        indexed: bool,
    );

    /// Issue one compute dispatch.
    fn dispatch(&mut self, workgroups: [u32; 3]);
}
