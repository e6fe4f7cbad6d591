//! wgpu adapter for the driver facade.
//!
//! Translates facade calls onto a recording `wgpu::RenderPass` or
//! `wgpu::ComputePass`. Pipelines and uniform bind groups are owned by the
//! shader layer and registered up front; the adapter only resolves them by
//! setting / snapshot and records the pass. Buffers grow by reallocation:
//! the engine re-uploads full contents every frame, so nothing is copied
//! forward.
//!
//! Callers construct the pass themselves and detach its lifetime with
//! `forget_lifetime()` before handing it over. Multi-draw requires
//! `wgpu::Features::MULTI_DRAW_INDIRECT`, and non-zero `first_instance`
//! values require `INDIRECT_FIRST_INSTANCE`.

use std::collections::HashMap;
use std::sync::Arc;

use crate::command::DrawShard;
use crate::driver::GraphicsDriver;
use crate::indirect::IndirectBufferId;
use crate::resource::VertexResourceId;
use crate::setting::{PrimitiveTopology, RenderSetting, ResourceBinding};
use crate::uniform::UniformValueSnapshot;

/// GPU buffers backing one vertex resource.
pub struct WgpuVertexResource {
    pub vertex: wgpu::Buffer,
    pub index: Option<wgpu::Buffer>,
}

/// Which kind of pass this adapter is recording into.
pub enum WgpuPass {
    Render(wgpu::RenderPass<'static>),
    Compute(wgpu::ComputePass<'static>),
}

pub struct WgpuDriver {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    pass: WgpuPass,
    render_pipelines: HashMap<RenderSetting, wgpu::RenderPipeline, ahash::RandomState>,
    compute_pipelines: HashMap<RenderSetting, wgpu::ComputePipeline, ahash::RandomState>,
    uniform_bind_groups: HashMap<UniformValueSnapshot, wgpu::BindGroup, ahash::RandomState>,
    vertex_resources: HashMap<VertexResourceId, WgpuVertexResource, ahash::RandomState>,
    indirect_buffers: HashMap<IndirectBufferId, wgpu::Buffer, ahash::RandomState>,
}

/// Bind group slot for deduplicated uniform snapshots.
const UNIFORM_GROUP_SLOT: u32 = 1;

impl WgpuDriver {
    pub fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>, pass: WgpuPass) -> Self {
        Self {
            device,
            queue,
            pass,
            render_pipelines: HashMap::default(),
            compute_pipelines: HashMap::default(),
            uniform_bind_groups: HashMap::default(),
            vertex_resources: HashMap::default(),
            indirect_buffers: HashMap::default(),
        }
    }

    pub fn insert_render_pipeline(&mut self, setting: RenderSetting, pipeline: wgpu::RenderPipeline) {
        self.render_pipelines.insert(setting, pipeline);
    }

    pub fn insert_compute_pipeline(
        &mut self,
        setting: RenderSetting,
        pipeline: wgpu::ComputePipeline,
    ) {
        self.compute_pipelines.insert(setting, pipeline);
    }

    pub fn insert_uniform_bind_group(
        &mut self,
        snapshot: UniformValueSnapshot,
        bind_group: wgpu::BindGroup,
    ) {
        self.uniform_bind_groups.insert(snapshot, bind_group);
    }

    pub fn insert_vertex_resource(&mut self, id: VertexResourceId, resource: WgpuVertexResource) {
        self.vertex_resources.insert(id, resource);
    }

    fn ensure_indirect_buffer(&mut self, id: IndirectBufferId, size: u64) {
        let grow = match self.indirect_buffers.get(&id) {
            Some(buffer) => buffer.size() < size,
            None => true,
        };
        if grow {
            let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("lumenflow indirect"),
                size,
                usage: wgpu::BufferUsages::INDIRECT | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            self.indirect_buffers.insert(id, buffer);
        }
    }

    fn ensure_vertex_buffer(&mut self, id: VertexResourceId, size: u64) {
        let grow = match self.vertex_resources.get(&id) {
            Some(resource) => resource.vertex.size() < size,
            None => true,
        };
        if grow {
            let vertex = self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("lumenflow vertex"),
                size,
                usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            let index = self.vertex_resources.remove(&id).and_then(|r| r.index);
            self.vertex_resources
                .insert(id, WgpuVertexResource { vertex, index });
        }
    }
}

impl GraphicsDriver for WgpuDriver {
    fn apply_setting(&mut self, setting: &RenderSetting, _binding: ResourceBinding) {
        match &mut self.pass {
            WgpuPass::Render(pass) => match self.render_pipelines.get(setting) {
                Some(pipeline) => pass.set_pipeline(pipeline),
                None => tracing::warn!(?setting, "no render pipeline registered for setting"),
            },
            WgpuPass::Compute(pass) => match self.compute_pipelines.get(setting) {
                Some(pipeline) => pass.set_pipeline(pipeline),
                None => tracing::warn!(?setting, "no compute pipeline registered for setting"),
            },
        }
    }

    fn apply_uniforms(&mut self, snapshot: &UniformValueSnapshot) {
        let Some(bind_group) = self.uniform_bind_groups.get(snapshot) else {
            if !snapshot.is_empty() {
                tracing::warn!("no bind group registered for uniform snapshot");
            }
            return;
        };
        match &mut self.pass {
            WgpuPass::Render(pass) => pass.set_bind_group(UNIFORM_GROUP_SLOT, bind_group, &[]),
            WgpuPass::Compute(pass) => pass.set_bind_group(UNIFORM_GROUP_SLOT, bind_group, &[]),
        }
    }

    fn bind_vertex_resource(&mut self, resource: VertexResourceId) {
        let WgpuPass::Render(pass) = &mut self.pass else {
            return;
        };
        let Some(buffers) = self.vertex_resources.get(&resource) else {
            tracing::warn!(?resource, "unknown vertex resource");
            return;
        };
        pass.set_vertex_buffer(0, buffers.vertex.slice(..));
        if let Some(index) = &buffers.index {
            pass.set_index_buffer(index.slice(..), wgpu::IndexFormat::Uint32);
        }
    }

    fn upload_vertex_data(&mut self, resource: VertexResourceId, data: &[u8]) {
        self.ensure_vertex_buffer(resource, data.len() as u64);
        self.queue
            .write_buffer(&self.vertex_resources[&resource].vertex, 0, data);
    }

    fn bind_indirect_buffer(&mut self, _buffer: IndirectBufferId) {
        // Indirect buffers are referenced directly at draw time; nothing to
        // record here.
    }

    fn upload_indirect(&mut self, buffer: IndirectBufferId, data: &[u8]) {
        self.ensure_indirect_buffer(buffer, data.len() as u64);
        self.queue
            .write_buffer(&self.indirect_buffers[&buffer], 0, data);
    }

    fn draw(
        &mut self,
        _topology: PrimitiveTopology,
        shard: DrawShard,
        instance_count: u32,
        base_instance: u32,
        indexed: bool,
    ) {
        let WgpuPass::Render(pass) = &mut self.pass else {
            return;
        };
        let instances = base_instance..base_instance + instance_count;
        if indexed {
            pass.draw_indexed(
                shard.index_offset..shard.index_offset + shard.index_count,
                shard.vertex_offset as i32,
                instances,
            );
        } else {
            pass.draw(
                shard.vertex_offset..shard.vertex_offset + shard.vertex_count,
                instances,
            );
        }
    }

    fn multi_draw_indirect(
        &mut self,
        buffer: IndirectBufferId,
        byte_offset: u64,
        count: u32,
        _stride: u32,
        indexed: bool,
    ) {
        let Some(gpu_buffer) = self.indirect_buffers.get(&buffer) else {
            tracing::warn!(?buffer, "multi-draw against unknown indirect buffer");
            return;
        };
        let WgpuPass::Render(pass) = &mut self.pass else {
            return;
        };
        if indexed {
            pass.multi_draw_indexed_indirect(gpu_buffer, byte_offset, count);
        } else {
            pass.multi_draw_indirect(gpu_buffer, byte_offset, count);
        }
    }

    fn dispatch(&mut self, workgroups: [u32; 3]) {
        let WgpuPass::Compute(pass) = &mut self.pass else {
            tracing::warn!("dispatch issued outside a compute pass");
            return;
        };
        pass.dispatch_workgroups(workgroups[0], workgroups[1], workgroups[2]);
    }
}
