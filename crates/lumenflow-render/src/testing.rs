//! Test support: a recording driver, a simple vertex resource manager, and
//! synthetic graphics instances.
//!
//! Used by this crate's own tests and available to downstream crates that
//! want to exercise flow strategies without a GPU.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use glam::{Mat4, Vec4};
use lumenflow_core::KeyId;

use crate::command::DrawShard;
use crate::driver::GraphicsDriver;
use crate::indirect::IndirectBufferId;
use crate::instance::{
    ComputeDispatch, GraphicsInstance, InstanceDataWriter, TickContext,
};
use crate::mesh::Mesh;
use crate::resource::{VertexResourceId, VertexResourceManager, VertexWriter};
use crate::setting::{
    BufferUsage, PrimitiveTopology, RenderParameter, RenderSetting, RenderState, ResourceBinding,
    SourceId, VertexBufferKey, VertexLayoutId,
};
use crate::uniform::{ShaderProvider, UniformHook, UniformValueSnapshot};

/// One recorded driver facade call.
#[derive(Debug, Clone)]
pub enum DriverCall {
    ApplySetting(ResourceBinding),
    ApplyUniforms(UniformValueSnapshot),
    BindVertexResource(VertexResourceId),
    UploadVertexData {
        resource: VertexResourceId,
        bytes: usize,
    },
    BindIndirectBuffer(IndirectBufferId),
    UploadIndirect {
        buffer: IndirectBufferId,
        bytes: usize,
    },
    Draw {
        topology: PrimitiveTopology,
        shard: DrawShard,
        instance_count: u32,
        base_instance: u32,
        indexed: bool,
    },
    MultiDrawIndirect {
        buffer: IndirectBufferId,
        byte_offset: u64,
        count: u32,
        stride: u32,
        indexed: bool,
    },
    Dispatch([u32; 3]),
}

/// Driver that records every facade call for assertions.
#[derive(Default)]
pub struct RecordingDriver {
    calls: Vec<DriverCall>,
}

impl RecordingDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> &[DriverCall] {
        &self.calls
    }

    /// Number of GPU draw submissions (direct or multi-draw).
    pub fn count_draws(&self) -> usize {
        self.calls
            .iter()
            .filter(|call| {
                matches!(
                    call,
                    DriverCall::Draw { .. } | DriverCall::MultiDrawIndirect { .. }
                )
            })
            .count()
    }

    pub fn count_dispatches(&self) -> usize {
        self.calls
            .iter()
            .filter(|call| matches!(call, DriverCall::Dispatch(_)))
            .count()
    }
}

impl GraphicsDriver for RecordingDriver {
    fn apply_setting(&mut self, _setting: &RenderSetting, binding: ResourceBinding) {
        self.calls.push(DriverCall::ApplySetting(binding));
    }

    fn apply_uniforms(&mut self, snapshot: &UniformValueSnapshot) {
        self.calls.push(DriverCall::ApplyUniforms(snapshot.clone()));
    }

    fn bind_vertex_resource(&mut self, resource: VertexResourceId) {
        self.calls.push(DriverCall::BindVertexResource(resource));
    }

    fn upload_vertex_data(&mut self, resource: VertexResourceId, data: &[u8]) {
        self.calls.push(DriverCall::UploadVertexData {
            resource,
            bytes: data.len(),
        });
    }

    fn bind_indirect_buffer(&mut self, buffer: IndirectBufferId) {
        self.calls.push(DriverCall::BindIndirectBuffer(buffer));
    }

    fn upload_indirect(&mut self, buffer: IndirectBufferId, data: &[u8]) {
        self.calls.push(DriverCall::UploadIndirect {
            buffer,
            bytes: data.len(),
        });
    }

    fn draw(
        &mut self,
        topology: PrimitiveTopology,
        shard: DrawShard,
        instance_count: u32,
        base_instance: u32,
        indexed: bool,
    ) {
        self.calls.push(DriverCall::Draw {
            topology,
            shard,
            instance_count,
            base_instance,
            indexed,
        });
    }

    fn multi_draw_indirect(
        &mut self,
        buffer: IndirectBufferId,
        byte_offset: u64,
        count: u32,
        stride: u32,
        indexed: bool,
    ) {
        self.calls.push(DriverCall::MultiDrawIndirect {
            buffer,
            byte_offset,
            count,
            stride,
            indexed,
        });
    }

    fn dispatch(&mut self, workgroups: [u32; 3]) {
        self.calls.push(DriverCall::Dispatch(workgroups));
    }
}

/// Stride of the test vertex layout, in bytes (one `Vec4` per element).
pub const TEST_STRIDE: u32 = 16;

/// Vertex resource manager that hands out sequential ids per key.
#[derive(Default)]
pub struct SimpleVertexResourceManager {
    resources: HashMap<VertexBufferKey, VertexResourceId, ahash::RandomState>,
    next_id: u64,
}

impl SimpleVertexResourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }
}

impl VertexResourceManager for SimpleVertexResourceManager {
    fn get(&mut self, key: &VertexBufferKey) -> VertexResourceId {
        let next_id = &mut self.next_id;
        *self.resources.entry(*key).or_insert_with(|| {
            let id = VertexResourceId(*next_id);
            *next_id += 1;
            id
        })
    }

    fn create_builder(&mut self, _parameter: &RenderParameter, capacity: u32) -> VertexWriter {
        VertexWriter::with_capacity(TEST_STRIDE, capacity)
    }
}

/// A render setting for tests; `blend` toggles state so two settings can
/// differ.
pub fn test_setting(instanced: bool, blend: bool) -> Arc<RenderSetting> {
    let mut state = RenderState::default();
    if blend {
        state |= RenderState::BLEND;
    }
    Arc::new(RenderSetting::new(
        state,
        ResourceBinding::NONE,
        RenderParameter {
            topology: PrimitiveTopology::TriangleList,
            layout: VertexLayoutId(0),
            usage: BufferUsage::Dynamic,
            instanced,
            indexed: false,
        },
    ))
}

struct TestWriter;

impl InstanceDataWriter for TestWriter {
    fn write_instance(&self, writer: &mut VertexWriter, transform: &Mat4) {
        // One Vec4 per instance: the transform's translation.
        let translation = transform.w_axis;
        writer.put_vec4(translation);
    }
}

/// Synthetic graphics instance with builder-style configuration.
pub struct TestInstance {
    id: KeyId,
    visible: AtomicBool,
    discard: AtomicBool,
    ticks: AtomicU32,
    tickable: bool,
    panic_on_tick: bool,
    mesh: Option<Mesh>,
    transform: Mat4,
    writer: Option<Arc<dyn InstanceDataWriter>>,
    shader: Option<Arc<dyn ShaderProvider>>,
    dispatch: Option<ComputeDispatch>,
    raw: Option<Arc<dyn Fn(&mut dyn GraphicsDriver) + Send + Sync>>,
}

impl TestInstance {
    pub fn new(id: &str) -> Self {
        Self {
            id: KeyId::new(id),
            visible: AtomicBool::new(true),
            discard: AtomicBool::new(false),
            ticks: AtomicU32::new(0),
            tickable: false,
            panic_on_tick: false,
            mesh: None,
            transform: Mat4::IDENTITY,
            writer: None,
            shader: None,
            dispatch: None,
            raw: None,
        }
    }

    /// Dynamic mesh whose fill writes one `Vec4` per vertex.
    pub fn with_dynamic_mesh(mut self, vertex_count: u32, index_count: u32) -> Self {
        self.mesh = Some(Mesh::dynamic(
            PrimitiveTopology::TriangleList,
            vertex_count,
            index_count,
            Arc::new(move |writer: &mut VertexWriter, transform: &Mat4| {
                for i in 0..vertex_count {
                    writer.put_vec4(transform.w_axis + Vec4::new(i as f32, 0.0, 0.0, 0.0));
                }
            }),
        ));
        self
    }

    pub fn with_baked_mesh(mut self, source: SourceId, vertex_count: u32, index_count: u32) -> Self {
        self.mesh = Some(Mesh::baked(
            source,
            PrimitiveTopology::TriangleList,
            vertex_count,
            index_count,
            0,
            0,
        ));
        self
    }

    pub fn with_baked_mesh_at(
        mut self,
        source: SourceId,
        vertex_count: u32,
        index_count: u32,
        vertex_offset: u32,
        index_offset: u32,
    ) -> Self {
        self.mesh = Some(Mesh::baked(
            source,
            PrimitiveTopology::TriangleList,
            vertex_count,
            index_count,
            vertex_offset,
            index_offset,
        ));
        self
    }

    pub fn with_mesh(mut self, mesh: Mesh) -> Self {
        self.mesh = Some(mesh);
        self
    }

    pub fn with_transform(mut self, transform: Mat4) -> Self {
        self.transform = transform;
        self
    }

    pub fn with_instance_writer(mut self) -> Self {
        self.writer = Some(Arc::new(TestWriter));
        self
    }

    pub fn with_shader(mut self, shader: Arc<dyn ShaderProvider>) -> Self {
        self.shader = Some(shader);
        self
    }

    pub fn with_dispatch(mut self, workgroups: [u32; 3]) -> Self {
        self.dispatch = Some(ComputeDispatch::new(workgroups, |_| {}));
        self
    }

    pub fn with_raw(
        mut self,
        run: impl Fn(&mut dyn GraphicsDriver) + Send + Sync + 'static,
    ) -> Self {
        self.raw = Some(Arc::new(run));
        self
    }

    pub fn tickable(mut self) -> Self {
        self.tickable = true;
        self
    }

    pub fn panicking_tick(mut self) -> Self {
        self.tickable = true;
        self.panic_on_tick = true;
        self
    }

    pub fn discarded(self) -> Self {
        self.discard.store(true, Ordering::Relaxed);
        self
    }

    pub fn set_visible(&self, visible: bool) {
        self.visible.store(visible, Ordering::Relaxed);
    }

    pub fn tick_count(&self) -> u32 {
        self.ticks.load(Ordering::Relaxed)
    }
}

impl GraphicsInstance for TestInstance {
    fn identifier(&self) -> KeyId {
        self.id.clone()
    }

    fn should_render(&self) -> bool {
        self.visible.load(Ordering::Relaxed)
    }

    fn should_discard(&self) -> bool {
        self.discard.load(Ordering::Relaxed)
    }

    fn should_tick(&self) -> bool {
        self.tickable
    }

    fn tick(&self, _ctx: &TickContext) {
        if self.panic_on_tick {
            panic!("tick failed for {}", self.id);
        }
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    fn mesh(&self) -> Option<Mesh> {
        self.mesh.clone()
    }

    fn world_transform(&self) -> Mat4 {
        self.transform
    }

    fn instance_writer(&self) -> Option<Arc<dyn InstanceDataWriter>> {
        self.writer.clone()
    }

    fn shader_provider(&self) -> Option<Arc<dyn ShaderProvider>> {
        self.shader.clone()
    }

    fn dispatch(&self) -> Option<ComputeDispatch> {
        self.dispatch.clone()
    }

    fn raw_commands(&self) -> Option<Arc<dyn Fn(&mut dyn GraphicsDriver) + Send + Sync>> {
        self.raw.clone()
    }
}

/// A shader provider backed by a fixed hook list.
pub struct TestShaderProvider {
    hooks: Vec<UniformHook>,
    binding: ResourceBinding,
}

impl TestShaderProvider {
    pub fn new(hooks: Vec<UniformHook>) -> Self {
        Self {
            hooks,
            binding: ResourceBinding::NONE,
        }
    }

    pub fn with_binding(mut self, binding: ResourceBinding) -> Self {
        self.binding = binding;
        self
    }
}

impl ShaderProvider for TestShaderProvider {
    fn uniform_hooks(&self) -> &[UniformHook] {
        &self.hooks
    }

    fn resource_binding(&self) -> ResourceBinding {
        self.binding
    }
}
