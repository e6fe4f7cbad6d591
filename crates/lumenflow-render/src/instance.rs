//! Graphics instances and the per-frame info extracted from them.
//!
//! [`GraphicsInstance`] is the external contract one renderable or
//! dispatchable unit of work implements. [`InstanceInfo`] is what the engine
//! actually batches: a closed union of per-flow variants with every
//! capability (mesh, instance writer, transform, shader) resolved once at
//! collection time so the hot packing loop never does runtime type tests.

use std::fmt;
use std::sync::Arc;

use glam::Mat4;
use lumenflow_core::KeyId;

use crate::driver::GraphicsDriver;
use crate::mesh::Mesh;
use crate::resource::VertexWriter;
use crate::setting::{BatchKey, RenderSetting, ResourceBinding, SourceId};
use crate::uniform::ShaderProvider;

/// Per-frame tick context handed to instances.
#[derive(Debug, Clone, Copy)]
pub struct TickContext {
    pub frame: u64,
    pub delta_seconds: f32,
}

/// Writes one instance's worth of instanced attribute data.
pub trait InstanceDataWriter: Send + Sync {
    fn write_instance(&self, writer: &mut VertexWriter, transform: &Mat4);
}

/// A compute dispatch payload: a closure that binds whatever the dispatch
/// needs, plus the workgroup counts the engine issues afterwards.
#[derive(Clone)]
pub struct ComputeDispatch {
    pub run: Arc<dyn Fn(&mut dyn GraphicsDriver) + Send + Sync>,
    pub workgroups: [u32; 3],
}

impl ComputeDispatch {
    pub fn new(
        workgroups: [u32; 3],
        run: impl Fn(&mut dyn GraphicsDriver) + Send + Sync + 'static,
    ) -> Self {
        Self {
            run: Arc::new(run),
            workgroups,
        }
    }
}

impl fmt::Debug for ComputeDispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeDispatch")
            .field("workgroups", &self.workgroups)
            .finish_non_exhaustive()
    }
}

/// One renderable or dispatchable unit of work for a frame.
///
/// The capability accessors (`mesh`, `instance_writer`, `shader_provider`,
/// `dispatch`, `raw_commands`) are polled exactly once, at info-collection
/// time.
pub trait GraphicsInstance: Send + Sync {
    fn identifier(&self) -> KeyId;

    fn should_render(&self) -> bool {
        true
    }

    fn should_discard(&self) -> bool {
        false
    }

    fn should_tick(&self) -> bool {
        false
    }

    fn tick(&self, _ctx: &TickContext) {}

    /// Mesh payload for rasterization instances.
    fn mesh(&self) -> Option<Mesh> {
        None
    }

    fn world_transform(&self) -> Mat4 {
        Mat4::IDENTITY
    }

    /// Per-instance attribute writer for instanced draws.
    fn instance_writer(&self) -> Option<Arc<dyn InstanceDataWriter>> {
        None
    }

    fn shader_provider(&self) -> Option<Arc<dyn ShaderProvider>> {
        None
    }

    /// Dispatch payload for compute instances.
    fn dispatch(&self) -> Option<ComputeDispatch> {
        None
    }

    /// Raw command list for function-flow instances.
    fn raw_commands(&self) -> Option<Arc<dyn Fn(&mut dyn GraphicsDriver) + Send + Sync>> {
        None
    }
}

/// Extracted rendering data for one rasterization instance.
#[derive(Clone)]
pub struct RasterizationInstanceInfo {
    pub id: KeyId,
    pub instance: Arc<dyn GraphicsInstance>,
    pub setting: Arc<RenderSetting>,
    pub binding: ResourceBinding,
    pub mesh: Mesh,
    pub transform: Mat4,
    pub vertex_count: u32,
    pub index_count: u32,
    /// Assigned during packing for dynamic meshes; fixed for baked meshes.
    pub vertex_offset: u32,
    pub index_offset: u32,
    pub writer: Option<Arc<dyn InstanceDataWriter>>,
    pub shader: Option<Arc<dyn ShaderProvider>>,
}

impl RasterizationInstanceInfo {
    /// Element count a draw for this instance covers: indices when the
    /// parameter is indexed, vertices otherwise.
    pub fn element_count(&self) -> u32 {
        if self.setting.parameter.indexed {
            self.index_count
        } else {
            self.vertex_count
        }
    }
}

/// Extracted dispatch data for one compute instance.
#[derive(Clone)]
pub struct ComputeInstanceInfo {
    pub id: KeyId,
    pub instance: Arc<dyn GraphicsInstance>,
    pub setting: Arc<RenderSetting>,
    pub binding: ResourceBinding,
    pub dispatch: ComputeDispatch,
    pub shader: Option<Arc<dyn ShaderProvider>>,
}

/// Extracted payload for one function-flow instance.
#[derive(Clone)]
pub struct FunctionInstanceInfo {
    pub id: KeyId,
    pub instance: Arc<dyn GraphicsInstance>,
    pub setting: Arc<RenderSetting>,
    pub run: Arc<dyn Fn(&mut dyn GraphicsDriver) + Send + Sync>,
}

/// Per-instance extracted rendering data, one variant per flow kind.
#[derive(Clone)]
pub enum InstanceInfo {
    Rasterization(RasterizationInstanceInfo),
    Compute(ComputeInstanceInfo),
    Function(FunctionInstanceInfo),
}

impl InstanceInfo {
    pub fn id(&self) -> &KeyId {
        match self {
            InstanceInfo::Rasterization(info) => &info.id,
            InstanceInfo::Compute(info) => &info.id,
            InstanceInfo::Function(info) => &info.id,
        }
    }

    pub fn setting(&self) -> &Arc<RenderSetting> {
        match self {
            InstanceInfo::Rasterization(info) => &info.setting,
            InstanceInfo::Compute(info) => &info.setting,
            InstanceInfo::Function(info) => &info.setting,
        }
    }

    pub fn instance(&self) -> &Arc<dyn GraphicsInstance> {
        match self {
            InstanceInfo::Rasterization(info) => &info.instance,
            InstanceInfo::Compute(info) => &info.instance,
            InstanceInfo::Function(info) => &info.instance,
        }
    }

    pub fn shader(&self) -> Option<&Arc<dyn ShaderProvider>> {
        match self {
            InstanceInfo::Rasterization(info) => info.shader.as_ref(),
            InstanceInfo::Compute(info) => info.shader.as_ref(),
            InstanceInfo::Function(_) => None,
        }
    }

    /// Geometry-source identity: the mesh's source for rasterization,
    /// [`SourceId::NONE`] for everything without a mesh.
    pub fn source_id(&self) -> SourceId {
        match self {
            InstanceInfo::Rasterization(info) => info.mesh.source_id(),
            InstanceInfo::Compute(_) | InstanceInfo::Function(_) => SourceId::NONE,
        }
    }

    pub fn batch_key(&self) -> BatchKey {
        BatchKey::new(self.setting().clone(), self.source_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TestInstance, test_setting};

    #[test]
    fn test_batch_key_uses_mesh_source() {
        let setting = test_setting(false, false);
        let baked = TestInstance::new("baked").with_baked_mesh(SourceId(9), 12, 0);
        let info = crate::raster::collect_rasterization_info(
            &(Arc::new(baked) as Arc<dyn GraphicsInstance>),
            &setting,
        )
        .unwrap();
        assert_eq!(info.batch_key().source, SourceId(9));
    }

    #[test]
    fn test_compute_info_has_no_source() {
        let setting = test_setting(false, false);
        let instance: Arc<dyn GraphicsInstance> =
            Arc::new(TestInstance::new("c").with_dispatch([1, 1, 1]));
        let info = InstanceInfo::Compute(ComputeInstanceInfo {
            id: instance.identifier(),
            instance: instance.clone(),
            setting,
            binding: ResourceBinding::NONE,
            dispatch: instance.dispatch().unwrap(),
            shader: None,
        });
        assert_eq!(info.source_id(), SourceId::NONE);
        assert!(info.batch_key().source.is_none());
    }
}
