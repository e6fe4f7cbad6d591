//! Render-flow batching engine.
//!
//! Groups heterogeneous graphics instances into GPU-efficient batches,
//! deduplicates uniform state, packs indirect multi-draw buffers, and
//! executes commands in stage order through a backend-agnostic driver
//! facade.
//!
//! The frame loop lives in [`pipeline::FlowDriver`]:
//!
//! 1. instances tick and get swept for discards,
//! 2. each flow's [`flow::RenderFlowStrategy`] collects per-frame
//!    [`instance::InstanceInfo`] into [`batch::BatchContainer`]s,
//! 3. strategies turn batches into [`command::RenderCommand`]s (the
//!    rasterization strategy packs vertex builders and indirect buffers on
//!    the way),
//! 4. uploads flush once and the [`command::RenderCommandQueue`] executes
//!    stage by stage against a [`driver::GraphicsDriver`].

pub mod batch;
pub mod command;
pub mod compute_flow;
pub mod driver;
pub mod flow;
pub mod function_flow;
pub mod indirect;
pub mod instance;
pub mod mesh;
pub mod pipeline;
pub mod raster;
pub mod resource;
pub mod setting;
pub mod testing;
pub mod uniform;
pub mod wgpu_driver;

pub use batch::{BatchContainer, RenderBatch};
pub use command::{
    DrawRange, DrawShard, QueueRunStats, RenderCommand, RenderCommandKind, RenderCommandQueue,
    StageId,
};
pub use compute_flow::ComputeFlowStrategy;
pub use driver::GraphicsDriver;
pub use flow::{
    CollectContext, CommandsBySetting, FlowError, FlowStrategyProvider, RenderFlowContext,
    RenderFlowRegistry, RenderFlowStrategy, RenderFlowType, RegistryError,
};
pub use function_flow::FunctionFlowStrategy;
pub use indirect::{
    DrawIndexedIndirectCommand, DrawIndirectCommand, IndirectBufferId, IndirectBufferRegistry,
    IndirectCommandBuffer,
};
pub use instance::{
    ComputeDispatch, ComputeInstanceInfo, FunctionInstanceInfo, GraphicsInstance,
    InstanceDataWriter, InstanceInfo, RasterizationInstanceInfo, TickContext,
};
pub use mesh::{Mesh, MeshFill, MeshSource};
pub use pipeline::{FlowDriver, FlowDriverError, FlowFrameStats};
pub use raster::RasterizationFlowStrategy;
pub use resource::{
    RenderPostProcessor, VertexResourceId, VertexResourceManager, VertexUploadProcessor,
    VertexWriter,
};
pub use setting::{
    BatchKey, BufferUsage, PrimitiveTopology, RenderParameter, RenderSetting, RenderState,
    ResourceBinding, SourceId, VertexBufferKey, VertexLayoutId,
};
pub use uniform::{
    ShaderProvider, UniformBatchGroup, UniformHook, UniformValue, UniformValueSnapshot,
};
pub use wgpu_driver::{WgpuDriver, WgpuPass, WgpuVertexResource};
