//! Render settings and the keys derived from them.
//!
//! A [`RenderSetting`] is the immutable value identifying "things that can
//! share a batch": fixed-function state, resource bindings, and the static
//! render parameters (topology, vertex layout, usage). Batches reference
//! settings through `Arc` and never own them.

use std::sync::Arc;

use bitflags::bitflags;

bitflags! {
    /// Fixed-function render state carried by a setting.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RenderState: u32 {
        const DEPTH_TEST  = 1 << 0;
        const DEPTH_WRITE = 1 << 1;
        const BLEND       = 1 << 2;
        const CULL_BACK   = 1 << 3;
        const WIREFRAME   = 1 << 4;
    }
}

impl Default for RenderState {
    fn default() -> Self {
        RenderState::DEPTH_TEST | RenderState::DEPTH_WRITE | RenderState::CULL_BACK
    }
}

/// Primitive topology for draw commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    TriangleList,
    TriangleStrip,
}

/// Buffer usage hint for the vertex resource backing a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    /// Geometry baked once into a GPU resource.
    Static,
    /// Geometry rebuilt every frame by the packing pass.
    Dynamic,
}

/// Handle to a vertex attribute layout owned by the vertex resource manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexLayoutId(pub u32);

/// Identifies a texture/buffer binding set owned by the shader layer.
///
/// `NONE` means "no bindings beyond the setting's defaults".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ResourceBinding(pub u64);

impl ResourceBinding {
    pub const NONE: ResourceBinding = ResourceBinding(0);
}

/// Static render parameters: everything about a draw that is fixed at
/// configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderParameter {
    pub topology: PrimitiveTopology,
    pub layout: VertexLayoutId,
    pub usage: BufferUsage,
    /// True when one indirect command covers the whole batch with
    /// per-instance attribute data.
    pub instanced: bool,
    /// True when draws go through an index buffer.
    pub indexed: bool,
}

/// Identity of the geometry source backing an instance.
///
/// For baked meshes this is the handle of the backing vertex array; dynamic
/// per-frame geometry shares [`SourceId::DYNAMIC`]. [`SourceId::NONE`] marks
/// "no mesh" (compute, raw functions).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(pub i64);

impl SourceId {
    pub const NONE: SourceId = SourceId(-1);
    pub const DYNAMIC: SourceId = SourceId(0);

    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }
}

/// Immutable render-compatibility value: state + bindings + parameters.
///
/// Equality is by value; owned by configuration and shared via `Arc`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RenderSetting {
    pub state: RenderState,
    pub binding: ResourceBinding,
    pub parameter: RenderParameter,
}

impl RenderSetting {
    pub fn new(state: RenderState, binding: ResourceBinding, parameter: RenderParameter) -> Self {
        Self {
            state,
            binding,
            parameter,
        }
    }
}

/// Map key for persistent batch allocation.
///
/// Two instances map to the same batch key iff they are render-compatible
/// and share source geometry identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchKey {
    pub setting: Arc<RenderSetting>,
    pub source: SourceId,
}

impl BatchKey {
    pub fn new(setting: Arc<RenderSetting>, source: SourceId) -> Self {
        Self { setting, source }
    }
}

/// Selects the physical GPU vertex resource a group of batches packs into.
///
/// Derived from the static render parameter plus the geometry source; every
/// batch under one key shares one vertex resource and one indirect buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexBufferKey {
    pub parameter: RenderParameter,
    pub source: SourceId,
}

impl VertexBufferKey {
    pub fn new(parameter: RenderParameter, source: SourceId) -> Self {
        Self { parameter, source }
    }
}
