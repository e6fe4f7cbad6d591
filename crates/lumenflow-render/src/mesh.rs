//! Mesh provider contract.
//!
//! A mesh is either *baked* (lives in a pre-existing GPU vertex array with
//! fixed offsets) or *dynamic* (regenerated every frame through a fill
//! closure into a CPU vertex builder).

use std::fmt;
use std::sync::Arc;

use glam::Mat4;

use crate::resource::VertexWriter;
use crate::setting::{PrimitiveTopology, SourceId};

/// Fill routine for dynamic meshes.
///
/// Writes the mesh's vertices into `writer` with `transform` baked in.
pub trait MeshFill: Send + Sync {
    fn fill(&self, writer: &mut VertexWriter, transform: &Mat4);
}

impl<F> MeshFill for F
where
    F: Fn(&mut VertexWriter, &Mat4) + Send + Sync,
{
    fn fill(&self, writer: &mut VertexWriter, transform: &Mat4) {
        self(writer, transform)
    }
}

/// Where a mesh's geometry lives.
#[derive(Clone)]
pub enum MeshSource {
    /// Pre-existing GPU geometry with fixed offsets; never repacked.
    Baked {
        source: SourceId,
        vertex_offset: u32,
        index_offset: u32,
    },
    /// Per-frame geometry generated through the fill closure; packed fresh
    /// each frame.
    Dynamic { fill: Arc<dyn MeshFill> },
}

impl fmt::Debug for MeshSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeshSource::Baked {
                source,
                vertex_offset,
                index_offset,
            } => f
                .debug_struct("Baked")
                .field("source", source)
                .field("vertex_offset", vertex_offset)
                .field("index_offset", index_offset)
                .finish(),
            MeshSource::Dynamic { .. } => f.debug_struct("Dynamic").finish_non_exhaustive(),
        }
    }
}

/// Mesh payload resolved from a graphics instance at collection time.
#[derive(Debug, Clone)]
pub struct Mesh {
    pub source: MeshSource,
    pub topology: PrimitiveTopology,
    pub vertex_count: u32,
    pub index_count: u32,
}

impl Mesh {
    pub fn baked(
        source: SourceId,
        topology: PrimitiveTopology,
        vertex_count: u32,
        index_count: u32,
        vertex_offset: u32,
        index_offset: u32,
    ) -> Self {
        Self {
            source: MeshSource::Baked {
                source,
                vertex_offset,
                index_offset,
            },
            topology,
            vertex_count,
            index_count,
        }
    }

    pub fn dynamic(
        topology: PrimitiveTopology,
        vertex_count: u32,
        index_count: u32,
        fill: Arc<dyn MeshFill>,
    ) -> Self {
        Self {
            source: MeshSource::Dynamic { fill },
            topology,
            vertex_count,
            index_count,
        }
    }

    /// The geometry-source identity used for batch keys: the baked handle,
    /// or [`SourceId::DYNAMIC`] for per-frame geometry.
    pub fn source_id(&self) -> SourceId {
        match &self.source {
            MeshSource::Baked { source, .. } => *source,
            MeshSource::Dynamic { .. } => SourceId::DYNAMIC,
        }
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self.source, MeshSource::Dynamic { .. })
    }

    /// Fixed offsets for baked meshes; dynamic meshes get theirs assigned
    /// during packing.
    pub fn baked_offsets(&self) -> Option<(u32, u32)> {
        match &self.source {
            MeshSource::Baked {
                vertex_offset,
                index_offset,
                ..
            } => Some((*vertex_offset, *index_offset)),
            MeshSource::Dynamic { .. } => None,
        }
    }
}
