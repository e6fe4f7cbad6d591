//! Vertex resources, CPU write builders, and deferred upload tasks.

use glam::{Mat4, Vec2, Vec3, Vec4};

use crate::driver::GraphicsDriver;
use crate::setting::{RenderParameter, VertexBufferKey};

/// Handle to a physical GPU vertex resource (vertex array + buffers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexResourceId(pub u64);

/// Owns the physical vertex resources batches pack into.
///
/// External collaborator: the engine only asks for the resource behind a
/// [`VertexBufferKey`] and for CPU builders sized to a packing pass.
pub trait VertexResourceManager {
    fn get(&mut self, key: &VertexBufferKey) -> VertexResourceId;

    /// A CPU-side write builder for the given parameter, sized for
    /// `capacity` elements (vertices or instances, whichever the packing
    /// pass needs more of).
    fn create_builder(&mut self, parameter: &RenderParameter, capacity: u32) -> VertexWriter;
}

/// Growable CPU-side vertex/instance data builder.
///
/// The `written` flag lets the post-processing pass flush only builders a
/// fill pass actually touched.
pub struct VertexWriter {
    data: Vec<u8>,
    stride: u32,
    written: bool,
}

impl VertexWriter {
    pub fn with_capacity(stride: u32, capacity: u32) -> Self {
        Self {
            data: Vec::with_capacity(stride as usize * capacity as usize),
            stride,
            written: false,
        }
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn written(&self) -> bool {
        self.written
    }

    /// Number of whole elements written so far.
    pub fn element_count(&self) -> u32 {
        if self.stride == 0 {
            0
        } else {
            (self.data.len() / self.stride as usize) as u32
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.written = false;
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
        self.written = true;
    }

    pub fn put_f32(&mut self, value: f32) {
        self.put_bytes(&value.to_le_bytes());
    }

    pub fn put_u32(&mut self, value: u32) {
        self.put_bytes(&value.to_le_bytes());
    }

    pub fn put_vec2(&mut self, value: Vec2) {
        self.put_bytes(bytemuck::bytes_of(&value));
    }

    pub fn put_vec3(&mut self, value: Vec3) {
        self.put_bytes(bytemuck::bytes_of(&value));
    }

    pub fn put_vec4(&mut self, value: Vec4) {
        self.put_bytes(bytemuck::bytes_of(&value));
    }

    pub fn put_mat4(&mut self, value: &Mat4) {
        self.put_bytes(bytemuck::bytes_of(value));
    }

    /// Take the written bytes out, leaving the builder clean for reuse.
    pub fn take(&mut self) -> Vec<u8> {
        self.written = false;
        std::mem::take(&mut self.data)
    }
}

/// Deferred, batched upload task run once after all strategies have
/// produced commands for the frame.
pub trait RenderPostProcessor: Send {
    fn run(&mut self, driver: &mut dyn GraphicsDriver);
}

/// Post-processor that flushes one written vertex builder to its resource.
pub struct VertexUploadProcessor {
    resource: VertexResourceId,
    data: Vec<u8>,
}

impl VertexUploadProcessor {
    pub fn new(resource: VertexResourceId, data: Vec<u8>) -> Self {
        Self { resource, data }
    }
}

impl RenderPostProcessor for VertexUploadProcessor {
    fn run(&mut self, driver: &mut dyn GraphicsDriver) {
        if self.data.is_empty() {
            return;
        }
        driver.upload_vertex_data(self.resource, &self.data);
        self.data.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{DriverCall, RecordingDriver};

    #[test]
    fn test_writer_tracks_written_flag() {
        let mut writer = VertexWriter::with_capacity(16, 4);
        assert!(!writer.written());
        writer.put_vec4(Vec4::ONE);
        assert!(writer.written());
        assert_eq!(writer.element_count(), 1);
        assert_eq!(writer.bytes().len(), 16);
    }

    #[test]
    fn test_writer_take_resets() {
        let mut writer = VertexWriter::with_capacity(4, 4);
        writer.put_f32(1.5);
        let data = writer.take();
        assert_eq!(data.len(), 4);
        assert!(!writer.written());
        assert_eq!(writer.element_count(), 0);
    }

    #[test]
    fn test_upload_processor_flushes_once() {
        let mut writer = VertexWriter::with_capacity(4, 4);
        writer.put_u32(0xDEAD_BEEF);

        let mut processor = VertexUploadProcessor::new(VertexResourceId(3), writer.take());
        let mut driver = RecordingDriver::new();
        processor.run(&mut driver);
        processor.run(&mut driver); // second run is a no-op

        let uploads: Vec<_> = driver
            .calls()
            .iter()
            .filter(|call| matches!(call, DriverCall::UploadVertexData { .. }))
            .collect();
        assert_eq!(uploads.len(), 1);
    }
}
