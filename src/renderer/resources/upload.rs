use crate::renderer::contexts::device_ctx::command_encoder::CommandEncoder;
use crate::renderer::error::{RenderError, Result};
use crate::renderer::internals::descriptor_heap::DescriptorHeaps;
use crate::renderer::resources::buffer::{Buffer, BufferCreateInfo};
use crate::renderer::resources::desc::HeapKind;
use crate::renderer::resources::memory_heap::HeapInfo;
use crate::renderer::resources::resource::GpuResource;

/// Permanently mapped upload-heap twin of a GPU-only resource.
///
/// Stays in the generic-read state for its whole life. Nothing here fences: the
/// staging memory must not be rewritten or freed until the GPU copy out of it is done.
#[derive(Debug)]
pub struct UploadStaging {
    buffer: Buffer,
}

impl UploadStaging {
    /// Creates staging memory the same byte size as `target`
    pub fn for_resource(
        target: &GpuResource,
        heap_info: Option<HeapInfo>,
    ) -> Result<Self> {
        if target.heap_kind() != HeapKind::Default {
            return Err(RenderError::WrongHeapKind {
                name: target.name().to_string(),
                heap: target.heap_kind(),
                expected: HeapKind::Default,
            });
        }

        let mut info = BufferCreateInfo::new(&format!("{}Upload", target.name()), target.byte_size(), 1)
            .in_heap(HeapKind::Upload);
        // Placement heaps of any other kind are refused when the buffer is created
        info.heap_info = heap_info;

        // Staging memory is never viewed by shaders
        let buffer = Buffer::new(target.device(), &DescriptorHeaps::default(), &info)?;

        Ok(Self { buffer })
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    pub fn byte_size(&self) -> u64 {
        self.buffer.byte_size()
    }

    /// Copies `data` into the mapped memory; the whole buffer is replaced at once
    pub fn upload_data(&mut self, data: &[u8]) -> Result<()> {
        self.buffer.write_mapped(data)
    }

    /// Records the full copy from staging into `dst`
    pub fn record_copy(
        &self,
        encoder: &mut CommandEncoder,
        dst: &GpuResource,
    ) -> Result<()> {
        encoder.copy_resource(dst.id(), self.buffer.id())
    }
}
