use bytemuck::Pod;
use crate::renderer::contexts::device_ctx::backend::ResourceId;
use crate::renderer::contexts::device_ctx::device::RenderDevice;
use crate::renderer::error::{RenderError, Result};
use crate::renderer::internals::descriptor_allocator::DescriptorHandle;
use crate::renderer::internals::descriptor_heap::DescriptorHeaps;
use crate::renderer::resources::buffer::{align_constant_buffer_size, Buffer, BufferCreateInfo};
use crate::renderer::resources::desc::HeapKind;
use crate::renderer::resources::memory_heap::HeapInfo;

#[derive(Debug, Clone)]
pub struct ConstantBufferCreateInfo {
    pub name: String,
    pub element_count: u64,
    /// Unaligned size of one element; rounded up to 256 bytes on creation
    pub element_size: u32,
    pub heap_info: Option<HeapInfo>,
}

impl ConstantBufferCreateInfo {
    pub fn new(name: &str, element_count: u64, element_size: u32) -> Self {
        Self {
            name: name.to_string(),
            element_count,
            element_size,
            heap_info: None,
        }
    }

    /// Sized for `element_count` values of `T`
    pub fn of<T: Pod>(name: &str, element_count: u64) -> Self {
        Self::new(name, element_count, size_of::<T>() as u32)
    }

    pub fn placed(mut self, heap_info: HeapInfo) -> Self {
        self.heap_info = Some(heap_info);
        self
    }
}

/// Array of 256-byte aligned elements in permanently mapped upload memory.
/// Every element can be bound through its own constant buffer view.
#[derive(Debug)]
pub struct ConstantBuffer {
    buffer: Buffer,
}

impl ConstantBuffer {
    pub fn new(
        device: &RenderDevice,
        heaps: &DescriptorHeaps,
        info: &ConstantBufferCreateInfo,
    ) -> Result<Self> {
        let stride = align_constant_buffer_size(info.element_size as u64);
        let mut buffer_info = BufferCreateInfo::new(&info.name, info.element_count, stride as u32)
            .in_heap(HeapKind::Upload);
        if let Some(heap_info) = &info.heap_info {
            buffer_info = buffer_info.placed(heap_info.clone());
        }

        Ok(Self {
            buffer: Buffer::new(device, heaps, &buffer_info)?,
        })
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    pub fn id(&self) -> ResourceId {
        self.buffer.id()
    }

    pub fn name(&self) -> &str {
        self.buffer.name()
    }

    pub fn element_count(&self) -> u64 {
        self.buffer.element_count()
    }

    /// Aligned size of one element
    pub fn element_stride(&self) -> u64 {
        self.buffer.element_size() as u64
    }

    /// Writes `value` at the start of element `index`
    pub fn upload_element<T: Pod>(&mut self, index: u64, value: &T) -> Result<()> {
        self.check_index(index)?;
        let bytes = bytemuck::bytes_of(value);
        if bytes.len() as u64 > self.element_stride() {
            return Err(RenderError::UploadSizeMismatch {
                name: self.name().to_string(),
                expected: self.element_stride(),
                actual: bytes.len() as u64,
            });
        }
        let offset = index * self.element_stride();
        self.buffer.write_mapped_at(offset, bytes)
    }

    /// Replaces the whole buffer, padding included
    pub fn upload_data(&mut self, data: &[u8]) -> Result<()> {
        self.buffer.write_mapped(data)
    }

    /// View of the whole array
    pub fn constant_buffer_view(&mut self) -> Result<DescriptorHandle> {
        self.buffer.constant_buffer_view()
    }

    /// View of element `index` only
    pub fn element_view(&mut self, index: u64) -> Result<DescriptorHandle> {
        self.check_index(index)?;
        let stride = self.element_stride();
        let subresource = u32::try_from(index).map_err(|_| RenderError::ElementOutOfRange {
            name: self.name().to_string(),
            index,
            count: self.element_count(),
        })?;
        self.buffer.constant_buffer_view_range(Some(subresource), index * stride, stride)
    }

    /// GPU address of element `index`, for root constant buffer bindings
    pub fn gpu_address(&self, index: u64) -> Result<u64> {
        self.check_index(index)?;
        Ok(self.buffer.resource().gpu_virtual_address()? + index * self.element_stride())
    }

    fn check_index(&self, index: u64) -> Result<()> {
        if index >= self.element_count() {
            return Err(RenderError::ElementOutOfRange {
                name: self.name().to_string(),
                index,
                count: self.element_count(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use bytemuck::Zeroable;
    use glam::Mat4;
    use super::*;
    use crate::renderer::contexts::device_ctx::headless::{HeadlessBackend, HeadlessDesc};
    use crate::renderer::resources::desc::ResourceState;

    #[repr(C)]
    #[derive(Debug, Clone, Copy, Pod, Zeroable)]
    struct PerObject {
        model: Mat4,
        tint: [f32; 4],
    }

    fn fixture() -> (Arc<HeadlessBackend>, RenderDevice, DescriptorHeaps) {
        let backend = Arc::new(HeadlessBackend::new(HeadlessDesc::default()));
        let device = RenderDevice::new(backend.clone());
        let heaps = DescriptorHeaps::new(&device, 1, 1, 8, 2).unwrap();
        (backend, device, heaps)
    }

    #[test]
    fn elements_are_padded_to_256_bytes() {
        let (backend, device, heaps) = fixture();
        let mut cb = ConstantBuffer::new(&device, &heaps, &ConstantBufferCreateInfo::of::<PerObject>("PerObject", 3)).unwrap();
        assert_eq!(cb.element_stride(), 256);
        assert_eq!(cb.buffer().byte_size(), 768);
        assert_eq!(cb.buffer().state(), ResourceState::GenericRead);

        let value = PerObject { model: Mat4::IDENTITY, tint: [0.5; 4] };
        cb.upload_element(1, &value).unwrap();

        let contents = backend.contents(cb.id()).unwrap();
        assert_eq!(&contents[256..256 + size_of::<PerObject>()], bytemuck::bytes_of(&value));
        assert!(contents[..256].iter().all(|&b| b == 0));
    }

    #[test]
    fn element_indices_are_checked() {
        let (_, device, heaps) = fixture();
        let mut cb = ConstantBuffer::new(&device, &heaps, &ConstantBufferCreateInfo::new("Small", 2, 16)).unwrap();
        assert!(matches!(
            cb.upload_element(2, &[0u32; 4]),
            Err(RenderError::ElementOutOfRange { index: 2, count: 2, .. })
        ));
        assert!(cb.gpu_address(2).is_err());
        assert!(matches!(
            cb.upload_element(0, &[0u32; 128]),
            Err(RenderError::UploadSizeMismatch { .. })
        ));
    }

    #[test]
    fn each_element_has_its_own_view() {
        let (_, device, heaps) = fixture();
        let mut cb = ConstantBuffer::new(&device, &heaps, &ConstantBufferCreateInfo::new("Frame", 2, 64)).unwrap();

        let whole = cb.constant_buffer_view().unwrap();
        let first = cb.element_view(0).unwrap();
        let second = cb.element_view(1).unwrap();
        assert_ne!(first, second);
        assert_ne!(whole, first);
        assert_eq!(cb.element_view(1).unwrap(), second);
        assert_eq!(cb.gpu_address(1).unwrap() - cb.gpu_address(0).unwrap(), 256);
    }
}
