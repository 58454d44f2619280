use crate::renderer::contexts::device_ctx::backend::ResourceId;
use crate::renderer::contexts::device_ctx::command_encoder::CommandEncoder;
use crate::renderer::contexts::device_ctx::device::RenderDevice;
use crate::renderer::error::{RenderError, Result};
use crate::renderer::internals::descriptor_allocator::DescriptorHandle;
use crate::renderer::internals::descriptor_heap::DescriptorHeaps;
use crate::renderer::resources::desc::{
    Format, HeapKind, ResourceDesc, ResourceState, ResourceUsage, ViewDesc, ViewKey, ViewKind, ViewRange,
};
use crate::renderer::resources::memory_heap::HeapInfo;
use crate::renderer::resources::resource::{GpuResource, ResourceParams};
use crate::renderer::resources::upload::UploadStaging;

pub const CONSTANT_BUFFER_ALIGNMENT: u64 = 256;

/// Rounds up to the size constant buffer views must cover
pub fn align_constant_buffer_size(size: u64) -> u64 {
    (size + CONSTANT_BUFFER_ALIGNMENT - 1) & !(CONSTANT_BUFFER_ALIGNMENT - 1)
}

#[derive(Debug, Clone)]
pub struct BufferCreateInfo {
    pub name: String,
    pub element_count: u64,
    pub element_size: u32,
    pub usage: ResourceUsage,
    pub initial_state: ResourceState,
    pub heap: HeapKind,
    pub heap_info: Option<HeapInfo>,
}

impl BufferCreateInfo {
    /// A GPU-only buffer starting in the common state
    pub fn new(name: &str, element_count: u64, element_size: u32) -> Self {
        Self {
            name: name.to_string(),
            element_count,
            element_size,
            usage: ResourceUsage::empty(),
            initial_state: ResourceState::Common,
            heap: HeapKind::Default,
            heap_info: None,
        }
    }

    /// Moves the buffer to another heap, along with the state that heap requires
    pub fn in_heap(mut self, heap: HeapKind) -> Self {
        self.heap = heap;
        self.initial_state = heap.required_state().unwrap_or(ResourceState::Common);
        self
    }

    pub fn with_usage(mut self, usage: ResourceUsage) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_initial_state(mut self, state: ResourceState) -> Self {
        self.initial_state = state;
        self
    }

    pub fn placed(mut self, heap_info: HeapInfo) -> Self {
        self.heap = heap_info.heap.kind();
        self.initial_state = self.heap.required_state().unwrap_or(self.initial_state);
        self.heap_info = Some(heap_info);
        self
    }

    /// Saturates; [`Buffer::new`] rejects sizes that overflow
    pub fn byte_size(&self) -> u64 {
        self.element_count.saturating_mul(self.element_size as u64)
    }

    fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| RenderError::InvalidCreateInfo {
            name: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.element_count == 0 || self.element_size == 0 {
            return Err(invalid("buffers need at least one element of non-zero size"));
        }
        if self.element_count.checked_mul(self.element_size as u64).is_none() {
            return Err(invalid("byte size overflows a u64"));
        }
        if self.usage.intersects(ResourceUsage::RENDER_TARGET | ResourceUsage::DEPTH_STENCIL) {
            return Err(invalid("buffers cannot be render or depth-stencil targets"));
        }
        if let Some(required) = self.heap.required_state() {
            if self.initial_state != required {
                return Err(invalid(&format!(
                    "{:?} heap buffers must start in {:?}",
                    self.heap, required
                )));
            }
        }
        Ok(())
    }
}

/// Input to the input assembler for vertex data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexBufferView {
    pub gpu_address: u64,
    pub size_in_bytes: u64,
    pub stride: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexBufferView {
    pub gpu_address: u64,
    pub size_in_bytes: u64,
    pub format: Format,
}

#[derive(Debug)]
pub struct Buffer {
    resource: GpuResource,
    element_count: u64,
    element_size: u32,
    // Boxed: the staging twin is itself a Buffer
    staging: Option<Box<UploadStaging>>,
}

impl Buffer {
    pub fn new(
        device: &RenderDevice,
        heaps: &DescriptorHeaps,
        info: &BufferCreateInfo,
    ) -> Result<Self> {
        info.validate()?;

        let resource = GpuResource::create(device, heaps, ResourceParams {
            name: &info.name,
            desc: ResourceDesc::Buffer {
                size: info.byte_size(),
                usage: info.usage,
            },
            heap_kind: info.heap,
            initial_state: info.initial_state,
            clear_value: None,
            heap_info: info.heap_info.as_ref(),
        })?;

        Ok(Self {
            resource,
            element_count: info.element_count,
            element_size: info.element_size,
            staging: None,
        })
    }

    pub fn resource(&self) -> &GpuResource {
        &self.resource
    }

    pub fn resource_mut(&mut self) -> &mut GpuResource {
        &mut self.resource
    }

    pub fn id(&self) -> ResourceId {
        self.resource.id()
    }

    pub fn name(&self) -> &str {
        self.resource.name()
    }

    pub fn byte_size(&self) -> u64 {
        self.resource.byte_size()
    }

    pub fn element_count(&self) -> u64 {
        self.element_count
    }

    pub fn element_size(&self) -> u32 {
        self.element_size
    }

    pub fn state(&self) -> ResourceState {
        self.resource.state()
    }

    pub fn transition(
        &mut self,
        encoder: &mut CommandEncoder,
        after: ResourceState,
    ) -> Result<()> {
        self.resource.transition(encoder, after)
    }

    /// Structured view over every element
    pub fn shader_resource_view(&mut self) -> Result<DescriptorHandle> {
        let (count, stride) = (self.element_count, self.element_size);
        self.resource.view(ViewKey::new(ViewKind::ShaderResource, None), |res| {
            if res.desc().usage().contains(ResourceUsage::DENY_SHADER_RESOURCE) {
                return Err(RenderError::UnsupportedView {
                    name: res.name().to_string(),
                    view: ViewKind::ShaderResource,
                });
            }
            Ok(whole_buffer_view(ViewKind::ShaderResource, count, stride))
        })
    }

    pub fn unordered_access_view(&mut self) -> Result<DescriptorHandle> {
        let (count, stride) = (self.element_count, self.element_size);
        self.resource.view(ViewKey::new(ViewKind::UnorderedAccess, None), |res| {
            require_usage(res, ViewKind::UnorderedAccess, ResourceUsage::UNORDERED_ACCESS)?;
            Ok(whole_buffer_view(ViewKind::UnorderedAccess, count, stride))
        })
    }

    /// Constant buffer view of the whole buffer; its size must be a multiple of 256 bytes
    pub fn constant_buffer_view(&mut self) -> Result<DescriptorHandle> {
        self.constant_buffer_view_range(None, 0, self.byte_size())
    }

    pub(crate) fn constant_buffer_view_range(
        &mut self,
        subresource: Option<u32>,
        offset: u64,
        size: u64,
    ) -> Result<DescriptorHandle> {
        self.resource.view(ViewKey::new(ViewKind::ConstantBuffer, subresource), |res| {
            if size % CONSTANT_BUFFER_ALIGNMENT != 0 || offset % CONSTANT_BUFFER_ALIGNMENT != 0 {
                return Err(RenderError::InvalidCreateInfo {
                    name: res.name().to_string(),
                    reason: format!(
                        "constant buffer views need {}-byte aligned offset and size, got {} at {}",
                        CONSTANT_BUFFER_ALIGNMENT, size, offset
                    ),
                });
            }
            Ok(ViewDesc {
                kind: ViewKind::ConstantBuffer,
                format: Format::Unknown,
                range: ViewRange::Buffer {
                    offset,
                    size,
                    stride: size as u32,
                },
            })
        })
    }

    pub fn vertex_buffer_view(&self) -> Result<VertexBufferView> {
        Ok(VertexBufferView {
            gpu_address: self.resource.gpu_virtual_address()?,
            size_in_bytes: self.byte_size(),
            stride: self.element_size,
        })
    }

    /// Index buffers hold 16- or 32-bit indices
    pub fn index_buffer_view(&self) -> Result<IndexBufferView> {
        let format = match self.element_size {
            2 => Format::R16Uint,
            4 => Format::R32Uint,
            other => {
                return Err(RenderError::InvalidCreateInfo {
                    name: self.name().to_string(),
                    reason: format!("index elements must be 2 or 4 bytes, not {}", other),
                });
            }
        };

        Ok(IndexBufferView {
            gpu_address: self.resource.gpu_virtual_address()?,
            size_in_bytes: self.byte_size(),
            format,
        })
    }

    /// Replaces the whole contents of an upload-heap buffer
    pub fn write_mapped(&mut self, data: &[u8]) -> Result<()> {
        if self.resource.heap_kind() != HeapKind::Upload {
            return Err(RenderError::NotCpuVisible {
                name: self.name().to_string(),
                heap: self.resource.heap_kind(),
            });
        }
        if data.len() as u64 != self.byte_size() {
            return Err(RenderError::UploadSizeMismatch {
                name: self.name().to_string(),
                expected: self.byte_size(),
                actual: data.len() as u64,
            });
        }
        self.resource.device().write_mapped(self.id(), 0, data)?;

        Ok(())
    }

    /// Writes part of an upload-heap buffer
    pub fn write_mapped_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if self.resource.heap_kind() != HeapKind::Upload {
            return Err(RenderError::NotCpuVisible {
                name: self.name().to_string(),
                heap: self.resource.heap_kind(),
            });
        }
        self.resource.device().write_mapped(self.id(), offset, data)?;

        Ok(())
    }

    /// Contents of an upload or readback buffer. Readback data is only valid once the copy has completed.
    pub fn read_mapped(&self) -> Result<Vec<u8>> {
        if !self.resource.heap_kind().is_cpu_visible() {
            return Err(RenderError::NotCpuVisible {
                name: self.name().to_string(),
                heap: self.resource.heap_kind(),
            });
        }
        self.resource.device().read_bytes(self.id(), 0, self.byte_size() as usize)
    }

    /// Creates the upload-heap twin used by [`Buffer::upload_data`]
    pub fn initialize_upload(&mut self, heap_info: Option<HeapInfo>) -> Result<()> {
        self.staging = Some(Box::new(UploadStaging::for_resource(&self.resource, heap_info)?));
        Ok(())
    }

    pub fn has_staging(&self) -> bool {
        self.staging.is_some()
    }

    /// Drops the staging buffer; only safe once the last copy out of it has completed
    pub fn release_staging(&mut self) -> Option<UploadStaging> {
        self.staging.take().map(|staging| *staging)
    }

    /// Stages `data` and records a full copy into this buffer.
    /// The caller is responsible for the barriers around the copy.
    pub fn upload_data(
        &mut self,
        encoder: &mut CommandEncoder,
        data: &[u8],
    ) -> Result<()> {
        let staging = self.staging.as_mut().ok_or_else(|| RenderError::MissingStaging {
            name: self.resource.name().to_string(),
        })?;
        staging.upload_data(data)?;
        staging.record_copy(encoder, &self.resource)
    }
}

fn whole_buffer_view(kind: ViewKind, count: u64, stride: u32) -> ViewDesc {
    ViewDesc {
        kind,
        format: Format::Unknown,
        range: ViewRange::Buffer {
            offset: 0,
            size: count * stride as u64,
            stride,
        },
    }
}

pub(crate) fn require_usage(res: &GpuResource, view: ViewKind, usage: ResourceUsage) -> Result<()> {
    if res.desc().usage().contains(usage) {
        Ok(())
    } else {
        Err(RenderError::MissingUsage {
            name: res.name().to_string(),
            view,
            usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use super::*;
    use crate::renderer::contexts::device_ctx::backend::PLACEMENT_ALIGNMENT;
    use crate::renderer::contexts::device_ctx::headless::{HeadlessBackend, HeadlessDesc};
    use crate::renderer::internals::descriptor_heap::lock_heap;
    use crate::renderer::resources::memory_heap::MemoryHeap;

    struct Fixture {
        backend: Arc<HeadlessBackend>,
        device: RenderDevice,
        heaps: DescriptorHeaps,
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(HeadlessBackend::new(HeadlessDesc::default()));
        let device = RenderDevice::new(backend.clone());
        let heaps = DescriptorHeaps::new(&device, 4, 4, 8, 2).unwrap();
        Fixture { backend, device, heaps }
    }

    fn submit_and_wait(f: &Fixture, encoder: &mut CommandEncoder) {
        let commands = encoder.end_recording().unwrap();
        let fence = f.device.create_fence(0).unwrap();
        f.device.submit(&commands, Some((fence, 1))).unwrap();
        f.device.wait_for_fence(fence, 1).unwrap();
    }

    #[test]
    fn upload_then_readback_round_trips() {
        let f = fixture();
        let mut gpu = Buffer::new(&f.device, &f.heaps, &BufferCreateInfo::new("Payload", 256, 1)).unwrap();
        let mut readback = Buffer::new(
            &f.device,
            &f.heaps,
            &BufferCreateInfo::new("PayloadReadback", 256, 1).in_heap(HeapKind::Readback),
        ).unwrap();
        gpu.initialize_upload(None).unwrap();

        let mut encoder = CommandEncoder::new();
        encoder.begin_recording().unwrap();
        gpu.transition(&mut encoder, ResourceState::CopyDest).unwrap();
        gpu.upload_data(&mut encoder, &[0xAB; 256]).unwrap();
        gpu.transition(&mut encoder, ResourceState::CopySource).unwrap();
        encoder.copy_resource(readback.id(), gpu.id()).unwrap();
        submit_and_wait(&f, &mut encoder);

        assert_eq!(readback.read_mapped().unwrap(), vec![0xAB; 256]);
        assert_eq!(f.backend.contents(gpu.id()).unwrap(), vec![0xAB; 256]);
        assert!(matches!(readback.write_mapped(&[0; 256]), Err(RenderError::NotCpuVisible { .. })));
    }

    #[test]
    fn uploads_must_replace_everything() {
        let f = fixture();
        let mut gpu = Buffer::new(&f.device, &f.heaps, &BufferCreateInfo::new("Short", 64, 4)).unwrap();
        let mut encoder = CommandEncoder::new();
        encoder.begin_recording().unwrap();

        assert!(matches!(
            gpu.upload_data(&mut encoder, &[0; 256]),
            Err(RenderError::MissingStaging { .. })
        ));

        gpu.initialize_upload(None).unwrap();
        assert!(matches!(
            gpu.upload_data(&mut encoder, &[0; 255]),
            Err(RenderError::UploadSizeMismatch { expected: 256, actual: 255, .. })
        ));
        assert!(encoder.commands().is_empty());
    }

    #[test]
    fn staging_only_pairs_with_default_heap_buffers() {
        let f = fixture();
        let mut upload = Buffer::new(
            &f.device,
            &f.heaps,
            &BufferCreateInfo::new("Upload", 16, 4).in_heap(HeapKind::Upload),
        ).unwrap();
        assert!(matches!(
            upload.initialize_upload(None),
            Err(RenderError::WrongHeapKind { expected: HeapKind::Default, .. })
        ));
        upload.write_mapped(&[1; 64]).unwrap();
        assert_eq!(upload.read_mapped().unwrap(), vec![1; 64]);
    }

    #[test]
    fn views_are_created_once() {
        let f = fixture();
        let mut buffer = Buffer::new(
            &f.device,
            &f.heaps,
            &BufferCreateInfo::new("Particles", 64, 16).with_usage(ResourceUsage::UNORDERED_ACCESS),
        ).unwrap();

        let srv = buffer.shader_resource_view().unwrap();
        assert_eq!(buffer.shader_resource_view().unwrap(), srv);
        let uav = buffer.unordered_access_view().unwrap();
        assert_ne!(uav, srv);
        assert_eq!(buffer.unordered_access_view().unwrap(), uav);
        assert_eq!(buffer.resource().view_count(), 2);
        assert_eq!(f.backend.stats().views_written, 2);
    }

    #[test]
    fn unordered_access_needs_the_usage_flag() {
        let f = fixture();
        let mut buffer = Buffer::new(&f.device, &f.heaps, &BufferCreateInfo::new("Plain", 4, 4)).unwrap();
        assert!(matches!(
            buffer.unordered_access_view(),
            Err(RenderError::MissingUsage { view: ViewKind::UnorderedAccess, .. })
        ));
        assert_eq!(buffer.resource().view_count(), 0);
    }

    #[test]
    fn views_need_their_heap() {
        let f = fixture();
        let mut buffer = Buffer::new(&f.device, &DescriptorHeaps::default(), &BufferCreateInfo::new("Lonely", 4, 4)).unwrap();
        assert!(matches!(buffer.shader_resource_view(), Err(RenderError::MissingHeap { .. })));
    }

    #[test]
    fn constant_buffer_views_need_aligned_sizes() {
        let f = fixture();
        let mut odd = Buffer::new(&f.device, &f.heaps, &BufferCreateInfo::new("Odd", 100, 1)).unwrap();
        assert!(matches!(odd.constant_buffer_view(), Err(RenderError::InvalidCreateInfo { .. })));

        let mut even = Buffer::new(&f.device, &f.heaps, &BufferCreateInfo::new("Even", 2, 256)).unwrap();
        even.constant_buffer_view().unwrap();
        assert_eq!(align_constant_buffer_size(100), 256);
        assert_eq!(align_constant_buffer_size(256), 256);
        assert_eq!(align_constant_buffer_size(257), 512);
    }

    #[test]
    fn vertex_and_index_views_describe_the_buffer() {
        let f = fixture();
        let vertices = Buffer::new(&f.device, &f.heaps, &BufferCreateInfo::new("Vertices", 3, 32)).unwrap();
        let view = vertices.vertex_buffer_view().unwrap();
        assert_eq!(view.size_in_bytes, 96);
        assert_eq!(view.stride, 32);
        assert_eq!(view.gpu_address, f.device.gpu_virtual_address(vertices.id()).unwrap());

        let wide = Buffer::new(&f.device, &f.heaps, &BufferCreateInfo::new("Wide", 6, 4)).unwrap();
        assert_eq!(wide.index_buffer_view().unwrap().format, Format::R32Uint);
        let narrow = Buffer::new(&f.device, &f.heaps, &BufferCreateInfo::new("Narrow", 6, 2)).unwrap();
        assert_eq!(narrow.index_buffer_view().unwrap().format, Format::R16Uint);
        let odd = Buffer::new(&f.device, &f.heaps, &BufferCreateInfo::new("Odd", 6, 3)).unwrap();
        assert!(odd.index_buffer_view().is_err());
    }

    #[test]
    fn invalid_buffers_are_rejected() {
        let f = fixture();
        assert!(Buffer::new(&f.device, &f.heaps, &BufferCreateInfo::new("Empty", 0, 4)).is_err());
        assert!(Buffer::new(
            &f.device,
            &f.heaps,
            &BufferCreateInfo::new("Target", 4, 4).with_usage(ResourceUsage::RENDER_TARGET),
        ).is_err());
        assert!(Buffer::new(
            &f.device,
            &f.heaps,
            &BufferCreateInfo::new("Upload", 4, 4)
                .in_heap(HeapKind::Upload)
                .with_initial_state(ResourceState::CopyDest),
        ).is_err());
    }

    #[test]
    fn oversized_buffers_are_rejected_before_the_device_sees_them() {
        let f = fixture();
        assert!(matches!(
            Buffer::new(&f.device, &f.heaps, &BufferCreateInfo::new("Huge", u64::MAX / 2, 4)),
            Err(RenderError::InvalidCreateInfo { .. })
        ));
        assert_eq!(BufferCreateInfo::new("Huge", u64::MAX / 2, 4).byte_size(), u64::MAX);
        assert_eq!(f.backend.stats().resources_created, 0);
    }

    #[test]
    fn released_staging_frees_its_memory() {
        let f = fixture();
        let mut gpu = Buffer::new(&f.device, &f.heaps, &BufferCreateInfo::new("Mesh", 32, 4)).unwrap();
        gpu.initialize_upload(None).unwrap();
        assert!(gpu.has_staging());
        assert_eq!(f.backend.live_resource_count(), 2);

        let staging = gpu.release_staging().unwrap();
        assert_eq!(staging.byte_size(), gpu.byte_size());
        drop(staging);
        assert!(!gpu.has_staging());
        assert_eq!(f.backend.live_resource_count(), 1);
    }

    #[test]
    fn placed_buffers_share_heap_memory() {
        let f = fixture();
        let heap = MemoryHeap::new(&f.device, 2 * PLACEMENT_ALIGNMENT, HeapKind::Upload).unwrap();
        let mut a = Buffer::new(&f.device, &f.heaps, &BufferCreateInfo::new("A", 16, 1).placed(heap.at(0))).unwrap();
        let b = Buffer::new(&f.device, &f.heaps, &BufferCreateInfo::new("B", 16, 1).placed(heap.at(0))).unwrap();

        a.write_mapped(&[9; 16]).unwrap();
        assert_eq!(b.read_mapped().unwrap(), vec![9; 16]);

        assert!(matches!(
            Buffer::new(&f.device, &f.heaps, &BufferCreateInfo::new("Late", 16, 1).placed(heap.at(PLACEMENT_ALIGNMENT + 4))),
            Err(RenderError::InvalidCreateInfo { .. })
        ));
        assert!(matches!(
            Buffer::new(&f.device, &f.heaps, &BufferCreateInfo::new("Huge", 3 * PLACEMENT_ALIGNMENT, 1).placed(heap.at(0))),
            Err(RenderError::InvalidCreateInfo { .. })
        ));
        let mut mismatched = BufferCreateInfo::new("Mismatched", 16, 1).placed(heap.at(0));
        mismatched.heap = HeapKind::Default;
        mismatched.initial_state = ResourceState::Common;
        assert!(matches!(
            Buffer::new(&f.device, &f.heaps, &mismatched),
            Err(RenderError::WrongHeapKind { .. })
        ));
    }

    #[test]
    fn dropping_releases_views_and_memory() {
        let f = fixture();
        let mut buffer = Buffer::new(&f.device, &f.heaps, &BufferCreateInfo::new("Temp", 4, 4)).unwrap();
        buffer.shader_resource_view().unwrap();
        assert_eq!(f.backend.live_resource_count(), 1);

        drop(buffer);
        assert_eq!(f.backend.live_resource_count(), 0);
        let heap = f.heaps.cbv_srv_uav.as_ref().unwrap();
        assert_eq!(lock_heap(heap).unwrap().live_count(), 0);
    }
}
