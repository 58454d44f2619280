use std::sync::{Arc, Mutex, MutexGuard};
use crate::renderer::contexts::device_ctx::backend::{DescriptorHeapDesc, DescriptorHeapId, ResourceId};
use crate::renderer::contexts::device_ctx::device::RenderDevice;
use crate::renderer::error::{RenderError, Result};
use crate::renderer::internals::descriptor_allocator::{DescriptorAllocator, DescriptorHandle, DescriptorLayout};
use crate::renderer::resources::desc::{ViewDesc, ViewKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorHeapKind {
    RenderTarget,
    DepthStencil,
    /// Constant buffer, shader resource and unordered access views share one heap
    CbvSrvUav,
}

impl DescriptorHeapKind {
    /// Only the combined heap is read by shaders directly
    pub fn default_shader_visible(&self) -> bool {
        matches!(self, DescriptorHeapKind::CbvSrvUav)
    }
}

pub type SharedDescriptorHeap = Arc<Mutex<DescriptorHeap>>;

/// A backend descriptor heap plus the allocator handing out its slots
#[derive(Debug)]
pub struct DescriptorHeap {
    id: DescriptorHeapId,
    allocator: DescriptorAllocator,
    shader_visible: bool,

    device: RenderDevice,
}

impl DescriptorHeap {
    pub fn new(
        device: &RenderDevice,
        kind: DescriptorHeapKind,
        capacity: u32,
        shader_visible: bool,
        frames_in_flight: u32,
    ) -> Result<Self> {
        if capacity == 0 {
            return Err(RenderError::ZeroCapacity);
        }

        let info = device.create_descriptor_heap(&DescriptorHeapDesc {
            kind,
            capacity,
            shader_visible,
        })?;
        let layout = DescriptorLayout {
            kind,
            capacity,
            stride: info.stride,
            cpu_base: info.cpu_base,
            gpu_base: if shader_visible { info.gpu_base } else { None },
        };
        let allocator = match DescriptorAllocator::new(layout, frames_in_flight) {
            Ok(allocator) => allocator,
            Err(e) => {
                if let Err(destroy_err) = device.destroy_descriptor_heap(info.id) {
                    log::error!("Failed to destroy {:?} descriptor heap {:?}: {}", kind, info.id, destroy_err);
                }
                return Err(e);
            }
        };

        log::debug!(
            "{:?} descriptor heap: {} slots, stride {}, shader visible: {}",
            kind, capacity, info.stride, shader_visible
        );

        Ok(Self {
            id: info.id,
            allocator,
            shader_visible,
            device: device.clone(),
        })
    }

    pub fn shared(self) -> SharedDescriptorHeap {
        Arc::new(Mutex::new(self))
    }

    pub fn id(&self) -> DescriptorHeapId {
        self.id
    }

    pub fn kind(&self) -> DescriptorHeapKind {
        self.allocator.layout().kind
    }

    pub fn is_shader_visible(&self) -> bool {
        self.shader_visible
    }

    pub fn allocator(&self) -> &DescriptorAllocator {
        &self.allocator
    }

    pub fn allocate(&mut self) -> Result<DescriptorHandle> {
        self.allocator.allocate()
    }

    /// Allocates a slot and writes a view of `resource` into it
    pub fn allocate_view(
        &mut self,
        resource: ResourceId,
        view: &ViewDesc,
    ) -> Result<DescriptorHandle> {
        let mut handle = self.allocator.allocate()?;
        if let Err(e) = self.device.write_view(self.id, handle.cpu, resource, view) {
            // Nothing has seen the slot yet
            self.allocator.immediately_deallocate(&mut handle)?;
            return Err(e.into());
        }
        Ok(handle)
    }

    pub fn immediately_deallocate(&mut self, handle: &mut DescriptorHandle) -> Result<u32> {
        self.allocator.immediately_deallocate(handle)
    }

    pub fn deferred_deallocate(&mut self, handle: &mut DescriptorHandle) -> Result<u32> {
        self.allocator.deferred_deallocate(handle)
    }

    /// Releases through the deferred path, or immediately when no frame has started yet
    pub fn release(&mut self, handle: &mut DescriptorHandle) -> Result<u32> {
        match self.allocator.deferred_deallocate(handle) {
            Err(RenderError::DeferredFrameNotSet) => {
                log::warn!(
                    "Releasing {:?} descriptor {:#x} immediately, no frame has started",
                    self.kind(), handle.cpu
                );
                self.allocator.immediately_deallocate(handle)
            }
            other => other,
        }
    }

    pub fn reset_deferred(&mut self, slot: u32) -> Result<usize> {
        self.allocator.reset_deferred(slot)
    }

    pub fn index_of(&self, handle: &DescriptorHandle) -> Result<u32> {
        self.allocator.index_of(handle)
    }

    pub fn live_count(&self) -> u32 {
        self.allocator.live_count()
    }
}

impl Drop for DescriptorHeap {
    fn drop(&mut self) {
        if self.allocator.live_count() > 0 {
            log::warn!(
                "Destroying {:?} descriptor heap with {} live descriptors",
                self.kind(), self.allocator.live_count()
            );
        }
        if let Err(e) = self.device.destroy_descriptor_heap(self.id) {
            log::error!("Failed to destroy {:?} descriptor heap: {}", self.kind(), e);
        }
    }
}

pub fn lock_heap(heap: &SharedDescriptorHeap) -> Result<MutexGuard<'_, DescriptorHeap>> {
    heap.lock().map_err(|e| RenderError::LockPoisoned(e.to_string()))
}

/// The heaps resources draw their views from. A missing heap makes its view kinds unavailable.
#[derive(Debug, Clone, Default)]
pub struct DescriptorHeaps {
    pub rtv: Option<SharedDescriptorHeap>,
    pub dsv: Option<SharedDescriptorHeap>,
    pub cbv_srv_uav: Option<SharedDescriptorHeap>,
}

impl DescriptorHeaps {
    pub fn new(
        device: &RenderDevice,
        rtv_capacity: u32,
        dsv_capacity: u32,
        cbv_srv_uav_capacity: u32,
        frames_in_flight: u32,
    ) -> Result<Self> {
        let create = |kind: DescriptorHeapKind, capacity| {
            DescriptorHeap::new(device, kind, capacity, kind.default_shader_visible(), frames_in_flight)
                .map(DescriptorHeap::shared)
        };

        Ok(Self {
            rtv: Some(create(DescriptorHeapKind::RenderTarget, rtv_capacity)?),
            dsv: Some(create(DescriptorHeapKind::DepthStencil, dsv_capacity)?),
            cbv_srv_uav: Some(create(DescriptorHeapKind::CbvSrvUav, cbv_srv_uav_capacity)?),
        })
    }

    pub fn get(&self, kind: DescriptorHeapKind) -> Option<&SharedDescriptorHeap> {
        match kind {
            DescriptorHeapKind::RenderTarget => self.rtv.as_ref(),
            DescriptorHeapKind::DepthStencil => self.dsv.as_ref(),
            DescriptorHeapKind::CbvSrvUav => self.cbv_srv_uav.as_ref(),
        }
    }

    pub fn for_view(&self, view: ViewKind) -> Option<&SharedDescriptorHeap> {
        self.get(view.heap_kind())
    }

    /// Recycles `slot`'s deferred descriptors on every heap
    pub fn reset_deferred(&self, slot: u32) -> Result<usize> {
        let mut recycled = 0;
        for heap in [&self.rtv, &self.dsv, &self.cbv_srv_uav].into_iter().flatten() {
            recycled += lock_heap(heap)?.reset_deferred(slot)?;
        }
        Ok(recycled)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use super::*;
    use crate::renderer::contexts::device_ctx::headless::{HeadlessBackend, HeadlessDesc};
    use crate::renderer::contexts::device_ctx::backend::{Placement, ResourceCreateDesc};
    use crate::renderer::resources::desc::{Format, HeapKind, ResourceDesc, ResourceState, ResourceUsage, ViewRange};

    fn device() -> (RenderDevice, Arc<HeadlessBackend>) {
        let backend = Arc::new(HeadlessBackend::new(HeadlessDesc::default()));
        (RenderDevice::new(backend.clone()), backend)
    }

    #[test]
    fn backend_heap_is_destroyed_when_the_allocator_is_refused() {
        let (device, backend) = device();
        assert!(matches!(
            DescriptorHeap::new(&device, DescriptorHeapKind::RenderTarget, 8, false, 0),
            Err(RenderError::InvalidCreateInfo { .. })
        ));
        assert_eq!(backend.descriptor_heap_count(), 0);

        let heap = DescriptorHeap::new(&device, DescriptorHeapKind::RenderTarget, 8, false, 2).unwrap();
        assert_eq!(backend.descriptor_heap_count(), 1);
        drop(heap);
        assert_eq!(backend.descriptor_heap_count(), 0);
    }

    #[test]
    fn only_shader_visible_heaps_carry_gpu_handles() {
        let (device, _) = device();
        let heaps = DescriptorHeaps::new(&device, 4, 4, 4, 2).unwrap();

        let rtv = lock_heap(heaps.rtv.as_ref().unwrap()).unwrap().allocate().unwrap();
        let srv = lock_heap(heaps.cbv_srv_uav.as_ref().unwrap()).unwrap().allocate().unwrap();
        assert_eq!(rtv.gpu, None);
        assert!(srv.gpu.is_some());
    }

    #[test]
    fn handles_from_another_heap_are_rejected() {
        let (device, _) = device();
        let mut a = DescriptorHeap::new(&device, DescriptorHeapKind::RenderTarget, 4, false, 1).unwrap();
        let mut b = DescriptorHeap::new(&device, DescriptorHeapKind::RenderTarget, 4, false, 1).unwrap();
        let mut handle = a.allocate().unwrap();

        assert!(matches!(
            b.immediately_deallocate(&mut handle),
            Err(RenderError::HandleOutOfRange { .. })
        ));
        assert_eq!(a.immediately_deallocate(&mut handle).unwrap(), 0);
    }

    #[test]
    fn allocate_view_writes_the_backend_slot() {
        let (device, backend) = device();
        let resource = device.create_resource(&ResourceCreateDesc {
            desc: ResourceDesc::Buffer {
                size: 256,
                usage: ResourceUsage::empty(),
            },
            heap: HeapKind::Upload,
            placement: Placement::Committed,
            initial_state: ResourceState::GenericRead,
            clear_value: None,
        }).unwrap();
        let mut heap = DescriptorHeap::new(&device, DescriptorHeapKind::CbvSrvUav, 4, true, 1).unwrap();
        let view = ViewDesc {
            kind: ViewKind::ConstantBuffer,
            format: Format::Unknown,
            range: ViewRange::Buffer { offset: 0, size: 256, stride: 256 },
        };

        let handle = heap.allocate_view(resource, &view).unwrap();
        assert_eq!(backend.view_at(heap.id(), handle.cpu).unwrap(), Some((resource, view)));

        // A view of something that does not exist leaves the slot free again
        assert!(heap.allocate_view(ResourceId(999), &view).is_err());
        assert_eq!(heap.live_count(), 1);
    }

    #[test]
    fn release_falls_back_to_immediate_before_the_first_frame() {
        let (device, _) = device();
        let mut heap = DescriptorHeap::new(&device, DescriptorHeapKind::DepthStencil, 2, false, 2).unwrap();
        let mut handle = heap.allocate().unwrap();
        heap.release(&mut handle).unwrap();
        assert_eq!(heap.live_count(), 0);
        assert_eq!(heap.allocator().free_count(), 2);

        heap.reset_deferred(0).unwrap();
        let mut handle = heap.allocate().unwrap();
        heap.release(&mut handle).unwrap();
        assert_eq!(heap.allocator().pending_count(), 1);
    }

    #[test]
    fn reset_deferred_touches_every_heap() {
        let (device, _) = device();
        let heaps = DescriptorHeaps::new(&device, 2, 2, 2, 2).unwrap();
        heaps.reset_deferred(0).unwrap();
        for kind in [DescriptorHeapKind::RenderTarget, DescriptorHeapKind::DepthStencil, DescriptorHeapKind::CbvSrvUav] {
            let heap = heaps.get(kind).unwrap();
            let mut guard = lock_heap(heap).unwrap();
            let mut handle = guard.allocate().unwrap();
            guard.deferred_deallocate(&mut handle).unwrap();
        }

        assert_eq!(heaps.reset_deferred(1).unwrap(), 0);
        assert_eq!(heaps.reset_deferred(0).unwrap(), 3);
        assert!(matches!(heaps.reset_deferred(2), Err(RenderError::FrameSlotOutOfRange { .. })));
    }
}
