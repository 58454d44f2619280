use std::collections::BTreeMap;
use crate::renderer::contexts::device_ctx::backend::{Placement, ResourceCreateDesc, ResourceId};
use crate::renderer::contexts::device_ctx::command_encoder::CommandEncoder;
use crate::renderer::contexts::device_ctx::device::RenderDevice;
use crate::renderer::error::{RenderError, Result};
use crate::renderer::internals::descriptor_allocator::DescriptorHandle;
use crate::renderer::internals::descriptor_heap::{lock_heap, DescriptorHeaps};
use crate::renderer::resources::desc::{ClearValue, HeapKind, ResourceDesc, ResourceState, ViewDesc, ViewKey};
use crate::renderer::resources::memory_heap::HeapInfo;

#[derive(Debug, Clone)]
pub enum ResourceOrigin {
    /// Owns a dedicated allocation
    Committed,
    /// Sub-allocated from a caller heap
    Placed(HeapInfo),
    /// Owned by someone else, e.g. a swap-chain back buffer
    External,
}

/// State shared by buffers and textures: the native resource, its state tag and its view cache.
///
/// Views are created on first request and cached by [`ViewKey`]. Dropping the resource
/// hands every cached descriptor back through the deferred path of its heap and
/// destroys the native resource unless it is external.
#[derive(Debug)]
pub struct GpuResource {
    id: ResourceId,
    name: String,
    desc: ResourceDesc,
    heap_kind: HeapKind,
    origin: ResourceOrigin,
    state: ResourceState,
    views: BTreeMap<ViewKey, DescriptorHandle>,

    heaps: DescriptorHeaps,
    device: RenderDevice,
}

pub struct ResourceParams<'a> {
    pub name: &'a str,
    pub desc: ResourceDesc,
    pub heap_kind: HeapKind,
    pub initial_state: ResourceState,
    pub clear_value: Option<ClearValue>,
    pub heap_info: Option<&'a HeapInfo>,
}

impl GpuResource {
    pub fn create(
        device: &RenderDevice,
        heaps: &DescriptorHeaps,
        params: ResourceParams<'_>,
    ) -> Result<Self> {
        let (placement, origin) = match params.heap_info {
            Some(info) => {
                info.validate(params.name, params.heap_kind, params.desc.byte_size())?;
                (
                    Placement::Placed {
                        heap: info.heap.id(),
                        offset: info.offset,
                    },
                    ResourceOrigin::Placed(info.clone()),
                )
            }
            None => (Placement::Committed, ResourceOrigin::Committed),
        };

        let id = device.create_resource(&ResourceCreateDesc {
            desc: params.desc,
            heap: params.heap_kind,
            placement,
            initial_state: params.initial_state,
            clear_value: params.clear_value,
        })?;
        device.set_debug_name(id, params.name);
        log::debug!(
            "Created '{}' ({:?}, {} bytes, {:?})",
            params.name, params.heap_kind, params.desc.byte_size(), placement
        );

        Ok(Self {
            id,
            name: params.name.to_string(),
            desc: params.desc,
            heap_kind: params.heap_kind,
            origin,
            state: params.initial_state,
            views: BTreeMap::new(),
            heaps: heaps.clone(),
            device: device.clone(),
        })
    }

    /// Wraps a resource owned elsewhere; its memory is never released from here
    pub fn wrap_external(
        device: &RenderDevice,
        heaps: &DescriptorHeaps,
        id: ResourceId,
        name: &str,
    ) -> Result<Self> {
        let (desc, heap_kind, state) = device.describe_resource(id)?;

        Ok(Self {
            id,
            name: name.to_string(),
            desc,
            heap_kind,
            origin: ResourceOrigin::External,
            state,
            views: BTreeMap::new(),
            heaps: heaps.clone(),
            device: device.clone(),
        })
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn desc(&self) -> &ResourceDesc {
        &self.desc
    }

    pub fn byte_size(&self) -> u64 {
        self.desc.byte_size()
    }

    pub fn heap_kind(&self) -> HeapKind {
        self.heap_kind
    }

    pub fn origin(&self) -> &ResourceOrigin {
        &self.origin
    }

    pub fn state(&self) -> ResourceState {
        self.state
    }

    pub fn device(&self) -> &RenderDevice {
        &self.device
    }

    pub fn gpu_virtual_address(&self) -> Result<u64> {
        Ok(self.device.gpu_virtual_address(self.id)?)
    }

    /// Records a transition barrier from the tracked state, skipped when already there
    pub fn transition(
        &mut self,
        encoder: &mut CommandEncoder,
        after: ResourceState,
    ) -> Result<()> {
        if self.state == after {
            return Ok(());
        }
        encoder.barrier(self.id, self.state, after)?;
        self.state = after;

        Ok(())
    }

    pub fn view_count(&self) -> usize {
        self.views.len()
    }

    pub fn cached_view(&self, key: &ViewKey) -> Option<DescriptorHandle> {
        self.views.get(key).copied()
    }

    /// Returns the cached view for `key`, creating it from `view` on a miss
    pub fn view(
        &mut self,
        key: ViewKey,
        view: impl FnOnce(&Self) -> Result<ViewDesc>,
    ) -> Result<DescriptorHandle> {
        if let Some(handle) = self.views.get(&key) {
            return Ok(*handle);
        }

        let heap = self.heaps.for_view(key.kind).ok_or_else(|| RenderError::MissingHeap {
            name: self.name.clone(),
            view: key.kind,
            heap: key.kind.heap_kind(),
        })?;
        let view = view(self)?;
        let handle = lock_heap(heap)?.allocate_view(self.id, &view)?;
        self.views.insert(key, handle);

        Ok(handle)
    }

    /// Hands every cached view back to its heap
    pub fn release_views(&mut self) -> Result<()> {
        for (key, mut handle) in std::mem::take(&mut self.views) {
            if let Some(heap) = self.heaps.for_view(key.kind) {
                lock_heap(heap)?.release(&mut handle)?;
            }
        }
        Ok(())
    }
}

impl Drop for GpuResource {
    fn drop(&mut self) {
        if let Err(e) = self.release_views() {
            log::error!("Failed to release views of '{}': {}", self.name, e);
        }
        if matches!(self.origin, ResourceOrigin::External) {
            return;
        }
        if let Err(e) = self.device.destroy_resource(self.id) {
            log::error!("Failed to destroy '{}': {}", self.name, e);
        }
    }
}
