mod commands;
mod convert;
mod descriptors;
mod device;
mod instance;
mod queue;

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use gpu_allocator::AllocationError;
use crate::renderer::config::RenderConfig;
use crate::renderer::contexts::device_ctx::backend::{
    DescriptorHeapDesc, DescriptorHeapId, DescriptorHeapInfo, DeviceResult, FenceId, GpuBackend,
    GpuCommand, MemoryHeapDesc, MemoryHeapId, Placement, ResourceCreateDesc, ResourceId,
    PLACEMENT_ALIGNMENT,
};
use crate::renderer::contexts::device_ctx::vulkan::commands::CommandPool;
use crate::renderer::contexts::device_ctx::vulkan::descriptors::{
    BindlessBinding, BindlessSet, DescriptorAshDevice, SlotView, VulkanDescriptorAllocator,
    VulkanDescriptorHeap,
};
use crate::renderer::contexts::device_ctx::vulkan::device::VulkanDevice;
use crate::renderer::contexts::device_ctx::vulkan::instance::VulkanInstance;
use crate::renderer::error::{DeviceError, Result};
use crate::renderer::resources::desc::{
    mip_extent, Format, HeapKind, ResourceDesc, ResourceState, ResourceUsage, TextureDimension,
    ViewDesc, ViewKind, ViewRange,
};

const BACK_BUFFER_FORMAT: Format = Format::B8G8R8A8Unorm;

impl From<vk::Result> for DeviceError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => DeviceError::DeviceLost(result.to_string()),
            _ => DeviceError::Backend(result.to_string()),
        }
    }
}

fn allocation_error(error: AllocationError, requested: u64) -> DeviceError {
    match error {
        AllocationError::OutOfMemory => DeviceError::OutOfMemory { requested },
        error => DeviceError::Backend(error.to_string()),
    }
}

#[derive(Debug, Clone, Copy)]
enum NativeResource {
    Buffer(vk::Buffer),
    Image(vk::Image),
}

enum ResourceMemory {
    Committed(Allocation),
    Placed {
        heap: MemoryHeapId,
        offset: u64,
    },
}

struct VulkanResource {
    native: NativeResource,
    desc: ResourceDesc,
    heap: HeapKind,
    memory: ResourceMemory,
    /// State as of the last recorded submission
    state: ResourceState,
    /// Images start out undefined until a submission gives them their first layout
    layout_initialized: bool,
    /// Serial of the last submission that referenced the resource
    last_use: u64,
    name: String,
    owned_by_backend: bool,
}

struct VulkanMemoryHeap {
    kind: HeapKind,
    size: u64,
    allocation: Allocation,
}

struct VulkanFence {
    semaphore: vk::Semaphore,
    last_signaled: u64,
}

struct VulkanState {
    next_object: u32,
    next_resource: u64,

    allocator: Allocator,
    descriptor_allocator: VulkanDescriptorAllocator,
    command_pool: CommandPool,

    /// Timeline every submission signals with its serial, used to retire command buffers
    /// and to tell whether a resource is still referenced by the GPU
    timeline: vk::Semaphore,
    serial: u64,

    resources: HashMap<ResourceId, VulkanResource>,
    memory_heaps: HashMap<MemoryHeapId, VulkanMemoryHeap>,
    descriptor_heaps: HashMap<DescriptorHeapId, VulkanDescriptorHeap>,
    fences: HashMap<FenceId, VulkanFence>,

    back_buffers: Vec<ResourceId>,
    presents: u64,
}

impl VulkanState {
    fn next_object_id(&mut self) -> u32 {
        self.next_object += 1;
        self.next_object
    }

    fn next_resource_id(&mut self) -> ResourceId {
        self.next_resource += 1;
        ResourceId(self.next_resource)
    }

    fn resource(&self, id: ResourceId) -> DeviceResult<&VulkanResource> {
        self.resources.get(&id).ok_or(DeviceError::UnknownResource(id))
    }

    fn fence(&self, id: FenceId) -> DeviceResult<&VulkanFence> {
        self.fences.get(&id).ok_or(DeviceError::UnknownFence(id))
    }

    /// Mapped bytes backing a CPU-visible resource
    fn mapped_slice<'a>(
        &'a self,
        id: ResourceId,
        resource: &'a VulkanResource,
    ) -> DeviceResult<&'a [u8]> {
        let size = resource.desc.byte_size();
        let (bytes, start) = match &resource.memory {
            ResourceMemory::Committed(allocation) => (allocation.mapped_slice(), 0),
            ResourceMemory::Placed { heap, offset } => {
                let heap = self.memory_heaps.get(heap).ok_or(DeviceError::UnknownMemoryHeap(*heap))?;
                (heap.allocation.mapped_slice(), *offset)
            }
        };
        mapped_range(bytes.ok_or(DeviceError::NotMapped(id))?, start, size)
    }
}

/// Vulkan 1.3 device rendering to offscreen back buffers.
///
/// Descriptor heaps are host-side slot tables; the shader-visible one is additionally backed by
/// an update-after-bind descriptor set, so a GPU descriptor handle is an index into its arrays.
/// Fences are timeline semaphores.
pub struct VulkanBackend {
    name: String,
    state: Mutex<VulkanState>,
    device: VulkanDevice,
    _instance: VulkanInstance,
}

impl fmt::Debug for VulkanBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VulkanBackend")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl VulkanBackend {
    pub fn new(config: &RenderConfig) -> Result<Self> {
        let instance = VulkanInstance::new()?;
        let device = VulkanDevice::new(&instance)?;

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.instance.clone(),
            device: device.logical.clone(),
            physical_device: device.physical,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: true,
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        })
            .map_err(|e| DeviceError::Backend(e.to_string()))?;

        let command_pool = CommandPool::new(&device.logical, device.queue.family.index)?;
        let timeline = create_timeline_semaphore(&device.logical, 0)?;

        let state = VulkanState {
            next_object: 0,
            next_resource: 0,
            allocator,
            descriptor_allocator: VulkanDescriptorAllocator::new(device.max_update_after_bind_descriptors),
            command_pool,
            timeline,
            serial: 0,
            resources: HashMap::new(),
            memory_heaps: HashMap::new(),
            descriptor_heaps: HashMap::new(),
            fences: HashMap::new(),
            back_buffers: Vec::new(),
            presents: 0,
        };

        let backend = Self {
            name: format!("vulkan ({})", device.name()),
            state: Mutex::new(state),
            device,
            _instance: instance,
        };

        for index in 0..config.frames_in_flight {
            backend.create_back_buffer(index, config.back_buffer_width, config.back_buffer_height)?;
        }
        log::info!(
            "Vulkan backend ready on {} with {} offscreen back buffers",
            backend.name, config.frames_in_flight
        );

        Ok(backend)
    }

    pub fn presents(&self) -> u64 {
        self.lock().map(|state| state.presents).unwrap_or_default()
    }

    fn create_back_buffer(&self, index: u32, width: u32, height: u32) -> DeviceResult<()> {
        let id = self.create_resource(&ResourceCreateDesc {
            desc: ResourceDesc::Texture {
                dimension: TextureDimension::D2,
                format: BACK_BUFFER_FORMAT,
                width,
                height,
                depth: 1,
                mip_levels: 1,
                usage: ResourceUsage::RENDER_TARGET,
            },
            heap: HeapKind::Default,
            placement: Placement::Committed,
            initial_state: ResourceState::Present,
            clear_value: None,
        })?;
        self.set_debug_name(id, &format!("BackBuffer{}", index));

        let mut state = self.lock()?;
        if let Some(resource) = state.resources.get_mut(&id) {
            resource.owned_by_backend = true;
        }
        state.back_buffers.push(id);
        Ok(())
    }

    fn lock(&self) -> DeviceResult<MutexGuard<'_, VulkanState>> {
        self.state
            .lock()
            .map_err(|e| DeviceError::Backend(e.to_string()))
    }

    /// Creates and binds memory for a fresh native resource
    fn bind_memory(
        &self,
        state: &mut VulkanState,
        native: NativeResource,
        desc: &ResourceCreateDesc,
    ) -> DeviceResult<ResourceMemory> {
        let device = &self.device.logical;
        let requirements = unsafe {
            match native {
                NativeResource::Buffer(buffer) => device.get_buffer_memory_requirements(buffer),
                NativeResource::Image(image) => device.get_image_memory_requirements(image),
            }
        };

        match desc.placement {
            Placement::Committed => {
                let allocation = state.allocator
                    .allocate(&AllocationCreateDesc {
                        name: "framekeep resource",
                        requirements,
                        location: convert::memory_location(desc.heap),
                        linear: matches!(native, NativeResource::Buffer(_)),
                        allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                    })
                    .map_err(|e| allocation_error(e, requirements.size))?;

                let bound = unsafe { bind(device, native, allocation.memory(), allocation.offset()) };
                if let Err(e) = bound {
                    if let Err(free_error) = state.allocator.free(allocation) {
                        log::error!("Failed to free allocation after a bind error: {}", free_error);
                    }
                    return Err(e);
                }
                Ok(ResourceMemory::Committed(allocation))
            }
            Placement::Placed { heap, offset } => {
                let memory = state.memory_heaps
                    .get(&heap)
                    .ok_or(DeviceError::UnknownMemoryHeap(heap))?;
                if memory.kind != desc.heap {
                    return Err(DeviceError::InvalidPlacement(format!(
                        "a {:?} resource cannot be placed in a {:?} heap",
                        desc.heap, memory.kind
                    )));
                }
                if offset % PLACEMENT_ALIGNMENT != 0 || offset % requirements.alignment.max(1) != 0 {
                    return Err(DeviceError::InvalidPlacement(format!(
                        "offset {} is not aligned to {} bytes",
                        offset, PLACEMENT_ALIGNMENT.max(requirements.alignment)
                    )));
                }
                check_bounds(offset, requirements.size, memory.size)
                    .map_err(|e| DeviceError::InvalidPlacement(e.to_string()))?;

                unsafe {
                    bind(device, native, memory.allocation.memory(), memory.allocation.offset() + offset)?;
                }
                Ok(ResourceMemory::Placed { heap, offset })
            }
        }
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        let device = &self.device.logical;
        if let Err(e) = unsafe { device.device_wait_idle() } {
            log::error!("Failed to idle the device before teardown: {}", e);
        }

        let state = match self.state.get_mut() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };

        let leaked = state.resources.values().filter(|r| !r.owned_by_backend).count();
        if leaked > 0 {
            log::warn!("Vulkan backend torn down with {} live resources", leaked);
        }

        for (_, heap) in state.descriptor_heaps.drain() {
            heap.destroy(device, &mut state.descriptor_allocator);
        }
        unsafe {
            state.descriptor_allocator.cleanup(&DescriptorAshDevice(device));
        }

        for (_, resource) in state.resources.drain() {
            free_resource(device, &mut state.allocator, resource);
        }
        for (_, heap) in state.memory_heaps.drain() {
            if let Err(e) = state.allocator.free(heap.allocation) {
                log::error!("Failed to free memory heap: {}", e);
            }
        }

        unsafe {
            for (_, fence) in state.fences.drain() {
                device.destroy_semaphore(fence.semaphore, None);
            }
            device.destroy_semaphore(state.timeline, None);
        }
        state.command_pool.destroy(device);
    }
}

impl GpuBackend for VulkanBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_descriptor_heap(&self, desc: &DescriptorHeapDesc) -> DeviceResult<DescriptorHeapInfo> {
        let mut guard = self.lock()?;
        let state = &mut *guard;

        let bindless = if desc.shader_visible {
            Some(BindlessSet::new(&self.device.logical, &mut state.descriptor_allocator, desc.capacity)?)
        } else {
            None
        };

        let id = DescriptorHeapId(state.next_object_id());
        // Handles are slot indices offset into a range of their own; GPU handles are the bare index
        let info = DescriptorHeapInfo {
            id,
            cpu_base: (id.0 as u64) << 32,
            gpu_base: desc.shader_visible.then_some(0),
            stride: 1,
        };
        state.descriptor_heaps.insert(id, VulkanDescriptorHeap {
            info,
            slots: (0..desc.capacity).map(|_| None).collect(),
            bindless,
        });
        log::debug!("Created {:?} descriptor heap {:?} with {} slots", desc.kind, id, desc.capacity);

        Ok(info)
    }

    fn destroy_descriptor_heap(&self, heap: DescriptorHeapId) -> DeviceResult<()> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        let removed = state.descriptor_heaps
            .remove(&heap)
            .ok_or(DeviceError::UnknownDescriptorHeap(heap))?;
        removed.destroy(&self.device.logical, &mut state.descriptor_allocator);
        Ok(())
    }

    fn write_view(
        &self,
        heap: DescriptorHeapId,
        cpu: u64,
        resource: ResourceId,
        view: &ViewDesc,
    ) -> DeviceResult<()> {
        let device = &self.device.logical;
        let mut guard = self.lock()?;
        let state = &mut *guard;
        let res = state.resources.get(&resource).ok_or(DeviceError::UnknownResource(resource))?;
        let heap = state.descriptor_heaps
            .get_mut(&heap)
            .ok_or(DeviceError::UnknownDescriptorHeap(heap))?;
        let index = heap.slot_index(cpu)?;

        let image_view = match res.native {
            NativeResource::Image(image) => Some(create_image_view(device, image, &res.desc, view)?),
            NativeResource::Buffer(_) => None,
        };
        heap.clear_slot(device, index);
        heap.slots[index] = Some(SlotView {
            resource,
            view: *view,
            image_view,
        });

        if let Some(bindless) = &heap.bindless {
            write_bindless(device, bindless, index as u32, res, view, image_view)?;
        }
        Ok(())
    }

    fn create_memory_heap(&self, desc: &MemoryHeapDesc) -> DeviceResult<MemoryHeapId> {
        if desc.size == 0 {
            return Err(DeviceError::InvalidPlacement("memory heaps cannot be empty".to_string()));
        }
        let mut state = self.lock()?;

        // Any memory type of the right location, so buffers and textures can share the heap
        let requirements = vk::MemoryRequirements {
            size: desc.size,
            alignment: PLACEMENT_ALIGNMENT,
            memory_type_bits: u32::MAX,
        };
        let allocation = state.allocator
            .allocate(&AllocationCreateDesc {
                name: "framekeep memory heap",
                requirements,
                location: convert::memory_location(desc.kind),
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| allocation_error(e, desc.size))?;

        let id = MemoryHeapId(state.next_object_id());
        state.memory_heaps.insert(id, VulkanMemoryHeap {
            kind: desc.kind,
            size: desc.size,
            allocation,
        });
        Ok(id)
    }

    fn destroy_memory_heap(&self, heap: MemoryHeapId) -> DeviceResult<()> {
        let mut state = self.lock()?;
        let placed_inside = state.resources.values().any(|r| {
            matches!(r.memory, ResourceMemory::Placed { heap: h, .. } if h == heap)
        });
        if placed_inside {
            return Err(DeviceError::InvalidPlacement(format!(
                "memory heap {:?} still has resources placed in it",
                heap
            )));
        }
        let removed = state.memory_heaps
            .remove(&heap)
            .ok_or(DeviceError::UnknownMemoryHeap(heap))?;
        state.allocator
            .free(removed.allocation)
            .map_err(|e| DeviceError::Backend(e.to_string()))
    }

    fn create_resource(&self, desc: &ResourceCreateDesc) -> DeviceResult<ResourceId> {
        let device = &self.device.logical;
        let native = match desc.desc {
            ResourceDesc::Buffer { size, .. } => {
                let buffer_info = vk::BufferCreateInfo::default()
                    .size(size.max(1))
                    .usage(convert::buffer_usage())
                    .sharing_mode(vk::SharingMode::EXCLUSIVE);
                NativeResource::Buffer(unsafe { device.create_buffer(&buffer_info, None)? })
            }
            ResourceDesc::Texture { dimension, format, width, height, depth, mip_levels, usage } => {
                if desc.heap != HeapKind::Default {
                    return Err(DeviceError::Backend(format!(
                        "textures must live in the default heap, not {:?}",
                        desc.heap
                    )));
                }
                let (extent_depth, array_layers) = match dimension {
                    TextureDimension::D3 => (depth, 1),
                    _ => (1, depth),
                };
                let image_info = vk::ImageCreateInfo::default()
                    .image_type(convert::image_type(dimension))
                    .format(convert::format(format))
                    .extent(vk::Extent3D { width, height, depth: extent_depth })
                    .mip_levels(mip_levels)
                    .array_layers(array_layers)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .tiling(vk::ImageTiling::OPTIMAL)
                    .usage(convert::image_usage(usage))
                    .sharing_mode(vk::SharingMode::EXCLUSIVE)
                    .initial_layout(vk::ImageLayout::UNDEFINED);
                NativeResource::Image(unsafe { device.create_image(&image_info, None)? })
            }
        };

        let mut guard = self.lock()?;
        let state = &mut *guard;
        let memory = match self.bind_memory(state, native, desc) {
            Ok(memory) => memory,
            Err(e) => {
                destroy_native(device, native);
                return Err(e);
            }
        };

        let id = state.next_resource_id();
        state.resources.insert(id, VulkanResource {
            native,
            desc: desc.desc,
            heap: desc.heap,
            memory,
            state: desc.initial_state,
            layout_initialized: matches!(native, NativeResource::Buffer(_)),
            last_use: 0,
            name: String::new(),
            owned_by_backend: false,
        });

        Ok(id)
    }

    fn destroy_resource(&self, resource: ResourceId) -> DeviceResult<()> {
        let device = &self.device.logical;
        let mut guard = self.lock()?;
        let state = &mut *guard;

        let res = state.resource(resource)?;
        if res.owned_by_backend {
            return Err(DeviceError::Backend(format!(
                "{:?} is owned by the backend",
                resource
            )));
        }

        // Destroying it now would pull memory out from under the GPU, so finish the work first
        let last_use = res.last_use;
        let in_flight = unsafe { device.get_semaphore_counter_value(state.timeline)? } < last_use;
        if in_flight {
            log::error!("'{}' destroyed while submission {} still uses it", res.name, last_use);
            wait_timeline(device, state.timeline, last_use)?;
        }

        for heap in state.descriptor_heaps.values_mut() {
            for index in 0..heap.slots.len() {
                if heap.slots[index].as_ref().is_some_and(|slot| slot.resource == resource) {
                    heap.clear_slot(device, index);
                }
            }
        }
        if let Some(removed) = state.resources.remove(&resource) {
            free_resource(device, &mut state.allocator, removed);
        }

        if in_flight {
            return Err(DeviceError::ResourceInFlight(resource));
        }
        Ok(())
    }

    fn describe_resource(&self, resource: ResourceId) -> DeviceResult<(ResourceDesc, HeapKind, ResourceState)> {
        let state = self.lock()?;
        let res = state.resource(resource)?;
        Ok((res.desc, res.heap, res.state))
    }

    fn gpu_virtual_address(&self, resource: ResourceId) -> DeviceResult<u64> {
        let state = self.lock()?;
        match state.resource(resource)?.native {
            NativeResource::Buffer(buffer) => {
                let info = vk::BufferDeviceAddressInfo::default().buffer(buffer);
                Ok(unsafe { self.device.logical.get_buffer_device_address(&info) })
            }
            NativeResource::Image(_) => Err(DeviceError::Backend(format!(
                "{:?} is a texture and has no GPU virtual address",
                resource
            ))),
        }
    }

    fn write_mapped(&self, resource: ResourceId, offset: u64, data: &[u8]) -> DeviceResult<()> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        let res = state.resources.get_mut(&resource).ok_or(DeviceError::UnknownResource(resource))?;
        if res.heap != HeapKind::Upload {
            return Err(DeviceError::NotMapped(resource));
        }
        check_bounds(offset, data.len() as u64, res.desc.byte_size())?;

        let (allocation, base) = match &mut res.memory {
            ResourceMemory::Committed(allocation) => (allocation, 0),
            ResourceMemory::Placed { heap, offset } => {
                let heap = state.memory_heaps
                    .get_mut(heap)
                    .ok_or(DeviceError::UnknownMemoryHeap(*heap))?;
                (&mut heap.allocation, *offset)
            }
        };
        if allocation.mapped_ptr().is_none() {
            return Err(DeviceError::NotMapped(resource));
        }
        presser::copy_from_slice_to_offset(data, allocation, (base + offset) as usize)
            .map_err(|e| DeviceError::Mapping(e.to_string()))?;
        Ok(())
    }

    fn read_mapped(&self, resource: ResourceId, offset: u64, out: &mut [u8]) -> DeviceResult<()> {
        let state = self.lock()?;
        let res = state.resource(resource)?;
        if !res.heap.is_cpu_visible() {
            return Err(DeviceError::NotMapped(resource));
        }
        check_bounds(offset, out.len() as u64, res.desc.byte_size())?;

        let bytes = state.mapped_slice(resource, res)?;
        let range = mapped_range(bytes, offset, out.len() as u64)?;
        out.copy_from_slice(range);
        Ok(())
    }

    fn set_debug_name(&self, resource: ResourceId, name: &str) {
        let Ok(mut state) = self.lock() else {
            return;
        };
        let Some(res) = state.resources.get_mut(&resource) else {
            return;
        };
        res.name = name.to_string();
        match res.native {
            NativeResource::Buffer(buffer) => self.device.set_object_name(buffer, name),
            NativeResource::Image(image) => self.device.set_object_name(image, name),
        }
    }

    fn create_fence(&self, initial_value: u64) -> DeviceResult<FenceId> {
        let semaphore = create_timeline_semaphore(&self.device.logical, initial_value)?;
        let mut state = self.lock()?;
        let id = FenceId(state.next_object_id());
        state.fences.insert(id, VulkanFence {
            semaphore,
            last_signaled: initial_value,
        });
        Ok(id)
    }

    fn destroy_fence(&self, fence: FenceId) -> DeviceResult<()> {
        let removed = self.lock()?
            .fences
            .remove(&fence)
            .ok_or(DeviceError::UnknownFence(fence))?;
        unsafe {
            self.device.logical.destroy_semaphore(removed.semaphore, None);
        }
        Ok(())
    }

    fn completed_fence_value(&self, fence: FenceId) -> DeviceResult<u64> {
        let semaphore = self.lock()?.fence(fence)?.semaphore;
        Ok(unsafe { self.device.logical.get_semaphore_counter_value(semaphore)? })
    }

    fn wait_for_fence(&self, fence: FenceId, value: u64) -> DeviceResult<()> {
        let (semaphore, last_signaled) = {
            let state = self.lock()?;
            let fence = state.fence(fence)?;
            (fence.semaphore, fence.last_signaled)
        };

        let completed = unsafe { self.device.logical.get_semaphore_counter_value(semaphore)? };
        if completed >= value {
            return Ok(());
        }
        if last_signaled < value {
            return Err(DeviceError::FenceNeverSignaled {
                value,
                last: last_signaled,
            });
        }
        wait_timeline(&self.device.logical, semaphore, value)
    }

    fn submit(&self, commands: &[GpuCommand], signal: Option<(FenceId, u64)>) -> DeviceResult<()> {
        let device = &self.device.logical;
        let mut guard = self.lock()?;
        let state = &mut *guard;

        let fence_signal = match signal {
            Some((fence, value)) => Some((state.fence(fence)?.semaphore, value)),
            None => None,
        };

        let completed = unsafe { device.get_semaphore_counter_value(state.timeline)? };
        let command_buffer = state.command_pool.acquire(device, completed)?;
        let recorded = record_batch(device, command_buffer, &state.resources, commands)
            .and_then(|batch| {
                unsafe { device.end_command_buffer(command_buffer)? };
                Ok(batch)
            });
        let batch = match recorded {
            Ok(batch) => batch,
            Err(e) => {
                state.command_pool.give_back(command_buffer);
                return Err(e);
            }
        };

        let serial = state.serial + 1;
        let mut signals = vec![
            vk::SemaphoreSubmitInfo::default()
                .semaphore(state.timeline)
                .value(serial)
                .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS),
        ];
        if let Some((semaphore, value)) = fence_signal {
            signals.push(
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(semaphore)
                    .value(value)
                    .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS),
            );
        }
        let command_buffer_infos = [
            vk::CommandBufferSubmitInfo::default().command_buffer(command_buffer),
        ];
        let submit_info = vk::SubmitInfo2::default()
            .command_buffer_infos(&command_buffer_infos)
            .signal_semaphore_infos(&signals);

        if let Err(e) = unsafe { device.queue_submit2(self.device.queue.handle, &[submit_info], vk::Fence::null()) } {
            state.command_pool.give_back(command_buffer);
            return Err(e.into());
        }
        state.serial = serial;
        state.command_pool.retire(command_buffer, serial);

        for (id, after) in batch {
            if let Some(res) = state.resources.get_mut(&id) {
                res.state = after;
                res.layout_initialized = true;
                res.last_use = serial;
            }
        }
        if let Some((fence, value)) = signal {
            if let Some(fence) = state.fences.get_mut(&fence) {
                fence.last_signaled = fence.last_signaled.max(value);
            }
        }
        log::trace!(
            "Submitted {} commands as serial {}, {} command buffers in flight",
            commands.len(), serial, state.command_pool.in_flight_count()
        );

        Ok(())
    }

    fn present(&self, vsync: bool) -> DeviceResult<()> {
        let mut state = self.lock()?;
        state.presents += 1;
        log::trace!("Present {} (vsync: {})", state.presents, vsync);
        Ok(())
    }

    fn back_buffers(&self) -> Vec<ResourceId> {
        self.lock()
            .map(|state| state.back_buffers.clone())
            .unwrap_or_default()
    }
}

fn create_timeline_semaphore(device: &ash::Device, initial_value: u64) -> DeviceResult<vk::Semaphore> {
    let mut type_info = vk::SemaphoreTypeCreateInfo::default()
        .semaphore_type(vk::SemaphoreType::TIMELINE)
        .initial_value(initial_value);
    let semaphore_info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
    Ok(unsafe { device.create_semaphore(&semaphore_info, None)? })
}

fn wait_timeline(device: &ash::Device, semaphore: vk::Semaphore, value: u64) -> DeviceResult<()> {
    let semaphores = [semaphore];
    let values = [value];
    let wait_info = vk::SemaphoreWaitInfo::default()
        .semaphores(&semaphores)
        .values(&values);
    unsafe {
        device.wait_semaphores(&wait_info, u64::MAX)?;
    }
    Ok(())
}

unsafe fn bind(
    device: &ash::Device,
    native: NativeResource,
    memory: vk::DeviceMemory,
    offset: u64,
) -> DeviceResult<()> {
    unsafe {
        match native {
            NativeResource::Buffer(buffer) => device.bind_buffer_memory(buffer, memory, offset)?,
            NativeResource::Image(image) => device.bind_image_memory(image, memory, offset)?,
        }
    }
    Ok(())
}

fn destroy_native(device: &ash::Device, native: NativeResource) {
    unsafe {
        match native {
            NativeResource::Buffer(buffer) => device.destroy_buffer(buffer, None),
            NativeResource::Image(image) => device.destroy_image(image, None),
        }
    }
}

fn free_resource(device: &ash::Device, allocator: &mut Allocator, resource: VulkanResource) {
    destroy_native(device, resource.native);
    if let ResourceMemory::Committed(allocation) = resource.memory {
        if let Err(e) = allocator.free(allocation) {
            log::error!("Failed to free memory of '{}': {}", resource.name, e);
        }
    }
}

fn check_bounds(offset: u64, len: u64, size: u64) -> DeviceResult<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(DeviceError::OutOfBounds { offset, len, size }),
    }
}

/// `bytes[offset..offset + len]`, or `OutOfBounds` when the range does not fit
fn mapped_range(bytes: &[u8], offset: u64, len: u64) -> DeviceResult<&[u8]> {
    let out_of_bounds = || DeviceError::OutOfBounds { offset, len, size: bytes.len() as u64 };
    let start = usize::try_from(offset).map_err(|_| out_of_bounds())?;
    let end = offset
        .checked_add(len)
        .and_then(|end| usize::try_from(end).ok())
        .ok_or_else(out_of_bounds)?;
    bytes.get(start..end).ok_or_else(out_of_bounds)
}

fn expect_state(resource: ResourceId, actual: ResourceState, allowed: &[ResourceState]) -> DeviceResult<()> {
    if allowed.contains(&actual) {
        Ok(())
    } else {
        Err(DeviceError::InvalidBarrier {
            resource,
            before: allowed[0],
            actual,
        })
    }
}

fn full_range(desc: &ResourceDesc) -> vk::ImageSubresourceRange {
    let aspect_mask = match desc {
        ResourceDesc::Texture { format, .. } => convert::aspect(*format),
        ResourceDesc::Buffer { .. } => vk::ImageAspectFlags::COLOR,
    };
    vk::ImageSubresourceRange {
        aspect_mask,
        base_mip_level: 0,
        level_count: vk::REMAINING_MIP_LEVELS,
        base_array_layer: 0,
        layer_count: vk::REMAINING_ARRAY_LAYERS,
    }
}

/// Buffer copies address one aspect; depth textures copy their depth plane
fn copy_aspect(format: Format) -> vk::ImageAspectFlags {
    if format.is_depth() {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

/// One region per mip, matching the tightly packed layout of `ResourceDesc::byte_size`
fn buffer_image_regions(desc: &ResourceDesc) -> Vec<vk::BufferImageCopy> {
    let ResourceDesc::Texture { dimension, format, width, height, depth, mip_levels, .. } = *desc else {
        return Vec::new();
    };
    let layer_count = match dimension {
        TextureDimension::D3 => 1,
        _ => depth,
    };

    let mut buffer_offset = 0;
    (0..mip_levels)
        .map(|mip| {
            let (w, h, d) = mip_extent(dimension, width, height, depth, mip);
            let region = vk::BufferImageCopy {
                buffer_offset,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: copy_aspect(format),
                    mip_level: mip,
                    base_array_layer: 0,
                    layer_count,
                },
                image_offset: vk::Offset3D::default(),
                image_extent: vk::Extent3D {
                    width: w,
                    height: h,
                    depth: if dimension == TextureDimension::D3 { d } else { 1 },
                },
            };
            buffer_offset += w as u64 * h as u64 * d as u64 * format.bytes_per_pixel() as u64;
            region
        })
        .collect()
}

fn image_regions(desc: &ResourceDesc) -> Vec<vk::ImageCopy> {
    let aspect_mask = full_range(desc).aspect_mask;
    buffer_image_regions(desc)
        .into_iter()
        .map(|region| {
            let subresource = vk::ImageSubresourceLayers {
                aspect_mask,
                ..region.image_subresource
            };
            vk::ImageCopy {
                src_subresource: subresource,
                src_offset: vk::Offset3D::default(),
                dst_subresource: subresource,
                dst_offset: vk::Offset3D::default(),
                extent: region.image_extent,
            }
        })
        .collect()
}

/// Validates `commands` against the tracked resource states and records them.
/// Returns the state every referenced resource is left in.
fn record_batch(
    device: &ash::Device,
    command_buffer: vk::CommandBuffer,
    resources: &HashMap<ResourceId, VulkanResource>,
    commands: &[GpuCommand],
) -> DeviceResult<HashMap<ResourceId, ResourceState>> {
    let mut states: HashMap<ResourceId, ResourceState> = HashMap::new();
    let mut first_layouts = Vec::new();

    for command in commands {
        for id in command.resources() {
            if let Entry::Vacant(entry) = states.entry(id) {
                let res = resources.get(&id).ok_or(DeviceError::UnknownResource(id))?;
                entry.insert(res.state);
                if let (NativeResource::Image(image), false) = (res.native, res.layout_initialized) {
                    let scope = convert::state_scope(res.state);
                    first_layouts.push(
                        vk::ImageMemoryBarrier2::default()
                            .src_stage_mask(vk::PipelineStageFlags2::NONE)
                            .src_access_mask(vk::AccessFlags2::NONE)
                            .dst_stage_mask(scope.stage)
                            .dst_access_mask(scope.access)
                            .old_layout(vk::ImageLayout::UNDEFINED)
                            .new_layout(scope.layout)
                            .image(image)
                            .subresource_range(full_range(&res.desc)),
                    );
                }
            }
        }
    }

    if !first_layouts.is_empty() {
        let dependency_info = vk::DependencyInfo::default().image_memory_barriers(&first_layouts);
        unsafe { device.cmd_pipeline_barrier2(command_buffer, &dependency_info) };
    }

    for command in commands {
        match *command {
            GpuCommand::Barrier { resource, before, after } => {
                let actual = states[&resource];
                if actual != before {
                    return Err(DeviceError::InvalidBarrier { resource, before, actual });
                }
                record_barrier(device, command_buffer, &resources[&resource], before, after);
                states.insert(resource, after);
            }
            GpuCommand::CopyResource { dst, src } => {
                let (src_res, dst_res) = (&resources[&src], &resources[&dst]);
                let (src_size, dst_size) = (src_res.desc.byte_size(), dst_res.desc.byte_size());
                if src_size != dst_size {
                    return Err(DeviceError::CopySizeMismatch { dst: dst_size, src: src_size });
                }
                let (src_state, dst_state) = copy_states(&states, dst, src)?;
                let src_layout = convert::state_scope(src_state).layout;
                let dst_layout = convert::state_scope(dst_state).layout;

                unsafe {
                    match (src_res.native, dst_res.native) {
                        (NativeResource::Buffer(s), NativeResource::Buffer(d)) => {
                            let region = vk::BufferCopy { src_offset: 0, dst_offset: 0, size: src_size };
                            device.cmd_copy_buffer(command_buffer, s, d, &[region]);
                        }
                        (NativeResource::Buffer(s), NativeResource::Image(d)) => {
                            let regions = buffer_image_regions(&dst_res.desc);
                            device.cmd_copy_buffer_to_image(command_buffer, s, d, dst_layout, &regions);
                        }
                        (NativeResource::Image(s), NativeResource::Buffer(d)) => {
                            let regions = buffer_image_regions(&src_res.desc);
                            device.cmd_copy_image_to_buffer(command_buffer, s, src_layout, d, &regions);
                        }
                        (NativeResource::Image(s), NativeResource::Image(d)) => {
                            let regions = image_regions(&src_res.desc);
                            device.cmd_copy_image(command_buffer, s, src_layout, d, dst_layout, &regions);
                        }
                    }
                }
            }
            GpuCommand::CopyBufferRegion { dst, dst_offset, src, src_offset, size } => {
                let (src_res, dst_res) = (&resources[&src], &resources[&dst]);
                let (NativeResource::Buffer(s), NativeResource::Buffer(d)) = (src_res.native, dst_res.native) else {
                    return Err(DeviceError::Backend("buffer region copies need two buffers".to_string()));
                };
                check_bounds(src_offset, size, src_res.desc.byte_size())?;
                check_bounds(dst_offset, size, dst_res.desc.byte_size())?;
                copy_states(&states, dst, src)?;

                let region = vk::BufferCopy { src_offset, dst_offset, size };
                unsafe { device.cmd_copy_buffer(command_buffer, s, d, &[region]) };
            }
        }
    }

    Ok(states)
}

fn copy_states(
    states: &HashMap<ResourceId, ResourceState>,
    dst: ResourceId,
    src: ResourceId,
) -> DeviceResult<(ResourceState, ResourceState)> {
    let (src_state, dst_state) = (states[&src], states[&dst]);
    expect_state(src, src_state, &[
        ResourceState::CopySource,
        ResourceState::GenericRead,
        ResourceState::Common,
    ])?;
    expect_state(dst, dst_state, &[
        ResourceState::CopyDest,
        ResourceState::Common,
    ])?;
    Ok((src_state, dst_state))
}

fn record_barrier(
    device: &ash::Device,
    command_buffer: vk::CommandBuffer,
    resource: &VulkanResource,
    before: ResourceState,
    after: ResourceState,
) {
    let (src, dst) = (convert::state_scope(before), convert::state_scope(after));
    match resource.native {
        NativeResource::Image(image) => {
            let barriers = [
                vk::ImageMemoryBarrier2::default()
                    .src_stage_mask(src.stage)
                    .src_access_mask(src.access)
                    .dst_stage_mask(dst.stage)
                    .dst_access_mask(dst.access)
                    .old_layout(src.layout)
                    .new_layout(dst.layout)
                    .image(image)
                    .subresource_range(full_range(&resource.desc)),
            ];
            let dependency_info = vk::DependencyInfo::default().image_memory_barriers(&barriers);
            unsafe { device.cmd_pipeline_barrier2(command_buffer, &dependency_info) };
        }
        NativeResource::Buffer(buffer) => {
            let barriers = [
                vk::BufferMemoryBarrier2::default()
                    .src_stage_mask(src.stage)
                    .src_access_mask(src.access)
                    .dst_stage_mask(dst.stage)
                    .dst_access_mask(dst.access)
                    .buffer(buffer)
                    .offset(0)
                    .size(vk::WHOLE_SIZE),
            ];
            let dependency_info = vk::DependencyInfo::default().buffer_memory_barriers(&barriers);
            unsafe { device.cmd_pipeline_barrier2(command_buffer, &dependency_info) };
        }
    }
}

fn create_image_view(
    device: &ash::Device,
    image: vk::Image,
    desc: &ResourceDesc,
    view: &ViewDesc,
) -> DeviceResult<vk::ImageView> {
    let ResourceDesc::Texture { dimension, format, depth, mip_levels, .. } = *desc else {
        return Err(DeviceError::Backend("image views need a texture".to_string()));
    };
    let (base_mip_level, level_count) = match view.range {
        ViewRange::Texture { most_detailed_mip, mip_count } => (most_detailed_mip, mip_count),
        ViewRange::Buffer { .. } => (0, mip_levels),
    };
    let format = if view.format == Format::Unknown { format } else { view.format };
    // Sampling reads a single aspect
    let aspect_mask = match view.kind {
        ViewKind::ShaderResource => copy_aspect(format),
        _ => convert::aspect(format),
    };
    let layer_count = match dimension {
        TextureDimension::D3 => 1,
        _ => depth,
    };

    let view_info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(convert::image_view_type(dimension, layer_count))
        .format(convert::format(format))
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask,
            base_mip_level,
            level_count,
            base_array_layer: 0,
            layer_count,
        });
    Ok(unsafe { device.create_image_view(&view_info, None)? })
}

fn write_bindless(
    device: &ash::Device,
    bindless: &BindlessSet,
    index: u32,
    resource: &VulkanResource,
    view: &ViewDesc,
    image_view: Option<vk::ImageView>,
) -> DeviceResult<()> {
    let is_buffer = matches!(resource.native, NativeResource::Buffer(_));
    let binding = BindlessBinding::for_view(view.kind, is_buffer).ok_or_else(|| {
        DeviceError::Backend(format!("{:?} views cannot be written to a shader-visible heap", view.kind))
    })?;
    let write = vk::WriteDescriptorSet::default()
        .dst_set(*bindless.set.raw())
        .dst_binding(binding as u32)
        .dst_array_element(index)
        .descriptor_type(binding.descriptor_type());

    match (resource.native, image_view) {
        (NativeResource::Buffer(buffer), _) => {
            let (offset, range) = match view.range {
                ViewRange::Buffer { offset, size, .. } => (offset, size),
                ViewRange::Texture { .. } => (0, vk::WHOLE_SIZE),
            };
            let buffer_infos = [vk::DescriptorBufferInfo { buffer, offset, range }];
            unsafe { device.update_descriptor_sets(&[write.buffer_info(&buffer_infos)], &[]) };
        }
        (NativeResource::Image(_), Some(image_view)) => {
            let image_layout = match binding {
                BindlessBinding::StorageImage => vk::ImageLayout::GENERAL,
                _ => convert::state_scope(ResourceState::ShaderResource).layout,
            };
            let image_infos = [
                vk::DescriptorImageInfo::default()
                    .image_view(image_view)
                    .image_layout(image_layout),
            ];
            unsafe { device.update_descriptor_sets(&[write.image_info(&image_infos)], &[]) };
        }
        (NativeResource::Image(_), None) => {
            return Err(DeviceError::Backend("texture view written without an image view".to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_image_regions_follow_packed_mips() {
        let desc = ResourceDesc::Texture {
            dimension: TextureDimension::D2,
            format: Format::R8G8B8A8Unorm,
            width: 4,
            height: 4,
            depth: 2,
            mip_levels: 3,
            usage: ResourceUsage::empty(),
        };
        let regions = buffer_image_regions(&desc);
        let offsets: Vec<u64> = regions.iter().map(|r| r.buffer_offset).collect();
        // Two layers per mip: 4x4, 2x2, 1x1
        assert_eq!(offsets, [0, 128, 160]);
        assert_eq!(regions[1].image_extent, vk::Extent3D { width: 2, height: 2, depth: 1 });
        assert!(regions.iter().all(|r| r.image_subresource.layer_count == 2));
    }

    #[test]
    fn volume_regions_copy_every_slice() {
        let desc = ResourceDesc::Texture {
            dimension: TextureDimension::D3,
            format: Format::R32Float,
            width: 4,
            height: 4,
            depth: 4,
            mip_levels: 2,
            usage: ResourceUsage::empty(),
        };
        let regions = buffer_image_regions(&desc);
        assert_eq!(regions[0].image_extent.depth, 4);
        assert_eq!(regions[1].buffer_offset, 4 * 4 * 4 * 4);
        assert_eq!(regions[1].image_subresource.layer_count, 1);
    }

    #[test]
    fn depth_textures_copy_their_depth_plane() {
        let desc = ResourceDesc::Texture {
            dimension: TextureDimension::D2,
            format: Format::D24UnormS8Uint,
            width: 8,
            height: 8,
            depth: 1,
            mip_levels: 1,
            usage: ResourceUsage::DEPTH_STENCIL,
        };
        assert_eq!(buffer_image_regions(&desc)[0].image_subresource.aspect_mask, vk::ImageAspectFlags::DEPTH);
        assert!(full_range(&desc).aspect_mask.contains(vk::ImageAspectFlags::STENCIL));
        assert!(buffer_image_regions(&ResourceDesc::Buffer { size: 4, usage: ResourceUsage::empty() }).is_empty());
    }

    #[test]
    fn placement_bounds_are_checked() {
        assert!(check_bounds(0, 64, 64).is_ok());
        assert!(matches!(check_bounds(1, 64, 64), Err(DeviceError::OutOfBounds { .. })));
        assert!(matches!(check_bounds(u64::MAX, 2, 64), Err(DeviceError::OutOfBounds { .. })));
    }

    #[test]
    fn mapped_ranges_past_the_allocation_are_errors() {
        let bytes = [1u8, 2, 3, 4, 5, 6, 7, 8];
        assert_eq!(mapped_range(&bytes, 2, 4).unwrap(), &[3, 4, 5, 6]);
        assert_eq!(mapped_range(&bytes, 8, 0).unwrap(), &[] as &[u8]);
        assert!(matches!(
            mapped_range(&bytes, 6, 4),
            Err(DeviceError::OutOfBounds { offset: 6, len: 4, size: 8 })
        ));
        assert!(matches!(mapped_range(&bytes, u64::MAX, 2), Err(DeviceError::OutOfBounds { .. })));
    }
}
