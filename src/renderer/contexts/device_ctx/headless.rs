use std::collections::{HashMap, VecDeque};
use std::ptr::NonNull;
use std::sync::{Mutex, MutexGuard};
use crate::renderer::contexts::device_ctx::backend::{
    DescriptorHeapDesc, DescriptorHeapId, DescriptorHeapInfo, DeviceResult, FenceId, GpuBackend,
    GpuCommand, MemoryHeapDesc, MemoryHeapId, Placement, ResourceCreateDesc, ResourceId,
    PLACEMENT_ALIGNMENT,
};
use crate::renderer::error::DeviceError;
use crate::renderer::resources::desc::{
    Format, HeapKind, ResourceDesc, ResourceState, ResourceUsage, TextureDimension, ViewDesc,
};

const DESCRIPTOR_STRIDE: u32 = 32;
const CPU_DESCRIPTOR_BASE: u64 = 0x0000_1000_0000;
const GPU_DESCRIPTOR_BASE: u64 = 0x0100_0000_0000;
const GPU_VIRTUAL_BASE: u64 = 0x0200_0000_0000;

/// Shape of the backend-owned swap chain
#[derive(Debug, Clone, Copy)]
pub struct HeadlessDesc {
    pub back_buffer_count: u32,
    pub width: u32,
    pub height: u32,
    pub format: Format,
    /// Total bytes of resource and heap memory the device will hand out
    pub memory_budget: u64,
}

impl Default for HeadlessDesc {
    fn default() -> Self {
        Self {
            back_buffer_count: 2,
            width: 1280,
            height: 720,
            format: Format::B8G8R8A8Unorm,
            memory_budget: u64::MAX,
        }
    }
}

/// Counters exposed for inspection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeadlessStats {
    /// Fence waits that actually had to block on unfinished work
    pub fence_waits: u64,
    pub submissions: u64,
    pub executed_batches: u64,
    pub presents: u64,
    pub resources_created: u64,
    pub resources_destroyed: u64,
    /// Resources destroyed while pending work still referenced them
    pub in_flight_destroys: u64,
    pub views_written: u64,
}

#[derive(Debug)]
enum Storage {
    Owned(Vec<u8>),
    Placed {
        heap: MemoryHeapId,
        offset: u64,
    },
}

#[derive(Debug)]
struct HeadlessResource {
    desc: ResourceDesc,
    heap: HeapKind,
    storage: Storage,
    state: ResourceState,
    gpu_address: u64,
    name: String,
    owned_by_backend: bool,
}

#[derive(Debug)]
struct HeadlessMemoryHeap {
    kind: HeapKind,
    bytes: Vec<u8>,
    gpu_address: u64,
}

#[derive(Debug)]
struct HeadlessDescriptorHeap {
    info: DescriptorHeapInfo,
    slots: Vec<Option<(ResourceId, ViewDesc)>>,
}

#[derive(Debug, Clone, Copy)]
struct HeadlessFence {
    completed: u64,
    last_signaled: u64,
}

#[derive(Debug)]
struct Batch {
    commands: Vec<GpuCommand>,
    signal: Option<(FenceId, u64)>,
}

#[derive(Debug, Default)]
struct HeadlessState {
    next_id: u64,
    next_object: u32,
    next_cpu_descriptor: u64,
    next_gpu_descriptor: u64,
    next_gpu_address: u64,
    memory_used: u64,
    resources: HashMap<ResourceId, HeadlessResource>,
    memory_heaps: HashMap<MemoryHeapId, HeadlessMemoryHeap>,
    descriptor_heaps: HashMap<DescriptorHeapId, HeadlessDescriptorHeap>,
    fences: HashMap<FenceId, HeadlessFence>,
    queue: VecDeque<Batch>,
    back_buffers: Vec<ResourceId>,
    lost: Option<String>,
    stats: HeadlessStats,
}

/// A CPU emulation of a GPU queue.
///
/// Submitted work is not executed until someone waits on a fence value it signals
/// (or calls [`HeadlessBackend::retire_all`]), so completed fence values only move
/// when the CPU blocks. Barriers and copies are validated as they execute; a failing
/// batch loses the device.
#[derive(Debug)]
pub struct HeadlessBackend {
    desc: HeadlessDesc,
    state: Mutex<HeadlessState>,
}

impl HeadlessBackend {
    pub fn new(desc: HeadlessDesc) -> Self {
        let mut state = HeadlessState {
            next_id: 1,
            next_cpu_descriptor: CPU_DESCRIPTOR_BASE,
            next_gpu_descriptor: GPU_DESCRIPTOR_BASE,
            next_gpu_address: GPU_VIRTUAL_BASE,
            ..Default::default()
        };

        for i in 0..desc.back_buffer_count {
            let id = state.next_resource_id();
            let texture = ResourceDesc::Texture {
                dimension: TextureDimension::D2,
                format: desc.format,
                width: desc.width,
                height: desc.height,
                depth: 1,
                mip_levels: 1,
                usage: ResourceUsage::RENDER_TARGET,
            };
            let gpu_address = state.reserve_gpu_address(texture.byte_size());
            state.resources.insert(id, HeadlessResource {
                desc: texture,
                heap: HeapKind::Default,
                storage: Storage::Owned(vec![0; texture.byte_size() as usize]),
                state: ResourceState::Present,
                gpu_address,
                name: format!("BackBuffer{}", i),
                owned_by_backend: true,
            });
            state.back_buffers.push(id);
        }

        Self {
            desc,
            state: Mutex::new(state),
        }
    }

    pub fn stats(&self) -> HeadlessStats {
        self.state().map(|state| state.stats).unwrap_or_default()
    }

    pub fn live_resource_count(&self) -> usize {
        self.state()
            .map(|state| state.resources.values().filter(|r| !r.owned_by_backend).count())
            .unwrap_or_default()
    }

    pub fn descriptor_heap_count(&self) -> usize {
        self.state().map(|state| state.descriptor_heaps.len()).unwrap_or_default()
    }

    pub fn pending_batches(&self) -> usize {
        self.state().map(|state| state.queue.len()).unwrap_or_default()
    }

    /// Lets the emulated GPU finish everything that has been submitted
    pub fn retire_all(&self) -> DeviceResult<()> {
        let mut state = self.lock()?;
        while state.execute_next()? {}
        Ok(())
    }

    /// Raw contents of any resource, including GPU-only ones
    pub fn contents(&self, resource: ResourceId) -> DeviceResult<Vec<u8>> {
        let state = self.lock()?;
        let size = state.resource(resource)?.desc.byte_size();
        let mut out = vec![0; size as usize];
        state.read(resource, 0, &mut out)?;
        Ok(out)
    }

    pub fn resource_state(&self, resource: ResourceId) -> DeviceResult<ResourceState> {
        Ok(self.lock()?.resource(resource)?.state)
    }

    pub fn debug_name(&self, resource: ResourceId) -> DeviceResult<String> {
        Ok(self.lock()?.resource(resource)?.name.clone())
    }

    /// The view last written into the slot at `cpu`
    pub fn view_at(&self, heap: DescriptorHeapId, cpu: u64) -> DeviceResult<Option<(ResourceId, ViewDesc)>> {
        let state = self.lock()?;
        let heap = state.descriptor_heap(heap)?;
        let index = heap.slot_index(cpu)?;
        Ok(heap.slots[index])
    }

    fn state(&self) -> DeviceResult<MutexGuard<'_, HeadlessState>> {
        self.state
            .lock()
            .map_err(|e| DeviceError::Backend(e.to_string()))
    }

    /// Like `state`, but refuses to touch a lost device
    fn lock(&self) -> DeviceResult<MutexGuard<'_, HeadlessState>> {
        let state = self.state()?;
        if let Some(reason) = &state.lost {
            return Err(DeviceError::DeviceLost(reason.clone()));
        }
        Ok(state)
    }
}

impl HeadlessDescriptorHeap {
    fn slot_index(&self, cpu: u64) -> DeviceResult<usize> {
        let stride = self.info.stride as u64;
        let end = self.info.cpu_base + stride * self.slots.len() as u64;
        if cpu < self.info.cpu_base || cpu >= end || (cpu - self.info.cpu_base) % stride != 0 {
            return Err(DeviceError::OutOfBounds {
                offset: cpu.wrapping_sub(self.info.cpu_base),
                len: stride,
                size: end - self.info.cpu_base,
            });
        }
        Ok(((cpu - self.info.cpu_base) / stride) as usize)
    }
}

impl HeadlessState {
    fn next_object_id(&mut self) -> u32 {
        self.next_object += 1;
        self.next_object
    }

    fn next_resource_id(&mut self) -> ResourceId {
        let id = ResourceId(self.next_id);
        self.next_id += 1;
        id
    }

    fn reserve_gpu_address(&mut self, size: u64) -> u64 {
        let address = self.next_gpu_address;
        self.next_gpu_address += size.max(1).div_ceil(PLACEMENT_ALIGNMENT) * PLACEMENT_ALIGNMENT;
        address
    }

    fn charge(&mut self, size: u64, budget: u64) -> DeviceResult<()> {
        if self.memory_used.saturating_add(size) > budget {
            return Err(DeviceError::OutOfMemory { requested: size });
        }
        self.memory_used += size;
        Ok(())
    }

    fn resource(&self, id: ResourceId) -> DeviceResult<&HeadlessResource> {
        self.resources.get(&id).ok_or(DeviceError::UnknownResource(id))
    }

    fn resource_mut(&mut self, id: ResourceId) -> DeviceResult<&mut HeadlessResource> {
        self.resources.get_mut(&id).ok_or(DeviceError::UnknownResource(id))
    }

    fn descriptor_heap(&self, id: DescriptorHeapId) -> DeviceResult<&HeadlessDescriptorHeap> {
        self.descriptor_heaps.get(&id).ok_or(DeviceError::UnknownDescriptorHeap(id))
    }

    fn fence_mut(&mut self, id: FenceId) -> DeviceResult<&mut HeadlessFence> {
        self.fences.get_mut(&id).ok_or(DeviceError::UnknownFence(id))
    }

    fn bytes_mut(&mut self, id: ResourceId) -> DeviceResult<&mut [u8]> {
        let resource = self.resources.get_mut(&id).ok_or(DeviceError::UnknownResource(id))?;
        let size = resource.desc.byte_size() as usize;
        match &mut resource.storage {
            Storage::Owned(bytes) => Ok(bytes.as_mut_slice()),
            Storage::Placed { heap, offset } => {
                let heap = self
                    .memory_heaps
                    .get_mut(heap)
                    .ok_or(DeviceError::UnknownMemoryHeap(*heap))?;
                let start = *offset as usize;
                Ok(&mut heap.bytes[start..start + size])
            }
        }
    }

    fn read(&self, id: ResourceId, offset: u64, out: &mut [u8]) -> DeviceResult<()> {
        let resource = self.resource(id)?;
        let size = resource.desc.byte_size();
        check_bounds(offset, out.len() as u64, size)?;
        let bytes = match &resource.storage {
            Storage::Owned(bytes) => &bytes[..],
            Storage::Placed { heap, offset } => {
                let heap = self
                    .memory_heaps
                    .get(heap)
                    .ok_or(DeviceError::UnknownMemoryHeap(*heap))?;
                let start = *offset as usize;
                &heap.bytes[start..start + size as usize]
            }
        };
        let start = offset as usize;
        out.copy_from_slice(&bytes[start..start + out.len()]);
        Ok(())
    }

    fn write(&mut self, id: ResourceId, offset: u64, data: &[u8]) -> DeviceResult<()> {
        let bytes = self.bytes_mut(id)?;
        check_bounds(offset, data.len() as u64, bytes.len() as u64)?;

        let copied = unsafe {
            let mut raw = presser::RawAllocation::from_raw_parts(
                NonNull::new(bytes.as_mut_ptr())
                    .ok_or_else(|| DeviceError::Mapping("null mapped pointer".to_string()))?,
                bytes.len(),
            );
            let mut slab = raw.borrow_as_slab();
            presser::copy_from_slice_to_offset(data, &mut slab, offset as usize)
        };
        copied.map_err(|e| DeviceError::Mapping(e.to_string()))?;
        Ok(())
    }

    fn is_referenced_by_pending_work(&self, id: ResourceId) -> bool {
        self.queue
            .iter()
            .flat_map(|batch| batch.commands.iter())
            .any(|command| command.resources().any(|r| r == id))
    }

    /// Runs the oldest batch. Returns false once the queue is empty.
    fn execute_next(&mut self) -> DeviceResult<bool> {
        let Some(batch) = self.queue.pop_front() else {
            return Ok(false);
        };

        for command in &batch.commands {
            if let Err(e) = self.execute(command) {
                let reason = format!("{:?} failed: {}", command, e);
                log::error!("Headless device lost: {}", reason);
                self.lost = Some(reason.clone());
                return Err(DeviceError::DeviceLost(reason));
            }
        }

        if let Some((fence, value)) = batch.signal {
            let fence = self.fence_mut(fence)?;
            fence.completed = fence.completed.max(value);
        }
        self.stats.executed_batches += 1;

        Ok(true)
    }

    fn execute(&mut self, command: &GpuCommand) -> DeviceResult<()> {
        match *command {
            GpuCommand::Barrier { resource, before, after } => {
                let res = self.resource_mut(resource)?;
                if res.state != before {
                    return Err(DeviceError::InvalidBarrier {
                        resource,
                        before,
                        actual: res.state,
                    });
                }
                res.state = after;
            }
            GpuCommand::CopyResource { dst, src } => {
                let src_size = self.resource(src)?.desc.byte_size();
                let dst_size = self.resource(dst)?.desc.byte_size();
                if src_size != dst_size {
                    return Err(DeviceError::CopySizeMismatch { dst: dst_size, src: src_size });
                }
                self.copy(dst, 0, src, 0, src_size)?;
            }
            GpuCommand::CopyBufferRegion { dst, dst_offset, src, src_offset, size } => {
                self.copy(dst, dst_offset, src, src_offset, size)?;
            }
        }
        Ok(())
    }

    fn copy(&mut self, dst: ResourceId, dst_offset: u64, src: ResourceId, src_offset: u64, size: u64) -> DeviceResult<()> {
        expect_state(src, self.resource(src)?.state, &[
            ResourceState::CopySource,
            ResourceState::GenericRead,
            ResourceState::Common,
        ])?;
        expect_state(dst, self.resource(dst)?.state, &[
            ResourceState::CopyDest,
            ResourceState::Common,
        ])?;

        let mut staging = vec![0; size as usize];
        self.read(src, src_offset, &mut staging)?;
        self.write(dst, dst_offset, &staging)
    }
}

fn check_bounds(offset: u64, len: u64, size: u64) -> DeviceResult<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(DeviceError::OutOfBounds { offset, len, size }),
    }
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

impl GpuBackend for HeadlessBackend {
    fn name(&self) -> &str {
        "headless"
    }

    fn create_descriptor_heap(&self, desc: &DescriptorHeapDesc) -> DeviceResult<DescriptorHeapInfo> {
        let mut state = self.lock()?;
        let id = DescriptorHeapId(state.next_object_id());
        let span = desc.capacity as u64 * DESCRIPTOR_STRIDE as u64;

        // Leave a gap between heaps so a handle from one never lands inside another
        let cpu_base = state.next_cpu_descriptor;
        state.next_cpu_descriptor += span + 0x1_0000;
        let gpu_base = if desc.shader_visible {
            let base = state.next_gpu_descriptor;
            state.next_gpu_descriptor += span + 0x1_0000;
            Some(base)
        } else {
            None
        };

        let info = DescriptorHeapInfo {
            id,
            cpu_base,
            gpu_base,
            stride: DESCRIPTOR_STRIDE,
        };
        state.descriptor_heaps.insert(id, HeadlessDescriptorHeap {
            info,
            slots: vec![None; desc.capacity as usize],
        });
        log::debug!("Created {:?} descriptor heap {:?} with {} slots", desc.kind, id, desc.capacity);

        Ok(info)
    }

    fn destroy_descriptor_heap(&self, heap: DescriptorHeapId) -> DeviceResult<()> {
        self.lock()?
            .descriptor_heaps
            .remove(&heap)
            .map(|_| ())
            .ok_or(DeviceError::UnknownDescriptorHeap(heap))
    }

    fn write_view(
        &self,
        heap: DescriptorHeapId,
        cpu: u64,
        resource: ResourceId,
        view: &ViewDesc,
    ) -> DeviceResult<()> {
        let mut state = self.lock()?;
        state.resource(resource)?;
        let heap = state
            .descriptor_heaps
            .get_mut(&heap)
            .ok_or(DeviceError::UnknownDescriptorHeap(heap))?;
        let index = heap.slot_index(cpu)?;
        heap.slots[index] = Some((resource, *view));
        state.stats.views_written += 1;
        Ok(())
    }

    fn create_memory_heap(&self, desc: &MemoryHeapDesc) -> DeviceResult<MemoryHeapId> {
        if desc.size == 0 {
            return Err(DeviceError::InvalidPlacement("memory heaps cannot be empty".to_string()));
        }
        let mut state = self.lock()?;
        state.charge(desc.size, self.desc.memory_budget)?;
        let bytes = match zeroed(desc.size) {
            Ok(bytes) => bytes,
            Err(e) => {
                state.memory_used -= desc.size;
                return Err(e);
            }
        };
        let id = MemoryHeapId(state.next_object_id());
        let gpu_address = state.reserve_gpu_address(desc.size);
        state.memory_heaps.insert(id, HeadlessMemoryHeap {
            kind: desc.kind,
            bytes,
            gpu_address,
        });
        Ok(id)
    }

    fn destroy_memory_heap(&self, heap: MemoryHeapId) -> DeviceResult<()> {
        let mut state = self.lock()?;
        let placed_inside = state.resources.values().any(|r| {
            matches!(r.storage, Storage::Placed { heap: h, .. } if h == heap)
        });
        if placed_inside {
            return Err(DeviceError::InvalidPlacement(format!(
                "memory heap {:?} still has resources placed in it",
                heap
            )));
        }
        let removed = state
            .memory_heaps
            .remove(&heap)
            .ok_or(DeviceError::UnknownMemoryHeap(heap))?;
        state.memory_used -= removed.bytes.len() as u64;
        Ok(())
    }

    fn create_resource(&self, desc: &ResourceCreateDesc) -> DeviceResult<ResourceId> {
        let mut state = self.lock()?;
        let size = desc.desc.byte_size();

        let (storage, gpu_address) = match desc.placement {
            Placement::Committed => {
                state.charge(size, self.desc.memory_budget)?;
                let bytes = match zeroed(size) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        state.memory_used -= size;
                        return Err(e);
                    }
                };
                let address = state.reserve_gpu_address(size);
                (Storage::Owned(bytes), address)
            }
            Placement::Placed { heap, offset } => {
                let memory = state
                    .memory_heaps
                    .get(&heap)
                    .ok_or(DeviceError::UnknownMemoryHeap(heap))?;
                if memory.kind != desc.heap {
                    return Err(DeviceError::InvalidPlacement(format!(
                        "a {:?} resource cannot be placed in a {:?} heap",
                        desc.heap, memory.kind
                    )));
                }
                if offset % PLACEMENT_ALIGNMENT != 0 {
                    return Err(DeviceError::InvalidPlacement(format!(
                        "offset {} is not aligned to {} bytes",
                        offset, PLACEMENT_ALIGNMENT
                    )));
                }
                check_bounds(offset, size, memory.bytes.len() as u64)
                    .map_err(|e| DeviceError::InvalidPlacement(e.to_string()))?;
                (Storage::Placed { heap, offset }, memory.gpu_address + offset)
            }
        };

        let id = state.next_resource_id();
        state.resources.insert(id, HeadlessResource {
            desc: desc.desc,
            heap: desc.heap,
            storage,
            state: desc.initial_state,
            gpu_address,
            name: String::new(),
            owned_by_backend: false,
        });
        state.stats.resources_created += 1;

        Ok(id)
    }

    fn destroy_resource(&self, resource: ResourceId) -> DeviceResult<()> {
        let mut state = self.lock()?;
        if state.resource(resource)?.owned_by_backend {
            return Err(DeviceError::Backend(format!(
                "{:?} is owned by the swap chain",
                resource
            )));
        }

        let in_flight = state.is_referenced_by_pending_work(resource);
        if let Some(removed) = state.resources.remove(&resource) {
            if let Storage::Owned(bytes) = removed.storage {
                state.memory_used -= bytes.len() as u64;
            }
        }
        state.stats.resources_destroyed += 1;

        if in_flight {
            state.stats.in_flight_destroys += 1;
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
        Ok(self.lock()?.resource(resource)?.gpu_address)
    }

    fn write_mapped(&self, resource: ResourceId, offset: u64, data: &[u8]) -> DeviceResult<()> {
        let mut state = self.lock()?;
        if state.resource(resource)?.heap != HeapKind::Upload {
            return Err(DeviceError::NotMapped(resource));
        }
        state.write(resource, offset, data)
    }

    fn read_mapped(&self, resource: ResourceId, offset: u64, out: &mut [u8]) -> DeviceResult<()> {
        let state = self.lock()?;
        if !state.resource(resource)?.heap.is_cpu_visible() {
            return Err(DeviceError::NotMapped(resource));
        }
        state.read(resource, offset, out)
    }

    fn set_debug_name(&self, resource: ResourceId, name: &str) {
        if let Ok(mut state) = self.lock() {
            if let Ok(res) = state.resource_mut(resource) {
                res.name = name.to_string();
            }
        }
    }

    fn create_fence(&self, initial_value: u64) -> DeviceResult<FenceId> {
        let mut state = self.lock()?;
        let id = FenceId(state.next_object_id());
        state.fences.insert(id, HeadlessFence {
            completed: initial_value,
            last_signaled: initial_value,
        });
        Ok(id)
    }

    fn destroy_fence(&self, fence: FenceId) -> DeviceResult<()> {
        self.lock()?
            .fences
            .remove(&fence)
            .map(|_| ())
            .ok_or(DeviceError::UnknownFence(fence))
    }

    fn completed_fence_value(&self, fence: FenceId) -> DeviceResult<u64> {
        let mut state = self.lock()?;
        Ok(state.fence_mut(fence)?.completed)
    }

    fn wait_for_fence(&self, fence: FenceId, value: u64) -> DeviceResult<()> {
        let mut state = self.lock()?;
        let current = *state.fence_mut(fence)?;
        if current.completed >= value {
            return Ok(());
        }
        if current.last_signaled < value {
            // A real queue would hang here forever
            return Err(DeviceError::FenceNeverSignaled {
                value,
                last: current.last_signaled,
            });
        }

        state.stats.fence_waits += 1;
        while state.fence_mut(fence)?.completed < value {
            if !state.execute_next()? {
                break;
            }
        }
        Ok(())
    }

    fn submit(&self, commands: &[GpuCommand], signal: Option<(FenceId, u64)>) -> DeviceResult<()> {
        let mut state = self.lock()?;
        if let Some((fence, value)) = signal {
            let fence = state.fence_mut(fence)?;
            fence.last_signaled = fence.last_signaled.max(value);
        }
        state.queue.push_back(Batch {
            commands: commands.to_vec(),
            signal,
        });
        state.stats.submissions += 1;
        Ok(())
    }

    fn present(&self, _vsync: bool) -> DeviceResult<()> {
        self.lock()?.stats.presents += 1;
        Ok(())
    }

    fn back_buffers(&self) -> Vec<ResourceId> {
        self.lock()
            .map(|state| state.back_buffers.clone())
            .unwrap_or_default()
    }
}

/// Zero-filled backing store, or `OutOfMemory` when the host cannot provide it
fn zeroed(size: u64) -> DeviceResult<Vec<u8>> {
    let len = usize::try_from(size).map_err(|_| DeviceError::OutOfMemory { requested: size })?;
    let mut bytes = Vec::new();
    bytes.try_reserve_exact(len).map_err(|_| DeviceError::OutOfMemory { requested: size })?;
    bytes.resize(len, 0);
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::internals::descriptor_heap::DescriptorHeapKind;

    fn buffer(size: u64, heap: HeapKind, state: ResourceState) -> ResourceCreateDesc {
        ResourceCreateDesc {
            desc: ResourceDesc::Buffer {
                size,
                usage: ResourceUsage::empty(),
            },
            heap,
            placement: Placement::Committed,
            initial_state: state,
            clear_value: None,
        }
    }

    #[test]
    fn work_only_completes_when_waited_on() {
        let backend = HeadlessBackend::new(HeadlessDesc::default());
        let fence = backend.create_fence(0).unwrap();
        backend.submit(&[], Some((fence, 1))).unwrap();

        assert_eq!(backend.completed_fence_value(fence).unwrap(), 0);
        backend.wait_for_fence(fence, 1).unwrap();
        assert_eq!(backend.completed_fence_value(fence).unwrap(), 1);
        assert_eq!(backend.stats().fence_waits, 1);

        // Already complete, no blocking
        backend.wait_for_fence(fence, 1).unwrap();
        assert_eq!(backend.stats().fence_waits, 1);
    }

    #[test]
    fn waiting_on_an_unsignaled_value_is_reported() {
        let backend = HeadlessBackend::new(HeadlessDesc::default());
        let fence = backend.create_fence(0).unwrap();
        assert!(matches!(
            backend.wait_for_fence(fence, 3),
            Err(DeviceError::FenceNeverSignaled { value: 3, last: 0 })
        ));
    }

    #[test]
    fn copies_move_bytes_between_heaps() {
        let backend = HeadlessBackend::new(HeadlessDesc::default());
        let upload = backend.create_resource(&buffer(16, HeapKind::Upload, ResourceState::GenericRead)).unwrap();
        let gpu = backend.create_resource(&buffer(16, HeapKind::Default, ResourceState::CopyDest)).unwrap();
        let readback = backend.create_resource(&buffer(16, HeapKind::Readback, ResourceState::CopyDest)).unwrap();
        let fence = backend.create_fence(0).unwrap();

        backend.write_mapped(upload, 0, &[7; 16]).unwrap();
        backend.submit(&[
            GpuCommand::CopyResource { dst: gpu, src: upload },
            GpuCommand::Barrier { resource: gpu, before: ResourceState::CopyDest, after: ResourceState::CopySource },
            GpuCommand::CopyResource { dst: readback, src: gpu },
        ], Some((fence, 1))).unwrap();
        backend.wait_for_fence(fence, 1).unwrap();

        let mut out = [0; 16];
        backend.read_mapped(readback, 0, &mut out).unwrap();
        assert_eq!(out, [7; 16]);
        assert!(backend.read_mapped(gpu, 0, &mut out).is_err());
    }

    #[test]
    fn mismatched_barrier_loses_the_device() {
        let backend = HeadlessBackend::new(HeadlessDesc::default());
        let gpu = backend.create_resource(&buffer(16, HeapKind::Default, ResourceState::Common)).unwrap();
        let fence = backend.create_fence(0).unwrap();
        backend.submit(&[GpuCommand::Barrier {
            resource: gpu,
            before: ResourceState::RenderTarget,
            after: ResourceState::Present,
        }], Some((fence, 1))).unwrap();

        assert!(matches!(backend.wait_for_fence(fence, 1), Err(DeviceError::DeviceLost(_))));
        assert!(matches!(backend.completed_fence_value(fence), Err(DeviceError::DeviceLost(_))));
    }

    #[test]
    fn destroying_a_resource_with_pending_work_is_flagged() {
        let backend = HeadlessBackend::new(HeadlessDesc::default());
        let src = backend.create_resource(&buffer(16, HeapKind::Upload, ResourceState::GenericRead)).unwrap();
        let dst = backend.create_resource(&buffer(16, HeapKind::Default, ResourceState::CopyDest)).unwrap();
        backend.submit(&[GpuCommand::CopyResource { dst, src }], None).unwrap();

        assert!(matches!(backend.destroy_resource(src), Err(DeviceError::ResourceInFlight(_))));
        assert_eq!(backend.stats().in_flight_destroys, 1);
        assert!(backend.retire_all().is_err());
    }

    #[test]
    fn placed_resources_alias_their_heap() {
        let backend = HeadlessBackend::new(HeadlessDesc::default());
        let heap = backend.create_memory_heap(&MemoryHeapDesc {
            size: 2 * PLACEMENT_ALIGNMENT,
            kind: HeapKind::Upload,
        }).unwrap();
        let placed = |offset| ResourceCreateDesc {
            placement: Placement::Placed { heap, offset },
            ..buffer(64, HeapKind::Upload, ResourceState::GenericRead)
        };

        let a = backend.create_resource(&placed(PLACEMENT_ALIGNMENT)).unwrap();
        let b = backend.create_resource(&placed(PLACEMENT_ALIGNMENT)).unwrap();
        backend.write_mapped(a, 0, &[3; 64]).unwrap();
        assert_eq!(backend.contents(b).unwrap(), vec![3; 64]);

        assert!(matches!(backend.create_resource(&placed(100)), Err(DeviceError::InvalidPlacement(_))));
        assert!(matches!(
            backend.create_resource(&placed(2 * PLACEMENT_ALIGNMENT)),
            Err(DeviceError::InvalidPlacement(_))
        ));
        assert!(matches!(
            backend.create_resource(&ResourceCreateDesc {
                heap: HeapKind::Default,
                ..placed(0)
            }),
            Err(DeviceError::InvalidPlacement(_))
        ));
        assert!(backend.destroy_memory_heap(heap).is_err());
    }

    #[test]
    fn memory_budget_runs_out() {
        let backend = HeadlessBackend::new(HeadlessDesc {
            memory_budget: 100,
            ..Default::default()
        });
        backend.create_resource(&buffer(64, HeapKind::Default, ResourceState::Common)).unwrap();
        assert!(matches!(
            backend.create_resource(&buffer(64, HeapKind::Default, ResourceState::Common)),
            Err(DeviceError::OutOfMemory { requested: 64 })
        ));
    }

    #[test]
    fn allocations_the_host_cannot_back_fail_cleanly() {
        let backend = HeadlessBackend::new(HeadlessDesc {
            memory_budget: u64::MAX / 4 + 32,
            ..Default::default()
        });
        assert!(matches!(
            backend.create_resource(&buffer(u64::MAX / 4, HeapKind::Default, ResourceState::Common)),
            Err(DeviceError::OutOfMemory { .. })
        ));
        // Nothing was charged for the failed allocation
        backend.create_resource(&buffer(64, HeapKind::Default, ResourceState::Common)).unwrap();
        assert_eq!(backend.live_resource_count(), 1);
    }

    #[test]
    fn descriptor_heaps_do_not_overlap() {
        let backend = HeadlessBackend::new(HeadlessDesc::default());
        let desc = |kind, shader_visible| DescriptorHeapDesc { kind, capacity: 8, shader_visible };
        let rtv = backend.create_descriptor_heap(&desc(DescriptorHeapKind::RenderTarget, false)).unwrap();
        let srv = backend.create_descriptor_heap(&desc(DescriptorHeapKind::CbvSrvUav, true)).unwrap();

        assert_eq!(rtv.gpu_base, None);
        assert!(srv.gpu_base.is_some());
        assert!(srv.cpu_base >= rtv.cpu_base + 8 * rtv.stride as u64);
    }

    #[test]
    fn back_buffers_belong_to_the_swap_chain() {
        let backend = HeadlessBackend::new(HeadlessDesc::default());
        let buffers = backend.back_buffers();
        assert_eq!(buffers.len(), 2);
        assert_eq!(backend.resource_state(buffers[0]).unwrap(), ResourceState::Present);
        assert!(backend.destroy_resource(buffers[0]).is_err());
    }
}
