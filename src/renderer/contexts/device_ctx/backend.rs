use std::fmt::Debug;
use crate::renderer::error::DeviceError;
use crate::renderer::internals::descriptor_heap::DescriptorHeapKind;
use crate::renderer::resources::desc::{ClearValue, HeapKind, ResourceDesc, ResourceState, ViewDesc};

pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DescriptorHeapId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemoryHeapId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FenceId(pub u32);

/// Byte alignment of placed resources inside a memory heap
pub const PLACEMENT_ALIGNMENT: u64 = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorHeapDesc {
    pub kind: DescriptorHeapKind,
    pub capacity: u32,
    pub shader_visible: bool,
}

/// What the backend hands back for a freshly created descriptor heap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorHeapInfo {
    pub id: DescriptorHeapId,
    pub cpu_base: u64,
    pub gpu_base: Option<u64>,
    pub stride: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryHeapDesc {
    pub size: u64,
    pub kind: HeapKind,
}

/// Committed resources get their own allocation, placed ones live at an offset in a memory heap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Committed,
    Placed {
        heap: MemoryHeapId,
        offset: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceCreateDesc {
    pub desc: ResourceDesc,
    pub heap: HeapKind,
    pub placement: Placement,
    pub initial_state: ResourceState,
    pub clear_value: Option<ClearValue>,
}

/// Work recorded on a command encoder, replayed by the backend at submit time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuCommand {
    Barrier {
        resource: ResourceId,
        before: ResourceState,
        after: ResourceState,
    },
    /// Whole-resource copy, both sides must have the same byte size
    CopyResource {
        dst: ResourceId,
        src: ResourceId,
    },
    CopyBufferRegion {
        dst: ResourceId,
        dst_offset: u64,
        src: ResourceId,
        src_offset: u64,
        size: u64,
    },
}

impl GpuCommand {
    pub fn resources(&self) -> impl Iterator<Item = ResourceId> {
        let (a, b) = match *self {
            GpuCommand::Barrier { resource, .. } => (resource, None),
            GpuCommand::CopyResource { dst, src } => (dst, Some(src)),
            GpuCommand::CopyBufferRegion { dst, src, .. } => (dst, Some(src)),
        };
        std::iter::once(a).chain(b)
    }
}

/// The native graphics API underneath the descriptor heaps and resources.
///
/// Fences are monotonically increasing counters; `wait_for_fence` blocks without timeout.
pub trait GpuBackend: Send + Sync + Debug + 'static {
    fn name(&self) -> &str;

    fn create_descriptor_heap(&self, desc: &DescriptorHeapDesc) -> DeviceResult<DescriptorHeapInfo>;
    fn destroy_descriptor_heap(&self, heap: DescriptorHeapId) -> DeviceResult<()>;
    /// Writes a view of `resource` into the slot at `cpu`
    fn write_view(
        &self,
        heap: DescriptorHeapId,
        cpu: u64,
        resource: ResourceId,
        view: &ViewDesc,
    ) -> DeviceResult<()>;

    fn create_memory_heap(&self, desc: &MemoryHeapDesc) -> DeviceResult<MemoryHeapId>;
    fn destroy_memory_heap(&self, heap: MemoryHeapId) -> DeviceResult<()>;

    fn create_resource(&self, desc: &ResourceCreateDesc) -> DeviceResult<ResourceId>;
    fn destroy_resource(&self, resource: ResourceId) -> DeviceResult<()>;
    /// Shape and heap of an existing resource, including ones the backend owns itself
    fn describe_resource(&self, resource: ResourceId) -> DeviceResult<(ResourceDesc, HeapKind, ResourceState)>;
    fn gpu_virtual_address(&self, resource: ResourceId) -> DeviceResult<u64>;
    fn write_mapped(&self, resource: ResourceId, offset: u64, data: &[u8]) -> DeviceResult<()>;
    fn read_mapped(&self, resource: ResourceId, offset: u64, out: &mut [u8]) -> DeviceResult<()>;
    fn set_debug_name(&self, resource: ResourceId, name: &str);

    fn create_fence(&self, initial_value: u64) -> DeviceResult<FenceId>;
    fn destroy_fence(&self, fence: FenceId) -> DeviceResult<()>;
    fn completed_fence_value(&self, fence: FenceId) -> DeviceResult<u64>;
    fn wait_for_fence(&self, fence: FenceId, value: u64) -> DeviceResult<()>;

    /// Queues `commands` for execution; the fence is signaled with the value once they finish
    fn submit(&self, commands: &[GpuCommand], signal: Option<(FenceId, u64)>) -> DeviceResult<()>;
    fn present(&self, vsync: bool) -> DeviceResult<()>;

    /// Swap-chain images owned by the backend, if it has any
    fn back_buffers(&self) -> Vec<ResourceId> {
        Vec::new()
    }
}
