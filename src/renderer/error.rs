use thiserror::Error;
use crate::renderer::contexts::device_ctx::backend::{DescriptorHeapId, FenceId, MemoryHeapId, ResourceId};
use crate::renderer::internals::descriptor_heap::DescriptorHeapKind;
use crate::renderer::resources::desc::{HeapKind, ResourceState, ResourceUsage, ViewKind};

pub type Result<T> = std::result::Result<T, RenderError>;

/// Which named registry an operation touched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryKind {
    Texture,
    Buffer,
    ConstantBuffer,
    Mesh,
}

impl std::fmt::Display for RegistryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryKind::Texture => write!(f, "texture"),
            RegistryKind::Buffer => write!(f, "buffer"),
            RegistryKind::ConstantBuffer => write!(f, "constant buffer"),
            RegistryKind::Mesh => write!(f, "mesh"),
        }
    }
}

/// Frame slot or the unique (not frame-indexed) registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryScope {
    Frame(u32),
    Unique,
}

impl std::fmt::Display for RegistryScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryScope::Frame(slot) => write!(f, "in frame {}", slot),
            RegistryScope::Unique => write!(f, "in the unique registry"),
        }
    }
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("{kind:?} descriptor heap exhausted: none of its {capacity} descriptors are free")]
    HeapExhausted {
        kind: DescriptorHeapKind,
        capacity: u32,
    },
    #[error("descriptor heap capacity must be greater than zero")]
    ZeroCapacity,
    #[error("null descriptor handle")]
    NullHandle,
    #[error("descriptor handle {cpu:#x} does not belong to the {kind:?} heap")]
    HandleOutOfRange {
        kind: DescriptorHeapKind,
        cpu: u64,
    },
    #[error("descriptor {index} of the {kind:?} heap is not live")]
    DescriptorNotLive {
        kind: DescriptorHeapKind,
        index: u32,
    },
    #[error("deferred deallocation before any call to reset_deferred")]
    DeferredFrameNotSet,
    #[error("frame slot {slot} is out of range for {frames_in_flight} frames in flight")]
    FrameSlotOutOfRange {
        slot: u32,
        frames_in_flight: u32,
    },
    #[error("a {kind} named '{name}' is already registered {scope}")]
    DuplicateName {
        kind: RegistryKind,
        name: String,
        scope: RegistryScope,
    },
    #[error("no {kind} named '{name}' is registered {scope}")]
    UnknownName {
        kind: RegistryKind,
        name: String,
        scope: RegistryScope,
    },
    #[error("'{name}' has no {heap:?} heap associated for {view:?} views")]
    MissingHeap {
        name: String,
        view: ViewKind,
        heap: DescriptorHeapKind,
    },
    #[error("'{name}' was not created with {usage:?} usage, required by {view:?} views")]
    MissingUsage {
        name: String,
        view: ViewKind,
        usage: ResourceUsage,
    },
    #[error("'{name}' does not support {view:?} views")]
    UnsupportedView {
        name: String,
        view: ViewKind,
    },
    #[error("invalid create info for '{name}': {reason}")]
    InvalidCreateInfo {
        name: String,
        reason: String,
    },
    #[error("subresource {subresource} is out of range for '{name}' with {mip_levels} mip levels")]
    SubresourceOutOfRange {
        name: String,
        subresource: u32,
        mip_levels: u32,
    },
    #[error("element {index} is out of range for '{name}' with {count} elements")]
    ElementOutOfRange {
        name: String,
        index: u64,
        count: u64,
    },
    #[error("upload size mismatch for '{name}': expected {expected} bytes, got {actual}")]
    UploadSizeMismatch {
        name: String,
        expected: u64,
        actual: u64,
    },
    #[error("'{name}' lives in the {heap:?} heap and is not mapped for CPU access")]
    NotCpuVisible {
        name: String,
        heap: HeapKind,
    },
    #[error("'{name}' lives in the {heap:?} heap, expected {expected:?}")]
    WrongHeapKind {
        name: String,
        heap: HeapKind,
        expected: HeapKind,
    },
    #[error("'{name}' has no upload staging buffer, call initialize_upload first")]
    MissingStaging { name: String },
    #[error("a frame is already being recorded")]
    FrameAlreadyActive,
    #[error("no frame is being recorded")]
    NoActiveFrame,
    #[error("command encoder is already recording")]
    EncoderRecording,
    #[error("command encoder is not recording")]
    EncoderNotRecording,
    #[error("no mesh named '{0}' is loaded")]
    UnknownMesh(String),
    #[error("invalid render configuration: {0}")]
    InvalidConfig(String),
    #[error("lock poisoned: {0}")]
    LockPoisoned(String),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Failures reported by a [`GpuBackend`](crate::renderer::contexts::device_ctx::backend::GpuBackend).
/// None of these are retried.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("out of device memory allocating {requested} bytes")]
    OutOfMemory { requested: u64 },
    #[error("unknown resource {0:?}")]
    UnknownResource(ResourceId),
    #[error("unknown descriptor heap {0:?}")]
    UnknownDescriptorHeap(DescriptorHeapId),
    #[error("unknown memory heap {0:?}")]
    UnknownMemoryHeap(MemoryHeapId),
    #[error("unknown fence {0:?}")]
    UnknownFence(FenceId),
    #[error("resource {0:?} is not mapped")]
    NotMapped(ResourceId),
    #[error("access of {len} bytes at offset {offset} is out of bounds for {size} bytes")]
    OutOfBounds { offset: u64, len: u64, size: u64 },
    #[error("invalid placement: {0}")]
    InvalidPlacement(String),
    #[error("copy size mismatch: destination is {dst} bytes, source is {src} bytes")]
    CopySizeMismatch { dst: u64, src: u64 },
    #[error("barrier on {resource:?} expects {before:?} but the resource is in {actual:?}")]
    InvalidBarrier {
        resource: ResourceId,
        before: ResourceState,
        actual: ResourceState,
    },
    #[error("resource {0:?} is referenced by work the GPU has not finished")]
    ResourceInFlight(ResourceId),
    #[error("fence value {value} was never signaled by submitted work (last signal {last})")]
    FenceNeverSignaled { value: u64, last: u64 },
    #[error("device lost: {0}")]
    DeviceLost(String),
    #[error("mapped memory copy failed: {0}")]
    Mapping(String),
    #[error("backend error: {0}")]
    Backend(String),
}
