use std::sync::Arc;
use crate::renderer::contexts::device_ctx::backend::{MemoryHeapDesc, MemoryHeapId, PLACEMENT_ALIGNMENT};
use crate::renderer::contexts::device_ctx::device::RenderDevice;
use crate::renderer::error::{RenderError, Result};
use crate::renderer::resources::desc::HeapKind;

/// Caller-managed memory that placed resources are sub-allocated from
#[derive(Debug)]
pub struct MemoryHeap {
    id: MemoryHeapId,
    kind: HeapKind,
    size: u64,

    device: RenderDevice,
}

impl MemoryHeap {
    pub fn new(
        device: &RenderDevice,
        size: u64,
        kind: HeapKind,
    ) -> Result<Arc<Self>> {
        let id = device.create_memory_heap(&MemoryHeapDesc { size, kind })?;
        log::debug!("Created {:?} memory heap {:?} of {} bytes", kind, id, size);

        Ok(Arc::new(Self {
            id,
            kind,
            size,
            device: device.clone(),
        }))
    }

    pub fn id(&self) -> MemoryHeapId {
        self.id
    }

    pub fn kind(&self) -> HeapKind {
        self.kind
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Placement at `offset`, which must be aligned to [`PLACEMENT_ALIGNMENT`]
    pub fn at(self: &Arc<Self>, offset: u64) -> HeapInfo {
        HeapInfo {
            heap: self.clone(),
            offset,
        }
    }
}

impl Drop for MemoryHeap {
    fn drop(&mut self) {
        if let Err(e) = self.device.destroy_memory_heap(self.id) {
            log::error!("Failed to destroy memory heap {:?}: {}", self.id, e);
        }
    }
}

/// Where a placed resource lives. Resources placed in a heap keep it alive.
#[derive(Debug, Clone)]
pub struct HeapInfo {
    pub heap: Arc<MemoryHeap>,
    pub offset: u64,
}

impl HeapInfo {
    /// Checks that a resource of `size` bytes in `kind` memory fits here
    pub fn validate(&self, name: &str, kind: HeapKind, size: u64) -> Result<()> {
        let invalid = |reason: String| RenderError::InvalidCreateInfo {
            name: name.to_string(),
            reason,
        };

        if self.heap.kind() != kind {
            return Err(RenderError::WrongHeapKind {
                name: name.to_string(),
                heap: kind,
                expected: self.heap.kind(),
            });
        }
        if self.offset % PLACEMENT_ALIGNMENT != 0 {
            return Err(invalid(format!(
                "placement offset {} is not aligned to {} bytes",
                self.offset, PLACEMENT_ALIGNMENT
            )));
        }
        if self.offset.checked_add(size).is_none_or(|end| end > self.heap.size()) {
            return Err(invalid(format!(
                "{} bytes at offset {} overflow a heap of {} bytes",
                size, self.offset, self.heap.size()
            )));
        }
        Ok(())
    }
}
