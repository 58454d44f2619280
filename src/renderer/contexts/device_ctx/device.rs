use std::ops::Deref;
use std::sync::Arc;
use bytemuck::Pod;
use crate::renderer::contexts::device_ctx::backend::{FenceId, GpuBackend, ResourceId};
use crate::renderer::error::Result;

/// Cheaply clonable handle to the backend every heap and resource is created from
#[derive(Debug, Clone)]
pub struct RenderDevice {
    backend: Arc<dyn GpuBackend>,
}

impl RenderDevice {
    pub fn new(backend: Arc<dyn GpuBackend>) -> Self {
        log::info!("Render device backed by {}", backend.name());
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn GpuBackend> {
        &self.backend
    }

    pub fn write_pod<T: Pod>(
        &self,
        resource: ResourceId,
        offset: u64,
        data: &[T],
    ) -> Result<()> {
        self.backend.write_mapped(resource, offset, bytemuck::cast_slice(data))?;
        Ok(())
    }

    pub fn read_bytes(
        &self,
        resource: ResourceId,
        offset: u64,
        len: usize,
    ) -> Result<Vec<u8>> {
        let mut out = vec![0; len];
        self.backend.read_mapped(resource, offset, &mut out)?;
        Ok(out)
    }

    /// Blocks until the fence reaches `value`, skipping the call when it already has
    pub fn wait_until(
        &self,
        fence: FenceId,
        value: u64,
    ) -> Result<()> {
        if self.backend.completed_fence_value(fence)? < value {
            self.backend.wait_for_fence(fence, value)?;
        }
        Ok(())
    }
}

impl Deref for RenderDevice {
    type Target = dyn GpuBackend;

    fn deref(&self) -> &Self::Target {
        self.backend.as_ref()
    }
}
