use std::sync::atomic::{AtomicU64, Ordering};
use crate::renderer::contexts::device_ctx::backend::FenceId;
use crate::renderer::contexts::device_ctx::command_encoder::CommandEncoder;
use crate::renderer::contexts::device_ctx::device::RenderDevice;
use crate::renderer::error::Result;

pub struct TransferContext {
    transfer_fence: FenceId,
    last_value: AtomicU64,

    device: RenderDevice,
}

impl TransferContext {
    pub fn new(device: RenderDevice) -> Result<Self> {
        let transfer_fence = device.create_fence(0)?;

        Ok(Self {
            transfer_fence,
            last_value: AtomicU64::new(0),
            device,
        })
    }

    // Instantly execute some commands on the GPU without dealing with the render loop and frame slots.
    // Blocks until the work is done, so staging buffers used inside can be freed right after.
    pub fn immediate_submit<F>(
        &self,
        func: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut CommandEncoder) -> Result<()>,
    {
        let mut encoder = CommandEncoder::new();
        encoder.begin_recording()?;

        func(&mut encoder)?;

        let commands = encoder.end_recording()?;
        let value = self.last_value.fetch_add(1, Ordering::SeqCst) + 1;
        self.device.submit(&commands, Some((self.transfer_fence, value)))?;

        // Full stall until the copy has landed
        self.device.wait_until(self.transfer_fence, value)
    }
}

impl Drop for TransferContext {
    fn drop(&mut self) {
        let value = self.last_value.load(Ordering::SeqCst);
        if let Err(e) = self.device.wait_until(self.transfer_fence, value) {
            log::error!("Failed to drain transfer work: {}", e);
        }
        if let Err(e) = self.device.destroy_fence(self.transfer_fence) {
            log::error!("Failed to destroy transfer fence: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use super::*;
    use crate::renderer::contexts::device_ctx::headless::{HeadlessBackend, HeadlessDesc};

    #[test]
    fn immediate_submit_blocks_until_done() {
        let backend = Arc::new(HeadlessBackend::new(HeadlessDesc::default()));
        let transfer = TransferContext::new(RenderDevice::new(backend.clone())).unwrap();

        transfer.immediate_submit(|_| Ok(())).unwrap();
        transfer.immediate_submit(|_| Ok(())).unwrap();

        assert_eq!(backend.pending_batches(), 0);
        assert_eq!(backend.stats().fence_waits, 2);
    }
}
