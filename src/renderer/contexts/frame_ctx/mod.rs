pub mod frame;
pub mod synchronizer;

use crate::renderer::contexts::device_ctx::command_encoder::CommandEncoder;
use crate::renderer::contexts::device_ctx::device::RenderDevice;
use crate::renderer::contexts::frame_ctx::frame::Frame;
use crate::renderer::contexts::frame_ctx::synchronizer::{FrameSynchronizer, FrameToken};
use crate::renderer::error::{RenderError, Result};
use crate::renderer::internals::descriptor_heap::DescriptorHeaps;

/// Responsibilities:
/// - Manage per-frame command encoders
/// - Manage synchronization between frames
/// - Recycle deferred descriptors once their frame slot is known to be idle
#[derive(Debug)]
pub struct RenderFrameContext {
    frames: Vec<Frame>,
    heaps: DescriptorHeaps,
    vsync: bool,
    sync: FrameSynchronizer,
}

impl RenderFrameContext {
    pub fn new(
        device: &RenderDevice,
        heaps: &DescriptorHeaps,
        frames_in_flight: u32,
        vsync: bool,
    ) -> Result<Self> {
        let sync = FrameSynchronizer::new(device, frames_in_flight)?;
        let frames = (0..frames_in_flight).map(Frame::new).collect();

        Ok(Self {
            frames,
            heaps: heaps.clone(),
            vsync,
            sync,
        })
    }

    pub fn synchronizer(&self) -> &FrameSynchronizer {
        &self.sync
    }

    pub fn frames_in_flight(&self) -> u32 {
        self.sync.frames_in_flight()
    }

    pub fn current_frame(&self) -> Option<FrameToken> {
        self.sync.active_frame()
    }

    pub fn frame(&self, slot: u32) -> Option<&Frame> {
        self.frames.get(slot as usize)
    }

    /// Waits for the next slot, recycles its deferred descriptors and starts its encoder
    pub fn begin_frame(&mut self) -> Result<FrameToken> {
        let token = self.sync.begin_frame()?;
        if let Err(e) = self.start_slot(token) {
            self.sync.abandon_frame();
            return Err(e);
        }

        Ok(token)
    }

    fn start_slot(&mut self, token: FrameToken) -> Result<()> {
        let recycled = self.heaps.reset_deferred(token.slot)?;
        if recycled > 0 {
            log::trace!("Frame {} recycled {} descriptors in slot {}", token.number, recycled, token.slot);
        }
        self.frames[token.slot as usize].begin(recycled)
    }

    /// Encoder of the frame being recorded
    pub fn encoder(&mut self) -> Result<&mut CommandEncoder> {
        let token = self.sync.active_frame().ok_or(RenderError::NoActiveFrame)?;
        Ok(self.frames[token.slot as usize].encoder())
    }

    /// Submits the frame's commands and presents. Returns the fence value signaled.
    pub fn end_frame(&mut self) -> Result<u64> {
        let token = self.sync.active_frame().ok_or(RenderError::NoActiveFrame)?;
        let commands = self.frames[token.slot as usize].encoder().end_recording()?;
        self.sync.end_frame(&commands, self.vsync)
    }

    pub fn flush_all(&self) -> Result<()> {
        self.sync.flush_all()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use super::*;
    use crate::renderer::contexts::device_ctx::backend::GpuBackend;
    use crate::renderer::contexts::device_ctx::headless::{HeadlessBackend, HeadlessDesc};
    use crate::renderer::internals::descriptor_heap::lock_heap;
    use crate::renderer::resources::desc::ResourceState;

    struct Fixture {
        backend: Arc<HeadlessBackend>,
        heaps: DescriptorHeaps,
        frames: RenderFrameContext,
    }

    fn fixture(frames_in_flight: u32) -> Fixture {
        let backend = Arc::new(HeadlessBackend::new(HeadlessDesc::default()));
        let device = RenderDevice::new(backend.clone());
        let heaps = DescriptorHeaps::new(&device, 2, 2, 4, frames_in_flight).unwrap();
        let frames = RenderFrameContext::new(&device, &heaps, frames_in_flight, true).unwrap();
        Fixture { backend, heaps, frames }
    }

    #[test]
    fn failed_begin_leaves_no_frame_active() {
        let mut f = fixture(2);
        f.frames.frames[0].encoder().begin_recording().unwrap();

        assert!(matches!(f.frames.begin_frame(), Err(RenderError::EncoderRecording)));
        assert!(f.frames.current_frame().is_none());
        assert!(matches!(f.frames.end_frame(), Err(RenderError::NoActiveFrame)));

        f.frames.frames[0].encoder().end_recording().unwrap();
        let token = f.frames.begin_frame().unwrap();
        assert_eq!((token.slot, token.number), (0, 0));
        assert_eq!(f.frames.end_frame().unwrap(), 1);
    }

    #[test]
    fn deferred_descriptors_return_after_their_slot_is_waited_on() {
        let mut f = fixture(2);
        let srv_heap = f.heaps.cbv_srv_uav.clone().unwrap();

        f.frames.begin_frame().unwrap();
        let mut handle = lock_heap(&srv_heap).unwrap().allocate().unwrap();
        lock_heap(&srv_heap).unwrap().deferred_deallocate(&mut handle).unwrap();
        assert!(handle.is_null());
        f.frames.end_frame().unwrap();

        // Slot 1 must not see slot 0's pending descriptor
        let token = f.frames.begin_frame().unwrap();
        assert_eq!(token.slot, 1);
        assert_eq!(lock_heap(&srv_heap).unwrap().allocator().pending_count(), 1);
        assert_eq!(lock_heap(&srv_heap).unwrap().allocator().free_count(), 3);
        f.frames.end_frame().unwrap();

        let token = f.frames.begin_frame().unwrap();
        assert_eq!(token.slot, 0);
        assert_eq!(f.backend.stats().fence_waits, 1);
        assert_eq!(f.frames.frame(0).unwrap().recycled_descriptors(), 1);
        let heap = lock_heap(&srv_heap).unwrap();
        assert_eq!(heap.allocator().pending_count(), 0);
        assert_eq!(heap.allocator().free_count(), 4);
    }

    #[test]
    fn encoder_is_only_available_inside_a_frame() {
        let mut f = fixture(2);
        assert!(matches!(f.frames.encoder(), Err(RenderError::NoActiveFrame)));
        assert!(matches!(f.frames.end_frame(), Err(RenderError::NoActiveFrame)));

        f.frames.begin_frame().unwrap();
        assert!(f.frames.encoder().unwrap().is_recording());
        assert!(matches!(f.frames.begin_frame(), Err(RenderError::FrameAlreadyActive)));
        assert_eq!(f.frames.end_frame().unwrap(), 1);
        assert!(matches!(f.frames.encoder(), Err(RenderError::NoActiveFrame)));
    }

    #[test]
    fn recorded_commands_are_submitted_with_the_frame() {
        let mut f = fixture(1);
        let back_buffer = f.backend.back_buffers()[0];

        f.frames.begin_frame().unwrap();
        let encoder = f.frames.encoder().unwrap();
        encoder.barrier(back_buffer, ResourceState::Present, ResourceState::RenderTarget).unwrap();
        encoder.barrier(back_buffer, ResourceState::RenderTarget, ResourceState::Present).unwrap();
        f.frames.end_frame().unwrap();

        // A single slot means every frame waits on the one before it
        f.frames.begin_frame().unwrap();
        assert_eq!(f.backend.stats().executed_batches, 1);
        assert_eq!(f.backend.resource_state(back_buffer).unwrap(), ResourceState::Present);
        f.frames.end_frame().unwrap();
        f.frames.flush_all().unwrap();
        assert_eq!(f.backend.pending_batches(), 0);
    }
}
