use crate::renderer::contexts::device_ctx::backend::{FenceId, GpuCommand};
use crate::renderer::contexts::device_ctx::device::RenderDevice;
use crate::renderer::error::{RenderError, Result};

/// The frame currently being recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameToken {
    /// Slot in `0..frames_in_flight` whose per-frame resources may be touched
    pub slot: u32,
    /// Monotonic frame number, starting at 0
    pub number: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// The slot's last submission has completed, or it was never submitted
    Free,
    /// The GPU may still be reading the slot's resources
    Submitted,
}

/// Ties frame slots to values of a single monotonically increasing fence.
///
/// Frame `n` signals `n + 1`, so a recorded value of 0 means the slot was never submitted.
/// A slot is handed out again only after the value recorded for it has completed.
#[derive(Debug)]
pub struct FrameSynchronizer {
    fence: FenceId,
    fence_values: Vec<u64>,
    frame_counter: u64,
    active: Option<FrameToken>,

    device: RenderDevice,
}

impl FrameSynchronizer {
    pub fn new(
        device: &RenderDevice,
        frames_in_flight: u32,
    ) -> Result<Self> {
        if frames_in_flight == 0 {
            return Err(RenderError::InvalidConfig("at least one frame must be in flight".to_string()));
        }
        let fence = device.create_fence(0)?;

        Ok(Self {
            fence,
            fence_values: vec![0; frames_in_flight as usize],
            frame_counter: 0,
            active: None,
            device: device.clone(),
        })
    }

    pub fn frames_in_flight(&self) -> u32 {
        self.fence_values.len() as u32
    }

    /// Frames submitted so far
    pub fn frame_counter(&self) -> u64 {
        self.frame_counter
    }

    pub fn active_frame(&self) -> Option<FrameToken> {
        self.active
    }

    /// Fence value last recorded for `slot`
    pub fn fence_value(&self, slot: u32) -> Result<u64> {
        self.fence_values
            .get(slot as usize)
            .copied()
            .ok_or(RenderError::FrameSlotOutOfRange {
                slot,
                frames_in_flight: self.frames_in_flight(),
            })
    }

    pub fn slot_state(&self, slot: u32) -> Result<SlotState> {
        let value = self.fence_value(slot)?;
        if self.device.completed_fence_value(self.fence)? >= value {
            Ok(SlotState::Free)
        } else {
            Ok(SlotState::Submitted)
        }
    }

    /// Blocks until the next slot's previous submission has completed, then hands it out
    pub fn begin_frame(&mut self) -> Result<FrameToken> {
        if self.active.is_some() {
            return Err(RenderError::FrameAlreadyActive);
        }

        let slot = (self.frame_counter % self.fence_values.len() as u64) as u32;
        self.device.wait_until(self.fence, self.fence_values[slot as usize])?;

        let token = FrameToken {
            slot,
            number: self.frame_counter,
        };
        self.active = Some(token);

        Ok(token)
    }

    /// Drops the active frame without submitting it; its slot is handed out again next
    pub fn abandon_frame(&mut self) -> Option<FrameToken> {
        self.active.take()
    }

    /// Submits `commands`, signals the frame's fence value and presents.
    /// Returns the signaled value.
    pub fn end_frame(
        &mut self,
        commands: &[GpuCommand],
        vsync: bool,
    ) -> Result<u64> {
        let token = self.active.take().ok_or(RenderError::NoActiveFrame)?;

        let value = self.frame_counter + 1;
        self.device.submit(commands, Some((self.fence, value)))?;
        self.fence_values[token.slot as usize] = value;
        self.frame_counter += 1;

        self.device.present(vsync)?;

        Ok(value)
    }

    /// Waits for every slot's last submission
    pub fn flush_all(&self) -> Result<()> {
        for &value in &self.fence_values {
            self.device.wait_until(self.fence, value)?;
        }
        Ok(())
    }
}

impl Drop for FrameSynchronizer {
    fn drop(&mut self) {
        if let Err(e) = self.flush_all() {
            log::error!("Failed to flush frames in flight: {}", e);
        }
        if let Err(e) = self.device.destroy_fence(self.fence) {
            log::error!("Failed to destroy frame fence: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use super::*;
    use crate::renderer::contexts::device_ctx::headless::{HeadlessBackend, HeadlessDesc};

    fn synchronizer(frames: u32) -> (Arc<HeadlessBackend>, FrameSynchronizer) {
        let backend = Arc::new(HeadlessBackend::new(HeadlessDesc::default()));
        let device = RenderDevice::new(backend.clone());
        let sync = FrameSynchronizer::new(&device, frames).unwrap();
        (backend, sync)
    }

    #[test]
    fn slots_cycle_and_values_increase() {
        let (_, mut sync) = synchronizer(2);
        let mut slots = Vec::new();
        let mut values = Vec::new();
        for _ in 0..5 {
            slots.push(sync.begin_frame().unwrap().slot);
            values.push(sync.end_frame(&[], true).unwrap());
        }
        assert_eq!(slots, [0, 1, 0, 1, 0]);
        assert_eq!(values, [1, 2, 3, 4, 5]);
        assert_eq!(sync.frame_counter(), 5);
    }

    #[test]
    fn reusing_a_slot_waits_for_its_fence() {
        let (backend, mut sync) = synchronizer(2);

        // The first lap only touches never-submitted slots
        for _ in 0..2 {
            sync.begin_frame().unwrap();
            sync.end_frame(&[], false).unwrap();
        }
        assert_eq!(backend.stats().fence_waits, 0);
        assert_eq!(sync.slot_state(0).unwrap(), SlotState::Submitted);
        assert_eq!(sync.slot_state(1).unwrap(), SlotState::Submitted);

        let token = sync.begin_frame().unwrap();
        assert_eq!(token.slot, 0);
        assert_eq!(backend.stats().fence_waits, 1);
        assert_eq!(sync.slot_state(0).unwrap(), SlotState::Free);
        // Work is retired in order, so only slot 0's batch had to run
        assert_eq!(sync.slot_state(1).unwrap(), SlotState::Submitted);
    }

    #[test]
    fn begin_and_end_must_alternate() {
        let (_, mut sync) = synchronizer(2);
        assert!(matches!(sync.end_frame(&[], true), Err(RenderError::NoActiveFrame)));
        sync.begin_frame().unwrap();
        assert!(matches!(sync.begin_frame(), Err(RenderError::FrameAlreadyActive)));
        sync.end_frame(&[], true).unwrap();
        assert!(matches!(sync.slot_state(2), Err(RenderError::FrameSlotOutOfRange { slot: 2, .. })));
    }

    #[test]
    fn abandoned_frames_hand_their_slot_out_again() {
        let (backend, mut sync) = synchronizer(2);
        let token = sync.begin_frame().unwrap();
        assert_eq!(sync.abandon_frame(), Some(token));
        assert_eq!(sync.abandon_frame(), None);

        assert_eq!(sync.begin_frame().unwrap(), token);
        assert_eq!(sync.end_frame(&[], true).unwrap(), 1);
        assert_eq!(backend.stats().submissions, 1);
    }

    #[test]
    fn flush_retires_everything() {
        let (backend, mut sync) = synchronizer(3);
        for _ in 0..3 {
            sync.begin_frame().unwrap();
            sync.end_frame(&[], true).unwrap();
        }
        sync.flush_all().unwrap();
        assert_eq!(backend.pending_batches(), 0);
        for slot in 0..3 {
            assert_eq!(sync.slot_state(slot).unwrap(), SlotState::Free);
        }
        assert_eq!(backend.stats().presents, 3);
    }

    #[test]
    fn zero_frames_in_flight_is_rejected() {
        let backend = Arc::new(HeadlessBackend::new(HeadlessDesc::default()));
        let device = RenderDevice::new(backend);
        assert!(FrameSynchronizer::new(&device, 0).is_err());
    }
}
