use crate::renderer::contexts::device_ctx::command_encoder::CommandEncoder;
use crate::renderer::error::Result;

/// Per-slot recording state. Reused every `frames_in_flight` frames.
#[derive(Debug)]
pub struct Frame {
    slot: u32,
    encoder: CommandEncoder,

    // Descriptors returned to the heaps when this slot was last started
    recycled_descriptors: usize,
}

impl Frame {
    pub fn new(slot: u32) -> Self {
        Self {
            slot,
            encoder: CommandEncoder::new(),
            recycled_descriptors: 0,
        }
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn encoder(&mut self) -> &mut CommandEncoder {
        &mut self.encoder
    }

    pub fn recycled_descriptors(&self) -> usize {
        self.recycled_descriptors
    }

    pub(super) fn begin(&mut self, recycled_descriptors: usize) -> Result<()> {
        self.recycled_descriptors = recycled_descriptors;
        self.encoder.begin_recording()
    }
}
