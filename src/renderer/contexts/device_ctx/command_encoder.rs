use crate::renderer::contexts::device_ctx::backend::{GpuCommand, ResourceId};
use crate::renderer::error::{RenderError, Result};
use crate::renderer::resources::desc::ResourceState;

/// Records GPU commands for one submission.
/// Nothing reaches the GPU until the recorded list is handed to the backend's `submit`.
#[derive(Debug, Default)]
pub struct CommandEncoder {
    commands: Vec<GpuCommand>,
    is_recording: bool,
}

impl CommandEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a fresh list; anything left from the previous recording is discarded
    pub fn begin_recording(&mut self) -> Result<()> {
        if self.is_recording {
            return Err(RenderError::EncoderRecording);
        }
        self.commands.clear();
        self.is_recording = true;

        Ok(())
    }

    pub fn end_recording(&mut self) -> Result<Vec<GpuCommand>> {
        if !self.is_recording {
            return Err(RenderError::EncoderNotRecording);
        }
        self.is_recording = false;

        Ok(std::mem::take(&mut self.commands))
    }

    pub fn is_recording(&self) -> bool {
        self.is_recording
    }

    pub fn commands(&self) -> &[GpuCommand] {
        &self.commands
    }

    pub fn barrier(
        &mut self,
        resource: ResourceId,
        before: ResourceState,
        after: ResourceState,
    ) -> Result<()> {
        self.record(GpuCommand::Barrier { resource, before, after })
    }

    pub fn copy_resource(
        &mut self,
        dst: ResourceId,
        src: ResourceId,
    ) -> Result<()> {
        self.record(GpuCommand::CopyResource { dst, src })
    }

    pub fn copy_buffer_region(
        &mut self,
        dst: ResourceId,
        dst_offset: u64,
        src: ResourceId,
        src_offset: u64,
        size: u64,
    ) -> Result<()> {
        self.record(GpuCommand::CopyBufferRegion {
            dst,
            dst_offset,
            src,
            src_offset,
            size,
        })
    }

    fn record(&mut self, command: GpuCommand) -> Result<()> {
        if !self.is_recording {
            return Err(RenderError::EncoderNotRecording);
        }
        self.commands.push(command);
        Ok(())
    }
}

impl Drop for CommandEncoder {
    fn drop(&mut self) {
        if self.is_recording {
            log::warn!("Dropping CommandEncoder while still recording {} commands", self.commands.len());
        }
    }
}
