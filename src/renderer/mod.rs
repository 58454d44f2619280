pub mod config;
pub mod contexts;
pub mod error;
pub mod internals;
pub mod resources;

use std::sync::Arc;
use crate::renderer::config::RenderConfig;
use crate::renderer::contexts::device_ctx::backend::GpuBackend;
use crate::renderer::contexts::device_ctx::command_encoder::CommandEncoder;
use crate::renderer::contexts::device_ctx::device::RenderDevice;
use crate::renderer::contexts::device_ctx::RenderDeviceContext;
use crate::renderer::contexts::frame_ctx::synchronizer::FrameToken;
use crate::renderer::contexts::frame_ctx::RenderFrameContext;
use crate::renderer::contexts::resource_ctx::scene::SceneGeometry;
use crate::renderer::contexts::resource_ctx::RenderResourceContext;
use crate::renderer::error::{RenderError, Result};
use crate::renderer::resources::texture::Texture;

pub const BACK_BUFFER_NAME: &str = "BackBuffer";

/// Owns every context; nothing in the crate is global
pub struct Renderer {
    dev: RenderDeviceContext,
    res: RenderResourceContext,
    frm: RenderFrameContext,
    scene: SceneGeometry,

    config: RenderConfig,
}

impl Renderer {
    pub fn new(config: RenderConfig) -> Result<Self> {
        config.validate()?;
        let dev = RenderDeviceContext::from_config(&config)?;
        Self::with_device_context(dev, config)
    }

    /// Runs on a caller-provided backend instead of the one named in the config
    pub fn with_backend(backend: Arc<dyn GpuBackend>, config: RenderConfig) -> Result<Self> {
        config.validate()?;
        Self::with_device_context(RenderDeviceContext::new(backend)?, config)
    }

    fn with_device_context(dev: RenderDeviceContext, config: RenderConfig) -> Result<Self> {
        let mut res = RenderResourceContext::new(&dev.device, &config)?;
        let frm = RenderFrameContext::new(&dev.device, res.heaps(), config.frames_in_flight, config.vsync)?;

        // One back buffer per frame slot, as far as the backend provides them
        let back_buffers = dev.device.back_buffers();
        for (slot, back_buffer) in back_buffers.iter().take(config.frames_in_flight as usize).enumerate() {
            res.wrap_texture_in_frame(slot as u32, BACK_BUFFER_NAME, *back_buffer)?;
        }

        log::info!(
            "Renderer ready on {} with {} frames in flight",
            dev.device.name(), config.frames_in_flight
        );

        Ok(Self {
            dev,
            res,
            frm,
            scene: SceneGeometry::new(),
            config,
        })
    }

    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    pub fn device(&self) -> &RenderDevice {
        &self.dev.device
    }

    pub fn resources(&self) -> &RenderResourceContext {
        &self.res
    }

    pub fn resources_mut(&mut self) -> &mut RenderResourceContext {
        &mut self.res
    }

    pub fn frames(&self) -> &RenderFrameContext {
        &self.frm
    }

    pub fn scene(&self) -> &SceneGeometry {
        &self.scene
    }

    pub fn scene_mut(&mut self) -> &mut SceneGeometry {
        &mut self.scene
    }

    /// Copies every loaded mesh to the GPU, stalling until done
    pub fn upload_scene(&mut self) -> Result<()> {
        self.scene.upload_meshes(&mut self.res, &self.dev.transfer)
    }

    pub fn begin_frame(&mut self) -> Result<FrameToken> {
        self.frm.begin_frame()
    }

    pub fn encoder(&mut self) -> Result<&mut CommandEncoder> {
        self.frm.encoder()
    }

    /// Resources and encoder of the frame being recorded, borrowed together
    pub fn frame_mut(&mut self) -> Result<(FrameToken, &mut RenderResourceContext, &mut CommandEncoder)> {
        let token = self.frm.current_frame().ok_or(RenderError::NoActiveFrame)?;
        Ok((token, &mut self.res, self.frm.encoder()?))
    }

    pub fn back_buffer(&mut self, slot: u32) -> Result<&mut Texture> {
        self.res.texture_mut(BACK_BUFFER_NAME, slot)
    }

    pub fn end_frame(&mut self) -> Result<u64> {
        self.frm.end_frame()
    }

    /// Waits for all submitted frames
    pub fn shutdown(&mut self) -> Result<()> {
        self.frm.flush_all()?;
        log::info!("Renderer idle after {} frames", self.frm.synchronizer().frame_counter());
        Ok(())
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        // Resources are destroyed right after this; the GPU must be done with them
        if let Err(e) = self.frm.flush_all() {
            log::error!("Failed to flush frames before teardown: {}", e);
        }
    }
}
