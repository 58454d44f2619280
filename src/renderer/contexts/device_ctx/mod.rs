pub mod backend;
pub mod command_encoder;
pub mod device;
pub mod headless;
pub mod transfer_ctx;
#[cfg(feature = "vulkan")]
pub mod vulkan;

use std::sync::Arc;
use crate::renderer::config::{BackendKind, RenderConfig};
use crate::renderer::contexts::device_ctx::backend::GpuBackend;
use crate::renderer::contexts::device_ctx::device::RenderDevice;
use crate::renderer::contexts::device_ctx::headless::{HeadlessBackend, HeadlessDesc};
use crate::renderer::contexts::device_ctx::transfer_ctx::TransferContext;
use crate::renderer::error::Result;
use crate::renderer::resources::desc::Format;

/// Responsibilities:
/// - Own the backend device every heap and resource is created from
/// - Run one-shot transfers outside the frame loop
pub struct RenderDeviceContext {
    pub device: RenderDevice,
    pub transfer: TransferContext,
}

impl RenderDeviceContext {
    pub fn new(backend: Arc<dyn GpuBackend>) -> Result<Self> {
        let device = RenderDevice::new(backend);
        let transfer = TransferContext::new(device.clone())?;

        Ok(Self {
            device,
            transfer,
        })
    }

    /// Picks the backend named in the config
    pub fn from_config(config: &RenderConfig) -> Result<Self> {
        let backend: Arc<dyn GpuBackend> = match config.backend {
            BackendKind::Headless => Arc::new(HeadlessBackend::new(HeadlessDesc {
                back_buffer_count: config.frames_in_flight,
                width: config.back_buffer_width,
                height: config.back_buffer_height,
                format: Format::B8G8R8A8Unorm,
                ..Default::default()
            })),
            #[cfg(feature = "vulkan")]
            BackendKind::Vulkan => Arc::new(vulkan::VulkanBackend::new(config)?),
            #[cfg(not(feature = "vulkan"))]
            BackendKind::Vulkan => {
                return Err(crate::renderer::error::RenderError::InvalidConfig(
                    "the vulkan backend needs the `vulkan` cargo feature".to_string(),
                ));
            }
        };

        Self::new(backend)
    }
}
