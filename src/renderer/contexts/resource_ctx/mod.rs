pub mod scene;
pub mod storage;

use crate::renderer::config::RenderConfig;
use crate::renderer::contexts::device_ctx::backend::ResourceId;
use crate::renderer::contexts::device_ctx::device::RenderDevice;
use crate::renderer::contexts::resource_ctx::storage::ResourceRegistry;
use crate::renderer::error::{RegistryScope, RenderError, Result};
use crate::renderer::internals::descriptor_heap::DescriptorHeaps;
use crate::renderer::resources::buffer::{Buffer, BufferCreateInfo};
use crate::renderer::resources::constant_buffer::{ConstantBuffer, ConstantBufferCreateInfo};
use crate::renderer::resources::texture::{Texture, TextureCreateInfo};

/// Responsibilities:
/// - Own the RTV, DSV and CBV/SRV/UAV descriptor heaps
/// - Create buffers, textures and constant buffers against those heaps
/// - Keep named per-frame and unique registries of them
pub struct RenderResourceContext {
    frames: Vec<ResourceRegistry>,
    unique: ResourceRegistry,
    heaps: DescriptorHeaps,

    device: RenderDevice,
}

impl RenderResourceContext {
    pub fn new(
        device: &RenderDevice,
        config: &RenderConfig,
    ) -> Result<Self> {
        config.validate()?;

        let heaps = DescriptorHeaps::new(
            device,
            config.rtv_heap_capacity,
            config.dsv_heap_capacity,
            config.cbv_srv_uav_heap_capacity,
            config.frames_in_flight,
        )?;
        let frames = (0..config.frames_in_flight)
            .map(|slot| ResourceRegistry::new(RegistryScope::Frame(slot)))
            .collect();

        Ok(Self {
            frames,
            unique: ResourceRegistry::new(RegistryScope::Unique),
            heaps,
            device: device.clone(),
        })
    }

    pub fn heaps(&self) -> &DescriptorHeaps {
        &self.heaps
    }

    pub fn device(&self) -> &RenderDevice {
        &self.device
    }

    pub fn frames_in_flight(&self) -> u32 {
        self.frames.len() as u32
    }

    pub fn frame(&self, slot: u32) -> Result<&ResourceRegistry> {
        let frames_in_flight = self.frames_in_flight();
        self.frames
            .get(slot as usize)
            .ok_or(RenderError::FrameSlotOutOfRange { slot, frames_in_flight })
    }

    pub fn unique(&self) -> &ResourceRegistry {
        &self.unique
    }

    // ---- Creation ----

    pub fn create_texture_in_frame(
        &mut self,
        slot: u32,
        info: &TextureCreateInfo,
    ) -> Result<&mut Texture> {
        let registry = frame_registry(&mut self.frames, slot)?;
        create_texture(registry, &self.device, &self.heaps, info)
    }

    /// Registers an externally owned texture, such as a back buffer, in a frame slot
    pub fn wrap_texture_in_frame(
        &mut self,
        slot: u32,
        name: &str,
        external: ResourceId,
    ) -> Result<&mut Texture> {
        let registry = frame_registry(&mut self.frames, slot)?;
        registry.textures.ensure_vacant(name)?;

        let texture = Texture::from_external(&self.device, &self.heaps, external, name)?;
        self.device.set_debug_name(texture.id(), &registry.debug_name(name));
        log::debug!("Wrapped external {:?} as '{}' in frame {}", external, name, slot);

        registry.textures.insert(name, texture)
    }

    pub fn create_buffer_in_frame(
        &mut self,
        slot: u32,
        info: &BufferCreateInfo,
    ) -> Result<&mut Buffer> {
        let registry = frame_registry(&mut self.frames, slot)?;
        create_buffer(registry, &self.device, &self.heaps, info)
    }

    pub fn create_constant_buffer_in_frame(
        &mut self,
        slot: u32,
        info: &ConstantBufferCreateInfo,
    ) -> Result<&mut ConstantBuffer> {
        let registry = frame_registry(&mut self.frames, slot)?;
        create_constant_buffer(registry, &self.device, &self.heaps, info)
    }

    pub fn create_texture_in_unique(&mut self, info: &TextureCreateInfo) -> Result<&mut Texture> {
        create_texture(&mut self.unique, &self.device, &self.heaps, info)
    }

    pub fn create_buffer_in_unique(&mut self, info: &BufferCreateInfo) -> Result<&mut Buffer> {
        create_buffer(&mut self.unique, &self.device, &self.heaps, info)
    }

    pub fn create_constant_buffer_in_unique(
        &mut self,
        info: &ConstantBufferCreateInfo,
    ) -> Result<&mut ConstantBuffer> {
        create_constant_buffer(&mut self.unique, &self.device, &self.heaps, info)
    }

    // ---- Lookup ----

    pub fn texture(&self, name: &str, slot: u32) -> Result<&Texture> {
        self.frame(slot)?.textures.get(name)
    }

    pub fn texture_mut(&mut self, name: &str, slot: u32) -> Result<&mut Texture> {
        frame_registry(&mut self.frames, slot)?.textures.get_mut(name)
    }

    pub fn buffer(&self, name: &str, slot: u32) -> Result<&Buffer> {
        self.frame(slot)?.buffers.get(name)
    }

    pub fn buffer_mut(&mut self, name: &str, slot: u32) -> Result<&mut Buffer> {
        frame_registry(&mut self.frames, slot)?.buffers.get_mut(name)
    }

    pub fn constant_buffer(&self, name: &str, slot: u32) -> Result<&ConstantBuffer> {
        self.frame(slot)?.constant_buffers.get(name)
    }

    pub fn constant_buffer_mut(&mut self, name: &str, slot: u32) -> Result<&mut ConstantBuffer> {
        frame_registry(&mut self.frames, slot)?.constant_buffers.get_mut(name)
    }

    pub fn unique_texture(&self, name: &str) -> Result<&Texture> {
        self.unique.textures.get(name)
    }

    pub fn unique_texture_mut(&mut self, name: &str) -> Result<&mut Texture> {
        self.unique.textures.get_mut(name)
    }

    pub fn unique_buffer(&self, name: &str) -> Result<&Buffer> {
        self.unique.buffers.get(name)
    }

    pub fn unique_buffer_mut(&mut self, name: &str) -> Result<&mut Buffer> {
        self.unique.buffers.get_mut(name)
    }

    pub fn unique_constant_buffer(&self, name: &str) -> Result<&ConstantBuffer> {
        self.unique.constant_buffers.get(name)
    }

    pub fn unique_constant_buffer_mut(&mut self, name: &str) -> Result<&mut ConstantBuffer> {
        self.unique.constant_buffers.get_mut(name)
    }

    // ---- Removal ----
    // Removed resources release their views through the deferred path when dropped.

    pub fn remove_texture(&mut self, name: &str, slot: u32) -> Result<Texture> {
        frame_registry(&mut self.frames, slot)?.textures.remove(name)
    }

    pub fn remove_buffer(&mut self, name: &str, slot: u32) -> Result<Buffer> {
        frame_registry(&mut self.frames, slot)?.buffers.remove(name)
    }

    pub fn remove_constant_buffer(&mut self, name: &str, slot: u32) -> Result<ConstantBuffer> {
        frame_registry(&mut self.frames, slot)?.constant_buffers.remove(name)
    }

    pub fn remove_unique_texture(&mut self, name: &str) -> Result<Texture> {
        self.unique.textures.remove(name)
    }

    pub fn remove_unique_buffer(&mut self, name: &str) -> Result<Buffer> {
        self.unique.buffers.remove(name)
    }

    pub fn remove_unique_constant_buffer(&mut self, name: &str) -> Result<ConstantBuffer> {
        self.unique.constant_buffers.remove(name)
    }
}

fn frame_registry(
    frames: &mut [ResourceRegistry],
    slot: u32,
) -> Result<&mut ResourceRegistry> {
    let frames_in_flight = frames.len() as u32;
    frames
        .get_mut(slot as usize)
        .ok_or(RenderError::FrameSlotOutOfRange { slot, frames_in_flight })
}

fn create_texture<'a>(
    registry: &'a mut ResourceRegistry,
    device: &RenderDevice,
    heaps: &DescriptorHeaps,
    info: &TextureCreateInfo,
) -> Result<&'a mut Texture> {
    registry.textures.ensure_vacant(&info.name)?;

    let texture = Texture::new(device, heaps, info)?;
    device.set_debug_name(texture.id(), &registry.debug_name(&info.name));

    registry.textures.insert(&info.name, texture)
}

fn create_buffer<'a>(
    registry: &'a mut ResourceRegistry,
    device: &RenderDevice,
    heaps: &DescriptorHeaps,
    info: &BufferCreateInfo,
) -> Result<&'a mut Buffer> {
    registry.buffers.ensure_vacant(&info.name)?;

    let buffer = Buffer::new(device, heaps, info)?;
    device.set_debug_name(buffer.id(), &registry.debug_name(&info.name));

    registry.buffers.insert(&info.name, buffer)
}

fn create_constant_buffer<'a>(
    registry: &'a mut ResourceRegistry,
    device: &RenderDevice,
    heaps: &DescriptorHeaps,
    info: &ConstantBufferCreateInfo,
) -> Result<&'a mut ConstantBuffer> {
    registry.constant_buffers.ensure_vacant(&info.name)?;

    let constant_buffer = ConstantBuffer::new(device, heaps, info)?;
    device.set_debug_name(constant_buffer.id(), &registry.debug_name(&info.name));

    registry.constant_buffers.insert(&info.name, constant_buffer)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use super::*;
    use crate::renderer::contexts::device_ctx::backend::GpuBackend;
    use crate::renderer::contexts::device_ctx::headless::{HeadlessBackend, HeadlessDesc};
    use crate::renderer::error::RegistryKind;
    use crate::renderer::internals::descriptor_heap::lock_heap;
    use crate::renderer::resources::desc::{Format, ResourceState};

    fn fixture() -> (Arc<HeadlessBackend>, RenderResourceContext) {
        let backend = Arc::new(HeadlessBackend::new(HeadlessDesc::default()));
        let device = RenderDevice::new(backend.clone());
        let config = RenderConfig {
            frames_in_flight: 2,
            rtv_heap_capacity: 4,
            dsv_heap_capacity: 2,
            cbv_srv_uav_heap_capacity: 8,
            ..Default::default()
        };
        let resources = RenderResourceContext::new(&device, &config).unwrap();
        (backend, resources)
    }

    fn color(name: &str) -> TextureCreateInfo {
        TextureCreateInfo::new_2d(name, Format::R8G8B8A8Unorm, 8, 8).render_target([0.0; 4])
    }

    #[test]
    fn names_are_unique_per_kind_and_scope() {
        let (backend, mut resources) = fixture();
        resources.create_texture_in_frame(0, &color("Color")).unwrap();
        resources.create_texture_in_frame(1, &color("Color")).unwrap();
        resources.create_texture_in_unique(&color("Color")).unwrap();
        resources.create_buffer_in_frame(0, &BufferCreateInfo::new("Color", 4, 4)).unwrap();

        assert!(matches!(
            resources.create_texture_in_frame(0, &color("Color")),
            Err(RenderError::DuplicateName { kind: RegistryKind::Texture, scope: RegistryScope::Frame(0), .. })
        ));
        // The rejected duplicate never reached the device
        assert_eq!(backend.live_resource_count(), 4);
    }

    #[test]
    fn lookups_report_unknown_names() {
        let (_, mut resources) = fixture();
        resources.create_constant_buffer_in_frame(1, &ConstantBufferCreateInfo::new("Camera", 1, 64)).unwrap();

        assert!(resources.constant_buffer("Camera", 1).is_ok());
        assert!(matches!(
            resources.constant_buffer("Camera", 0),
            Err(RenderError::UnknownName { kind: RegistryKind::ConstantBuffer, scope: RegistryScope::Frame(0), .. })
        ));
        assert!(matches!(resources.unique_buffer("Camera"), Err(RenderError::UnknownName { .. })));
        assert!(matches!(
            resources.texture("Camera", 2),
            Err(RenderError::FrameSlotOutOfRange { slot: 2, frames_in_flight: 2 })
        ));
    }

    #[test]
    fn per_frame_debug_names_carry_the_slot() {
        let (backend, mut resources) = fixture();
        let id = resources.create_texture_in_frame(1, &color("Color")).unwrap().id();
        assert_eq!(backend.debug_name(id).unwrap(), "Color[1]");
        assert_eq!(resources.texture("Color", 1).unwrap().name(), "Color");

        let id = resources.create_buffer_in_unique(&BufferCreateInfo::new("Lights", 4, 16)).unwrap().id();
        assert_eq!(backend.debug_name(id).unwrap(), "Lights");
    }

    #[test]
    fn back_buffers_are_wrapped_per_frame() {
        let (backend, mut resources) = fixture();
        for (slot, back_buffer) in backend.back_buffers().into_iter().enumerate() {
            let texture = resources.wrap_texture_in_frame(slot as u32, "BackBuffer", back_buffer).unwrap();
            assert_eq!(texture.state(), ResourceState::Present);
            texture.render_target_view(None).unwrap();
        }
        assert_eq!(backend.debug_name(backend.back_buffers()[1]).unwrap(), "BackBuffer[1]");
        let rtv = resources.heaps().rtv.clone().unwrap();
        assert_eq!(lock_heap(&rtv).unwrap().live_count(), 2);

        drop(resources.remove_texture("BackBuffer", 0).unwrap());
        assert_eq!(lock_heap(&rtv).unwrap().live_count(), 1);
        assert_eq!(backend.back_buffers().len(), 2);
    }

    #[test]
    fn removal_frees_the_resource() {
        let (backend, mut resources) = fixture();
        resources.create_buffer_in_unique(&BufferCreateInfo::new("Scratch", 16, 4)).unwrap();
        assert_eq!(backend.live_resource_count(), 1);

        let scratch = resources.remove_unique_buffer("Scratch").unwrap();
        drop(scratch);
        assert_eq!(backend.live_resource_count(), 0);
        assert!(resources.remove_unique_buffer("Scratch").is_err());
        assert!(resources.create_buffer_in_unique(&BufferCreateInfo::new("Scratch", 16, 4)).is_ok());
    }
}
