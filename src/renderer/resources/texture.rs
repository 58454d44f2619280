use crate::renderer::contexts::device_ctx::backend::ResourceId;
use crate::renderer::contexts::device_ctx::command_encoder::CommandEncoder;
use crate::renderer::contexts::device_ctx::device::RenderDevice;
use crate::renderer::error::{RenderError, Result};
use crate::renderer::internals::descriptor_allocator::DescriptorHandle;
use crate::renderer::internals::descriptor_heap::DescriptorHeaps;
use crate::renderer::resources::buffer::require_usage;
use crate::renderer::resources::desc::{
    max_mip_levels, ClearValue, Format, HeapKind, ResourceDesc, ResourceState, ResourceUsage,
    TextureDimension, ViewDesc, ViewKey, ViewKind, ViewRange,
};
use crate::renderer::resources::memory_heap::HeapInfo;
use crate::renderer::resources::resource::{GpuResource, ResourceParams};
use crate::renderer::resources::upload::UploadStaging;

#[derive(Debug, Clone)]
pub struct TextureCreateInfo {
    pub name: String,
    pub dimension: TextureDimension,
    pub format: Format,
    pub width: u32,
    pub height: u32,
    /// Depth for 3D textures, array size otherwise
    pub depth: u32,
    pub mip_levels: u32,
    pub clear_value: Option<ClearValue>,
    pub usage: ResourceUsage,
    pub initial_state: ResourceState,
    pub heap: HeapKind,
    pub heap_info: Option<HeapInfo>,
}

impl TextureCreateInfo {
    pub fn new_1d(name: &str, format: Format, width: u32) -> Self {
        Self::new(name, TextureDimension::D1, format, width, 1, 1)
    }

    pub fn new_2d(name: &str, format: Format, width: u32, height: u32) -> Self {
        Self::new(name, TextureDimension::D2, format, width, height, 1)
    }

    pub fn new_3d(name: &str, format: Format, width: u32, height: u32, depth: u32) -> Self {
        Self::new(name, TextureDimension::D3, format, width, height, depth)
    }

    fn new(
        name: &str,
        dimension: TextureDimension,
        format: Format,
        width: u32,
        height: u32,
        depth: u32,
    ) -> Self {
        Self {
            name: name.to_string(),
            dimension,
            format,
            width,
            height,
            depth,
            mip_levels: 1,
            clear_value: None,
            usage: ResourceUsage::empty(),
            initial_state: ResourceState::Common,
            heap: HeapKind::Default,
            heap_info: None,
        }
    }

    /// Render target usage with an optimized clear colour in the texture's format
    pub fn render_target(mut self, rgba: [f32; 4]) -> Self {
        self.usage |= ResourceUsage::RENDER_TARGET;
        self.clear_value = Some(ClearValue::Color {
            format: self.format,
            rgba,
        });
        self
    }

    /// Depth-stencil usage with an optimized clear value in the texture's format
    pub fn depth_stencil(mut self, depth: f32, stencil: u8) -> Self {
        self.usage |= ResourceUsage::DEPTH_STENCIL;
        self.clear_value = Some(ClearValue::DepthStencil {
            format: self.format,
            depth,
            stencil,
        });
        self
    }

    pub fn with_usage(mut self, usage: ResourceUsage) -> Self {
        self.usage |= usage;
        self
    }

    pub fn with_clear_value(mut self, clear_value: ClearValue) -> Self {
        self.clear_value = Some(clear_value);
        self
    }

    pub fn with_mip_levels(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        self
    }

    pub fn with_initial_state(mut self, state: ResourceState) -> Self {
        self.initial_state = state;
        self
    }

    pub fn placed(mut self, heap_info: HeapInfo) -> Self {
        self.heap_info = Some(heap_info);
        self
    }

    pub fn desc(&self) -> ResourceDesc {
        ResourceDesc::Texture {
            dimension: self.dimension,
            format: self.format,
            width: self.width,
            height: self.height,
            depth: self.depth,
            mip_levels: self.mip_levels,
            usage: self.usage,
        }
    }

    fn validate(&self) -> Result<()> {
        let invalid = |reason: String| RenderError::InvalidCreateInfo {
            name: self.name.clone(),
            reason,
        };

        if self.width == 0 {
            return Err(invalid("width must be greater than zero".to_string()));
        }
        match self.dimension {
            TextureDimension::D1 if self.height != 1 => {
                return Err(invalid(format!("1D textures have a height of 1, not {}", self.height)));
            }
            TextureDimension::D2 | TextureDimension::D3 if self.height == 0 => {
                return Err(invalid("height must be greater than zero".to_string()));
            }
            _ => {}
        }
        if self.depth == 0 {
            return Err(invalid("depth or array size must be greater than zero".to_string()));
        }
        if self.format == Format::Unknown {
            return Err(invalid("textures need a concrete format".to_string()));
        }

        let mip_depth = if self.dimension == TextureDimension::D3 { self.depth } else { 1 };
        let max_mips = max_mip_levels(self.width, self.height, mip_depth);
        if self.mip_levels == 0 || self.mip_levels > max_mips {
            return Err(invalid(format!(
                "{} mip levels requested, the chain has between 1 and {}",
                self.mip_levels, max_mips
            )));
        }

        if self.heap != HeapKind::Default {
            return Err(invalid(format!("textures live in the default heap, not {:?}", self.heap)));
        }
        if self.desc().checked_byte_size().is_none() {
            return Err(invalid("byte size overflows a u64".to_string()));
        }

        let render_target = self.usage.contains(ResourceUsage::RENDER_TARGET);
        let depth_stencil = self.usage.contains(ResourceUsage::DEPTH_STENCIL);
        if render_target && depth_stencil {
            return Err(invalid("a texture cannot be both a render target and a depth-stencil target".to_string()));
        }
        if depth_stencil && !self.format.is_depth() {
            return Err(invalid(format!("{:?} is not a depth format", self.format)));
        }
        if depth_stencil && self.dimension == TextureDimension::D3 {
            return Err(invalid("3D textures cannot be depth-stencil targets".to_string()));
        }
        if render_target && self.format.is_depth() {
            return Err(invalid(format!("{:?} cannot be a render target format", self.format)));
        }

        if let Some(clear) = &self.clear_value {
            match clear {
                ClearValue::Color { .. } if !render_target => {
                    return Err(invalid("colour clear values need render target usage".to_string()));
                }
                ClearValue::DepthStencil { .. } if !depth_stencil => {
                    return Err(invalid("depth clear values need depth-stencil usage".to_string()));
                }
                _ => {}
            }
            if clear.format() != self.format {
                return Err(invalid(format!(
                    "clear value format {:?} does not match texture format {:?}",
                    clear.format(), self.format
                )));
            }
        }

        Ok(())
    }
}

#[derive(Debug)]
pub struct Texture {
    resource: GpuResource,
    staging: Option<UploadStaging>,
}

impl Texture {
    pub fn new(
        device: &RenderDevice,
        heaps: &DescriptorHeaps,
        info: &TextureCreateInfo,
    ) -> Result<Self> {
        info.validate()?;

        let resource = GpuResource::create(device, heaps, ResourceParams {
            name: &info.name,
            desc: info.desc(),
            heap_kind: info.heap,
            initial_state: info.initial_state,
            clear_value: info.clear_value,
            heap_info: info.heap_info.as_ref(),
        })?;

        Ok(Self {
            resource,
            staging: None,
        })
    }

    /// Wraps a texture owned by someone else, such as a swap-chain back buffer
    pub fn from_external(
        device: &RenderDevice,
        heaps: &DescriptorHeaps,
        external: ResourceId,
        name: &str,
    ) -> Result<Self> {
        let resource = GpuResource::wrap_external(device, heaps, external, name)?;
        if !matches!(resource.desc(), ResourceDesc::Texture { .. }) {
            return Err(RenderError::InvalidCreateInfo {
                name: name.to_string(),
                reason: format!("{:?} is not a texture", external),
            });
        }

        Ok(Self {
            resource,
            staging: None,
        })
    }

    pub fn resource(&self) -> &GpuResource {
        &self.resource
    }

    pub fn resource_mut(&mut self) -> &mut GpuResource {
        &mut self.resource
    }

    pub fn id(&self) -> ResourceId {
        self.resource.id()
    }

    pub fn name(&self) -> &str {
        self.resource.name()
    }

    pub fn state(&self) -> ResourceState {
        self.resource.state()
    }

    pub fn format(&self) -> Format {
        match self.resource.desc() {
            ResourceDesc::Texture { format, .. } => *format,
            ResourceDesc::Buffer { .. } => Format::Unknown,
        }
    }

    pub fn mip_levels(&self) -> u32 {
        self.resource.desc().mip_levels()
    }

    pub fn transition(
        &mut self,
        encoder: &mut CommandEncoder,
        after: ResourceState,
    ) -> Result<()> {
        self.resource.transition(encoder, after)
    }

    pub fn render_target_view(&mut self, mip: Option<u32>) -> Result<DescriptorHandle> {
        self.single_mip_view(ViewKind::RenderTarget, ResourceUsage::RENDER_TARGET, mip)
    }

    pub fn depth_stencil_view(&mut self, mip: Option<u32>) -> Result<DescriptorHandle> {
        self.single_mip_view(ViewKind::DepthStencil, ResourceUsage::DEPTH_STENCIL, mip)
    }

    pub fn unordered_access_view(&mut self, mip: Option<u32>) -> Result<DescriptorHandle> {
        self.single_mip_view(ViewKind::UnorderedAccess, ResourceUsage::UNORDERED_ACCESS, mip)
    }

    /// A single mip when given, otherwise the whole chain
    pub fn shader_resource_view(&mut self, mip: Option<u32>) -> Result<DescriptorHandle> {
        let format = self.format();
        let mip_levels = self.mip_levels();
        self.resource.view(ViewKey::new(ViewKind::ShaderResource, mip), |res| {
            if res.desc().usage().contains(ResourceUsage::DENY_SHADER_RESOURCE) {
                return Err(RenderError::UnsupportedView {
                    name: res.name().to_string(),
                    view: ViewKind::ShaderResource,
                });
            }
            let (most_detailed_mip, mip_count) = match mip {
                Some(mip) => (check_mip(res, mip, mip_levels)?, 1),
                None => (0, mip_levels),
            };
            Ok(ViewDesc {
                kind: ViewKind::ShaderResource,
                format,
                range: ViewRange::Texture {
                    most_detailed_mip,
                    mip_count,
                },
            })
        })
    }

    /// Target-style views always address one mip, 0 unless given
    fn single_mip_view(
        &mut self,
        kind: ViewKind,
        usage: ResourceUsage,
        mip: Option<u32>,
    ) -> Result<DescriptorHandle> {
        let mip = mip.unwrap_or(0);
        let format = self.format();
        let mip_levels = self.mip_levels();
        self.resource.view(ViewKey::new(kind, Some(mip)), |res| {
            require_usage(res, kind, usage)?;
            check_mip(res, mip, mip_levels)?;
            Ok(ViewDesc {
                kind,
                format,
                range: ViewRange::Texture {
                    most_detailed_mip: mip,
                    mip_count: 1,
                },
            })
        })
    }

    /// Creates the upload-heap staging buffer used by [`Texture::upload_data`]
    pub fn initialize_upload(&mut self, heap_info: Option<HeapInfo>) -> Result<()> {
        self.staging = Some(UploadStaging::for_resource(&self.resource, heap_info)?);
        Ok(())
    }

    pub fn has_staging(&self) -> bool {
        self.staging.is_some()
    }

    pub fn release_staging(&mut self) -> Option<UploadStaging> {
        self.staging.take()
    }

    /// Stages every mip, tightly packed, and records the copy into the texture
    pub fn upload_data(
        &mut self,
        encoder: &mut CommandEncoder,
        data: &[u8],
    ) -> Result<()> {
        let staging = self.staging.as_mut().ok_or_else(|| RenderError::MissingStaging {
            name: self.resource.name().to_string(),
        })?;
        staging.upload_data(data)?;
        staging.record_copy(encoder, &self.resource)
    }
}

fn check_mip(res: &GpuResource, mip: u32, mip_levels: u32) -> Result<u32> {
    if mip >= mip_levels {
        return Err(RenderError::SubresourceOutOfRange {
            name: res.name().to_string(),
            subresource: mip,
            mip_levels,
        });
    }
    Ok(mip)
}
