use bitflags::bitflags;
use crate::renderer::internals::descriptor_heap::DescriptorHeapKind;

/// Where a resource's memory lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapKind {
    /// GPU-only memory, written through a copy from an upload resource
    Default,
    /// CPU-writable memory visible to the GPU, permanently mapped
    Upload,
    /// GPU-writable memory the CPU reads back from
    Readback,
}

impl HeapKind {
    pub fn is_cpu_visible(&self) -> bool {
        !matches!(self, HeapKind::Default)
    }

    /// The only state a resource in this heap may be created in, if constrained
    pub fn required_state(&self) -> Option<ResourceState> {
        match self {
            HeapKind::Default => None,
            HeapKind::Upload => Some(ResourceState::GenericRead),
            HeapKind::Readback => Some(ResourceState::CopyDest),
        }
    }
}

/// State tag used by explicit transition barriers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    Common,
    Present,
    CopyDest,
    CopySource,
    GenericRead,
    RenderTarget,
    DepthWrite,
    DepthRead,
    ShaderResource,
    UnorderedAccess,
    VertexAndConstantBuffer,
    IndexBuffer,
}

bitflags! {
    /// Extra capabilities a resource must be created with before some views can be made of it
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ResourceUsage: u32 {
        const RENDER_TARGET = 1 << 0;
        const DEPTH_STENCIL = 1 << 1;
        const UNORDERED_ACCESS = 1 << 2;
        const DENY_SHADER_RESOURCE = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Unknown,
    R8G8B8A8Unorm,
    R8G8B8A8UnormSrgb,
    B8G8R8A8Unorm,
    R16G16B16A16Float,
    R32G32B32A32Float,
    R32G32B32Float,
    R32G32Float,
    R32Float,
    R32Uint,
    R16Uint,
    D32Float,
    D24UnormS8Uint,
}

impl Format {
    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            Format::Unknown => 1,
            Format::R16Uint => 2,
            Format::R8G8B8A8Unorm
            | Format::R8G8B8A8UnormSrgb
            | Format::B8G8R8A8Unorm
            | Format::R32Float
            | Format::R32Uint
            | Format::D32Float
            | Format::D24UnormS8Uint => 4,
            Format::R16G16B16A16Float | Format::R32G32Float => 8,
            Format::R32G32B32Float => 12,
            Format::R32G32B32A32Float => 16,
        }
    }

    pub fn is_depth(&self) -> bool {
        matches!(self, Format::D32Float | Format::D24UnormS8Uint)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureDimension {
    D1,
    D2,
    D3,
}

/// Optimized clear value a render or depth target is created with
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Color {
        format: Format,
        rgba: [f32; 4],
    },
    DepthStencil {
        format: Format,
        depth: f32,
        stencil: u8,
    },
}

impl ClearValue {
    pub fn format(&self) -> Format {
        match self {
            ClearValue::Color { format, .. } | ClearValue::DepthStencil { format, .. } => *format,
        }
    }
}

/// Shape of a native resource, as the backend sees it
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResourceDesc {
    Buffer {
        size: u64,
        usage: ResourceUsage,
    },
    Texture {
        dimension: TextureDimension,
        format: Format,
        width: u32,
        height: u32,
        /// Depth for 3D textures, array size otherwise
        depth: u32,
        mip_levels: u32,
        usage: ResourceUsage,
    },
}

impl ResourceDesc {
    pub fn usage(&self) -> ResourceUsage {
        match self {
            ResourceDesc::Buffer { usage, .. } | ResourceDesc::Texture { usage, .. } => *usage,
        }
    }

    pub fn mip_levels(&self) -> u32 {
        match self {
            ResourceDesc::Buffer { .. } => 1,
            ResourceDesc::Texture { mip_levels, .. } => *mip_levels,
        }
    }

    /// Size of the resource with every mip tightly packed one after another.
    /// Saturates; create infos reject shapes whose size does not fit in a `u64`.
    pub fn byte_size(&self) -> u64 {
        self.checked_byte_size().unwrap_or(u64::MAX)
    }

    /// `None` when the packed size overflows a `u64`
    pub fn checked_byte_size(&self) -> Option<u64> {
        match *self {
            ResourceDesc::Buffer { size, .. } => Some(size),
            ResourceDesc::Texture {
                dimension,
                format,
                width,
                height,
                depth,
                mip_levels,
                ..
            } => (0..mip_levels).try_fold(0u64, |total, mip| {
                let (w, h, d) = mip_extent(dimension, width, height, depth, mip);
                let mip_size = (w as u64)
                    .checked_mul(h as u64)?
                    .checked_mul(d as u64)?
                    .checked_mul(format.bytes_per_pixel() as u64)?;
                total.checked_add(mip_size)
            }),
        }
    }
}

/// Extent of one mip level; array layers do not shrink
pub fn mip_extent(
    dimension: TextureDimension,
    width: u32,
    height: u32,
    depth: u32,
    mip: u32,
) -> (u32, u32, u32) {
    let w = (width >> mip).max(1);
    let h = (height >> mip).max(1);
    let d = match dimension {
        TextureDimension::D3 => (depth >> mip).max(1),
        _ => depth,
    };
    (w, h, d)
}

/// Full mip chain length for the given extent
pub fn max_mip_levels(width: u32, height: u32, depth: u32) -> u32 {
    let largest = width.max(height).max(depth).max(1);
    u32::BITS - largest.leading_zeros()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ViewKind {
    RenderTarget,
    DepthStencil,
    ShaderResource,
    UnorderedAccess,
    ConstantBuffer,
}

impl ViewKind {
    pub fn heap_kind(&self) -> DescriptorHeapKind {
        match self {
            ViewKind::RenderTarget => DescriptorHeapKind::RenderTarget,
            ViewKind::DepthStencil => DescriptorHeapKind::DepthStencil,
            ViewKind::ShaderResource | ViewKind::UnorderedAccess | ViewKind::ConstantBuffer => {
                DescriptorHeapKind::CbvSrvUav
            }
        }
    }
}

/// Key of a resource's view cache: the view kind plus an optional sub-resource (mip or element)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ViewKey {
    pub kind: ViewKind,
    pub subresource: Option<u32>,
}

impl ViewKey {
    pub fn new(kind: ViewKind, subresource: Option<u32>) -> Self {
        Self { kind, subresource }
    }
}

/// The part of a resource a view covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewRange {
    Buffer {
        offset: u64,
        size: u64,
        stride: u32,
    },
    Texture {
        most_detailed_mip: u32,
        mip_count: u32,
    },
}

/// Everything a backend needs to write a view into a descriptor slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewDesc {
    pub kind: ViewKind,
    pub format: Format,
    pub range: ViewRange,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn texture_byte_size_packs_every_mip() {
        let desc = ResourceDesc::Texture {
            dimension: TextureDimension::D2,
            format: Format::R8G8B8A8Unorm,
            width: 4,
            height: 4,
            depth: 1,
            mip_levels: 3,
            usage: ResourceUsage::empty(),
        };
        // 4x4 + 2x2 + 1x1 pixels
        assert_eq!(desc.byte_size(), (16 + 4 + 1) * 4);
    }

    #[test]
    fn array_layers_do_not_shrink_with_mips() {
        assert_eq!(mip_extent(TextureDimension::D2, 8, 8, 6, 2), (2, 2, 6));
        assert_eq!(mip_extent(TextureDimension::D3, 8, 8, 6, 2), (2, 2, 1));
    }

    #[test]
    fn full_mip_chain_length() {
        assert_eq!(max_mip_levels(1, 1, 1), 1);
        assert_eq!(max_mip_levels(256, 128, 1), 9);
        assert_eq!(max_mip_levels(300, 1, 1), 9);
    }

    #[test]
    fn views_map_to_their_heaps() {
        assert_eq!(ViewKind::RenderTarget.heap_kind(), DescriptorHeapKind::RenderTarget);
        assert_eq!(ViewKind::DepthStencil.heap_kind(), DescriptorHeapKind::DepthStencil);
        assert_eq!(ViewKind::UnorderedAccess.heap_kind(), DescriptorHeapKind::CbvSrvUav);
    }
}
