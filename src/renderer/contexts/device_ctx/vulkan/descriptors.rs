use ash::vk;
use gpu_descriptor::{
    CreatePoolError, DescriptorAllocator, DescriptorDevice, DescriptorPoolCreateFlags, DescriptorSet,
    DescriptorSetLayoutCreateFlags, DescriptorTotalCount, DeviceAllocationError,
};
use crate::renderer::contexts::device_ctx::backend::{DescriptorHeapInfo, DeviceResult, ResourceId};
use crate::renderer::error::DeviceError;
use crate::renderer::resources::desc::{ViewDesc, ViewKind};

pub type VulkanDescriptorAllocator = DescriptorAllocator<vk::DescriptorPool, vk::DescriptorSet>;

/// Set bindings of the shader-visible heap. Every binding is as large as the heap,
/// so a descriptor index addresses the same element in whichever binding its view uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindlessBinding {
    UniformBuffer = 0,
    StorageBuffer = 1,
    SampledImage = 2,
    StorageImage = 3,
}

impl BindlessBinding {
    const ALL: [Self; 4] = [
        Self::UniformBuffer,
        Self::StorageBuffer,
        Self::SampledImage,
        Self::StorageImage,
    ];

    pub fn for_view(kind: ViewKind, is_buffer: bool) -> Option<Self> {
        match (kind, is_buffer) {
            (ViewKind::ConstantBuffer, true) => Some(Self::UniformBuffer),
            (ViewKind::ShaderResource | ViewKind::UnorderedAccess, true) => Some(Self::StorageBuffer),
            (ViewKind::ShaderResource, false) => Some(Self::SampledImage),
            (ViewKind::UnorderedAccess, false) => Some(Self::StorageImage),
            _ => None,
        }
    }

    pub fn descriptor_type(&self) -> vk::DescriptorType {
        match self {
            Self::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            Self::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
            Self::SampledImage => vk::DescriptorType::SAMPLED_IMAGE,
            Self::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
        }
    }
}

/// The one descriptor set a shader-visible heap is backed by
pub struct BindlessSet {
    pub layout: vk::DescriptorSetLayout,
    pub set: DescriptorSet<vk::DescriptorSet>,
}

impl BindlessSet {
    pub fn new(
        device: &ash::Device,
        allocator: &mut VulkanDescriptorAllocator,
        capacity: u32,
    ) -> DeviceResult<Self> {
        let bindings = BindlessBinding::ALL
            .iter()
            .map(|binding| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(*binding as u32)
                    .descriptor_type(binding.descriptor_type())
                    .descriptor_count(capacity)
                    .stage_flags(vk::ShaderStageFlags::ALL)
            })
            .collect::<Vec<_>>();
        let binding_flags = [vk::DescriptorBindingFlags::PARTIALLY_BOUND
            | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND
            | vk::DescriptorBindingFlags::UPDATE_UNUSED_WHILE_PENDING; 4];

        let mut binding_flags_info = vk::DescriptorSetLayoutBindingFlagsCreateInfo::default()
            .binding_flags(&binding_flags);
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default()
            .bindings(&bindings)
            .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
            .push_next(&mut binding_flags_info);
        let layout = unsafe {
            device.create_descriptor_set_layout(&layout_info, None)?
        };

        let descriptor_count = DescriptorTotalCount {
            uniform_buffer: capacity,
            storage_buffer: capacity,
            sampled_image: capacity,
            storage_image: capacity,
            ..Default::default()
        };
        let allocated = unsafe {
            allocator.allocate(
                &DescriptorAshDevice(device),
                &layout,
                DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND,
                &descriptor_count,
                1,
            )
        };
        let set = match allocated.map(|sets| sets.into_iter().next()) {
            Ok(Some(set)) => set,
            Ok(None) => {
                unsafe { device.destroy_descriptor_set_layout(layout, None) };
                return Err(DeviceError::Backend("descriptor allocator returned no set".to_string()));
            }
            Err(e) => {
                unsafe { device.destroy_descriptor_set_layout(layout, None) };
                return Err(DeviceError::Backend(format!("failed to allocate bindless set: {}", e)));
            }
        };

        Ok(Self { layout, set })
    }

    pub fn destroy(
        self,
        device: &ash::Device,
        allocator: &mut VulkanDescriptorAllocator,
    ) {
        unsafe {
            allocator.free(&DescriptorAshDevice(device), std::iter::once(self.set));
            device.destroy_descriptor_set_layout(self.layout, None);
        }
    }
}

/// What was last written into a descriptor slot
pub struct SlotView {
    pub resource: ResourceId,
    pub view: ViewDesc,
    pub image_view: Option<vk::ImageView>,
}

pub struct VulkanDescriptorHeap {
    pub info: DescriptorHeapInfo,
    pub slots: Vec<Option<SlotView>>,
    pub bindless: Option<BindlessSet>,
}

impl VulkanDescriptorHeap {
    pub fn slot_index(&self, cpu: u64) -> DeviceResult<usize> {
        let offset = cpu.wrapping_sub(self.info.cpu_base);
        let stride = self.info.stride as u64;
        let size = stride * self.slots.len() as u64;
        if cpu < self.info.cpu_base || offset >= size || offset % stride != 0 {
            return Err(DeviceError::OutOfBounds {
                offset,
                len: stride,
                size,
            });
        }
        Ok((offset / stride) as usize)
    }

    /// Empties the slot and destroys the image view it held
    pub fn clear_slot(&mut self, device: &ash::Device, index: usize) {
        if let Some(SlotView { image_view: Some(image_view), .. }) = self.slots[index].take() {
            unsafe { device.destroy_image_view(image_view, None) };
        }
    }

    pub fn destroy(
        mut self,
        device: &ash::Device,
        allocator: &mut VulkanDescriptorAllocator,
    ) {
        for index in 0..self.slots.len() {
            self.clear_slot(device, index);
        }
        if let Some(bindless) = self.bindless.take() {
            bindless.destroy(device, allocator);
        }
    }
}

pub struct DescriptorAshDevice<'a>(pub &'a ash::Device);

impl DescriptorDevice<vk::DescriptorSetLayout, vk::DescriptorPool, vk::DescriptorSet>
for DescriptorAshDevice<'_>
{
    unsafe fn create_descriptor_pool(
        &self,
        descriptor_count: &DescriptorTotalCount,
        max_sets: u32,
        flags: DescriptorPoolCreateFlags,
    ) -> Result<vk::DescriptorPool, CreatePoolError> {
        let pool_sizes = [
            (vk::DescriptorType::SAMPLER, descriptor_count.sampler),
            (vk::DescriptorType::COMBINED_IMAGE_SAMPLER, descriptor_count.combined_image_sampler),
            (vk::DescriptorType::SAMPLED_IMAGE, descriptor_count.sampled_image),
            (vk::DescriptorType::STORAGE_IMAGE, descriptor_count.storage_image),
            (vk::DescriptorType::UNIFORM_TEXEL_BUFFER, descriptor_count.uniform_texel_buffer),
            (vk::DescriptorType::STORAGE_TEXEL_BUFFER, descriptor_count.storage_texel_buffer),
            (vk::DescriptorType::UNIFORM_BUFFER, descriptor_count.uniform_buffer),
            (vk::DescriptorType::STORAGE_BUFFER, descriptor_count.storage_buffer),
            (vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC, descriptor_count.uniform_buffer_dynamic),
            (vk::DescriptorType::STORAGE_BUFFER_DYNAMIC, descriptor_count.storage_buffer_dynamic),
            (vk::DescriptorType::INPUT_ATTACHMENT, descriptor_count.input_attachment),
        ]
            .into_iter()
            .filter(|(_, count)| *count != 0)
            .map(|(ty, descriptor_count)| vk::DescriptorPoolSize { ty, descriptor_count })
            .collect::<smallvec::SmallVec<[_; 11]>>();

        let mut ash_flags = vk::DescriptorPoolCreateFlags::empty();

        if flags.contains(DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET) {
            ash_flags |= vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET;
        }

        if flags.contains(DescriptorPoolCreateFlags::UPDATE_AFTER_BIND) {
            ash_flags |= vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND;
        }

        let result = unsafe {
            self.0.create_descriptor_pool(
                &vk::DescriptorPoolCreateInfo::default()
                    .max_sets(max_sets)
                    .pool_sizes(&pool_sizes)
                    .flags(ash_flags),
                None,
            )
        };

        match result {
            Ok(pool) => Ok(pool),
            Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY) => Err(CreatePoolError::OutOfDeviceMemory),
            Err(vk::Result::ERROR_FRAGMENTATION) => Err(CreatePoolError::Fragmentation),
            Err(err) => {
                log::error!("Unexpected descriptor pool creation result: {}", err);
                Err(CreatePoolError::OutOfHostMemory)
            }
        }
    }

    unsafe fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe {
            self.0.destroy_descriptor_pool(pool, None)
        }
    }

    unsafe fn alloc_descriptor_sets<'a>(
        &self,
        pool: &mut vk::DescriptorPool,
        layouts: impl ExactSizeIterator<Item = &'a vk::DescriptorSetLayout>,
        sets: &mut impl Extend<vk::DescriptorSet>,
    ) -> Result<(), DeviceAllocationError> {
        let set_layouts: smallvec::SmallVec<[_; 16]> = layouts.copied().collect();

        let result = unsafe {
            self.0.allocate_descriptor_sets(
                &vk::DescriptorSetAllocateInfo::default()
                    .set_layouts(&set_layouts)
                    .descriptor_pool(*pool),
            )
        };

        match result {
            Ok(allocated) => {
                sets.extend(allocated);
                Ok(())
            }
            Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY) => Err(DeviceAllocationError::OutOfHostMemory),
            Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY) => Err(DeviceAllocationError::OutOfDeviceMemory),
            Err(vk::Result::ERROR_FRAGMENTED_POOL) => Err(DeviceAllocationError::FragmentedPool),
            Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY) => Err(DeviceAllocationError::OutOfPoolMemory),
            Err(err) => {
                log::error!("Unexpected descriptor set allocation result: {}", err);
                Err(DeviceAllocationError::OutOfHostMemory)
            }
        }
    }

    unsafe fn dealloc_descriptor_sets(
        &self,
        pool: &mut vk::DescriptorPool,
        sets: impl Iterator<Item = vk::DescriptorSet>,
    ) {
        let sets: smallvec::SmallVec<[_; 16]> = sets.collect();
        if let Err(err) = unsafe { self.0.free_descriptor_sets(*pool, &sets) } {
            log::error!("Failed to free descriptor sets: {}", err);
        }
    }
}
