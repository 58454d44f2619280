use std::ffi::{c_char, CStr, CString};
use ash::vk;
use crate::renderer::contexts::device_ctx::backend::DeviceResult;
use crate::renderer::contexts::device_ctx::vulkan::instance::VulkanInstance;
use crate::renderer::contexts::device_ctx::vulkan::queue::{Queue, QueueFamily};
use crate::renderer::error::DeviceError;

/// Logical device plus the single queue every submission goes to
pub struct VulkanDevice {
    pub logical: ash::Device,
    pub physical: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    /// Budget for descriptors in update-after-bind pools, across all of them
    pub max_update_after_bind_descriptors: u32,
    pub queue: Queue,
    debug_utils: Option<ash::ext::debug_utils::Device>,
}

impl VulkanDevice {
    pub fn new(instance: &VulkanInstance) -> DeviceResult<Self> {
        let (physical, queue_family) = Self::select_physical_device(&instance.instance)?;
        let properties = unsafe {
            instance.instance.get_physical_device_properties(physical)
        };
        let mut vulkan_12_properties = vk::PhysicalDeviceVulkan12Properties::default();
        unsafe {
            let mut properties2 = vk::PhysicalDeviceProperties2::default()
                .push_next(&mut vulkan_12_properties);
            instance.instance.get_physical_device_properties2(physical, &mut properties2);
        }
        let max_update_after_bind_descriptors =
            vulkan_12_properties.max_update_after_bind_descriptors_in_all_pools;

        let queue_priorities = [1.0];
        let queue_create_infos = [
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(queue_family.index)
                .queue_priorities(&queue_priorities),
        ];

        let logical = {
            let enabled_extension_names = Self::required_device_extensions()
                .iter()
                .map(|ext| ext.as_ptr())
                .collect::<Vec<*const c_char>>();
            let mut enabled_features = RequiredDeviceFeatures::new();

            let device_create_info = enabled_features.device_create_info()
                .queue_create_infos(&queue_create_infos)
                .enabled_extension_names(&enabled_extension_names);

            unsafe {
                instance.instance.create_device(physical, &device_create_info, None)?
            }
        };

        let queue = unsafe {
            let handle = logical.get_device_queue(queue_family.index, 0);
            Queue::new(queue_family, handle)
        };

        let debug_utils = instance
            .validation_enabled()
            .then(|| ash::ext::debug_utils::Device::new(&instance.instance, &logical));

        Ok(Self {
            logical,
            physical,
            properties,
            max_update_after_bind_descriptors,
            queue,
            debug_utils,
        })
    }

    pub fn name(&self) -> String {
        self.properties
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown device".to_string())
    }

    /// Labels the object for validation messages and capture tools, if validation is on
    pub fn set_object_name<H: vk::Handle>(&self, handle: H, name: &str) {
        let (Some(debug_utils), Ok(name)) = (&self.debug_utils, CString::new(name)) else {
            return;
        };
        let info = vk::DebugUtilsObjectNameInfoEXT::default()
            .object_handle(handle)
            .object_name(&name);
        if let Err(e) = unsafe { debug_utils.set_debug_utils_object_name(&info) } {
            log::warn!("Failed to name Vulkan object '{}': {}", name.to_string_lossy(), e);
        }
    }

    fn select_physical_device(
        instance: &ash::Instance,
    ) -> DeviceResult<(vk::PhysicalDevice, QueueFamily)> {
        let req_device_exts = Self::required_device_extensions();

        unsafe {
            instance
                .enumerate_physical_devices()?
                .into_iter()
                // Filter out devices older than Vulkan 1.3
                .filter(|device| {
                    let props = instance.get_physical_device_properties(*device);
                    props.api_version >= vk::API_VERSION_1_3
                })
                // Filter out devices that do not contain the required device extensions
                .filter(|device| {
                    let supported_extensions = instance
                        .enumerate_device_extension_properties(*device)
                        .unwrap_or_default();

                    req_device_exts.iter().all(|req_ext| {
                        let req_ext_supported = supported_extensions
                            .iter()
                            .any(|sup_ext| sup_ext.extension_name_as_c_str() == Ok(*req_ext));
                        if !req_ext_supported {
                            log::error!("Device extension not supported: {:?}", req_ext);
                        }
                        req_ext_supported
                    })
                })
                // Filter out devices without a queue that does graphics and compute
                .filter_map(|device| {
                    instance
                        .get_physical_device_queue_family_properties(device)
                        .into_iter()
                        .enumerate()
                        .map(|(i, props)| QueueFamily::new(i as u32, props))
                        .find(|family| family.supports_graphics() && family.supports_compute())
                        .map(|family| (device, family))
                })
                .min_by_key(|(device, _)| {
                    let props = instance.get_physical_device_properties(*device);
                    match props.device_type {
                        vk::PhysicalDeviceType::DISCRETE_GPU => 0,
                        vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
                        vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
                        vk::PhysicalDeviceType::CPU => 3,
                        vk::PhysicalDeviceType::OTHER => 4,
                        _ => 5,
                    }
                })
                .ok_or_else(|| DeviceError::Backend("No suitable physical device found".to_string()))
        }
    }

    fn required_device_extensions() -> Vec<&'static CStr> {
        vec![
            #[cfg(target_os = "macos")]
            ash::khr::portability_subset::NAME,
        ]
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.logical.device_wait_idle() {
                log::error!("Failed to idle the device before destroying it: {}", e);
            }
            self.logical.destroy_device(None);
        }
    }
}

/// Core 1.2 and 1.3 features the backend relies on
struct RequiredDeviceFeatures<'a> {
    features: vk::PhysicalDeviceFeatures,
    vulkan_12_features: vk::PhysicalDeviceVulkan12Features<'a>,
    vulkan_13_features: vk::PhysicalDeviceVulkan13Features<'a>,
}

impl<'a> RequiredDeviceFeatures<'a> {
    fn new() -> Self {
        let vulkan_12_features = vk::PhysicalDeviceVulkan12Features::default()
            .timeline_semaphore(true)
            .buffer_device_address(true)
            .descriptor_indexing(true)
            .runtime_descriptor_array(true)
            .descriptor_binding_partially_bound(true)
            .descriptor_binding_update_unused_while_pending(true)
            .descriptor_binding_uniform_buffer_update_after_bind(true)
            .descriptor_binding_storage_buffer_update_after_bind(true)
            .descriptor_binding_sampled_image_update_after_bind(true)
            .descriptor_binding_storage_image_update_after_bind(true);
        let vulkan_13_features = vk::PhysicalDeviceVulkan13Features::default()
            .synchronization2(true)
            .dynamic_rendering(true);

        Self {
            features: vk::PhysicalDeviceFeatures::default(),
            vulkan_12_features,
            vulkan_13_features,
        }
    }

    fn device_create_info(&'a mut self) -> vk::DeviceCreateInfo<'a> {
        vk::DeviceCreateInfo::default()
            .enabled_features(&self.features)
            .push_next(&mut self.vulkan_12_features)
            .push_next(&mut self.vulkan_13_features)
    }
}
