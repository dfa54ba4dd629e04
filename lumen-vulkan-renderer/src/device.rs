//! Vulkan bootstrap: instance, physical device selection, logical device.
//!
//! The renderer runs headless — every output it draws into is a
//! dmabuf-backed scanout buffer imported from the display collaborator, so
//! no window surface or present queue is involved. What this module
//! guarantees instead: a graphics queue whose family supports timestamp
//! queries, and the external-memory extension set needed for zero-copy
//! buffer import.

use std::ffi::{c_void, CStr, CString};
use std::os::raw::c_char;

use ash::extensions::ext::DebugUtils;
use ash::vk;
use log::{debug, error, info, trace, warn};

use crate::error::{Result, VulkanError};

const APPLICATION_NAME: &str = "Lumen Compositor";
const ENGINE_NAME: &str = "Lumen Vulkan Renderer";
const VALIDATION_LAYER: &str = "VK_LAYER_KHRONOS_validation";

unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> vk::Bool32 {
    let callback_data = *p_callback_data;
    let message = if callback_data.p_message.is_null() {
        std::borrow::Cow::from("")
    } else {
        CStr::from_ptr(callback_data.p_message).to_string_lossy()
    };

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            error!(target: "vulkan", "[{:?}] {}", message_type, message);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            warn!(target: "vulkan", "[{:?}] {}", message_type, message);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            debug!(target: "vulkan", "[{:?}] {}", message_type, message);
        }
        _ => {
            trace!(target: "vulkan", "[{:?}] {}", message_type, message);
        }
    }
    vk::FALSE
}

/// Device extensions required for dmabuf import and foreign-queue handoff.
fn required_device_extensions() -> Vec<&'static CStr> {
    vec![
        ash::extensions::khr::ExternalMemoryFd::name(),
        unsafe { CStr::from_bytes_with_nul_unchecked(b"VK_EXT_external_memory_dma_buf\0") },
        unsafe { CStr::from_bytes_with_nul_unchecked(b"VK_EXT_image_drm_format_modifier\0") },
        unsafe { CStr::from_bytes_with_nul_unchecked(b"VK_EXT_queue_family_foreign\0") },
    ]
}

/// Owns the Vulkan instance, logical device, graphics queue and the
/// renderer's command pool. Dropped last, after everything created from it.
pub struct VulkanContext {
    #[allow(dead_code)]
    entry: ash::Entry,
    instance: ash::Instance,
    debug_utils_loader: Option<DebugUtils>,
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,

    pub physical_device: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub graphics_family: u32,

    pub device: ash::Device,
    pub graphics_queue: vk::Queue,
    pub command_pool: vk::CommandPool,
}

impl VulkanContext {
    /// Creates the full Vulkan context.
    ///
    /// `enable_validation` requests the Khronos validation layer plus a
    /// debug-utils messenger routed into the `log` facade; if the layer is
    /// absent this degrades to a warning, not an error.
    pub fn new(enable_validation: bool) -> Result<Self> {
        let entry = ash::Entry::linked();

        let app_name = CString::new(APPLICATION_NAME).unwrap();
        let engine_name = CString::new(ENGINE_NAME).unwrap();
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_1);

        let mut extension_names: Vec<*const c_char> = Vec::new();
        let mut layer_names: Vec<*const c_char> = Vec::new();
        let validation_cstr = CString::new(VALIDATION_LAYER).unwrap();
        let mut use_debug_utils = false;

        if enable_validation {
            let layer_available = entry
                .enumerate_instance_layer_properties()?
                .iter()
                .any(|layer| {
                    unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) }
                        .to_str()
                        .map(|name| name == VALIDATION_LAYER)
                        .unwrap_or(false)
                });
            if layer_available {
                info!("Validation layer '{}' enabled.", VALIDATION_LAYER);
                layer_names.push(validation_cstr.as_ptr());
            } else {
                warn!("Validation layer '{}' requested but not available.", VALIDATION_LAYER);
            }

            let debug_utils_available = entry
                .enumerate_instance_extension_properties(None)?
                .iter()
                .any(|ext| {
                    (unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) }) == DebugUtils::name()
                });
            if debug_utils_available {
                extension_names.push(DebugUtils::name().as_ptr());
                use_debug_utils = true;
            }
        }

        let instance_create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_layer_names(&layer_names)
            .enabled_extension_names(&extension_names);

        let instance = unsafe { entry.create_instance(&instance_create_info, None) }
            .map_err(|e| VulkanError::Initialization(format!("instance creation failed: {}", e)))?;
        info!("Vulkan instance created (API 1.1, headless).");

        let (debug_utils_loader, debug_messenger) = if use_debug_utils {
            let loader = DebugUtils::new(&entry, &instance);
            let messenger_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
                .message_severity(
                    vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                        | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
                )
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                )
                .pfn_user_callback(Some(vulkan_debug_callback));
            let messenger =
                unsafe { loader.create_debug_utils_messenger(&messenger_info, None) }?;
            (Some(loader), Some(messenger))
        } else {
            (None, None)
        };

        let (physical_device, graphics_family) = select_physical_device(&instance)?;
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let device_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_str()
            .unwrap_or("unknown");
        info!(
            "Selected physical device '{}' (graphics family {}, timestamp period {} ns)",
            device_name, graphics_family, properties.limits.timestamp_period
        );

        let queue_priorities = [1.0f32];
        let queue_create_infos = [vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(graphics_family)
            .queue_priorities(&queue_priorities)
            .build()];

        let extension_cstrs = required_device_extensions();
        let extension_ptrs: Vec<*const c_char> =
            extension_cstrs.iter().map(|s| s.as_ptr()).collect();
        for ext in &extension_cstrs {
            debug!("Enabling device extension {:?}", ext);
        }

        let enabled_features = vk::PhysicalDeviceFeatures::default();
        let device_create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_features(&enabled_features)
            .enabled_extension_names(&extension_ptrs);

        let device = unsafe { instance.create_device(physical_device, &device_create_info, None) }
            .map_err(|e| VulkanError::Initialization(format!("device creation failed: {}", e)))?;
        let graphics_queue = unsafe { device.get_device_queue(graphics_family, 0) };
        info!("Logical device created.");

        let pool_create_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(graphics_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe { device.create_command_pool(&pool_create_info, None) }?;

        Ok(Self {
            entry,
            instance,
            debug_utils_loader,
            debug_messenger,
            physical_device,
            properties,
            memory_properties,
            graphics_family,
            device,
            graphics_queue,
            command_pool,
        })
    }

    /// Nanoseconds per timestamp tick on the selected device.
    pub fn timestamp_period(&self) -> f32 {
        self.properties.limits.timestamp_period
    }

    pub fn raw_instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Finds a memory type index satisfying `type_bits` and `flags`.
    pub fn find_memory_type_index(
        &self,
        type_bits: u32,
        flags: vk::MemoryPropertyFlags,
    ) -> Result<u32> {
        for i in 0..self.memory_properties.memory_type_count {
            if (type_bits & (1 << i)) != 0
                && self.memory_properties.memory_types[i as usize]
                    .property_flags
                    .contains(flags)
            {
                return Ok(i);
            }
        }
        Err(VulkanError::NoSuitableMemoryType { type_bits, flags })
    }

    /// Picks a color format with the given optimal-tiling features, from a
    /// caller-ordered candidate list.
    pub fn find_supported_format(
        &self,
        candidates: &[vk::Format],
        features: vk::FormatFeatureFlags,
    ) -> Option<vk::Format> {
        candidates.iter().copied().find(|&format| {
            let props = unsafe {
                self.instance
                    .get_physical_device_format_properties(self.physical_device, format)
            };
            props.optimal_tiling_features.contains(features)
        })
    }
}

/// Selects the first physical device with a graphics queue family whose
/// timestamps are valid. Discrete GPUs are preferred over integrated ones.
fn select_physical_device(instance: &ash::Instance) -> Result<(vk::PhysicalDevice, u32)> {
    let devices = unsafe { instance.enumerate_physical_devices() }?;
    if devices.is_empty() {
        return Err(VulkanError::NoSuitablePhysicalDevice);
    }

    let mut best: Option<(vk::PhysicalDevice, u32, u32)> = None;
    for device in devices {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        let families = unsafe { instance.get_physical_device_queue_family_properties(device) };

        let graphics_family = families.iter().enumerate().find_map(|(index, family)| {
            let graphics = family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
            let timestamps = family.timestamp_valid_bits > 0;
            (graphics && timestamps).then_some(index as u32)
        });
        let Some(graphics_family) = graphics_family else {
            debug!(
                "Skipping device {:?}: no graphics queue family with timestamp support",
                properties.device_id
            );
            continue;
        };

        let score = match properties.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 3,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 2,
            vk::PhysicalDeviceType::VIRTUAL_GPU => 1,
            _ => 0,
        };
        if best.map_or(true, |(_, _, best_score)| score > best_score) {
            best = Some((device, graphics_family, score));
        }
    }

    best.map(|(device, family, _)| (device, family))
        .ok_or(VulkanError::NoSuitablePhysicalDevice)
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        info!("Dropping VulkanContext...");
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                error!("device_wait_idle failed in VulkanContext drop: {}", e);
            }
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
            if let (Some(loader), Some(messenger)) =
                (&self.debug_utils_loader, self.debug_messenger)
            {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
        debug!("VulkanContext destroyed.");
    }
}
