// Vulkan device owned by the OpenXR runtime's choices
//
// XR_KHR_vulkan_enable2 creates the instance and the logical device on our
// behalf (adding whatever extensions the compositor needs) and names the
// physical device driving the HMD. gpu-allocator sits on top for memory.

use anyhow::{Context, Result};
use ash::vk::{self, Handle};
use ash::Entry;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, Allocator, AllocatorCreateDesc};
use openxr as xr;
use parking_lot::Mutex;
use std::ffi::{c_char, CStr, CString};
use std::sync::Arc;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// (major, minor) the instance is created with
const TARGET_VERSION: (u32, u32) = (1, 3);

fn major_minor(version: xr::Version) -> (u32, u32) {
    (version.major() as u32, version.minor() as u32)
}

/// Patch levels are ignored on both ends of the runtime's range
fn version_in_range(target: (u32, u32), min: (u32, u32), max: (u32, u32)) -> bool {
    target >= min && target <= max
}

/// Instance, device, graphics queue and allocator for one XR system
pub struct VulkanDevice {
    // Taken in Drop so it is released before the device
    allocator: Mutex<Option<Allocator>>,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    _entry: Entry,

    pub graphics_queue: vk::Queue,
    pub graphics_queue_family: u32,

    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,

    pub properties: vk::PhysicalDeviceProperties,
}

impl VulkanDevice {
    /// Create the Vulkan device the OpenXR runtime wants for `system`
    ///
    /// # Arguments
    /// * `app_name` - Application name reported to the driver
    /// * `enable_validation` - Enable Khronos validation when installed
    pub fn new(
        xr_instance: &xr::Instance,
        system: xr::SystemId,
        app_name: &str,
        enable_validation: bool,
    ) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan device: {}", app_name);

        // Dynamic rendering needs 1.3
        let reqs = xr_instance
            .graphics_requirements::<xr::Vulkan>(system)
            .context("Failed to get Vulkan graphics requirements")?;
        let min = major_minor(reqs.min_api_version_supported);
        let max = major_minor(reqs.max_api_version_supported);
        log::debug!(
            "Runtime Vulkan range: {}.{} - {}.{}",
            min.0,
            min.1,
            max.0,
            max.1
        );
        if !version_in_range(TARGET_VERSION, min, max) {
            anyhow::bail!(
                "OpenXR runtime accepts Vulkan {}.{} to {}.{}, this backend needs {}.{}",
                min.0,
                min.1,
                max.0,
                max.1,
                TARGET_VERSION.0,
                TARGET_VERSION.1
            );
        }

        let entry = unsafe { Entry::load() }
            .context("Failed to load the Vulkan loader")?;

        let enable_validation = enable_validation && Self::validation_available(&entry);
        let instance =
            Self::create_instance(&entry, xr_instance, system, app_name, enable_validation)?;

        let debug_utils = if enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        let physical_device = unsafe {
            xr_instance.vulkan_graphics_device(system, instance.handle().as_raw() as _)
        }
        .context("Failed to get Vulkan physical device from OpenXR")?;
        let physical_device = vk::PhysicalDevice::from_raw(physical_device as u64);

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        log::info!(
            "Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );
        if properties.api_version < vk::API_VERSION_1_3 {
            anyhow::bail!("GPU does not support Vulkan 1.3 dynamic rendering");
        }

        let graphics_queue_family = Self::find_graphics_queue_family(&instance, physical_device)?;
        let device = Self::create_logical_device(
            &entry,
            &instance,
            xr_instance,
            system,
            physical_device,
            graphics_queue_family,
        )?;
        let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };

        let allocator = Self::create_allocator(&instance, physical_device, &device)?;

        Ok(Arc::new(Self {
            allocator: Mutex::new(Some(allocator)),
            device,
            physical_device,
            instance,
            _entry: entry,
            graphics_queue,
            graphics_queue_family,
            debug_utils,
            properties,
        }))
    }

    fn validation_available(entry: &Entry) -> bool {
        let layers = entry.enumerate_instance_layer_properties().unwrap_or_default();
        let found = layers
            .iter()
            .any(|l| unsafe { CStr::from_ptr(l.layer_name.as_ptr()) } == VALIDATION_LAYER);
        if !found {
            log::warn!("Vulkan validation requested but VK_LAYER_KHRONOS_validation is not installed");
        }
        found
    }

    fn create_instance(
        entry: &Entry,
        xr_instance: &xr::Instance,
        system: xr::SystemId,
        app_name: &str,
        enable_validation: bool,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = CString::new("OpenXR Graphics")?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);

        // The runtime appends whatever instance extensions it needs
        let mut extensions: Vec<*const c_char> = Vec::new();
        let mut layer_names: Vec<*const c_char> = Vec::new();
        if enable_validation {
            extensions.push(ash::extensions::ext::DebugUtils::name().as_ptr());
            layer_names.push(VALIDATION_LAYER.as_ptr());
        }

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let raw_instance = unsafe {
            xr_instance.create_vulkan_instance(
                system,
                std::mem::transmute(entry.static_fn().get_instance_proc_addr),
                &*create_info as *const _ as *const _,
            )
        }
        .context("OpenXR failed to create Vulkan instance")?
        .map_err(vk::Result::from_raw)
        .context("Failed to create Vulkan instance")?;

        let instance = unsafe {
            ash::Instance::load(entry.static_fn(), vk::Instance::from_raw(raw_instance as _))
        };

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::extensions::ext::DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .context("Failed to create Vulkan debug messenger")?;

        Ok((debug_utils, messenger))
    }

    fn find_graphics_queue_family(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
    ) -> Result<u32> {
        let queue_families =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

        queue_families
            .iter()
            .position(|props| props.queue_flags.contains(vk::QueueFlags::GRAPHICS))
            .map(|i| i as u32)
            .context("GPU has no graphics queue family")
    }

    fn create_logical_device(
        entry: &Entry,
        instance: &ash::Instance,
        xr_instance: &xr::Instance,
        system: xr::SystemId,
        physical_device: vk::PhysicalDevice,
        graphics_queue_family: u32,
    ) -> Result<ash::Device> {
        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(graphics_queue_family)
            .queue_priorities(&queue_priorities)
            .build();

        let supported = unsafe { instance.get_physical_device_features(physical_device) };
        let features = vk::PhysicalDeviceFeatures {
            fill_mode_non_solid: supported.fill_mode_non_solid,
            wide_lines: supported.wide_lines,
            sampler_anisotropy: supported.sampler_anisotropy,
            ..Default::default()
        };
        let mut features13 = vk::PhysicalDeviceVulkan13Features::builder()
            .dynamic_rendering(true)
            .synchronization2(true);

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_features(&features)
            .push_next(&mut features13);

        let raw_device = unsafe {
            xr_instance.create_vulkan_device(
                system,
                std::mem::transmute(entry.static_fn().get_instance_proc_addr),
                physical_device.as_raw() as _,
                &*create_info as *const _ as *const _,
            )
        }
        .context("OpenXR failed to create Vulkan device")?
        .map_err(vk::Result::from_raw)
        .context("Failed to create Vulkan device")?;

        let device =
            unsafe { ash::Device::load(instance.fp_v1_0(), vk::Device::from_raw(raw_device as _)) };

        Ok(device)
    }

    fn create_allocator(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: &ash::Device,
    ) -> Result<Allocator> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .context("Failed to create GPU allocator")?;

        Ok(allocator)
    }

    pub fn allocate(&self, desc: &AllocationCreateDesc) -> Result<Allocation> {
        let mut allocator = self.allocator.lock();
        let allocator = allocator.as_mut().context("GPU allocator already destroyed")?;
        allocator
            .allocate(desc)
            .with_context(|| format!("Failed to allocate memory for {}", desc.name))
    }

    pub fn free(&self, allocation: Allocation) -> Result<()> {
        let mut allocator = self.allocator.lock();
        let allocator = allocator.as_mut().context("GPU allocator already destroyed")?;
        allocator.free(allocation).context("Failed to free GPU memory")?;
        Ok(())
    }

    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        let _ = self.wait_idle();

        // Allocator frees its blocks against the live device
        drop(self.allocator.lock().take());
        unsafe {
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Hand `resource` back if `result` is Ok, otherwise release it and return the error
///
/// Covers the window between creating a raw Vulkan object and handing it to
/// an owner whose `destroy` would clean it up.
pub fn keep_or_release<R>(result: Result<()>, resource: R, release: impl FnOnce(R)) -> Result<R> {
    match result {
        Ok(()) => Ok(resource),
        Err(e) => {
            release(resource);
            Err(e)
        }
    }
}

fn message_type_label(types: vk::DebugUtilsMessageTypeFlagsEXT) -> &'static str {
    if types.contains(vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION) {
        "VALIDATION"
    } else if types.contains(vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE) {
        "PERF"
    } else {
        "GEN"
    }
}

unsafe fn cstr_or_empty<'a>(ptr: *const c_char) -> std::borrow::Cow<'a, str> {
    if ptr.is_null() {
        "".into()
    } else {
        CStr::from_ptr(ptr).to_string_lossy()
    }
}

/// Routes validation output into `log` as "[Vulkan TYPE] id: message"
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() {
        return vk::FALSE;
    }
    let data = &*p_callback_data;
    let level = if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::Level::Error
    } else if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::Level::Warn
    } else if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        log::Level::Info
    } else {
        log::Level::Debug
    };
    log::log!(
        level,
        "[Vulkan {}] {}: {}",
        message_type_label(message_type),
        cstr_or_empty(data.p_message_id_name),
        cstr_or_empty(data.p_message)
    );

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_wins_over_other_message_types() {
        let both = vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
            | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE;
        assert_eq!(message_type_label(both), "VALIDATION");
        assert_eq!(
            message_type_label(vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE),
            "PERF"
        );
        assert_eq!(
            message_type_label(vk::DebugUtilsMessageTypeFlagsEXT::GENERAL),
            "GEN"
        );
    }

    #[test]
    fn target_version_must_sit_inside_runtime_range() {
        assert!(version_in_range(TARGET_VERSION, (1, 0), (1, 3)));
        assert!(version_in_range(TARGET_VERSION, (1, 3), (1, 4)));
        // Runtime capped below 1.3
        assert!(!version_in_range(TARGET_VERSION, (1, 0), (1, 2)));
        // Runtime demands something newer
        assert!(!version_in_range(TARGET_VERSION, (1, 4), (2, 0)));
    }

    #[test]
    fn runtime_versions_drop_patch_level() {
        assert_eq!(major_minor(xr::Version::new(1, 3, 275)), (1, 3));
        assert!(version_in_range(
            TARGET_VERSION,
            major_minor(xr::Version::new(1, 0, 0)),
            major_minor(xr::Version::new(1, 3, 999)),
        ));
    }

    #[test]
    fn resources_survive_success() {
        let mut released = false;
        let kept = keep_or_release(Ok(()), 42u32, |_| released = true).unwrap();
        assert_eq!(kept, 42);
        assert!(!released);
    }

    #[test]
    fn resources_are_released_on_failure() {
        let mut released = None;
        let err = keep_or_release(
            Err(anyhow::anyhow!("Failed to bind buffer memory")),
            (7u64, "allocation"),
            |r| released = Some(r),
        )
        .unwrap_err();
        assert_eq!(released, Some((7, "allocation")));
        assert_eq!(err.to_string(), "Failed to bind buffer memory");
    }

    #[test]
    fn null_strings_read_as_empty() {
        assert_eq!(unsafe { cstr_or_empty(std::ptr::null()) }, "");
        let text = c"VUID-vkCmdDraw-None-02859";
        assert_eq!(
            unsafe { cstr_or_empty(text.as_ptr()) },
            "VUID-vkCmdDraw-None-02859"
        );
    }
}
