use std::collections::HashSet;

use anyhow::{anyhow, Result};
use log::*;
use vulkanalia::loader::{LibloadingLoader, LIBRARY};
use vulkanalia::prelude::v1_0::*;
use vulkanalia::vk::{ExtDebugUtilsExtension, KhrSurfaceExtension};
use vulkanalia::window as vk_window;
use winit::window::Window;

use crate::callback::debug_callback;
use crate::config::{APPLICATION_NAME, ENGINE_NAME, VALIDATION_ENABLED, VALIDATION_LAYER};
use crate::debug::DebugUtils;

/// The Vulkan instance, its debug messenger and the window surface.
///
/// Dropped after every device-level object, see [`crate::device::DeviceContext`].
pub struct VulkanInstance {
    /// Keeps the Vulkan library loaded.
    _entry: Entry,
    instance: Instance,
    messenger: Option<vk::DebugUtilsMessengerEXT>,
    surface: vk::SurfaceKHR,
    debug: DebugUtils,
}

impl VulkanInstance {
    pub unsafe fn create(window: &Window) -> Result<Self> {
        let loader = LibloadingLoader::new(LIBRARY)?;
        let entry = Entry::new(loader).map_err(|b| anyhow!("{}", b))?;
        let (instance, messenger) = create_instance(window, &entry)?;
        let mut created = Self {
            _entry: entry,
            instance,
            messenger,
            surface: vk::SurfaceKHR::null(),
            debug: DebugUtils::resolve(messenger.is_some()),
        };
        created.surface = vk_window::create_surface(&created.instance, window)?;
        debug!("Debug names and labels enabled: {}.", created.debug.is_enabled());
        Ok(created)
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    pub fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }

    pub fn debug(&self) -> DebugUtils {
        self.debug
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            if !self.surface.is_null() {
                self.instance.destroy_surface_khr(self.surface, None);
            }
            if let Some(messenger) = self.messenger.take() {
                self.instance.destroy_debug_utils_messenger_ext(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
        debug!("Destroyed Vulkan instance.");
    }
}

unsafe fn create_instance(
    window: &Window,
    entry: &Entry,
) -> Result<(Instance, Option<vk::DebugUtilsMessengerEXT>)> {
    let application_info = vk::ApplicationInfo::builder()
        .application_name(APPLICATION_NAME)
        .application_version(vk::make_version(1, 0, 0))
        .engine_name(ENGINE_NAME)
        .engine_version(vk::make_version(1, 0, 0))
        .api_version(vk::make_version(1, 1, 0));

    // Layers

    let available_layers = entry
        .enumerate_instance_layer_properties()?
        .iter()
        .map(|l| l.layer_name)
        .collect::<HashSet<_>>();
    if VALIDATION_ENABLED && !available_layers.contains(&VALIDATION_LAYER) {
        return Err(anyhow!("Validation layer requested but not supported."));
    }

    let layers = if VALIDATION_ENABLED {
        vec![VALIDATION_LAYER.as_ptr()]
    } else {
        Vec::new()
    };

    // Extensions

    let mut extensions = vk_window::get_required_instance_extensions(window)
        .iter()
        .map(|e| e.as_ptr())
        .collect::<Vec<_>>();
    if VALIDATION_ENABLED {
        extensions.push(vk::EXT_DEBUG_UTILS_EXTENSION.name.as_ptr());
    }

    let flags = if cfg!(target_os = "macos") {
        info!("Enabling extensions for macOS portability.");
        extensions.push(vk::KHR_GET_PHYSICAL_DEVICE_PROPERTIES2_EXTENSION.name.as_ptr());
        extensions.push(vk::KHR_PORTABILITY_ENUMERATION_EXTENSION.name.as_ptr());
        vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR
    } else {
        vk::InstanceCreateFlags::empty()
    };

    // Create

    let mut info = vk::InstanceCreateInfo::builder()
        .flags(flags)
        .application_info(&application_info)
        .enabled_layer_names(&layers)
        .enabled_extension_names(&extensions);

    let mut debug_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
        .message_severity(vk::DebugUtilsMessageSeverityFlagsEXT::all())
        .message_type(vk::DebugUtilsMessageTypeFlagsEXT::all())
        .user_callback(Some(debug_callback));

    if VALIDATION_ENABLED {
        info = info.push_next(&mut debug_info);
    }
    let instance = entry.create_instance(&info, None)?;

    // Messenger

    let messenger = if VALIDATION_ENABLED {
        match instance.create_debug_utils_messenger_ext(&debug_info, None) {
            Ok(messenger) => Some(messenger),
            Err(error) => {
                instance.destroy_instance(None);
                return Err(error.into());
            }
        }
    } else {
        None
    };

    info!("Created Vulkan instance (validation: {}).", VALIDATION_ENABLED);
    Ok((instance, messenger))
}
