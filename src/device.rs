use std::collections::HashSet;
use std::ffi::c_void;
use std::rc::Rc;

use anyhow::{anyhow, Result};
use log::*;
use thiserror::Error;
use vulkanalia::prelude::v1_0::*;
use vulkanalia::vk::KhrSurfaceExtension;

use crate::config::{DEVICE_EXTENSIONS, VALIDATION_ENABLED, VALIDATION_LAYER};
use crate::debug::DebugUtils;
use crate::dynamic_state::{
    self, DynamicPolygonMode, ExtendedDynamicState3Features, EXTENDED_DYNAMIC_STATE_3_EXTENSION,
};
use crate::error::RenderError;
use crate::instance::VulkanInstance;
use crate::swapchain::SwapchainSupport;

/// Why a physical device was skipped.
#[derive(Debug, Error)]
#[error("Missing {0}.")]
pub struct SuitabilityError(pub &'static str);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilyIndices {
    pub unsafe fn get(
        instance: &Instance,
        surface: vk::SurfaceKHR,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let properties = instance.get_physical_device_queue_family_properties(physical_device);
        Self::find(&properties, |index| {
            Ok(instance.get_physical_device_surface_support_khr(physical_device, index, surface)?)
        })
    }

    /// Picks the first graphics-capable family and the first family able to present.
    pub fn find(
        properties: &[vk::QueueFamilyProperties],
        mut supports_present: impl FnMut(u32) -> Result<bool>,
    ) -> Result<Self> {
        let graphics = properties
            .iter()
            .position(|p| p.queue_flags.contains(vk::QueueFlags::GRAPHICS))
            .map(|i| i as u32);

        let mut present = None;
        for index in 0..properties.len() as u32 {
            if supports_present(index)? {
                present = Some(index);
                break;
            }
        }

        match (graphics, present) {
            (Some(graphics), Some(present)) => Ok(Self { graphics, present }),
            (None, _) => Err(anyhow!(SuitabilityError("graphics queue family"))),
            (_, None) => Err(anyhow!(SuitabilityError("present queue family"))),
        }
    }

    /// Family indices with duplicates removed, in ascending order.
    pub fn unique(&self) -> Vec<u32> {
        let mut indices = vec![self.graphics, self.present];
        indices.sort_unstable();
        indices.dedup();
        indices
    }
}

/// Returns the first required feature the device lacks.
pub fn missing_feature(features: &vk::PhysicalDeviceFeatures) -> Option<&'static str> {
    if features.sampler_anisotropy != vk::TRUE {
        Some("sampler anisotropy")
    } else if features.fill_mode_non_solid != vk::TRUE {
        Some("non-solid fill mode")
    } else if features.sample_rate_shading != vk::TRUE {
        Some("sample rate shading")
    } else {
        None
    }
}

/// Highest sample count present in `counts`.
pub fn max_usable_sample_count(counts: vk::SampleCountFlags) -> vk::SampleCountFlags {
    [
        vk::SampleCountFlags::_64,
        vk::SampleCountFlags::_32,
        vk::SampleCountFlags::_16,
        vk::SampleCountFlags::_8,
        vk::SampleCountFlags::_4,
        vk::SampleCountFlags::_2,
    ]
    .iter()
    .cloned()
    .find(|c| counts.contains(*c))
    .unwrap_or(vk::SampleCountFlags::_1)
}

/// First candidate whose tiling features include `features`.
pub fn pick_format(
    candidates: &[vk::Format],
    tiling: vk::ImageTiling,
    features: vk::FormatFeatureFlags,
    mut properties: impl FnMut(vk::Format) -> vk::FormatProperties,
) -> Option<vk::Format> {
    candidates.iter().cloned().find(|f| {
        let props = properties(*f);
        match tiling {
            vk::ImageTiling::LINEAR => props.linear_tiling_features.contains(features),
            vk::ImageTiling::OPTIMAL => props.optimal_tiling_features.contains(features),
            _ => false,
        }
    })
}

/// The selected GPU, its logical device and queues.
///
/// Shared as `Rc<DeviceContext>` by every owner of device objects; the
/// logical device is destroyed once the last owner is gone.
pub struct DeviceContext {
    instance: Rc<VulkanInstance>,
    device: Device,
    pub physical_device: vk::PhysicalDevice,
    pub queue_families: QueueFamilyIndices,
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    pub msaa_samples: vk::SampleCountFlags,
    pub max_sampler_anisotropy: f32,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub dynamic_polygon_mode: DynamicPolygonMode,
}

impl DeviceContext {
    pub unsafe fn create(instance: Rc<VulkanInstance>) -> Result<Rc<Self>> {
        let physical_device = select_physical_device(&instance)?;
        let vk_instance = instance.instance();
        let queue_families = QueueFamilyIndices::get(vk_instance, instance.surface(), physical_device)?;
        let dynamic_polygon_mode_supported = dynamic_state::query_support(vk_instance, physical_device);
        let (device, graphics_queue, present_queue) = create_logical_device(
            vk_instance,
            physical_device,
            queue_families,
            dynamic_polygon_mode_supported,
        )?;
        let dynamic_polygon_mode =
            DynamicPolygonMode::resolve(vk_instance, &device, dynamic_polygon_mode_supported);
        info!("Dynamic polygon mode: {}.", dynamic_polygon_mode.is_available());

        let properties = vk_instance.get_physical_device_properties(physical_device);
        let msaa_samples = max_usable_sample_count(
            properties.limits.framebuffer_color_sample_counts
                & properties.limits.framebuffer_depth_sample_counts,
        );
        info!("Using {:?} MSAA samples.", msaa_samples);
        let memory_properties = vk_instance.get_physical_device_memory_properties(physical_device);

        Ok(Rc::new(Self {
            instance,
            device,
            physical_device,
            queue_families,
            graphics_queue,
            present_queue,
            msaa_samples,
            max_sampler_anisotropy: properties.limits.max_sampler_anisotropy,
            memory_properties,
            dynamic_polygon_mode,
        }))
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn instance(&self) -> &Instance {
        self.instance.instance()
    }

    pub fn surface(&self) -> vk::SurfaceKHR {
        self.instance.surface()
    }

    pub fn debug(&self) -> DebugUtils {
        self.instance.debug()
    }

    /// Assigns a debug name; silently ignored without the debug extension.
    pub unsafe fn name(&self, object_type: vk::ObjectType, handle: u64, name: &str) {
        self.debug().name(self.instance(), &self.device, object_type, handle, name);
    }

    pub unsafe fn format_properties(&self, format: vk::Format) -> vk::FormatProperties {
        self.instance()
            .get_physical_device_format_properties(self.physical_device, format)
    }

    pub unsafe fn swapchain_support(&self) -> Result<SwapchainSupport> {
        SwapchainSupport::get(self.instance(), self.surface(), self.physical_device)
    }

    pub unsafe fn depth_format(&self) -> Result<vk::Format> {
        let candidates = &[
            vk::Format::D32_SFLOAT,
            vk::Format::D32_SFLOAT_S8_UINT,
            vk::Format::D24_UNORM_S8_UINT,
        ];
        pick_format(
            candidates,
            vk::ImageTiling::OPTIMAL,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
            |f| self.format_properties(f),
        )
        .ok_or_else(|| anyhow!(RenderError::NoSupportedDepthFormat))
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        unsafe {
            if let Err(error) = self.device.device_wait_idle() {
                warn!("Device did not go idle before teardown: {}", error);
            }
            self.device.destroy_device(None);
        }
        debug!("Destroyed logical device.");
    }
}

unsafe fn select_physical_device(instance: &VulkanInstance) -> Result<vk::PhysicalDevice> {
    for physical_device in instance.instance().enumerate_physical_devices()? {
        let properties = instance.instance().get_physical_device_properties(physical_device);
        if let Err(error) = check_physical_device(instance, physical_device) {
            warn!("Skipping physical device (`{}`): {}", properties.device_name, error);
        } else {
            info!("Selected physical device (`{}`).", properties.device_name);
            return Ok(physical_device);
        }
    }
    Err(anyhow!(RenderError::NoSuitableDevice))
}

unsafe fn check_physical_device(
    instance: &VulkanInstance,
    physical_device: vk::PhysicalDevice,
) -> Result<()> {
    let vk_instance = instance.instance();
    QueueFamilyIndices::get(vk_instance, instance.surface(), physical_device)?;
    check_physical_device_extensions(vk_instance, physical_device)?;

    let support = SwapchainSupport::get(vk_instance, instance.surface(), physical_device)?;
    if support.formats.is_empty() || support.present_modes.is_empty() {
        return Err(anyhow!(SuitabilityError("swapchain support")));
    }

    let features = vk_instance.get_physical_device_features(physical_device);
    if let Some(feature) = missing_feature(&features) {
        return Err(anyhow!(SuitabilityError(feature)));
    }
    Ok(())
}

unsafe fn check_physical_device_extensions(
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<()> {
    let extensions = instance
        .enumerate_device_extension_properties(physical_device, None)?
        .iter()
        .map(|e| e.extension_name)
        .collect::<HashSet<_>>();
    if DEVICE_EXTENSIONS.iter().all(|e| extensions.contains(e)) {
        Ok(())
    } else {
        Err(anyhow!(SuitabilityError("required device extensions")))
    }
}

unsafe fn create_logical_device(
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
    indices: QueueFamilyIndices,
    dynamic_polygon_mode: bool,
) -> Result<(Device, vk::Queue, vk::Queue)> {
    let queue_priorities = &[1.0];
    let queue_infos = indices
        .unique()
        .iter()
        .map(|i| {
            vk::DeviceQueueCreateInfo::builder()
                .queue_family_index(*i)
                .queue_priorities(queue_priorities)
        })
        .collect::<Vec<_>>();

    let layers = if VALIDATION_ENABLED {
        vec![VALIDATION_LAYER.as_ptr()]
    } else {
        vec![]
    };

    let mut extensions = DEVICE_EXTENSIONS.iter().map(|n| n.as_ptr()).collect::<Vec<_>>();
    if cfg!(target_os = "macos") {
        extensions.push(vk::KHR_PORTABILITY_SUBSET_EXTENSION.name.as_ptr());
    }
    if dynamic_polygon_mode {
        extensions.push(EXTENDED_DYNAMIC_STATE_3_EXTENSION.as_ptr());
    }

    let features = vk::PhysicalDeviceFeatures::builder()
        .sampler_anisotropy(true)
        .fill_mode_non_solid(true)
        .sample_rate_shading(true);

    let dynamic_state_features = ExtendedDynamicState3Features::polygon_mode_only();
    let mut info = vk::DeviceCreateInfo::builder()
        .queue_create_infos(&queue_infos)
        .enabled_layer_names(&layers)
        .enabled_extension_names(&extensions)
        .enabled_features(&features)
        .build();
    if dynamic_polygon_mode {
        info.next = &dynamic_state_features as *const _ as *const c_void;
    }

    let device = instance
        .create_device(physical_device, &info, None)
        .map_err(RenderError::DeviceCreation)?;
    let graphics_queue = device.get_device_queue(indices.graphics, 0);
    let present_queue = device.get_device_queue(indices.present, 0);
    Ok((device, graphics_queue, present_queue))
}
