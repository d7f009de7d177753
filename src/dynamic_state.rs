use std::ffi::c_void;
use std::mem;
use std::os::raw::c_char;
use std::ptr;

use log::*;
use vulkanalia::prelude::v1_0::*;
use vulkanalia::vk::InstanceV1_1;

use crate::frame_graph::PolygonMode;

pub const EXTENDED_DYNAMIC_STATE_3_EXTENSION: vk::ExtensionName =
    vk::ExtensionName::from_bytes(b"VK_EXT_extended_dynamic_state3");

const FEATURES_STRUCTURE_TYPE: vk::StructureType = vk::StructureType::from_raw(1_000_455_000);
const POLYGON_MODE_FEATURE: usize = 2;
const FEATURE_COUNT: usize = 31;

/// `VK_DYNAMIC_STATE_POLYGON_MODE_EXT`.
pub const DYNAMIC_STATE_POLYGON_MODE: vk::DynamicState = vk::DynamicState::from_raw(1_000_455_004);

const SET_POLYGON_MODE: &[u8] = b"vkCmdSetPolygonModeEXT\0";

type CmdSetPolygonMode = unsafe extern "system" fn(vk::CommandBuffer, vk::PolygonMode);

/// `VkPhysicalDeviceExtendedDynamicState3FeaturesEXT`.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct ExtendedDynamicState3Features {
    s_type: vk::StructureType,
    next: *mut c_void,
    features: [vk::Bool32; FEATURE_COUNT],
}

impl Default for ExtendedDynamicState3Features {
    fn default() -> Self {
        Self {
            s_type: FEATURES_STRUCTURE_TYPE,
            next: ptr::null_mut(),
            features: [vk::FALSE; FEATURE_COUNT],
        }
    }
}

impl ExtendedDynamicState3Features {
    /// Requests only the dynamic polygon mode.
    pub fn polygon_mode_only() -> Self {
        let mut features = Self::default();
        features.features[POLYGON_MODE_FEATURE] = vk::TRUE;
        features
    }

    pub fn polygon_mode(&self) -> bool {
        self.features[POLYGON_MODE_FEATURE] == vk::TRUE
    }
}

/// Whether a device can switch polygon mode inside a command buffer.
pub fn supports_dynamic_polygon_mode(
    api_version: u32,
    extensions: &[vk::ExtensionName],
    features: &ExtendedDynamicState3Features,
) -> bool {
    api_version >= vk::make_version(1, 1, 0)
        && extensions.contains(&EXTENDED_DYNAMIC_STATE_3_EXTENSION)
        && features.polygon_mode()
}

/// Queries the device for the dynamic polygon mode feature.
pub unsafe fn query_support(instance: &Instance, physical_device: vk::PhysicalDevice) -> bool {
    let properties = instance.get_physical_device_properties(physical_device);
    let extensions = match instance.enumerate_device_extension_properties(physical_device, None) {
        Ok(extensions) => extensions.iter().map(|e| e.extension_name).collect::<Vec<_>>(),
        Err(error) => {
            trace!("Could not list device extensions: {}", error);
            return false;
        }
    };

    let mut features = ExtendedDynamicState3Features::default();
    if properties.api_version >= vk::make_version(1, 1, 0)
        && extensions.contains(&EXTENDED_DYNAMIC_STATE_3_EXTENSION)
    {
        let mut features2 = vk::PhysicalDeviceFeatures2 {
            next: &mut features as *mut _ as *mut c_void,
            ..Default::default()
        };
        instance.get_physical_device_features2(physical_device, &mut features2);
    }
    supports_dynamic_polygon_mode(properties.api_version, &extensions, &features)
}

/// Dynamic polygon mode, resolved once when the logical device is created.
///
/// Without it the frame graph builds one pipeline per polygon mode instead.
#[derive(Copy, Clone, Default)]
pub struct DynamicPolygonMode {
    set_polygon_mode: Option<CmdSetPolygonMode>,
}

impl DynamicPolygonMode {
    pub unsafe fn resolve(instance: &Instance, device: &Device, enabled: bool) -> Self {
        if !enabled {
            return Self::default();
        }
        let name = SET_POLYGON_MODE.as_ptr() as *const c_char;
        let set_polygon_mode = (instance.commands().get_device_proc_addr)(device.handle(), name)
            .map(|f| mem::transmute::<unsafe extern "system" fn(), CmdSetPolygonMode>(f));
        if set_polygon_mode.is_none() {
            warn!("vkCmdSetPolygonModeEXT is missing; falling back to per-mode pipelines.");
        }
        Self { set_polygon_mode }
    }

    pub fn is_available(&self) -> bool {
        self.set_polygon_mode.is_some()
    }

    pub unsafe fn set(&self, command_buffer: vk::CommandBuffer, mode: PolygonMode) {
        if let Some(set_polygon_mode) = self.set_polygon_mode {
            set_polygon_mode(command_buffer, mode.vk());
        }
    }
}

impl std::fmt::Debug for DynamicPolygonMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicPolygonMode")
            .field("available", &self.is_available())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn features_carry_only_the_polygon_mode_request() {
        let features = ExtendedDynamicState3Features::polygon_mode_only();
        assert_eq!(features.s_type, FEATURES_STRUCTURE_TYPE);
        assert!(features.polygon_mode());
        assert_eq!(features.features.iter().filter(|f| **f == vk::TRUE).count(), 1);
        assert!(!ExtendedDynamicState3Features::default().polygon_mode());
    }

    #[test]
    fn dynamic_polygon_mode_needs_version_extension_and_feature() {
        let extensions = [vk::KHR_SWAPCHAIN_EXTENSION.name, EXTENDED_DYNAMIC_STATE_3_EXTENSION];
        let enabled = ExtendedDynamicState3Features::polygon_mode_only();
        let v1_1 = vk::make_version(1, 1, 0);

        assert!(supports_dynamic_polygon_mode(v1_1, &extensions, &enabled));
        assert!(!supports_dynamic_polygon_mode(vk::make_version(1, 0, 0), &extensions, &enabled));
        assert!(!supports_dynamic_polygon_mode(v1_1, &extensions[..1], &enabled));
        assert!(!supports_dynamic_polygon_mode(
            v1_1,
            &extensions,
            &ExtendedDynamicState3Features::default()
        ));
    }

    #[test]
    fn unresolved_capability_is_unavailable() {
        assert!(!DynamicPolygonMode::default().is_available());
    }
}
