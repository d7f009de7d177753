use std::ffi::CString;

use log::*;
use vulkanalia::prelude::v1_0::*;
use vulkanalia::vk::ExtDebugUtilsExtension;

/// Debug-utils capability, resolved once when the instance is created.
///
/// Object names and command buffer labels are optional: when the extension
/// was not enabled every call is a no-op, and driver failures are only traced.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DebugUtils {
    enabled: bool,
}

impl DebugUtils {
    pub fn resolve(extension_enabled: bool) -> Self {
        Self { enabled: extension_enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Names a Vulkan object for validation messages and capture tools.
    pub unsafe fn name(
        &self,
        instance: &Instance,
        device: &Device,
        object_type: vk::ObjectType,
        handle: u64,
        name: &str,
    ) {
        if !self.enabled {
            return;
        }
        let name = match label_bytes(name) {
            Some(name) => name,
            None => return,
        };
        let info = vk::DebugUtilsObjectNameInfoEXT::builder()
            .object_type(object_type)
            .object_handle(handle)
            .object_name(name.as_bytes_with_nul());
        if let Err(error) = instance.set_debug_utils_object_name_ext(device.handle(), &info) {
            trace!("Naming {:?} failed: {}", object_type, error);
        }
    }

    pub unsafe fn begin_label(
        &self,
        instance: &Instance,
        command_buffer: vk::CommandBuffer,
        name: &str,
        color: [f32; 4],
    ) {
        if !self.enabled {
            return;
        }
        let name = match label_bytes(name) {
            Some(name) => name,
            None => return,
        };
        let label = vk::DebugUtilsLabelEXT::builder()
            .label_name(name.as_bytes_with_nul())
            .color(color);
        instance.cmd_begin_debug_utils_label_ext(command_buffer, &label);
    }

    pub unsafe fn end_label(&self, instance: &Instance, command_buffer: vk::CommandBuffer) {
        if self.enabled {
            instance.cmd_end_debug_utils_label_ext(command_buffer);
        }
    }
}

fn label_bytes(name: &str) -> Option<CString> {
    CString::new(name).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_is_resolved_once() {
        assert!(!DebugUtils::default().is_enabled());
        assert!(DebugUtils::resolve(true).is_enabled());
    }

    #[test]
    fn interior_nul_names_are_skipped() {
        assert!(label_bytes("Geometry Pass").is_some());
        assert!(label_bytes("bad\0name").is_none());
    }
}
