use std::ffi::{c_void, CStr};

use log::*;
use vulkanalia::prelude::v1_0::*;

/// Forwards validation-layer messages to `log`, mapping Vulkan severity to log level.
pub extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    type_: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() {
        return vk::FALSE;
    }
    let data = unsafe { *data };
    if data.message.is_null() {
        return vk::FALSE;
    }
    let message = unsafe { CStr::from_ptr(data.message) }.to_string_lossy();

    match severity_level(severity) {
        Level::Error => error!("({:?}) {}", type_, message),
        Level::Warn => warn!("({:?}) {}", type_, message),
        Level::Debug => debug!("({:?}) {}", type_, message),
        _ => trace!("({:?}) {}", type_, message),
    }

    vk::FALSE
}

fn severity_level(severity: vk::DebugUtilsMessageSeverityFlagsEXT) -> Level {
    if severity >= vk::DebugUtilsMessageSeverityFlagsEXT::ERROR {
        Level::Error
    } else if severity >= vk::DebugUtilsMessageSeverityFlagsEXT::WARNING {
        Level::Warn
    } else if severity >= vk::DebugUtilsMessageSeverityFlagsEXT::INFO {
        Level::Debug
    } else {
        Level::Trace
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severities_map_to_log_levels() {
        use vk::DebugUtilsMessageSeverityFlagsEXT as S;
        assert_eq!(severity_level(S::ERROR), Level::Error);
        assert_eq!(severity_level(S::WARNING), Level::Warn);
        assert_eq!(severity_level(S::INFO), Level::Debug);
        assert_eq!(severity_level(S::VERBOSE), Level::Trace);
    }
}
