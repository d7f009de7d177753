use std::env;
use std::path::PathBuf;

use log::*;
use vulkanalia::prelude::v1_0::*;

/// Whether the validation layers should be enabled.
pub const VALIDATION_ENABLED: bool = cfg!(debug_assertions);

/// The name of the validation layers.
pub const VALIDATION_LAYER: vk::ExtensionName =
    vk::ExtensionName::from_bytes(b"VK_LAYER_KHRONOS_validation");

/// Device extensions every candidate GPU must expose.
pub const DEVICE_EXTENSIONS: &[vk::ExtensionName] = &[vk::KHR_SWAPCHAIN_EXTENSION.name];

/// Max frames in flight to be presented.
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

pub const APPLICATION_NAME: &[u8] = b"-PTE-\0";
pub const ENGINE_NAME: &[u8] = b"No Engine\0";

pub const WINDOW_TITLE: &str = "-PTE-";
pub const WINDOW_WIDTH: u32 = 1280;
pub const WINDOW_HEIGHT: u32 = 720;

pub const CLEAR_COLOR: [f32; 4] = [0.0, 0.0, 0.0, 1.0];
pub const CLEAR_DEPTH: f32 = 1.0;

/// Fraction of samples shaded per fragment when sample shading is on.
pub const MIN_SAMPLE_SHADING: f32 = 0.2;

/// Per-type descriptor slack reserved for the overlay.
pub const OVERLAY_DESCRIPTOR_SLACK: u32 = 100;
/// Extra descriptor sets reserved for the overlay.
pub const OVERLAY_SET_SLACK: u32 = 500;

pub const FIELD_OF_VIEW_DEGREES: f32 = 45.0;
pub const NEAR_PLANE: f32 = 0.1;
pub const FAR_PLANE: f32 = 10.0;

pub const CAMERA_SPEED: f32 = 5.0;
pub const CAMERA_SENSITIVITY: f32 = 0.1;

/// Distance along X between copies of the default model added at runtime.
pub const MODEL_SPACING: f32 = 2.5;

pub const DEFAULT_VERTEX_SHADER: &str = "VulkanShaders/vert.spv";
pub const DEFAULT_FRAGMENT_SHADER: &str = "VulkanShaders/frag.spv";
pub const DEFAULT_MODEL: &str = "VulkanModels/viking_room.obj";
pub const DEFAULT_TEXTURE: &str = "VulkanTextures/viking_room.png";

/// Runtime settings: window size and asset locations.
#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    pub width: u32,
    pub height: u32,
    pub vertex_shader: PathBuf,
    pub fragment_shader: PathBuf,
    pub model: PathBuf,
    pub texture: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            width: WINDOW_WIDTH,
            height: WINDOW_HEIGHT,
            vertex_shader: DEFAULT_VERTEX_SHADER.into(),
            fragment_shader: DEFAULT_FRAGMENT_SHADER.into(),
            model: DEFAULT_MODEL.into(),
            texture: DEFAULT_TEXTURE.into(),
        }
    }
}

impl Settings {
    /// Defaults overridden by `VKCORE_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut settings = Self::default();
        let size = |key: &str, fallback: u32| match lookup(key) {
            Some(value) => match value.parse::<u32>() {
                Ok(parsed) if parsed > 0 => parsed,
                _ => {
                    warn!("Ignoring invalid {} value `{}`.", key, value);
                    fallback
                }
            },
            None => fallback,
        };
        settings.width = size("VKCORE_WIDTH", settings.width);
        settings.height = size("VKCORE_HEIGHT", settings.height);
        if let Some(path) = lookup("VKCORE_VERTEX_SHADER") {
            settings.vertex_shader = path.into();
        }
        if let Some(path) = lookup("VKCORE_FRAGMENT_SHADER") {
            settings.fragment_shader = path.into();
        }
        if let Some(path) = lookup("VKCORE_MODEL") {
            settings.model = path.into();
        }
        if let Some(path) = lookup("VKCORE_TEXTURE") {
            settings.texture = path.into();
        }
        settings
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_without_overrides() {
        assert_eq!(Settings::from_lookup(|_| None), Settings::default());
    }

    #[test]
    fn overrides_apply_and_bad_sizes_fall_back() {
        let vars: HashMap<&str, &str> = [
            ("VKCORE_WIDTH", "800"),
            ("VKCORE_HEIGHT", "zero"),
            ("VKCORE_MODEL", "assets/cube.obj"),
        ]
        .into_iter()
        .collect();
        let settings = Settings::from_lookup(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(settings.width, 800);
        assert_eq!(settings.height, WINDOW_HEIGHT);
        assert_eq!(settings.model, PathBuf::from("assets/cube.obj"));
        assert_eq!(settings.texture, PathBuf::from(DEFAULT_TEXTURE));
    }
}
