use std::path::PathBuf;

use thiserror::Error;
use vulkanalia::prelude::v1_0::*;

/// Failures raised by the rendering core.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("No suitable physical device found.")]
    NoSuitableDevice,
    #[error("Logical device creation rejected by the driver: {0}")]
    DeviceCreation(vk::ErrorCode),
    #[error("Shader module rejected: {0}")]
    ShaderCompile(String),
    #[error("No memory type matches mask {type_bits:#034b} with properties {properties:?}.")]
    NoSuitableMemoryType {
        type_bits: u32,
        properties: vk::MemoryPropertyFlags,
    },
    #[error("Unsupported image layout transition {old:?} -> {new:?}.")]
    UnsupportedLayoutTransition {
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    },
    #[error("Format {0:?} does not support linear blitting.")]
    UnsupportedBlitFormat(vk::Format),
    #[error("Descriptor pool capacity is zero ({frames} frames x {models} models).")]
    DescriptorPoolExhausted { frames: usize, models: usize },
    #[error("Queue submission failed: {0}")]
    QueueSubmit(vk::ErrorCode),
    #[error("Presentation failed: {0}")]
    Present(vk::ErrorCode),
    #[error("No supported depth format.")]
    NoSupportedDepthFormat,
}

/// Failures raised while reading assets from disk.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Cannot read `{path}`: {source}")]
    Unreadable {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Unsupported file extension for `{0}`.")]
    UnsupportedExtension(PathBuf),
    #[error("Malformed geometry in `{path}`: {reason}")]
    MalformedGeometry { path: PathBuf, reason: String },
    #[error("Cannot decode texture `{path}`: {reason}")]
    Texture { path: PathBuf, reason: String },
}
