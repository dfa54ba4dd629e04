//! Error type and `Result` alias for the Lumen Vulkan renderer.
//!
//! Everything in this crate that can fail reports a [`VulkanError`]. The
//! taxonomy is deliberately blunt: GPU object creation failures, missing
//! features and allocation failures are not recoverable by this renderer,
//! and the compositor process is expected to log them and terminate.
//! Conditions the renderer absorbs silently (a timestamp pair that is not
//! yet available, a surface with no drawable area) never surface here.

use ash::vk;
use thiserror::Error;

/// Error type for the Vulkan rendering subsystem.
#[derive(Debug, Error)]
pub enum VulkanError {
    /// An error originating directly from a Vulkan API call.
    #[error("Vulkan API error: {0}")]
    VkResult(vk::Result),

    /// A standard I/O error, typically from loading SPIR-V or config files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// General initialization failure of the renderer or one of its parts.
    #[error("initialization error: {0}")]
    Initialization(String),

    /// Creation of a specific Vulkan resource failed.
    #[error("failed to create {resource}: {message}")]
    ResourceCreation { resource: &'static str, message: String },

    /// A required instance or device extension is not available.
    #[error("missing required Vulkan extension: {0}")]
    MissingExtension(String),

    /// No physical device satisfies the renderer's requirements.
    #[error("no suitable physical device found")]
    NoSuitablePhysicalDevice,

    /// No suitable memory type exists for a requested allocation.
    #[error("no suitable memory type (type bits {type_bits:#x}, flags {flags:?})")]
    NoSuitableMemoryType { type_bits: u32, flags: vk::MemoryPropertyFlags },

    /// A staging request exceeded the configured maximum arena buffer size.
    #[error("staging allocation of {requested} bytes exceeds the {max} byte buffer cap")]
    StagingExhausted { requested: u64, max: u64 },

    /// A format needed for an image or attachment is not supported.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// SPIR-V code could not be loaded or is malformed.
    #[error("shader loading error: {0}")]
    ShaderLoading(String),

    /// Graphics pipeline construction failed.
    #[error("pipeline creation error: {0}")]
    PipelineCreation(String),

    /// Renderer config could not be parsed.
    #[error("config error: {0}")]
    Config(String),
}

impl From<vk::Result> for VulkanError {
    fn from(err: vk::Result) -> Self {
        VulkanError::VkResult(err)
    }
}

/// `Result` alias used throughout the renderer.
pub type Result<T, E = VulkanError> = std::result::Result<T, E>;
