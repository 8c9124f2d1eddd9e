use ash::vk;
use thiserror::Error;

/// Fatal renderer conditions a caller may want to tell apart.
///
/// These travel inside a `color_eyre::Report`; match on them with
/// `report.downcast_ref::<GfxError>()`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GfxError {
    #[error("no memory heap can hold an allocation of {size} bytes")]
    NoSuitableMemory { size: u64 },

    #[error("no suitable present mode")]
    NoSuitablePresentMode,

    #[error("no suitable surface color format")]
    NoSuitableColorFormat,

    #[error("no suitable depth format")]
    NoSuitableDepthFormat,

    #[error("no suitable physical device found")]
    NoSuitablePhysicalDevice,

    #[error("{requested} frames in flight requested, surface supports {min}..={max}")]
    UnsupportedFramesInFlight { requested: usize, min: u32, max: u32 },

    #[error("image format {0:?} cannot be sampled and transferred to")]
    UnsupportedImageFormat(vk::Format),

    #[error("unsupported image size {width}x{height}")]
    UnsupportedImageSize { width: u32, height: u32 },

    #[error("waiting for a fence failed: {0}")]
    FenceWaitFailed(vk::Result),

    #[error("failed to acquire the next swapchain image: {0}")]
    AcquireFailed(vk::Result),

    #[error("failed to present: {0}")]
    PresentFailed(vk::Result),

    #[error("shader bytecode is not valid SPIR-V")]
    InvalidShader,
}
