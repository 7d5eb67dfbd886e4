// Renderer error taxonomy
//
// Startup failures abort initialization, runtime failures abort the render
// loop. Out-of-date/suboptimal swapchains never become errors: the frame
// loop recreates the chain instead.

use ash::vk;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RendererError {
    #[error("validation layers requested but not available: {}", .missing.join(", "))]
    ValidationUnavailable { missing: Vec<String> },

    #[error("required instance extension not available: {0}")]
    MissingInstanceExtension(String),

    #[error("unsupported window or display handle for surface creation")]
    UnsupportedWindow,

    #[error("failed to find a suitable GPU")]
    NoSuitableDevice,

    #[error("no memory type matches filter {type_filter:#b} with properties {properties:?}")]
    NoSuitableMemoryType {
        type_filter: u32,
        properties: vk::MemoryPropertyFlags,
    },

    #[error("failed to read asset {path:?}")]
    AssetLoad {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to acquire swapchain image: {0}")]
    Acquire(vk::Result),

    #[error("failed to submit draw command buffer: {0}")]
    Submit(vk::Result),

    #[error("failed to present swapchain image: {0}")]
    Present(vk::Result),
}
