//! Renderer error types.

use ash::vk;
use thiserror::Error;

/// Errors that can occur in the rendering core.
///
/// Recoverable conditions (unknown shader parameters, array overflows) are
/// reported as [`BindingWarning`](crate::bind::BindingWarning) values instead
/// and never surface here.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    /// A timeline or device wait did not complete.
    #[error("device wait failed: {0:?}")]
    DeviceWait(vk::Result),
    /// GPU memory allocation failed.
    #[error("allocation failed: {0}")]
    Allocation(String),
    /// Descriptor allocation failed even after growing the pool chain.
    #[error("descriptor pool exhausted")]
    DescriptorPoolExhausted,
    /// Shader or pipeline compilation failed.
    #[error("pipeline compilation failed: {0}")]
    PipelineCompile(String),
    /// An invalid parameter was provided.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    /// A Vulkan call failed.
    #[error("vulkan call failed: {0:?}")]
    Vulkan(#[from] vk::Result),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RenderError::DescriptorPoolExhausted;
        assert_eq!(err.to_string(), "descriptor pool exhausted");

        let err = RenderError::PipelineCompile("bad entry point".to_string());
        assert_eq!(err.to_string(), "pipeline compilation failed: bad entry point");
    }

    #[test]
    fn test_from_vk_result() {
        let err = RenderError::from(vk::Result::ERROR_DEVICE_LOST);
        assert_eq!(err, RenderError::Vulkan(vk::Result::ERROR_DEVICE_LOST));
    }
}
