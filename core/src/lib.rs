//! # Orogen Core
//!
//! GPU-agnostic utilities for the Orogen renderer: timeline-gated object
//! pooling, the scene-graph node tree, and the inspector value model.

pub mod inspect;
pub mod pool;
pub mod scene;

/// Core library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
