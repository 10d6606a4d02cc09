//! Scene model errors.

/// Errors reported while validating scene data.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SceneError {
    #[error("index {index} out of range for {vertex_count} vertices")]
    IndexOutOfRange { index: u32, vertex_count: usize },
    #[error("raw image data has {actual} bytes, expected {expected}")]
    ImageSize { expected: usize, actual: usize },
    #[error("node not found: {0}")]
    NodeNotFound(String),
}
