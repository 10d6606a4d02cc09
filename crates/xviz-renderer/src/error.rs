//! Error types of the renderer.

/// Failures reported by a [`crate::backend::GpuBackend`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GpuError {
    #[error("device allocation failed for {0}")]
    Allocation(String),
    #[error("shader compilation failed for {label}: {message}")]
    ShaderCompilation { label: String, message: String },
    #[error("pipeline creation failed: {0}")]
    Pipeline(String),
    #[error("invalid resource handle: {0}")]
    InvalidHandle(String),
    #[error("no render pass is active")]
    NoActivePass,
    #[error("a render pass is already active")]
    PassActive,
    #[error("no default render target has been set")]
    NoTarget,
    #[error("read back failed: {0}")]
    Readback(String),
}

/// Errors that abort a frame.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RenderError {
    #[error("GPU error: {0}")]
    Gpu(#[from] GpuError),
    #[error("shader program {key} failed to compile: {message}")]
    ShaderCompilation { key: String, message: String },
    #[error("a frame is already in progress")]
    FrameInProgress,
    #[error("renderer has been shut down")]
    ShutDown,
}

/// Configuration file errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Serialization error: {0}")]
    Serialize(String),
    #[error("Deserialization error: {0}")]
    Deserialize(String),
}

/// Reasons a texture cannot be produced. These degrade the render; they
/// never abort a frame.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TextureError {
    #[error("failed to fetch {uri}: {message}")]
    Fetch { uri: String, message: String },
    #[error("failed to decode image: {0}")]
    Decode(String),
    #[error("image has no pixels")]
    Empty,
}
