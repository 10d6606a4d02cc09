//! Renderer-wide constants.

/// Lights of one category (directional, spot, point) that fit the uniform arrays.
pub const MAX_LIGHTS_PER_CATEGORY: usize = 4;

/// Shadow maps that can be bound in one color pass.
pub const MAX_SHADOW_MAPS: usize = 4;

/// Bone matrices available to a skinned draw.
pub const MAX_BONES: usize = 64;

/// Shadow map constants.
pub mod shadow {
    /// Depth format used by shadow maps and the default depth buffer.
    pub const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;
    pub const DEFAULT_SIZE: u32 = 2048;
    pub const MIN_SIZE: u32 = 256;
    pub const MAX_SIZE: u32 = 8192;
}

/// Dynamic uniform offsets must be multiples of this.
pub const UNIFORM_ALIGNMENT: u64 = 256;
