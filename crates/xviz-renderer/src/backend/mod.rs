//! GPU device abstraction.
//!
//! Caches and the renderer talk to the device only through [`GpuBackend`],
//! which keeps resource bookkeeping testable without a GPU. Resources are
//! addressed by opaque ids owned by the backend.

mod gpu_resources;
#[cfg(test)]
pub(crate) mod mock;
mod wgpu_backend;

pub use wgpu_backend::WgpuBackend;

use xviz_scene::{FilterMode, Viewport, WrapMode};

use crate::error::GpuError;

/// Handle to a vertex or index buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

/// Handle to a sampled color texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(pub u64);

/// Handle to a depth-only render target that can also be sampled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DepthTargetId(pub u64);

/// Handle to a compiled shader program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProgramId(pub u64);

/// Per-vertex inputs, each stored in its own buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VertexAttribute {
    Position,
    Normal,
    Color,
    TexCoord0,
    TexCoord1,
    BoneIds,
    BoneWeights,
}

impl VertexAttribute {
    /// Shader input location.
    pub fn location(self) -> u32 {
        match self {
            VertexAttribute::Position => 0,
            VertexAttribute::Normal => 1,
            VertexAttribute::Color => 2,
            VertexAttribute::TexCoord0 => 3,
            VertexAttribute::TexCoord1 => 4,
            VertexAttribute::BoneIds => 5,
            VertexAttribute::BoneWeights => 6,
        }
    }

    /// Bytes per vertex.
    pub fn stride(self) -> u64 {
        match self {
            VertexAttribute::Position | VertexAttribute::Normal => 12,
            VertexAttribute::Color | VertexAttribute::BoneIds | VertexAttribute::BoneWeights => 16,
            VertexAttribute::TexCoord0 | VertexAttribute::TexCoord1 => 8,
        }
    }

    pub fn format(self) -> wgpu::VertexFormat {
        match self {
            VertexAttribute::Position | VertexAttribute::Normal => wgpu::VertexFormat::Float32x3,
            VertexAttribute::Color | VertexAttribute::BoneWeights => wgpu::VertexFormat::Float32x4,
            VertexAttribute::TexCoord0 | VertexAttribute::TexCoord1 => wgpu::VertexFormat::Float32x2,
            VertexAttribute::BoneIds => wgpu::VertexFormat::Uint32x4,
        }
    }

    pub fn tex_coord(channel: usize) -> Option<Self> {
        match channel {
            0 => Some(VertexAttribute::TexCoord0),
            1 => Some(VertexAttribute::TexCoord1),
            _ => None,
        }
    }
}

/// What a buffer holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    Vertex(VertexAttribute),
    /// `u32` indices.
    Index,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topology {
    Triangles,
    Lines,
    Points,
}

/// Faces removed by the rasterizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CullMode {
    None,
    Front,
    Back,
}

/// RGBA8 texture upload description.
#[derive(Debug, Clone, PartialEq)]
pub struct TextureDesc {
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub wrap_u: WrapMode,
    pub wrap_v: WrapMode,
    pub min_filter: FilterMode,
    pub mag_filter: FilterMode,
}

/// Render pass a program is written for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassKind {
    /// Lit or unlit color output with depth testing.
    Color,
    /// Depth only, no fragment output.
    Depth,
}

/// Shader program source plus its vertex inputs.
#[derive(Debug, Clone)]
pub struct ProgramDescriptor<'a> {
    pub label: &'a str,
    /// Complete WGSL source with `vs_main` and, for color passes, `fs_main`.
    pub source: &'a str,
    pub attributes: &'a [VertexAttribute],
    pub pass: PassKind,
}

/// Where a render pass draws.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PassTarget {
    /// The host-provided target; depth is always cleared.
    Default {
        viewport: Viewport,
        clear_color: Option<[f32; 4]>,
    },
    /// A depth target, cleared to 1.0.
    Depth(DepthTargetId),
}

/// One draw call with everything it binds.
#[derive(Debug, Clone)]
pub struct DrawCall<'a> {
    pub program: ProgramId,
    pub topology: Topology,
    pub cull: CullMode,
    pub vertex_buffers: &'a [(VertexAttribute, BufferId)],
    pub index_buffer: Option<BufferId>,
    /// Vertices drawn, or indices when `index_buffer` is set.
    pub count: u32,
    /// Vertices in the bound buffers; sizes fallbacks for missing attributes.
    pub vertex_count: u32,
    /// Bytes of the per-draw uniform block.
    pub uniforms: &'a [u8],
    pub diffuse_texture: Option<TextureId>,
    /// Shadow maps by texture unit.
    pub shadow_maps: &'a [(u32, DepthTargetId)],
}

/// Device operations needed by the renderer.
///
/// Passes are strictly sequential: `begin_pass`, any number of `draw`s,
/// `end_pass`. Frame uniforms set before a color pass stay bound for it.
pub trait GpuBackend {
    fn create_buffer(&mut self, kind: BufferKind, contents: &[u8]) -> Result<BufferId, GpuError>;

    /// Overwrites a buffer from offset zero. `contents` must fit the buffer.
    fn write_buffer(&mut self, id: BufferId, contents: &[u8]) -> Result<(), GpuError>;

    fn destroy_buffer(&mut self, id: BufferId);

    fn create_texture(&mut self, desc: &TextureDesc, rgba: &[u8]) -> Result<TextureId, GpuError>;

    fn destroy_texture(&mut self, id: TextureId);

    fn create_depth_target(&mut self, width: u32, height: u32) -> Result<DepthTargetId, GpuError>;

    fn destroy_depth_target(&mut self, id: DepthTargetId);

    fn compile_program(&mut self, desc: &ProgramDescriptor<'_>) -> Result<ProgramId, GpuError>;

    fn set_frame_uniforms(&mut self, contents: &[u8]) -> Result<(), GpuError>;

    fn begin_pass(&mut self, target: PassTarget) -> Result<(), GpuError>;

    fn draw(&mut self, call: &DrawCall<'_>) -> Result<(), GpuError>;

    /// Finishes the pass and submits it; drawing returns to the default target.
    fn end_pass(&mut self) -> Result<(), GpuError>;

    /// Size of the default render target in pixels.
    fn default_target_size(&self) -> (u32, u32);

    /// Raw depth values of the default target, row-major from the top-left
    /// pixel. Must not be called while a pass is active.
    fn read_depth(&mut self) -> Result<Vec<f32>, GpuError>;
}
