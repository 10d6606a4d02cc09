//! xviz Renderer
//!
//! Forward, multi-light, shadow-mapped rendering of [`xviz_scene`] trees.
//!
//! # Architecture
//!
//! - [`backend::GpuBackend`] - device seam; [`backend::WgpuBackend`] implements it on wgpu
//! - [`resources::MeshCache`] - GPU buffers per geometry with partial updates and deferred deletion
//! - [`resources::TextureCache`] - decoded images uploaded once, URI images loaded off-thread
//! - [`program::ProgramCache`] - shader permutations compiled once per key
//! - [`shadow_map::ShadowMap`] - depth target rendered from a light
//! - [`renderer::Renderer`] - per-frame light collection, shadow passes and color pass
//!
//! # Example
//!
//! ```ignore
//! use xviz_renderer::{Renderer, RendererConfig, WgpuBackend};
//!
//! let backend = WgpuBackend::new(device, queue, color_format);
//! let mut renderer = Renderer::new(backend, RendererConfig::default());
//!
//! renderer.backend_mut().set_default_target(view, width, height);
//! let stats = renderer.render(&scene, &camera, true)?;
//! ```

pub mod backend;
pub mod config;
pub mod constants;
pub mod error;
pub mod lights;
pub mod program;
pub mod renderer;
pub mod resources;
pub mod shadow_map;
pub mod uniforms;

pub use backend::{GpuBackend, WgpuBackend};
pub use config::RendererConfig;
pub use error::{ConfigError, GpuError, RenderError, TextureError};
pub use program::{PermutationParams, ProgramCache, ProgramKind};
pub use renderer::{DepthBuffer, FrameState, FrameStats, Renderer};
pub use resources::{FileFetcher, ImageFetcher, MeshCache, TextureCache};
