//! xviz scene model
//!
//! Passive scene entities consumed by the renderer. Nothing here knows about
//! the GPU.
//!
//! - [`node::Node`] - scene tree with local transforms, lights and drawables
//! - [`geometry::Geometry`] - vertex attributes with per-attribute dirty flags
//! - [`material::Material`] - Phong, constant, per-vertex color and wireframe
//! - [`light::Light`] - directional, point and spot lights
//! - [`camera::Camera`] - projection, view and viewport

pub mod camera;
pub mod error;
pub mod geometry;
pub mod image;
pub mod light;
pub mod material;
pub mod node;

pub use camera::{Camera, Projection, Viewport};
pub use error::SceneError;
pub use geometry::{
    Aabb, ArcParams, Bone, BoneWeight, DirtyFlags, Geometry, GeometryId, GeometryRef, MAX_BONE_INFLUENCES,
    MAX_UV_CHANNELS, PrimitiveType, SlotKey,
};
pub use image::{FilterMode, Image, ImageId, ImageSource, PixelFormat, Sampler2D, Texture2D, WrapMode};
pub use light::{
    Attenuation, DirectionalLight, Light, LightColors, LightKind, PointLight, ShadowCamera,
    ShadowSettings, SpotLight,
};
pub use material::{
    ConstantMaterial, Material, MaterialKind, PerVertexColorMaterial, PhongMaterial, Side,
    WireframeMaterial,
};
pub use node::{Drawable, Node};
