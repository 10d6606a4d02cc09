//! GPU resource caches.
//!
//! Meshes and textures are uploaded on first use and owned by their cache;
//! scene objects only carry identities that lead back to them.

mod mesh;
mod texture;

pub use mesh::*;
pub use texture::*;
