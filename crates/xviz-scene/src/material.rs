//! Surface materials.
//!
//! Materials form a closed set; the renderer matches on [`Material`] to pick
//! a shader program and fill its parameters.

use glam::{Vec3, Vec4};
use serde::{Deserialize, Serialize};

use crate::image::Texture2D;

/// Which faces of a surface are drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Side {
    #[default]
    Front,
    Back,
    Both,
}

/// Material variant tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MaterialKind {
    Phong,
    Constant,
    PerVertexColor,
    Wireframe,
}

/// Lit material with ambient, diffuse and specular terms.
#[derive(Debug, Clone, PartialEq)]
pub struct PhongMaterial {
    pub ambient: Vec3,
    pub diffuse: Vec3,
    pub specular: Vec3,
    pub shininess: f32,
    pub opacity: f32,
    pub diffuse_map: Option<Texture2D>,
    /// Carried for exporters; not sampled by the built-in shaders.
    pub specular_map: Option<Texture2D>,
    pub side: Side,
}

impl Default for PhongMaterial {
    fn default() -> Self {
        Self::with_color(Vec3::splat(0.5))
    }
}

impl PhongMaterial {
    /// Material whose ambient and diffuse colors are both `color`.
    pub fn with_color(color: Vec3) -> Self {
        Self {
            ambient: color,
            diffuse: color,
            specular: Vec3::ZERO,
            shininess: 1.0,
            opacity: 1.0,
            diffuse_map: None,
            specular_map: None,
            side: Side::Front,
        }
    }

    pub fn with_specular(mut self, specular: Vec3, shininess: f32) -> Self {
        self.specular = specular;
        self.shininess = shininess;
        self
    }

    pub fn with_diffuse_map(mut self, texture: Texture2D) -> Self {
        self.diffuse_map = Some(texture);
        self
    }

    pub fn with_side(mut self, side: Side) -> Self {
        self.side = side;
        self
    }
}

/// Unlit single color.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstantMaterial {
    pub color: Vec4,
    pub side: Side,
}

/// Unlit color taken from the geometry's color attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct PerVertexColorMaterial {
    pub opacity: f32,
    pub side: Side,
}

/// Triangle edges drawn as lines, with an optional solid fill.
#[derive(Debug, Clone, PartialEq)]
pub struct WireframeMaterial {
    pub line_color: Vec4,
    /// A fully transparent fill disables the fill draw.
    pub fill_color: Vec4,
    /// Hint only; line rasterization width is backend-defined.
    pub line_width: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Material {
    Phong(PhongMaterial),
    Constant(ConstantMaterial),
    PerVertexColor(PerVertexColorMaterial),
    Wireframe(WireframeMaterial),
}

impl Default for Material {
    fn default() -> Self {
        Material::Phong(PhongMaterial::default())
    }
}

impl Material {
    pub fn constant(color: Vec4) -> Self {
        Material::Constant(ConstantMaterial {
            color,
            side: Side::Front,
        })
    }

    pub fn per_vertex_color(opacity: f32) -> Self {
        Material::PerVertexColor(PerVertexColorMaterial {
            opacity,
            side: Side::Front,
        })
    }

    pub fn wireframe(line_color: Vec4) -> Self {
        Material::Wireframe(WireframeMaterial {
            line_color,
            fill_color: Vec4::ZERO,
            line_width: 1.0,
        })
    }

    pub fn kind(&self) -> MaterialKind {
        match self {
            Material::Phong(_) => MaterialKind::Phong,
            Material::Constant(_) => MaterialKind::Constant,
            Material::PerVertexColor(_) => MaterialKind::PerVertexColor,
            Material::Wireframe(_) => MaterialKind::Wireframe,
        }
    }

    /// Faces that should be drawn. Wireframes are always two-sided.
    pub fn side(&self) -> Side {
        match self {
            Material::Phong(m) => m.side,
            Material::Constant(m) => m.side,
            Material::PerVertexColor(m) => m.side,
            Material::Wireframe(_) => Side::Both,
        }
    }

    pub fn opacity(&self) -> f32 {
        match self {
            Material::Phong(m) => m.opacity,
            Material::Constant(m) => m.color.w,
            Material::PerVertexColor(m) => m.opacity,
            Material::Wireframe(m) => m.line_color.w,
        }
    }

    pub fn diffuse_map(&self) -> Option<&Texture2D> {
        match self {
            Material::Phong(m) => m.diffuse_map.as_ref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_mid_gray_phong() {
        let Material::Phong(m) = Material::default() else {
            panic!("default material should be Phong");
        };
        assert_eq!(m.diffuse, Vec3::splat(0.5));
        assert_eq!(m.side, Side::Front);
        assert_eq!(m.opacity, 1.0);
    }

    #[test]
    fn test_wireframe_is_two_sided() {
        let m = Material::wireframe(Vec4::ONE);
        assert_eq!(m.kind(), MaterialKind::Wireframe);
        assert_eq!(m.side(), Side::Both);
    }
}
