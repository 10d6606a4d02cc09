//! Uniform blocks shared with the WGSL shaders.
//!
//! Layouts mirror `shaders/common.wgsl`; every field is a 16-byte multiple so
//! `#[repr(C)]` matches WGSL's uniform layout rules.

use bytemuck::{Pod, Zeroable};
use glam::{Mat3, Mat4, Vec3, Vec4};
use xviz_scene::{Light, Material};

use crate::constants::{MAX_BONES, MAX_LIGHTS_PER_CATEGORY};

/// One light in view space (176 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct LightUniform {
    /// View-space position, w = 1.
    pub position: [f32; 4],
    /// Directional: unit vector toward the light. Spot: cone axis.
    pub direction: [f32; 4],
    pub ambient: [f32; 4],
    pub diffuse: [f32; 4],
    pub specular: [f32; 4],
    /// x = constant, y = linear, z = quadratic.
    pub attenuation: [f32; 4],
    /// x = cos(inner cutoff), y = cos(outer cutoff), z = shadow bias, w = shadow unit.
    pub params: [f32; 4],
    /// World space to shadow clip space.
    pub light_space: [[f32; 4]; 4],
}

impl LightUniform {
    /// Transforms a node-space light into view space.
    pub fn new(
        light: &Light,
        global: &Mat4,
        view: &Mat4,
        light_space: Mat4,
        shadow_unit: Option<u32>,
    ) -> Self {
        let to_view = *view * *global;
        let colors = light.colors();
        let (position, direction, attenuation, cone) = match light {
            Light::Directional(l) => (
                l.position,
                to_view.transform_vector3(l.position - l.target).normalize_or_zero(),
                [1.0, 0.0, 0.0, 0.0],
                [-1.0, -1.0],
            ),
            Light::Point(l) => (
                l.position,
                Vec3::ZERO,
                [l.attenuation.constant, l.attenuation.linear, l.attenuation.quadratic, 0.0],
                [-1.0, -1.0],
            ),
            Light::Spot(l) => (
                l.position,
                to_view.transform_vector3(l.direction).normalize_or_zero(),
                [l.attenuation.constant, l.attenuation.linear, l.attenuation.quadratic, 0.0],
                [l.inner_cutoff.cos(), l.outer_cutoff.cos()],
            ),
        };
        let position = to_view.transform_point3(position);
        Self {
            position: position.extend(1.0).to_array(),
            direction: direction.extend(0.0).to_array(),
            ambient: colors.ambient.extend(1.0).to_array(),
            diffuse: colors.diffuse.extend(1.0).to_array(),
            specular: colors.specular.extend(1.0).to_array(),
            attenuation,
            params: [
                cone[0],
                cone[1],
                light.shadow().bias,
                shadow_unit.map(|u| u as f32).unwrap_or(-1.0),
            ],
            light_space: light_space.to_cols_array_2d(),
        }
    }
}

impl Default for LightUniform {
    fn default() -> Self {
        Self::zeroed()
    }
}

/// Lights of the frame, slotted by category.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct FrameUniforms {
    pub directional: [LightUniform; MAX_LIGHTS_PER_CATEGORY],
    pub spot: [LightUniform; MAX_LIGHTS_PER_CATEGORY],
    pub point: [LightUniform; MAX_LIGHTS_PER_CATEGORY],
}

impl Default for FrameUniforms {
    fn default() -> Self {
        Self::zeroed()
    }
}

/// Per-draw transforms, material parameters and bone palette.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct DrawUniforms {
    /// `projection * view * model`, or `light_space * model` in shadow passes.
    pub mvp: [[f32; 4]; 4],
    pub mv: [[f32; 4]; 4],
    pub model: [[f32; 4]; 4],
    /// Inverse-transpose of the upper 3x3 of `mv`, columns padded to vec4.
    pub normal_matrix: [[f32; 4]; 3],
    pub ambient: [f32; 4],
    /// rgb + opacity
    pub diffuse: [f32; 4],
    /// rgb + shininess
    pub specular: [f32; 4],
    pub params: [f32; 4],
    pub bones: [[[f32; 4]; 4]; MAX_BONES],
}

impl Default for DrawUniforms {
    fn default() -> Self {
        let mut uniforms = Self::zeroed();
        uniforms.set_transforms(&Mat4::IDENTITY, &Mat4::IDENTITY, &Mat4::IDENTITY);
        uniforms.bones = [Mat4::IDENTITY.to_cols_array_2d(); MAX_BONES];
        uniforms
    }
}

impl DrawUniforms {
    /// Color pass transforms for a drawable at `model`.
    pub fn new(model: &Mat4, view: &Mat4, projection: &Mat4) -> Self {
        let mut uniforms = Self::default();
        uniforms.set_transforms(model, view, projection);
        uniforms
    }

    /// Shadow pass transforms: only `mvp` and `model` matter.
    pub fn shadow(model: &Mat4, light_space: &Mat4) -> Self {
        let mut uniforms = Self::default();
        uniforms.mvp = (*light_space * *model).to_cols_array_2d();
        uniforms.model = model.to_cols_array_2d();
        uniforms
    }

    fn set_transforms(&mut self, model: &Mat4, view: &Mat4, projection: &Mat4) {
        let mv = *view * *model;
        self.mvp = (*projection * mv).to_cols_array_2d();
        self.mv = mv.to_cols_array_2d();
        self.model = model.to_cols_array_2d();
        self.normal_matrix = normal_matrix(&mv);
    }

    /// Fills the material block. Unlit materials put their color in `diffuse`.
    pub fn set_material(&mut self, material: &Material) {
        match material {
            Material::Phong(m) => {
                self.ambient = m.ambient.extend(1.0).to_array();
                self.diffuse = m.diffuse.extend(m.opacity).to_array();
                self.specular = m.specular.extend(m.shininess).to_array();
            }
            Material::Constant(m) => self.diffuse = m.color.to_array(),
            Material::PerVertexColor(m) => self.diffuse = [1.0, 1.0, 1.0, m.opacity],
            Material::Wireframe(m) => self.diffuse = m.line_color.to_array(),
        }
    }

    /// Unlit color override, used for wireframe fills.
    pub fn set_color(&mut self, color: Vec4) {
        self.diffuse = color.to_array();
    }

    /// Copies bone matrices; extra bones beyond the palette are ignored.
    pub fn set_bones(&mut self, bones: &[Mat4]) {
        for (slot, bone) in self.bones.iter_mut().zip(bones) {
            *slot = bone.to_cols_array_2d();
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

/// Inverse-transpose of the upper 3x3 of `mv`.
pub fn normal_matrix(mv: &Mat4) -> [[f32; 4]; 3] {
    let m = Mat3::from_mat4(*mv);
    let n = if m.determinant().abs() > f32::EPSILON {
        m.inverse().transpose()
    } else {
        m
    };
    [
        n.x_axis.extend(0.0).to_array(),
        n.y_axis.extend(0.0).to_array(),
        n.z_axis.extend(0.0).to_array(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use xviz_scene::DirectionalLight;

    #[test]
    fn test_struct_sizes_match_wgsl() {
        assert_eq!(std::mem::size_of::<LightUniform>(), 176);
        assert_eq!(std::mem::size_of::<FrameUniforms>(), 176 * 12);
        assert_eq!(std::mem::size_of::<DrawUniforms>(), 304 + 64 * MAX_BONES);
    }

    #[test]
    fn test_mvp_is_projection_view_model() {
        let model = Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0));
        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 10.0), Vec3::ZERO, Vec3::Y);
        let projection = Mat4::perspective_rh(1.0, 1.5, 0.1, 100.0);
        let u = DrawUniforms::new(&model, &view, &projection);
        let expected = (projection * view * model).to_cols_array();
        for (got, want) in u.mvp.as_flattened().iter().zip(expected) {
            assert_relative_eq!(*got, want, epsilon = 1e-5);
        }
        assert_eq!(u.mv, (view * model).to_cols_array_2d());
    }

    #[test]
    fn test_normal_matrix_undoes_nonuniform_scale() {
        let mv = Mat4::from_scale(Vec3::new(2.0, 1.0, 1.0));
        let n = normal_matrix(&mv);
        assert_relative_eq!(n[0][0], 0.5);
        assert_relative_eq!(n[1][1], 1.0);
    }

    #[test]
    fn test_directional_light_in_view_space() {
        let light = Light::Directional(DirectionalLight {
            position: Vec3::new(0.0, 0.0, 5.0),
            target: Vec3::ZERO,
            ..Default::default()
        });
        // Camera looking down -Z from +X: world +Z becomes view -X.
        let view = Mat4::look_at_rh(Vec3::new(5.0, 0.0, 0.0), Vec3::ZERO, Vec3::Y);
        let u = LightUniform::new(&light, &Mat4::IDENTITY, &view, Mat4::IDENTITY, None);
        assert_relative_eq!(u.direction[0], -1.0, epsilon = 1e-5);
        assert_eq!(u.params[3], -1.0);
    }
}
