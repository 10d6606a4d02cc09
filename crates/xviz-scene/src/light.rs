//! Light sources with optional shadow mapping.

use glam::{Mat4, Vec3};
use serde::{Deserialize, Serialize};

/// Ambient, diffuse and specular contribution of a light.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LightColors {
    pub ambient: Vec3,
    pub diffuse: Vec3,
    pub specular: Vec3,
}

impl Default for LightColors {
    fn default() -> Self {
        Self {
            ambient: Vec3::splat(0.1),
            diffuse: Vec3::ONE,
            specular: Vec3::ONE,
        }
    }
}

/// Distance attenuation `1 / (constant + linear * d + quadratic * d^2)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Attenuation {
    pub constant: f32,
    pub linear: f32,
    pub quadratic: f32,
}

impl Default for Attenuation {
    fn default() -> Self {
        Self {
            constant: 1.0,
            linear: 0.0,
            quadratic: 0.0,
        }
    }
}

impl Attenuation {
    pub fn at(&self, distance: f32) -> f32 {
        1.0 / (self.constant + self.linear * distance + self.quadratic * distance * distance)
    }
}

/// Volume covered by a light's shadow map, in light view space.
///
/// `left/right/top/bottom` bound the orthographic box of directional lights;
/// `near/far` clip every light type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShadowCamera {
    pub left: f32,
    pub right: f32,
    pub top: f32,
    pub bottom: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for ShadowCamera {
    fn default() -> Self {
        Self {
            left: -5.0,
            right: 5.0,
            top: 5.0,
            bottom: -5.0,
            near: 0.01,
            far: 500.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShadowSettings {
    pub casts_shadows: bool,
    /// Depth offset subtracted before the shadow comparison to avoid acne.
    pub bias: f32,
    pub camera: ShadowCamera,
}

impl Default for ShadowSettings {
    fn default() -> Self {
        Self {
            casts_shadows: false,
            bias: 0.005,
            camera: ShadowCamera::default(),
        }
    }
}

/// Parallel light travelling from `position` toward `target`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DirectionalLight {
    pub position: Vec3,
    pub target: Vec3,
    pub colors: LightColors,
    pub shadow: ShadowSettings,
}

impl Default for DirectionalLight {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 0.0, 1.0),
            target: Vec3::ZERO,
            colors: LightColors::default(),
            shadow: ShadowSettings::default(),
        }
    }
}

impl DirectionalLight {
    /// Direction pointing toward the light (not normalized for degenerate input).
    pub fn direction(&self) -> Vec3 {
        (self.position - self.target).normalize_or_zero()
    }
}

/// Omnidirectional light.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointLight {
    pub position: Vec3,
    pub attenuation: Attenuation,
    pub colors: LightColors,
    pub shadow: ShadowSettings,
    /// Point the single shadow frustum looks at.
    pub shadow_target: Vec3,
}

impl Default for PointLight {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            attenuation: Attenuation::default(),
            colors: LightColors::default(),
            shadow: ShadowSettings::default(),
            shadow_target: Vec3::ZERO,
        }
    }
}

/// Cone light. Cutoff angles are half-angles in radians.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpotLight {
    pub position: Vec3,
    pub direction: Vec3,
    pub attenuation: Attenuation,
    pub inner_cutoff: f32,
    pub outer_cutoff: f32,
    pub colors: LightColors,
    pub shadow: ShadowSettings,
}

impl Default for SpotLight {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            direction: Vec3::NEG_Z,
            attenuation: Attenuation::default(),
            inner_cutoff: 12.5_f32.to_radians(),
            outer_cutoff: 17.5_f32.to_radians(),
            colors: LightColors::default(),
            shadow: ShadowSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LightKind {
    Directional,
    Spot,
    Point,
}

/// A light attached to a scene node. Positions and directions are in node space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Light {
    Directional(DirectionalLight),
    Point(PointLight),
    Spot(SpotLight),
}

impl Light {
    pub fn kind(&self) -> LightKind {
        match self {
            Light::Directional(_) => LightKind::Directional,
            Light::Point(_) => LightKind::Point,
            Light::Spot(_) => LightKind::Spot,
        }
    }

    pub fn colors(&self) -> &LightColors {
        match self {
            Light::Directional(l) => &l.colors,
            Light::Point(l) => &l.colors,
            Light::Spot(l) => &l.colors,
        }
    }

    pub fn shadow(&self) -> &ShadowSettings {
        match self {
            Light::Directional(l) => &l.shadow,
            Light::Point(l) => &l.shadow,
            Light::Spot(l) => &l.shadow,
        }
    }

    pub fn shadow_mut(&mut self) -> &mut ShadowSettings {
        match self {
            Light::Directional(l) => &mut l.shadow,
            Light::Point(l) => &mut l.shadow,
            Light::Spot(l) => &mut l.shadow,
        }
    }

    pub fn casts_shadows(&self) -> bool {
        self.shadow().casts_shadows
    }

    /// Enables or disables shadow casting (builder style).
    pub fn with_shadows(mut self, casts_shadows: bool) -> Self {
        self.shadow_mut().casts_shadows = casts_shadows;
        self
    }

    /// Light view matrix in world space, given the owning node's global transform.
    pub fn view_matrix(&self, global: &Mat4) -> Mat4 {
        let (eye, center) = match self {
            Light::Directional(l) => (l.position, l.target),
            Light::Spot(l) => (l.position, l.position + l.direction),
            Light::Point(l) => (l.position, l.shadow_target),
        };
        let eye = global.transform_point3(eye);
        let center = global.transform_point3(center);
        let forward = (center - eye).normalize_or_zero();
        let up = if forward.dot(Vec3::Y).abs() > 0.99 {
            Vec3::Z
        } else {
            Vec3::Y
        };
        Mat4::look_at_rh(eye, center, up)
    }

    /// Shadow projection: orthographic for directional lights, perspective
    /// covering the cone for spots and a 90 degree frustum for point lights.
    pub fn projection_matrix(&self) -> Mat4 {
        let cam = &self.shadow().camera;
        match self {
            Light::Directional(_) => {
                Mat4::orthographic_rh(cam.left, cam.right, cam.bottom, cam.top, cam.near, cam.far)
            }
            Light::Spot(l) => {
                let fov = (2.0 * l.outer_cutoff).clamp(0.01, std::f32::consts::PI - 0.01);
                Mat4::perspective_rh(fov, 1.0, cam.near, cam.far)
            }
            Light::Point(_) => {
                Mat4::perspective_rh(std::f32::consts::FRAC_PI_2, 1.0, cam.near, cam.far)
            }
        }
    }

    /// World space to shadow clip space.
    pub fn light_space_matrix(&self, global: &Mat4) -> Mat4 {
        self.projection_matrix() * self.view_matrix(global)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_directional_direction_points_to_light() {
        let l = DirectionalLight {
            position: Vec3::new(0.0, 0.0, 10.0),
            ..Default::default()
        };
        assert_relative_eq!(l.direction().z, 1.0);
    }

    #[test]
    fn test_attenuation() {
        let a = Attenuation {
            constant: 1.0,
            linear: 0.5,
            quadratic: 0.25,
        };
        assert_relative_eq!(a.at(2.0), 1.0 / 3.0);
    }

    #[test]
    fn test_light_space_maps_target_to_center() {
        let light = Light::Directional(DirectionalLight {
            position: Vec3::new(0.0, 10.0, 0.0),
            target: Vec3::ZERO,
            ..Default::default()
        });
        let clip = light.light_space_matrix(&Mat4::IDENTITY) * Vec3::ZERO.extend(1.0);
        assert_relative_eq!(clip.x, 0.0, epsilon = 1e-5);
        assert_relative_eq!(clip.y, 0.0, epsilon = 1e-5);
        // Ten units in front of the light, inside [0, 1] depth.
        assert!(clip.z > 0.0 && clip.z < 1.0);
    }

    #[test]
    fn test_node_transform_moves_light() {
        let light = Light::Spot(SpotLight::default());
        let global = Mat4::from_translation(Vec3::new(3.0, 0.0, 0.0));
        let view = light.view_matrix(&global);
        let eye_in_view = view.transform_point3(Vec3::new(3.0, 0.0, 0.0));
        assert_relative_eq!(eye_in_view.length(), 0.0, epsilon = 1e-5);
    }
}
