//! Viewing camera: projection, view transform and viewport.

use glam::{Mat4, Vec2, Vec3, Vec4};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Projection {
    /// `yfov` in radians.
    Perspective {
        yfov: f32,
        aspect: f32,
        znear: f32,
        zfar: f32,
    },
    Orthographic {
        left: f32,
        right: f32,
        bottom: f32,
        top: f32,
        znear: f32,
        zfar: f32,
    },
}

impl Default for Projection {
    fn default() -> Self {
        Projection::Perspective {
            yfov: 45_f32.to_radians(),
            aspect: 1.0,
            znear: 0.01,
            zfar: 100.0,
        }
    }
}

impl Projection {
    pub fn near_far(&self) -> (f32, f32) {
        match *self {
            Projection::Perspective { znear, zfar, .. } | Projection::Orthographic { znear, zfar, .. } => {
                (znear, zfar)
            }
        }
    }

    /// Distance along the view axis for a depth buffer value in [0, 1].
    pub fn linear_depth(&self, depth: f32) -> f32 {
        let (near, far) = self.near_far();
        match self {
            Projection::Perspective { .. } => near * far / (far - depth * (far - near)),
            Projection::Orthographic { .. } => near + depth * (far - near),
        }
    }
}

/// Pixel rectangle of the render target, origin at the top-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Viewport {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn aspect(&self) -> f32 {
        if self.height == 0 {
            1.0
        } else {
            self.width as f32 / self.height as f32
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Camera {
    pub projection: Projection,
    view: Mat4,
    pub viewport: Viewport,
    pub background: Vec4,
}

impl Default for Camera {
    fn default() -> Self {
        Self::new(Projection::default())
    }
}

impl Camera {
    pub fn new(projection: Projection) -> Self {
        Self {
            projection,
            view: Mat4::IDENTITY,
            viewport: Viewport::default(),
            background: Vec4::new(0.0, 0.0, 0.0, 1.0),
        }
    }

    pub fn perspective(yfov: f32, aspect: f32, znear: f32, zfar: f32) -> Self {
        Self::new(Projection::Perspective {
            yfov,
            aspect,
            znear,
            zfar,
        })
    }

    pub fn orthographic(left: f32, right: f32, bottom: f32, top: f32, znear: f32, zfar: f32) -> Self {
        Self::new(Projection::Orthographic {
            left,
            right,
            bottom,
            top,
            znear,
            zfar,
        })
    }

    pub fn with_background(mut self, color: Vec4) -> Self {
        self.background = color;
        self
    }

    pub fn view_matrix(&self) -> Mat4 {
        self.view
    }

    pub fn set_view_matrix(&mut self, view: Mat4) {
        self.view = view;
    }

    /// Places the camera at `eye` looking at `center`.
    pub fn look_at(&mut self, eye: Vec3, center: Vec3, up: Vec3) {
        self.view = Mat4::look_at_rh(eye, center, up);
    }

    /// Camera position in world space.
    pub fn eye(&self) -> Vec3 {
        self.view.inverse().transform_point3(Vec3::ZERO)
    }

    pub fn projection_matrix(&self) -> Mat4 {
        match self.projection {
            Projection::Perspective {
                yfov,
                aspect,
                znear,
                zfar,
            } => Mat4::perspective_rh(yfov, aspect, znear, zfar),
            Projection::Orthographic {
                left,
                right,
                bottom,
                top,
                znear,
                zfar,
            } => Mat4::orthographic_rh(left, right, bottom, top, znear, zfar),
        }
    }

    /// Sets the viewport and, for perspective cameras, matches the aspect ratio.
    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.viewport = viewport;
        if !viewport.is_empty() {
            self.set_aspect(viewport.aspect());
        }
    }

    pub fn set_aspect(&mut self, ratio: f32) {
        if let Projection::Perspective { aspect, .. } = &mut self.projection {
            *aspect = ratio;
        }
    }

    /// Moves the camera along its current viewing direction so that a sphere
    /// fits in the vertical field of view.
    pub fn view_sphere(&mut self, center: Vec3, radius: f32) {
        let inv = self.view.inverse();
        let forward = inv.transform_vector3(Vec3::NEG_Z).normalize_or(Vec3::NEG_Z);
        let up = inv.transform_vector3(Vec3::Y).normalize_or(Vec3::Y);
        let distance = match self.projection {
            Projection::Perspective { yfov, .. } => radius / (yfov * 0.5).sin(),
            Projection::Orthographic { .. } => radius * 2.0,
        };
        self.look_at(center - forward * distance, center, up);
    }

    /// Maps a world point to window coordinates (y down) within the viewport.
    pub fn project(&self, point: Vec3) -> Vec2 {
        project_point(&(self.projection_matrix() * self.view), &self.viewport, point)
    }
}

/// Maps a world point through `view_proj` to window coordinates in `viewport`.
pub fn project_point(view_proj: &Mat4, viewport: &Viewport, point: Vec3) -> Vec2 {
    let ndc = view_proj.project_point3(point);
    let x = viewport.x as f32 + (ndc.x + 1.0) * 0.5 * viewport.width as f32;
    let y = viewport.y as f32 + (1.0 - (ndc.y + 1.0) * 0.5) * viewport.height as f32;
    Vec2::new(x, y)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn test_camera() -> Camera {
        let mut camera = Camera::default();
        camera.set_viewport(Viewport::new(0, 0, 800, 600));
        camera.look_at(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, Vec3::Y);
        camera
    }

    #[test]
    fn test_project_center_and_up() {
        let camera = test_camera();
        let center = camera.project(Vec3::ZERO);
        assert_relative_eq!(center.x, 400.0, epsilon = 1e-3);
        assert_relative_eq!(center.y, 300.0, epsilon = 1e-3);

        // World up maps to smaller window y.
        let above = camera.project(Vec3::new(0.0, 1.0, 0.0));
        assert!(above.y < 300.0);
    }

    #[test]
    fn test_eye_position() {
        let camera = test_camera();
        assert_relative_eq!(camera.eye().z, 5.0, epsilon = 1e-5);
    }

    #[test]
    fn test_viewport_sets_aspect() {
        let camera = test_camera();
        let Projection::Perspective { aspect, .. } = camera.projection else {
            panic!("expected perspective");
        };
        assert_relative_eq!(aspect, 800.0 / 600.0);
    }

    #[test]
    fn test_view_sphere_keeps_direction() {
        let mut camera = test_camera();
        camera.view_sphere(Vec3::new(1.0, 0.0, 0.0), 2.0);
        let eye = camera.eye();
        assert_relative_eq!(eye.x, 1.0, epsilon = 1e-4);
        assert!(eye.z > 2.0);
    }

    #[test]
    fn test_linear_depth_spans_near_to_far() {
        let perspective = Projection::Perspective {
            yfov: 1.0,
            aspect: 1.0,
            znear: 0.5,
            zfar: 50.0,
        };
        assert_relative_eq!(perspective.linear_depth(0.0), 0.5, epsilon = 1e-5);
        assert_relative_eq!(perspective.linear_depth(1.0), 50.0, epsilon = 1e-3);

        // Depth written by the projection maps back to the view distance.
        let projected = Mat4::perspective_rh(1.0, 1.0, 0.5, 50.0).project_point3(Vec3::new(0.0, 0.0, -10.0));
        assert_relative_eq!(perspective.linear_depth(projected.z), 10.0, epsilon = 1e-3);

        let ortho = Projection::Orthographic {
            left: -1.0,
            right: 1.0,
            bottom: -1.0,
            top: 1.0,
            znear: 1.0,
            zfar: 11.0,
        };
        assert_relative_eq!(ortho.linear_depth(0.5), 6.0, epsilon = 1e-5);
    }
}
