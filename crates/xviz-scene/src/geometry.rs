//! Geometry: vertex attributes, indices, skeleton and GPU dirty tracking.

use std::sync::Arc;

use glam::{Mat4, Vec2, Vec3, Vec4};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SceneError;

/// Number of texture-coordinate channels a geometry can carry.
pub const MAX_UV_CHANNELS: usize = 2;

/// Maximum number of bone influences per vertex.
pub const MAX_BONE_INFLUENCES: usize = 4;

/// Elliptical arc in the plane through `center` perpendicular to `normal`.
///
/// Angles are in radians, measured from `axis` toward `normal x axis`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArcParams {
    pub center: Vec3,
    pub normal: Vec3,
    pub axis: Vec3,
    pub radius_a: f32,
    pub radius_b: f32,
    pub min_angle: f32,
    pub max_angle: f32,
    /// Adds the two radii closing the arc into a sector.
    pub sector: bool,
}

impl ArcParams {
    /// Points along the arc, one segment per `step_degrees` (at least one).
    pub fn points(&self, step_degrees: f32) -> Vec<Vec3> {
        let vx = self.axis;
        let vy = self.normal.cross(self.axis);
        let span = self.max_angle - self.min_angle;
        let step = step_degrees.to_radians();
        let steps = if step > 0.0 { (span.abs() / step).round() as u32 } else { 0 }.max(1);
        (0..=steps)
            .map(|i| {
                let angle = self.min_angle + span * i as f32 / steps as f32;
                self.center + vx * (self.radius_a * angle.cos()) + vy * (self.radius_b * angle.sin())
            })
            .collect()
    }
}

/// Geometry shared between drawables.
///
/// The renderer write-locks it briefly when it uploads dirty attributes.
pub type GeometryRef = Arc<RwLock<Geometry>>;

/// Unique identifier of a geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GeometryId(pub Uuid);

impl GeometryId {
    /// Creates a new random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for GeometryId {
    fn default() -> Self {
        Self::new()
    }
}

/// How the index (or vertex) stream is assembled into primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PrimitiveType {
    #[default]
    Triangles,
    Lines,
    Points,
}

/// Generational key of a GPU mesh cache slot.
///
/// Only the mesh cache writes this; a stale generation means the slot was
/// recycled and the key no longer refers to this geometry's buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotKey {
    pub index: u32,
    pub generation: u32,
}

/// Per-attribute "changed since last upload" markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DirtyFlags {
    pub vertices: bool,
    pub normals: bool,
    pub colors: bool,
}

impl DirtyFlags {
    /// Returns true if any attribute is marked.
    pub fn any(&self) -> bool {
        self.vertices || self.normals || self.colors
    }
}

/// Bone influences of a single vertex. Unused slots hold bone `-1`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoneWeight {
    pub bones: [i32; MAX_BONE_INFLUENCES],
    pub weights: [f32; MAX_BONE_INFLUENCES],
}

impl Default for BoneWeight {
    fn default() -> Self {
        Self {
            bones: [-1; MAX_BONE_INFLUENCES],
            weights: [0.0; MAX_BONE_INFLUENCES],
        }
    }
}

impl BoneWeight {
    /// Stores an influence in the first free slot. Ignored when all slots are used.
    pub fn add(&mut self, bone: i32, weight: f32) {
        if let Some(slot) = self.bones.iter().position(|&b| b < 0) {
            self.bones[slot] = bone;
            self.weights[slot] = weight;
        }
    }

    /// Rescales the used weights so they sum to one.
    pub fn normalize(&mut self) {
        let total: f32 = self
            .bones
            .iter()
            .zip(self.weights.iter())
            .filter(|(b, _)| **b >= 0)
            .map(|(_, w)| *w)
            .sum();
        if total <= f32::EPSILON {
            return;
        }
        for (bone, weight) in self.bones.iter().zip(self.weights.iter_mut()) {
            if *bone >= 0 {
                *weight /= total;
            }
        }
    }
}

/// A skeleton bone, bound to the scene node that animates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bone {
    pub name: String,
    /// Name of the node whose global transform drives this bone.
    pub node: String,
    /// Inverse bind matrix: mesh space to bone space.
    pub offset: Mat4,
}

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    /// Builds the box enclosing all points, or `None` for an empty set.
    pub fn from_points<'a>(points: impl IntoIterator<Item = &'a Vec3>) -> Option<Self> {
        let mut iter = points.into_iter();
        let first = *iter.next()?;
        let (min, max) = iter.fold((first, first), |(min, max), p| (min.min(*p), max.max(*p)));
        Some(Self { min, max })
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn radius(&self) -> f32 {
        (self.max - self.min).length() * 0.5
    }

    /// The eight corners of the box.
    pub fn corners(&self) -> [Vec3; 8] {
        let (a, b) = (self.min, self.max);
        [
            Vec3::new(a.x, a.y, a.z),
            Vec3::new(b.x, a.y, a.z),
            Vec3::new(a.x, b.y, a.z),
            Vec3::new(b.x, b.y, a.z),
            Vec3::new(a.x, a.y, b.z),
            Vec3::new(b.x, a.y, b.z),
            Vec3::new(a.x, b.y, b.z),
            Vec3::new(b.x, b.y, b.z),
        ]
    }

    /// Box enclosing this box after transformation.
    pub fn transformed(&self, m: &Mat4) -> Self {
        let corners = self.corners().map(|c| m.transform_point3(c));
        // Eight corners, never empty.
        Self::from_points(corners.iter()).unwrap_or(*self)
    }

    pub fn union(&self, other: &Self) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }
}

/// Vertex attribute arrays plus topology of a renderable mesh.
///
/// Mutating accessors (`vertices_mut`, `set_normals`, ...) raise the matching
/// dirty flag so the GPU mesh cache re-uploads only what changed.
#[derive(Debug, Clone)]
pub struct Geometry {
    id: GeometryId,
    vertices: Vec<Vec3>,
    normals: Vec<Vec3>,
    colors: Vec<Vec4>,
    tex_coords: [Vec<Vec2>; MAX_UV_CHANNELS],
    indices: Vec<u32>,
    primitive: PrimitiveType,
    bones: Vec<Bone>,
    weights: Vec<BoneWeight>,
    /// Whether this geometry is drawn into shadow maps.
    pub casts_shadows: bool,
    dirty: DirtyFlags,
    gpu_slot: Option<SlotKey>,
}

impl Default for Geometry {
    fn default() -> Self {
        Self::new(PrimitiveType::Triangles)
    }
}

impl Geometry {
    /// Creates an empty geometry of the given primitive type.
    pub fn new(primitive: PrimitiveType) -> Self {
        Self {
            id: GeometryId::new(),
            vertices: Vec::new(),
            normals: Vec::new(),
            colors: Vec::new(),
            tex_coords: Default::default(),
            indices: Vec::new(),
            primitive,
            bones: Vec::new(),
            weights: Vec::new(),
            casts_shadows: true,
            dirty: DirtyFlags::default(),
            gpu_slot: None,
        }
    }

    pub fn with_vertices(mut self, vertices: Vec<Vec3>) -> Self {
        self.vertices = vertices;
        self
    }

    pub fn with_normals(mut self, normals: Vec<Vec3>) -> Self {
        self.normals = normals;
        self
    }

    pub fn with_colors(mut self, colors: Vec<Vec4>) -> Self {
        self.colors = colors;
        self
    }

    /// Sets a texture-coordinate channel. Channels past `MAX_UV_CHANNELS` are ignored.
    pub fn with_tex_coords(mut self, channel: usize, coords: Vec<Vec2>) -> Self {
        if let Some(slot) = self.tex_coords.get_mut(channel) {
            *slot = coords;
        }
        self
    }

    pub fn with_indices(mut self, indices: Vec<u32>) -> Self {
        self.indices = indices;
        self
    }

    /// Attaches a skeleton: bones plus one `BoneWeight` per vertex.
    pub fn with_skeleton(mut self, bones: Vec<Bone>, weights: Vec<BoneWeight>) -> Self {
        self.bones = bones;
        self.weights = weights;
        self
    }

    pub fn with_casts_shadows(mut self, casts_shadows: bool) -> Self {
        self.casts_shadows = casts_shadows;
        self
    }

    /// Wraps the geometry for sharing between drawables.
    pub fn into_shared(self) -> GeometryRef {
        Arc::new(RwLock::new(self))
    }

    pub fn id(&self) -> GeometryId {
        self.id
    }

    pub fn primitive(&self) -> PrimitiveType {
        self.primitive
    }

    pub fn vertices(&self) -> &[Vec3] {
        &self.vertices
    }

    pub fn normals(&self) -> &[Vec3] {
        &self.normals
    }

    pub fn colors(&self) -> &[Vec4] {
        &self.colors
    }

    /// Texture coordinates of a channel; empty for unknown channels.
    pub fn tex_coords(&self, channel: usize) -> &[Vec2] {
        self.tex_coords.get(channel).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    pub fn bones(&self) -> &[Bone] {
        &self.bones
    }

    pub fn weights(&self) -> &[BoneWeight] {
        &self.weights
    }

    /// True when the geometry has bones and per-vertex weights.
    pub fn is_skinned(&self) -> bool {
        !self.bones.is_empty() && self.weights.len() == self.vertices.len()
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    /// Mutable positions; marks them dirty.
    pub fn vertices_mut(&mut self) -> &mut Vec<Vec3> {
        self.dirty.vertices = true;
        &mut self.vertices
    }

    /// Mutable normals; marks them dirty.
    pub fn normals_mut(&mut self) -> &mut Vec<Vec3> {
        self.dirty.normals = true;
        &mut self.normals
    }

    /// Mutable colors; marks them dirty.
    pub fn colors_mut(&mut self) -> &mut Vec<Vec4> {
        self.dirty.colors = true;
        &mut self.colors
    }

    pub fn set_vertices(&mut self, vertices: Vec<Vec3>) {
        *self.vertices_mut() = vertices;
    }

    pub fn set_normals(&mut self, normals: Vec<Vec3>) {
        *self.normals_mut() = normals;
    }

    pub fn set_colors(&mut self, colors: Vec<Vec4>) {
        *self.colors_mut() = colors;
    }

    pub fn dirty(&self) -> DirtyFlags {
        self.dirty
    }

    /// Clears the given flags after their attributes were uploaded.
    pub fn clear_dirty(&mut self, flags: DirtyFlags) {
        self.dirty.vertices &= !flags.vertices;
        self.dirty.normals &= !flags.normals;
        self.dirty.colors &= !flags.colors;
    }

    /// Mesh cache slot currently holding this geometry's buffers.
    pub fn gpu_slot(&self) -> Option<SlotKey> {
        self.gpu_slot
    }

    /// Set by the mesh cache only.
    pub fn set_gpu_slot(&mut self, slot: Option<SlotKey>) {
        self.gpu_slot = slot;
    }

    /// Checks that every index refers to an existing vertex.
    pub fn validate(&self) -> Result<(), SceneError> {
        let count = self.vertices.len();
        match self.indices.iter().find(|&&i| i as usize >= count) {
            Some(&index) => Err(SceneError::IndexOutOfRange {
                index,
                vertex_count: count,
            }),
            None => Ok(()),
        }
    }

    pub fn bounding_box(&self) -> Option<Aabb> {
        Aabb::from_points(self.vertices.iter())
    }

    /// Recomputes smooth per-vertex normals from triangle faces.
    ///
    /// Non-triangle geometry is left untouched.
    pub fn compute_normals(&mut self) {
        if self.primitive != PrimitiveType::Triangles {
            return;
        }
        let mut normals = vec![Vec3::ZERO; self.vertices.len()];
        let triangles: Vec<[usize; 3]> = if self.indices.is_empty() {
            (0..self.vertices.len() / 3)
                .map(|t| [3 * t, 3 * t + 1, 3 * t + 2])
                .collect()
        } else {
            self.indices
                .chunks_exact(3)
                .map(|c| [c[0] as usize, c[1] as usize, c[2] as usize])
                .collect()
        };
        for [a, b, c] in triangles {
            let (Some(pa), Some(pb), Some(pc)) =
                (self.vertices.get(a), self.vertices.get(b), self.vertices.get(c))
            else {
                continue;
            };
            // Unnormalized cross product weights by face area.
            let face = (*pb - *pa).cross(*pc - *pa);
            normals[a] += face;
            normals[b] += face;
            normals[c] += face;
        }
        for n in &mut normals {
            *n = n.normalize_or_zero();
        }
        self.set_normals(normals);
    }

    /// Solid box centered at the origin with per-face normals and UVs.
    pub fn cube(half_extents: Vec3) -> Self {
        let faces = [
            (Vec3::X, Vec3::Y, Vec3::Z),
            (Vec3::NEG_X, Vec3::Y, Vec3::NEG_Z),
            (Vec3::Y, Vec3::Z, Vec3::X),
            (Vec3::NEG_Y, Vec3::Z, Vec3::NEG_X),
            (Vec3::Z, Vec3::X, Vec3::Y),
            (Vec3::NEG_Z, Vec3::X, Vec3::NEG_Y),
        ];
        let mut vertices = Vec::with_capacity(24);
        let mut normals = Vec::with_capacity(24);
        let mut uvs = Vec::with_capacity(24);
        let mut indices = Vec::with_capacity(36);
        for (normal, u, v) in faces {
            let base = vertices.len() as u32;
            for (su, sv) in [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)] {
                let p = normal + u * su + v * sv;
                vertices.push(p * half_extents);
                normals.push(normal);
                uvs.push(Vec2::new((su + 1.0) * 0.5, (1.0 - sv) * 0.5));
            }
            // u x v == normal, so this winding is counter-clockwise seen from outside.
            indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }
        Self::new(PrimitiveType::Triangles)
            .with_vertices(vertices)
            .with_normals(normals)
            .with_tex_coords(0, uvs)
            .with_indices(indices)
    }

    /// Edges of a box centered at the origin, as a line list.
    pub fn wire_cube(half_extents: Vec3) -> Self {
        let corners = Aabb {
            min: -half_extents,
            max: half_extents,
        }
        .corners()
        .to_vec();
        let indices = vec![
            0, 1, 1, 3, 3, 2, 2, 0, 4, 5, 5, 7, 7, 6, 6, 4, 0, 4, 1, 5, 2, 6, 3, 7,
        ];
        Self::new(PrimitiveType::Lines)
            .with_vertices(corners)
            .with_indices(indices)
            .with_casts_shadows(false)
    }

    /// UV sphere centered at the origin.
    pub fn sphere(radius: f32, slices: u32, stacks: u32) -> Self {
        let slices = slices.max(3);
        let stacks = stacks.max(2);
        let mut vertices = Vec::new();
        let mut normals = Vec::new();
        let mut uvs = Vec::new();
        for stack in 0..=stacks {
            let v = stack as f32 / stacks as f32;
            let phi = v * std::f32::consts::PI;
            for slice in 0..=slices {
                let u = slice as f32 / slices as f32;
                let theta = u * std::f32::consts::TAU;
                let n = Vec3::new(phi.sin() * theta.cos(), phi.cos(), phi.sin() * theta.sin());
                vertices.push(n * radius);
                normals.push(n);
                uvs.push(Vec2::new(u, v));
            }
        }
        let row = slices + 1;
        let mut indices = Vec::new();
        for stack in 0..stacks {
            for slice in 0..slices {
                let a = stack * row + slice;
                let b = a + row;
                indices.extend_from_slice(&[a, a + 1, b, a + 1, b + 1, b]);
            }
        }
        Self::new(PrimitiveType::Triangles)
            .with_vertices(vertices)
            .with_normals(normals)
            .with_tex_coords(0, uvs)
            .with_indices(indices)
    }

    /// Plane in the XY plane facing +Z.
    pub fn plane(width: f32, height: f32) -> Self {
        let (w, h) = (width * 0.5, height * 0.5);
        Self::new(PrimitiveType::Triangles)
            .with_vertices(vec![
                Vec3::new(-w, -h, 0.0),
                Vec3::new(w, -h, 0.0),
                Vec3::new(w, h, 0.0),
                Vec3::new(-w, h, 0.0),
            ])
            .with_normals(vec![Vec3::Z; 4])
            .with_tex_coords(
                0,
                vec![
                    Vec2::new(0.0, 1.0),
                    Vec2::new(1.0, 1.0),
                    Vec2::new(1.0, 0.0),
                    Vec2::new(0.0, 0.0),
                ],
            )
            .with_indices(vec![0, 1, 2, 0, 2, 3])
    }

    /// A single segment.
    pub fn line(from: Vec3, to: Vec3) -> Self {
        Self::new(PrimitiveType::Lines)
            .with_vertices(vec![from, to])
            .with_indices(vec![0, 1])
            .with_casts_shadows(false)
    }

    /// Arc outline as a line list.
    pub fn arc(params: &ArcParams, step_degrees: f32) -> Self {
        let mut vertices = params.points(step_degrees);
        let last = vertices.len() as u32 - 1;
        let mut indices: Vec<u32> = (0..last).flat_map(|i| [i, i + 1]).collect();
        if params.sector {
            let center = last + 1;
            vertices.push(params.center);
            indices.extend_from_slice(&[center, 0, last, center]);
        }
        Self::new(PrimitiveType::Lines)
            .with_vertices(vertices)
            .with_indices(indices)
            .with_casts_shadows(false)
    }

    /// Circle outline around `normal`, with 10 degree segments.
    pub fn circle(center: Vec3, normal: Vec3, radius: f32) -> Self {
        let normal = normal.normalize_or(Vec3::Z);
        Self::arc(
            &ArcParams {
                center,
                normal,
                axis: normal.any_orthonormal_vector(),
                radius_a: radius,
                radius_b: radius,
                min_angle: 0.0,
                max_angle: std::f32::consts::TAU,
                sector: false,
            },
            10.0,
        )
    }

    /// Colored points. Missing colors default to white.
    pub fn point_cloud(points: Vec<Vec3>, colors: Vec<Vec4>) -> Self {
        let colors = if colors.len() == points.len() {
            colors
        } else {
            vec![Vec4::ONE; points.len()]
        };
        Self::new(PrimitiveType::Points)
            .with_vertices(points)
            .with_colors(colors)
            .with_casts_shadows(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_arc_with_sector() {
        let params = ArcParams {
            center: Vec3::ZERO,
            normal: Vec3::Z,
            axis: Vec3::X,
            radius_a: 2.0,
            radius_b: 1.0,
            min_angle: 0.0,
            max_angle: std::f32::consts::FRAC_PI_2,
            sector: true,
        };
        let arc = Geometry::arc(&params, 30.0);
        assert_eq!(arc.primitive(), PrimitiveType::Lines);
        // Three segments plus the two closing radii.
        assert_eq!(arc.indices().len(), 10);
        assert_relative_eq!(arc.vertices()[0].x, 2.0);
        assert_relative_eq!(arc.vertices()[3].y, 1.0, epsilon = 1e-6);
        assert_eq!(*arc.vertices().last().unwrap(), Vec3::ZERO);
        assert!(arc.validate().is_ok());
    }

    #[test]
    fn test_circle_lies_in_plane() {
        let normal = Vec3::new(1.0, 1.0, 0.0).normalize();
        let circle = Geometry::circle(Vec3::ONE, normal, 0.5);
        assert_eq!(circle.vertices().len(), 37);
        for v in circle.vertices() {
            assert_relative_eq!((*v - Vec3::ONE).dot(normal), 0.0, epsilon = 1e-5);
            assert_relative_eq!((*v - Vec3::ONE).length(), 0.5, epsilon = 1e-5);
        }
        let line = Geometry::line(Vec3::ZERO, Vec3::X);
        assert_eq!(line.indices(), &[0u32, 1]);
    }

    #[test]
    fn test_bone_weight_add_and_normalize() {
        let mut w = BoneWeight::default();
        w.add(2, 1.0);
        w.add(5, 3.0);
        w.normalize();
        assert_eq!(w.bones, [2, 5, -1, -1]);
        assert_relative_eq!(w.weights[0], 0.25);
        assert_relative_eq!(w.weights[1], 0.75);
    }

    #[test]
    fn test_bone_weight_ignores_fifth_influence() {
        let mut w = BoneWeight::default();
        for bone in 0..5 {
            w.add(bone, 1.0);
        }
        assert_eq!(w.bones, [0, 1, 2, 3]);
    }

    #[test]
    fn test_mutators_mark_dirty() {
        let mut g = Geometry::plane(1.0, 1.0);
        assert!(!g.dirty().any());

        g.normals_mut()[0] = Vec3::X;
        assert_eq!(
            g.dirty(),
            DirtyFlags {
                normals: true,
                ..Default::default()
            }
        );

        g.clear_dirty(DirtyFlags {
            normals: true,
            ..Default::default()
        });
        assert!(!g.dirty().any());
    }

    #[test]
    fn test_validate_rejects_out_of_range_index() {
        let g = Geometry::new(PrimitiveType::Triangles)
            .with_vertices(vec![Vec3::ZERO; 3])
            .with_indices(vec![0, 1, 3]);
        assert!(matches!(
            g.validate(),
            Err(SceneError::IndexOutOfRange { index: 3, .. })
        ));
        assert!(Geometry::cube(Vec3::ONE).validate().is_ok());
    }

    #[test]
    fn test_cube_normals_face_outward() {
        let g = Geometry::cube(Vec3::splat(2.0));
        assert_eq!(g.vertex_count(), 24);
        for tri in g.indices().chunks_exact(3) {
            let [a, b, c] = [0, 1, 2].map(|k| g.vertices()[tri[k] as usize]);
            let face = (b - a).cross(c - a).normalize();
            assert_relative_eq!(face.dot(g.normals()[tri[0] as usize]), 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_compute_normals_flat_triangle() {
        let mut g = Geometry::new(PrimitiveType::Triangles).with_vertices(vec![
            Vec3::ZERO,
            Vec3::X,
            Vec3::Y,
        ]);
        g.compute_normals();
        assert!(g.dirty().normals);
        for n in g.normals() {
            assert_relative_eq!(n.distance(Vec3::Z), 0.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_bounding_box() {
        let g = Geometry::sphere(2.0, 16, 8);
        let bb = g.bounding_box().unwrap();
        assert_relative_eq!(bb.max.y, 2.0, epsilon = 1e-5);
        assert_relative_eq!(bb.min.y, -2.0, epsilon = 1e-5);
        assert!(Geometry::default().bounding_box().is_none());
    }
}
