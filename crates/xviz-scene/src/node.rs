//! Scene graph nodes and drawables.

use std::collections::HashMap;
use std::sync::Arc;

use glam::{Mat4, Vec3};

use crate::geometry::{Aabb, GeometryRef};
use crate::light::Light;
use crate::material::Material;

/// A geometry paired with the material it is drawn with.
///
/// Both halves are shared. A `None` material is drawn with the renderer's
/// default material.
#[derive(Debug, Clone)]
pub struct Drawable {
    geometry: GeometryRef,
    material: Option<Arc<Material>>,
}

impl Drawable {
    pub fn new(geometry: GeometryRef, material: Option<Arc<Material>>) -> Self {
        Self { geometry, material }
    }

    pub fn geometry(&self) -> &GeometryRef {
        &self.geometry
    }

    pub fn material(&self) -> Option<&Arc<Material>> {
        self.material.as_ref()
    }
}

/// Node of the scene tree. A node exclusively owns its children.
#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    /// Transform relative to the parent node.
    pub transform: Mat4,
    /// Only this node's own drawables are affected; children keep their flags.
    pub visible: bool,
    children: Vec<Node>,
    light: Option<Light>,
    drawables: Vec<Drawable>,
}

impl Default for Node {
    fn default() -> Self {
        Self::new("")
    }
}

impl Node {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transform: Mat4::IDENTITY,
            visible: true,
            children: Vec::new(),
            light: None,
            drawables: Vec::new(),
        }
    }

    pub fn with_transform(mut self, transform: Mat4) -> Self {
        self.transform = transform;
        self
    }

    pub fn with_light(mut self, light: Light) -> Self {
        self.light = Some(light);
        self
    }

    pub fn with_drawable(mut self, drawable: Drawable) -> Self {
        self.drawables.push(drawable);
        self
    }

    pub fn with_child(mut self, child: Node) -> Self {
        self.children.push(child);
        self
    }

    pub fn add_child(&mut self, child: Node) -> &mut Node {
        self.children.push(child);
        let last = self.children.len() - 1;
        &mut self.children[last]
    }

    pub fn add_drawable(&mut self, drawable: Drawable) {
        self.drawables.push(drawable);
    }

    pub fn set_light(&mut self, light: Option<Light>) {
        self.light = light;
    }

    pub fn children(&self) -> &[Node] {
        &self.children
    }

    pub fn children_mut(&mut self) -> &mut [Node] {
        &mut self.children
    }

    pub fn light(&self) -> Option<&Light> {
        self.light.as_ref()
    }

    pub fn drawables(&self) -> &[Drawable] {
        &self.drawables
    }

    /// Sets the visibility flag, optionally on the whole subtree.
    pub fn set_visible(&mut self, visible: bool, recursive: bool) {
        self.visible = visible;
        if recursive {
            for child in &mut self.children {
                child.set_visible(visible, true);
            }
        }
    }

    /// Pre-order traversal with each node's global transform.
    ///
    /// Children are visited in insertion order; the root's parent transform is
    /// the identity.
    pub fn visit<F>(&self, mut f: F)
    where
        F: FnMut(&Node, &Mat4),
    {
        let mut path = Vec::new();
        self.walk(
            &Mat4::IDENTITY,
            &mut path,
            &mut |node: &Node, global: &Mat4, _: &[u32]| f(node, global),
        );
    }

    /// Like [`Node::visit`], also passing the child-index path from the root.
    pub fn visit_with_path<F>(&self, mut f: F)
    where
        F: FnMut(&Node, &Mat4, &[u32]),
    {
        let mut path = Vec::new();
        self.walk(&Mat4::IDENTITY, &mut path, &mut f);
    }

    fn walk<F>(&self, parent: &Mat4, path: &mut Vec<u32>, f: &mut F)
    where
        F: FnMut(&Node, &Mat4, &[u32]),
    {
        let global = *parent * self.transform;
        f(self, &global, path);
        for (i, child) in self.children.iter().enumerate() {
            path.push(i as u32);
            child.walk(&global, path, f);
            path.pop();
        }
    }

    /// All nodes of the subtree in pre-order, this node included.
    pub fn nodes_recursive(&self) -> Vec<&Node> {
        let mut out = vec![self];
        for child in &self.children {
            out.extend(child.nodes_recursive());
        }
        out
    }

    /// First node named `name` in pre-order.
    pub fn find_by_name(&self, name: &str) -> Option<&Node> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find_by_name(name))
    }

    pub fn find_by_name_mut(&mut self, name: &str) -> Option<&mut Node> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter_mut().find_map(|c| c.find_by_name_mut(name))
    }

    /// Global transform of the first node named `name`.
    pub fn global_transform_of(&self, name: &str) -> Option<Mat4> {
        let mut found = None;
        self.visit(|node, global| {
            if found.is_none() && node.name == name {
                found = Some(*global);
            }
        });
        found
    }

    /// Global transforms of every named node. The first node wins on duplicates.
    pub fn global_transforms(&self) -> HashMap<String, Mat4> {
        let mut map = HashMap::new();
        self.visit(|node, global| {
            if !node.name.is_empty() {
                map.entry(node.name.clone()).or_insert(*global);
            }
        });
        map
    }

    /// Replaces local transforms of the named nodes. Returns how many were set.
    pub fn update_transforms(&mut self, transforms: &HashMap<String, Mat4>) -> usize {
        let mut count = 0;
        if let Some(t) = transforms.get(&self.name) {
            self.transform = *t;
            count += 1;
        }
        for child in &mut self.children {
            count += child.update_transforms(transforms);
        }
        count
    }

    /// World-space bounds of every drawable in the subtree.
    pub fn bounding_box(&self) -> Option<Aabb> {
        let mut bounds: Option<Aabb> = None;
        self.visit(|node, global| {
            for drawable in &node.drawables {
                let Some(local) = drawable.geometry().read().bounding_box() else {
                    continue;
                };
                let world = local.transformed(global);
                bounds = Some(match bounds {
                    Some(b) => b.union(&world),
                    None => world,
                });
            }
        });
        bounds
    }

    /// Center and radius of a sphere enclosing the subtree's geometry.
    pub fn bounding_sphere(&self) -> Option<(Vec3, f32)> {
        self.bounding_box().map(|b| (b.center(), b.radius()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Geometry;
    use approx::assert_relative_eq;

    fn translated(name: &str, x: f32) -> Node {
        Node::new(name).with_transform(Mat4::from_translation(Vec3::new(x, 0.0, 0.0)))
    }

    #[test]
    fn test_global_transform_composes_parent_first() {
        let root = Node::new("root")
            .with_transform(Mat4::from_scale(Vec3::splat(2.0)))
            .with_child(translated("child", 1.0).with_child(translated("leaf", 1.0)));

        let leaf = root.global_transform_of("leaf").unwrap();
        let origin = leaf.transform_point3(Vec3::ZERO);
        assert_relative_eq!(origin.x, 4.0);
    }

    #[test]
    fn test_visit_order_and_paths() {
        let root = Node::new("root")
            .with_child(translated("a", 1.0).with_child(Node::new("a0")))
            .with_child(Node::new("b"));

        let mut seen = Vec::new();
        root.visit_with_path(|node, _, path| seen.push((node.name.clone(), path.to_vec())));
        assert_eq!(
            seen,
            vec![
                ("root".to_string(), vec![]),
                ("a".to_string(), vec![0]),
                ("a0".to_string(), vec![0, 0]),
                ("b".to_string(), vec![1]),
            ]
        );
    }

    #[test]
    fn test_set_visible_recursive() {
        let mut root = Node::new("root").with_child(Node::new("a").with_child(Node::new("b")));
        root.set_visible(false, false);
        assert!(root.find_by_name("b").unwrap().visible);

        root.set_visible(false, true);
        assert!(!root.find_by_name("b").unwrap().visible);
    }

    #[test]
    fn test_update_transforms() {
        let mut root = Node::new("root").with_child(Node::new("arm"));
        let mut map = HashMap::new();
        map.insert("arm".to_string(), Mat4::from_translation(Vec3::Y));
        assert_eq!(root.update_transforms(&map), 1);
        assert_eq!(root.find_by_name("arm").unwrap().transform, map["arm"]);
    }

    #[test]
    fn test_bounding_sphere() {
        let cube = Geometry::cube(Vec3::ONE).into_shared();
        let root = translated("root", 10.0).with_drawable(Drawable::new(cube, None));
        let (center, radius) = root.bounding_sphere().unwrap();
        assert_relative_eq!(center.x, 10.0);
        assert_relative_eq!(radius, 3f32.sqrt(), epsilon = 1e-5);
    }
}
