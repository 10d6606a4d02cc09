//! Light collection and slot assignment.
//!
//! Lights are gathered from the scene in traversal order and partitioned into
//! six buckets: {directional, spot, point} x {with shadow, without}. Within a
//! category the shadowless lights fill uniform slots first and the shadow
//! casters follow. Shadow texture units are handed out directional first,
//! then spot, then point.

use glam::Mat4;
use xviz_scene::{Light, LightKind, Node};

use crate::constants::{MAX_LIGHTS_PER_CATEGORY, MAX_SHADOW_MAPS};
use crate::program::PermutationParams;
use crate::uniforms::{FrameUniforms, LightUniform};

/// A light found in the scene with its resolved placement.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectedLight {
    /// Child indices from the root to the owning node.
    pub path: Vec<u32>,
    pub name: String,
    pub light: Light,
    /// Global transform of the owning node.
    pub global: Mat4,
    /// Index into the category's uniform array.
    pub slot: usize,
    /// Shadow texture unit, for shadow casters only.
    pub shadow_unit: Option<u32>,
    /// World to shadow clip space; identity for lights without shadows.
    pub light_space: Mat4,
}

/// Lights of one category, split by shadow casting.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LightBucket {
    pub lights: Vec<CollectedLight>,
    pub shadowed: Vec<CollectedLight>,
}

impl LightBucket {
    /// All lights in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &CollectedLight> {
        self.lights.iter().chain(&self.shadowed)
    }

    pub fn len(&self) -> usize {
        self.lights.len() + self.shadowed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn uniforms(&self, view: &Mat4) -> [LightUniform; MAX_LIGHTS_PER_CATEGORY] {
        let mut out = [LightUniform::default(); MAX_LIGHTS_PER_CATEGORY];
        for light in self.iter() {
            out[light.slot] = LightUniform::new(
                &light.light,
                &light.global,
                view,
                light.light_space,
                light.shadow_unit,
            );
        }
        out
    }
}

/// Lights of one frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LightSet {
    pub directional: LightBucket,
    pub spot: LightBucket,
    pub point: LightBucket,
    /// Lights dropped because their category was full.
    pub dropped: usize,
    /// Shadow casters lit without shadows because every unit was taken.
    pub demoted: usize,
}

struct Found {
    path: Vec<u32>,
    name: String,
    light: Light,
    global: Mat4,
}

impl LightSet {
    /// Collects the lights of `scene`. With `shadows_enabled` false every
    /// light is treated as shadowless.
    pub fn collect(scene: &Node, shadows_enabled: bool) -> Self {
        let mut found: [Vec<Found>; 3] = Default::default();
        scene.visit_with_path(|node: &Node, global: &Mat4, path: &[u32]| {
            if let Some(light) = node.light() {
                found[category(light.kind())].push(Found {
                    path: path.to_vec(),
                    name: node.name.clone(),
                    light: *light,
                    global: *global,
                });
            }
        });

        let mut set = LightSet::default();
        let mut next_unit = 0u32;
        for (index, lights) in found.into_iter().enumerate() {
            let bucket = match index {
                0 => &mut set.directional,
                1 => &mut set.spot,
                _ => &mut set.point,
            };
            for (n, found) in lights.into_iter().enumerate() {
                if n >= MAX_LIGHTS_PER_CATEGORY {
                    tracing::warn!(
                        "Dropping light on node '{}': more than {} {:?} lights",
                        found.name,
                        MAX_LIGHTS_PER_CATEGORY,
                        found.light.kind()
                    );
                    set.dropped += 1;
                    continue;
                }
                let wants_shadow = shadows_enabled && found.light.casts_shadows();
                let shadow_unit = if wants_shadow && (next_unit as usize) < MAX_SHADOW_MAPS {
                    next_unit += 1;
                    Some(next_unit - 1)
                } else {
                    if wants_shadow {
                        tracing::warn!(
                            "Light on node '{}' rendered without shadows: all {} shadow maps in use",
                            found.name,
                            MAX_SHADOW_MAPS
                        );
                        set.demoted += 1;
                    }
                    None
                };
                let light_space = if shadow_unit.is_some() {
                    found.light.light_space_matrix(&found.global)
                } else {
                    Mat4::IDENTITY
                };
                let collected = CollectedLight {
                    path: found.path,
                    name: found.name,
                    light: found.light,
                    global: found.global,
                    slot: 0,
                    shadow_unit,
                    light_space,
                };
                if shadow_unit.is_some() {
                    bucket.shadowed.push(collected);
                } else {
                    bucket.lights.push(collected);
                }
            }
            let offset = bucket.lights.len();
            for (slot, light) in bucket.lights.iter_mut().enumerate() {
                light.slot = slot;
            }
            for (slot, light) in bucket.shadowed.iter_mut().enumerate() {
                light.slot = offset + slot;
            }
        }
        set
    }

    /// Light counts for program selection.
    pub fn params(&self) -> PermutationParams {
        PermutationParams {
            num_dir_lights: self.directional.lights.len() as u32,
            num_dir_lights_with_shadow: self.directional.shadowed.len() as u32,
            num_spot_lights: self.spot.lights.len() as u32,
            num_spot_lights_with_shadow: self.spot.shadowed.len() as u32,
            num_point_lights: self.point.lights.len() as u32,
            num_point_lights_with_shadow: self.point.shadowed.len() as u32,
            ..Default::default()
        }
    }

    /// Shadow casters in texture unit order.
    pub fn shadow_casters(&self) -> impl Iterator<Item = &CollectedLight> {
        self.directional
            .shadowed
            .iter()
            .chain(&self.spot.shadowed)
            .chain(&self.point.shadowed)
    }

    pub fn len(&self) -> usize {
        self.directional.len() + self.spot.len() + self.point.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// View-space light block for the color pass.
    pub fn frame_uniforms(&self, view: &Mat4) -> FrameUniforms {
        FrameUniforms {
            directional: self.directional.uniforms(view),
            spot: self.spot.uniforms(view),
            point: self.point.uniforms(view),
        }
    }
}

fn category(kind: LightKind) -> usize {
    match kind {
        LightKind::Directional => 0,
        LightKind::Spot => 1,
        LightKind::Point => 2,
    }
}
