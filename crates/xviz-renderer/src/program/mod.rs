//! Material program cache.
//!
//! A program is one shader permutation: the material kind plus the light,
//! skinning and texture configuration it was compiled for. Programs are
//! compiled on first use and kept for the lifetime of the cache.

pub mod preprocessor;

use std::collections::HashMap;
use std::sync::Arc;

use xviz_scene::MaterialKind;

use crate::backend::{GpuBackend, PassKind, ProgramDescriptor, ProgramId, VertexAttribute};
use crate::constants::{MAX_BONES, MAX_LIGHTS_PER_CATEGORY};
use crate::error::RenderError;
use preprocessor::Defines;

const COMMON_WGSL: &str = include_str!("../shaders/common.wgsl");
const SKINNING_WGSL: &str = include_str!("../shaders/skinning.wgsl");
const SHADOWS_WGSL: &str = include_str!("../shaders/shadows.wgsl");
const PHONG_WGSL: &str = include_str!("../shaders/phong.wgsl");
const UNLIT_WGSL: &str = include_str!("../shaders/unlit.wgsl");
const DEPTH_WGSL: &str = include_str!("../shaders/depth.wgsl");

fn shader_include(name: &str) -> Option<&'static str> {
    match name {
        "common" => Some(COMMON_WGSL),
        "skinning" => Some(SKINNING_WGSL),
        "shadows" => Some(SHADOWS_WGSL),
        _ => None,
    }
}

/// Shader family of a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgramKind {
    Phong,
    Constant,
    PerVertexColor,
    Wireframe,
    /// Position-only depth output for shadow maps.
    ShadowDepth,
}

impl From<MaterialKind> for ProgramKind {
    fn from(kind: MaterialKind) -> Self {
        match kind {
            MaterialKind::Phong => ProgramKind::Phong,
            MaterialKind::Constant => ProgramKind::Constant,
            MaterialKind::PerVertexColor => ProgramKind::PerVertexColor,
            MaterialKind::Wireframe => ProgramKind::Wireframe,
        }
    }
}

impl ProgramKind {
    fn name(self) -> &'static str {
        match self {
            ProgramKind::Phong => "phong",
            ProgramKind::Constant => "constant",
            ProgramKind::PerVertexColor => "per_vertex_color",
            ProgramKind::Wireframe => "wireframe",
            ProgramKind::ShadowDepth => "shadow_depth",
        }
    }

    /// Whether the shader reads the light arrays.
    pub fn is_lit(self) -> bool {
        self == ProgramKind::Phong
    }

    fn pass(self) -> PassKind {
        match self {
            ProgramKind::ShadowDepth => PassKind::Depth,
            _ => PassKind::Color,
        }
    }

    fn source(self) -> &'static str {
        match self {
            ProgramKind::Phong => PHONG_WGSL,
            ProgramKind::Constant | ProgramKind::PerVertexColor | ProgramKind::Wireframe => UNLIT_WGSL,
            ProgramKind::ShadowDepth => DEPTH_WGSL,
        }
    }
}

/// Light and feature configuration a program is specialized for.
///
/// Light counts are per category; `*_with_shadow` counts lights that sample a
/// shadow map, the plain counts the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PermutationParams {
    pub num_dir_lights: u32,
    pub num_dir_lights_with_shadow: u32,
    pub num_spot_lights: u32,
    pub num_spot_lights_with_shadow: u32,
    pub num_point_lights: u32,
    pub num_point_lights_with_shadow: u32,
    pub skinning: bool,
    pub diffuse_map: bool,
}

impl PermutationParams {
    pub fn has_shadows(&self) -> bool {
        self.num_dir_lights_with_shadow + self.num_spot_lights_with_shadow + self.num_point_lights_with_shadow > 0
    }

    /// Drops what `kind` ignores so equivalent permutations share one program.
    pub fn normalized(&self, kind: ProgramKind) -> Self {
        if kind.is_lit() {
            *self
        } else {
            Self {
                skinning: self.skinning,
                ..Self::default()
            }
        }
    }
}

/// Cache key of a permutation, e.g. `phong:d1:ds0:s0:ss0:p0:ps0:sk0:dm0`.
pub fn program_key(kind: ProgramKind, params: &PermutationParams) -> String {
    let sk = params.skinning as u8;
    if kind.is_lit() {
        format!(
            "{}:d{}:ds{}:s{}:ss{}:p{}:ps{}:sk{}:dm{}",
            kind.name(),
            params.num_dir_lights,
            params.num_dir_lights_with_shadow,
            params.num_spot_lights,
            params.num_spot_lights_with_shadow,
            params.num_point_lights,
            params.num_point_lights_with_shadow,
            sk,
            params.diffuse_map as u8,
        )
    } else {
        format!("{}:sk{}", kind.name(), sk)
    }
}

/// Preprocessor defines of a permutation.
pub fn program_defines(kind: ProgramKind, params: &PermutationParams) -> Defines {
    let params = params.normalized(kind);
    let mut defines = Defines::new();
    defines
        .set("MAX_LIGHTS", MAX_LIGHTS_PER_CATEGORY as i64)
        .set("MAX_BONES", MAX_BONES as i64)
        .set("NUM_DIR_LIGHTS", params.num_dir_lights as i64)
        .set("NUM_DIR_LIGHTS_WITH_SHADOW", params.num_dir_lights_with_shadow as i64)
        .set("NUM_SPOT_LIGHTS", params.num_spot_lights as i64)
        .set("NUM_SPOT_LIGHTS_WITH_SHADOW", params.num_spot_lights_with_shadow as i64)
        .set("NUM_POINT_LIGHTS", params.num_point_lights as i64)
        .set("NUM_POINT_LIGHTS_WITH_SHADOW", params.num_point_lights_with_shadow as i64)
        .flag("HAS_SHADOWS", params.has_shadows())
        .flag("USE_SKINNING", params.skinning)
        .flag("HAS_NORMALS", kind.is_lit())
        .flag("HAS_DIFFUSE_MAP", params.diffuse_map)
        .flag("HAS_UVS", params.diffuse_map)
        .flag("HAS_COLORS", kind == ProgramKind::PerVertexColor);
    defines
}

/// Vertex inputs of a permutation, in buffer slot order.
pub fn program_attributes(kind: ProgramKind, params: &PermutationParams) -> Vec<VertexAttribute> {
    let params = params.normalized(kind);
    let mut attributes = vec![VertexAttribute::Position];
    if kind.is_lit() {
        attributes.push(VertexAttribute::Normal);
    }
    if kind == ProgramKind::PerVertexColor {
        attributes.push(VertexAttribute::Color);
    }
    if params.diffuse_map {
        attributes.push(VertexAttribute::TexCoord0);
    }
    if params.skinning {
        attributes.push(VertexAttribute::BoneIds);
        attributes.push(VertexAttribute::BoneWeights);
    }
    attributes
}

/// A compiled permutation.
#[derive(Debug)]
pub struct Program {
    pub id: ProgramId,
    pub kind: ProgramKind,
    pub key: String,
    pub params: PermutationParams,
    pub attributes: Vec<VertexAttribute>,
}

/// Compiles each permutation once and hands out shared programs.
#[derive(Debug, Default)]
pub struct ProgramCache {
    programs: HashMap<String, Arc<Program>>,
    compilations: usize,
}

impl ProgramCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the program for a permutation, compiling it on first use.
    pub fn instance<B: GpuBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        kind: ProgramKind,
        params: &PermutationParams,
    ) -> Result<Arc<Program>, RenderError> {
        let params = params.normalized(kind);
        let key = program_key(kind, &params);
        if let Some(program) = self.programs.get(&key) {
            return Ok(Arc::clone(program));
        }

        let fail = |message: String| {
            tracing::error!("Failed to build program {}: {}", key, message);
            RenderError::ShaderCompilation {
                key: key.clone(),
                message,
            }
        };
        let defines = program_defines(kind, &params);
        let body = preprocessor::preprocess(kind.source(), &defines, &shader_include)
            .map_err(|e| fail(e.to_string()))?;
        let source = format!("{}\n{}", defines.to_wgsl_consts(), body);
        let attributes = program_attributes(kind, &params);

        let id = backend
            .compile_program(&ProgramDescriptor {
                label: &key,
                source: &source,
                attributes: &attributes,
                pass: kind.pass(),
            })
            .map_err(|e| fail(e.to_string()))?;
        self.compilations += 1;
        tracing::info!("Compiled program {}", key);

        let program = Arc::new(Program {
            id,
            kind,
            key: key.clone(),
            params,
            attributes,
        });
        self.programs.insert(key, Arc::clone(&program));
        Ok(program)
    }

    /// Returns an already compiled program without compiling.
    pub fn get(&self, kind: ProgramKind, params: &PermutationParams) -> Option<Arc<Program>> {
        self.programs
            .get(&program_key(kind, &params.normalized(kind)))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    /// Programs compiled since the cache was created.
    pub fn compilations(&self) -> usize {
        self.compilations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockBackend;

    fn one_directional() -> PermutationParams {
        PermutationParams {
            num_dir_lights: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_phong_key_format() {
        assert_eq!(
            program_key(ProgramKind::Phong, &one_directional()),
            "phong:d1:ds0:s0:ss0:p0:ps0:sk0:dm0"
        );
        let params = PermutationParams {
            num_spot_lights_with_shadow: 2,
            skinning: true,
            diffuse_map: true,
            ..Default::default()
        };
        assert_eq!(
            program_key(ProgramKind::Phong, &params),
            "phong:d0:ds0:s0:ss2:p0:ps0:sk1:dm1"
        );
    }

    #[test]
    fn test_unlit_keys_ignore_lights() {
        let params = PermutationParams {
            num_point_lights: 3,
            diffuse_map: true,
            ..Default::default()
        };
        assert_eq!(program_key(ProgramKind::Constant, &params), "constant:sk0");
        assert_eq!(
            program_key(ProgramKind::ShadowDepth, &PermutationParams { skinning: true, ..params }),
            "shadow_depth:sk1"
        );
    }

    #[test]
    fn test_instance_is_memoized() {
        let mut backend = MockBackend::new();
        let mut cache = ProgramCache::new();
        let a = cache.instance(&mut backend, ProgramKind::Phong, &one_directional()).unwrap();
        let b = cache.instance(&mut backend, ProgramKind::Phong, &one_directional()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.compilations(), 1);
        assert_eq!(backend.programs.len(), 1);

        let c = cache
            .instance(&mut backend, ProgramKind::Phong, &PermutationParams::default())
            .unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_ne!(a.id, c.id);
        assert_eq!(cache.compilations(), 2);
    }

    #[test]
    fn test_unlit_permutations_share_a_program() {
        let mut backend = MockBackend::new();
        let mut cache = ProgramCache::new();
        let a = cache
            .instance(&mut backend, ProgramKind::Constant, &one_directional())
            .unwrap();
        let b = cache
            .instance(&mut backend, ProgramKind::Constant, &PermutationParams::default())
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(backend.compiled_labels(), vec!["constant:sk0"]);
    }

    #[test]
    fn test_generated_source_has_feature_constants() {
        let mut backend = MockBackend::new();
        let mut cache = ProgramCache::new();
        let params = PermutationParams {
            num_dir_lights: 1,
            num_dir_lights_with_shadow: 1,
            ..Default::default()
        };
        cache.instance(&mut backend, ProgramKind::Phong, &params).unwrap();
        let (_, _, source) = &backend.programs[0];
        assert!(source.contains("const NUM_DIR_LIGHTS: u32 = 1u;"));
        assert!(source.contains("const HAS_SHADOWS: u32 = 1u;"));
        assert!(source.contains("fn calc_shadow"));
        assert!(source.contains("fn fs_main"));
        assert!(!source.contains("#include"));
        assert!(!source.contains("diffuse_map: texture_2d"));
    }

    #[test]
    fn test_attributes_follow_features() {
        let params = PermutationParams {
            skinning: true,
            diffuse_map: true,
            ..Default::default()
        };
        assert_eq!(
            program_attributes(ProgramKind::Phong, &params),
            vec![
                VertexAttribute::Position,
                VertexAttribute::Normal,
                VertexAttribute::TexCoord0,
                VertexAttribute::BoneIds,
                VertexAttribute::BoneWeights,
            ]
        );
        assert_eq!(
            program_attributes(ProgramKind::PerVertexColor, &PermutationParams::default()),
            vec![VertexAttribute::Position, VertexAttribute::Color]
        );
        assert_eq!(
            program_attributes(ProgramKind::ShadowDepth, &PermutationParams::default()),
            vec![VertexAttribute::Position]
        );
    }

    #[test]
    fn test_compile_failure_is_reported() {
        let mut backend = MockBackend::new();
        backend.fail_compile = true;
        let mut cache = ProgramCache::new();
        let err = cache
            .instance(&mut backend, ProgramKind::Phong, &one_directional())
            .unwrap_err();
        assert!(matches!(
            err,
            RenderError::ShaderCompilation { ref key, .. } if key == "phong:d1:ds0:s0:ss0:p0:ps0:sk0:dm0"
        ));
        assert!(cache.is_empty());
        assert_eq!(cache.compilations(), 0);
    }
}
