//! Frame driver.
//!
//! A frame runs through [`FrameState`]s in order: lights are collected, one
//! depth pass is rendered per shadow-casting light, then every visible
//! drawable is drawn into the default target.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use glam::{Mat4, Vec2, Vec3};
use xviz_scene::camera::project_point;
use xviz_scene::{Camera, GeometryRef, Material, Node, PhongMaterial, PrimitiveType, Projection, Side, Viewport};

use crate::backend::{BufferId, CullMode, DepthTargetId, DrawCall, GpuBackend, PassTarget, ProgramId, Topology};
use crate::config::RendererConfig;
use crate::constants::MAX_BONES;
use crate::error::RenderError;
use crate::lights::{CollectedLight, LightSet};
use crate::program::{PermutationParams, ProgramCache, ProgramKind};
use crate::resources::{ImageFetcher, MeshCache, MeshResource, TextureCache};
use crate::shadow_map::{ShadowBinding, ShadowMap};
use crate::uniforms::DrawUniforms;

/// Stage of the frame being rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameState {
    #[default]
    Idle,
    LightCollection,
    ShadowPass,
    ColorPass,
}

/// Counters of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameStats {
    pub draw_calls: usize,
    pub shadow_passes: usize,
    /// Programs compiled since the renderer was created.
    pub programs_compiled: usize,
    /// Drawables left out because their geometry was empty or invalid.
    pub skipped_drawables: usize,
}

/// Depth of the default target converted to distances along the view axis.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthBuffer {
    pub width: u32,
    pub height: u32,
    pub znear: f32,
    pub zfar: f32,
    /// Row-major from the top-left pixel. Cleared pixels read `zfar`.
    pub distances: Vec<f32>,
}

impl DepthBuffer {
    pub fn get(&self, x: u32, y: u32) -> Option<f32> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.distances.get((y * self.width + x) as usize).copied()
    }
}

/// A visible drawable with everything resolved from the scene tree.
struct DrawItem {
    geometry: GeometryRef,
    material: Option<Arc<Material>>,
    model: Mat4,
    bones: Vec<Mat4>,
}

/// Forward renderer over a [`GpuBackend`].
pub struct Renderer<B: GpuBackend> {
    backend: B,
    config: RendererConfig,
    meshes: MeshCache,
    textures: TextureCache,
    programs: ProgramCache,
    /// Keyed by the light's child-index path in the scene.
    shadow_maps: HashMap<Vec<u32>, ShadowMap>,
    default_material: Arc<Material>,
    state: FrameState,
    /// Size set by the host through [`Renderer::resize`].
    viewport: Viewport,
    /// Transform and viewport of the last color pass, used by `project`.
    view_projection: Mat4,
    frame_viewport: Viewport,
    /// Projection of the last color pass, used to linearize depth.
    frame_projection: Projection,
    shut_down: bool,
}

impl<B: GpuBackend> Renderer<B> {
    pub fn new(backend: B, config: RendererConfig) -> Self {
        Self::with_program_cache(backend, config, ProgramCache::new())
    }

    /// Creates a renderer that draws with an existing program cache.
    pub fn with_program_cache(backend: B, config: RendererConfig, programs: ProgramCache) -> Self {
        let [r, g, b] = config.default_material_color;
        let default_material = Arc::new(Material::Phong(PhongMaterial::with_color(Vec3::new(r, g, b))));
        Self {
            backend,
            config,
            meshes: MeshCache::new(),
            textures: TextureCache::new(),
            programs,
            shadow_maps: HashMap::new(),
            default_material,
            state: FrameState::Idle,
            viewport: Viewport::default(),
            view_projection: Mat4::IDENTITY,
            frame_viewport: Viewport::default(),
            frame_projection: Projection::default(),
            shut_down: false,
        }
    }

    /// Replaces the source of URI images.
    pub fn with_image_fetcher(mut self, fetcher: Arc<dyn ImageFetcher>) -> Self {
        self.textures.clear(&mut self.backend);
        self.textures = TextureCache::with_fetcher(fetcher);
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn meshes(&self) -> &MeshCache {
        &self.meshes
    }

    pub fn programs(&self) -> &ProgramCache {
        &self.programs
    }

    /// Shadow maps created so far, one per shadow-casting light.
    pub fn shadow_map_count(&self) -> usize {
        self.shadow_maps.len()
    }

    /// Material used for drawables without one.
    pub fn default_material(&self) -> &Arc<Material> {
        &self.default_material
    }

    /// Releases the GPU buffers of a geometry at the next frame.
    pub fn release_geometry(&mut self, geometry: &GeometryRef) {
        self.meshes.release(&mut self.backend, geometry);
    }

    /// Sets the viewport used when the camera does not specify one.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.viewport = Viewport::new(0, 0, width, height);
    }

    /// Renders one frame of `scene` seen by `camera`.
    ///
    /// The color buffer is cleared to the camera background when
    /// `clear_color` is set; depth is always cleared. On error the frame is
    /// abandoned and the renderer returns to [`FrameState::Idle`].
    pub fn render(&mut self, scene: &Node, camera: &Camera, clear_color: bool) -> Result<FrameStats, RenderError> {
        self.ensure_idle()?;
        let _frame = tracing::debug_span!("frame").entered();
        let result = self.render_frame(scene, camera, clear_color);
        self.state = FrameState::Idle;
        if let Err(e) = &result {
            tracing::error!("Frame aborted: {}", e);
        }
        result
    }

    /// Clears the depth of the default target to the far plane, keeping color.
    pub fn clear_depth(&mut self) -> Result<(), RenderError> {
        self.ensure_idle()?;
        self.backend.begin_pass(PassTarget::Default {
            viewport: Viewport::default(),
            clear_color: None,
        })?;
        self.backend.end_pass()?;
        Ok(())
    }

    /// Reads back the depth of the default target as view distances, using
    /// the near and far planes of the last rendered frame.
    pub fn read_depth(&mut self) -> Result<DepthBuffer, RenderError> {
        self.ensure_idle()?;
        let (width, height) = self.backend.default_target_size();
        let raw = self.backend.read_depth()?;
        let (znear, zfar) = self.frame_projection.near_far();
        let projection = self.frame_projection;
        Ok(DepthBuffer {
            width,
            height,
            znear,
            zfar,
            distances: raw.into_iter().map(|d| projection.linear_depth(d)).collect(),
        })
    }

    fn ensure_idle(&self) -> Result<(), RenderError> {
        if self.shut_down {
            return Err(RenderError::ShutDown);
        }
        if self.state != FrameState::Idle {
            return Err(RenderError::FrameInProgress);
        }
        Ok(())
    }

    /// Window coordinates (y down) of a world point in the last rendered frame.
    pub fn project(&self, point: Vec3) -> Vec2 {
        project_point(&self.view_projection, &self.frame_viewport, point)
    }

    /// Frees every GPU resource. Later releases are immediate and later
    /// frames fail with [`RenderError::ShutDown`].
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.meshes.begin_teardown(&mut self.backend);
        self.textures.clear(&mut self.backend);
        for (_, map) in self.shadow_maps.drain() {
            map.release(&mut self.backend);
        }
        tracing::info!("Renderer shut down");
    }

    fn render_frame(&mut self, scene: &Node, camera: &Camera, clear_color: bool) -> Result<FrameStats, RenderError> {
        let mut stats = FrameStats::default();

        self.state = FrameState::LightCollection;
        let (lights, items) = {
            let _span = tracing::debug_span!("light_collection").entered();
            self.meshes.flush(&mut self.backend);
            self.textures.process_pending(&mut self.backend)?;
            let lights = LightSet::collect(scene, self.config.shadows_enabled);
            let items = collect_drawables(scene, self.config.validate_geometry, &mut stats);
            (lights, items)
        };

        self.state = FrameState::ShadowPass;
        let mut shadow_targets: Vec<(u32, DepthTargetId)> = Vec::new();
        for caster in lights.shadow_casters() {
            let _span = tracing::debug_span!("shadow_pass", light = %caster.name).entered();
            let binding = self.shadow_pass(&items, caster, &mut stats)?;
            shadow_targets.push((binding.unit, binding.target));
            stats.shadow_passes += 1;
        }
        self.release_unused_shadow_maps(&lights);

        self.state = FrameState::ColorPass;
        {
            let _span = tracing::debug_span!("color_pass").entered();
            self.color_pass(&items, camera, clear_color, &lights, &shadow_targets, &mut stats)?;
        }

        stats.programs_compiled = self.programs.compilations();
        tracing::trace!("Frame done: {:?}", stats);
        Ok(stats)
    }

    fn shadow_pass(
        &mut self,
        items: &[DrawItem],
        caster: &CollectedLight,
        stats: &mut FrameStats,
    ) -> Result<ShadowBinding, RenderError> {
        let mut map = match self.shadow_maps.remove(&caster.path) {
            Some(map) => map,
            None => {
                let size = self.config.clamped_shadow_map_size();
                tracing::info!("Creating shadow map for light '{}'", caster.name);
                ShadowMap::init(&mut self.backend, size, size)?
            }
        };
        map.light_space = caster.light_space;
        let unit = caster.shadow_unit.unwrap_or(0);

        if let Err(e) = map.bind(&mut self.backend) {
            self.shadow_maps.insert(caster.path.clone(), map);
            return Err(e);
        }
        let drawn = self.draw_shadow_casters(items, &caster.light_space, stats);
        let unbound = map.unbind(&mut self.backend);
        let binding = map.bind_texture(unit);
        self.shadow_maps.insert(caster.path.clone(), map);
        drawn?;
        unbound?;
        Ok(binding)
    }

    /// Frees the maps of lights that no longer cast shadows at the path they
    /// were created for (removed, moved in the tree, or demoted).
    fn release_unused_shadow_maps(&mut self, lights: &LightSet) {
        let casting: HashSet<&[u32]> = lights.shadow_casters().map(|l| l.path.as_slice()).collect();
        let stale: Vec<Vec<u32>> = self
            .shadow_maps
            .keys()
            .filter(|path| !casting.contains(path.as_slice()))
            .cloned()
            .collect();
        for path in stale {
            if let Some(map) = self.shadow_maps.remove(&path) {
                tracing::debug!("Releasing shadow map of light at {:?}", path);
                map.release(&mut self.backend);
            }
        }
    }

    fn draw_shadow_casters(
        &mut self,
        items: &[DrawItem],
        light_space: &Mat4,
        stats: &mut FrameStats,
    ) -> Result<(), RenderError> {
        for item in items {
            let skinning = {
                let geometry = item.geometry.read();
                if !geometry.casts_shadows || geometry.primitive() != PrimitiveType::Triangles {
                    continue;
                }
                geometry.is_skinned()
            };
            let mesh = self.meshes.fetch(&mut self.backend, &item.geometry)?.clone();
            let program = self.programs.instance(
                &mut self.backend,
                ProgramKind::ShadowDepth,
                &PermutationParams {
                    skinning,
                    ..Default::default()
                },
            )?;
            let mut uniforms = DrawUniforms::shadow(&item.model, light_space);
            uniforms.set_bones(&item.bones);
            self.backend.draw(&DrawCall {
                program: program.id,
                topology: Topology::Triangles,
                cull: CullMode::None,
                vertex_buffers: mesh.vertex_buffers(),
                index_buffer: mesh.index_buffer(),
                count: mesh.draw_count(),
                vertex_count: mesh.vertex_count(),
                uniforms: uniforms.as_bytes(),
                diffuse_texture: None,
                shadow_maps: &[],
            })?;
            stats.draw_calls += 1;
        }
        Ok(())
    }

    fn color_pass(
        &mut self,
        items: &[DrawItem],
        camera: &Camera,
        clear_color: bool,
        lights: &LightSet,
        shadow_targets: &[(u32, DepthTargetId)],
        stats: &mut FrameStats,
    ) -> Result<(), RenderError> {
        let viewport = if !camera.viewport.is_empty() {
            camera.viewport
        } else if !self.viewport.is_empty() {
            self.viewport
        } else {
            let (width, height) = self.backend.default_target_size();
            Viewport::new(0, 0, width, height)
        };
        let view = camera.view_matrix();
        let projection = camera.projection_matrix();
        self.view_projection = projection * view;
        self.frame_viewport = viewport;
        self.frame_projection = camera.projection;

        let frame = lights.frame_uniforms(&view);
        self.backend.set_frame_uniforms(bytemuck::bytes_of(&frame))?;
        self.backend.begin_pass(PassTarget::Default {
            viewport,
            clear_color: clear_color.then(|| camera.background.to_array()),
        })?;

        let light_params = lights.params();
        let mut drawn = Ok(());
        for item in items {
            drawn = self.draw_item(item, &view, &projection, &light_params, shadow_targets, stats);
            if drawn.is_err() {
                break;
            }
        }
        let ended = self.backend.end_pass();
        drawn?;
        ended?;
        Ok(())
    }

    fn draw_item(
        &mut self,
        item: &DrawItem,
        view: &Mat4,
        projection: &Mat4,
        light_params: &PermutationParams,
        shadow_targets: &[(u32, DepthTargetId)],
        stats: &mut FrameStats,
    ) -> Result<(), RenderError> {
        let material = item
            .material
            .clone()
            .unwrap_or_else(|| Arc::clone(&self.default_material));
        let skinning = item.geometry.read().is_skinned();
        let mesh = self.meshes.fetch(&mut self.backend, &item.geometry)?.clone();

        let texture = match material.diffuse_map() {
            Some(map) => self.textures.fetch(&mut self.backend, map)?,
            None => None,
        };
        let kind = ProgramKind::from(material.kind());
        let params = PermutationParams {
            skinning,
            diffuse_map: texture.is_some(),
            ..*light_params
        };

        let mut uniforms = DrawUniforms::new(&item.model, view, projection);
        uniforms.set_material(&material);
        uniforms.set_bones(&item.bones);

        let Material::Wireframe(wireframe) = &*material else {
            let program = self.programs.instance(&mut self.backend, kind, &params)?;
            let shadows = if kind.is_lit() { shadow_targets } else { &[] };
            self.backend.draw(&DrawCall {
                program: program.id,
                topology: mesh.topology(),
                cull: cull_mode(material.side()),
                vertex_buffers: mesh.vertex_buffers(),
                index_buffer: mesh.index_buffer(),
                count: mesh.draw_count(),
                vertex_count: mesh.vertex_count(),
                uniforms: uniforms.as_bytes(),
                diffuse_texture: texture.map(|t| t.id),
                shadow_maps: shadows,
            })?;
            stats.draw_calls += 1;
            return Ok(());
        };

        if mesh.primitive() != PrimitiveType::Triangles {
            let program = self.programs.instance(&mut self.backend, kind, &params)?;
            self.draw_unlit(&mesh, program.id, mesh.topology(), None, &uniforms)?;
            stats.draw_calls += 1;
            return Ok(());
        }

        if wireframe.fill_color.w > 0.0 {
            let program = self.programs.instance(&mut self.backend, ProgramKind::Constant, &params)?;
            let mut fill = uniforms;
            fill.set_color(wireframe.fill_color);
            self.draw_unlit(&mesh, program.id, Topology::Triangles, None, &fill)?;
            stats.draw_calls += 1;
        }
        match self.meshes.fetch_edges(&mut self.backend, &item.geometry)? {
            Some(edges) => {
                let program = self.programs.instance(&mut self.backend, kind, &params)?;
                self.draw_unlit(&mesh, program.id, Topology::Lines, Some(edges), &uniforms)?;
                stats.draw_calls += 1;
            }
            None => tracing::debug!("Wireframe mesh has no edges"),
        }
        Ok(())
    }

    /// Draws `mesh` without lighting, textures or culling. `indices`
    /// overrides the mesh's own index buffer.
    fn draw_unlit(
        &mut self,
        mesh: &MeshResource,
        program: ProgramId,
        topology: Topology,
        indices: Option<(BufferId, u32)>,
        uniforms: &DrawUniforms,
    ) -> Result<(), RenderError> {
        let (index_buffer, count) = match indices {
            Some((id, count)) => (Some(id), count),
            None => (mesh.index_buffer(), mesh.draw_count()),
        };
        self.backend.draw(&DrawCall {
            program,
            topology,
            cull: CullMode::None,
            vertex_buffers: mesh.vertex_buffers(),
            index_buffer,
            count,
            vertex_count: mesh.vertex_count(),
            uniforms: uniforms.as_bytes(),
            diffuse_texture: None,
            shadow_maps: &[],
        })?;
        Ok(())
    }
}

impl<B: GpuBackend> Drop for Renderer<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Faces culled for a material side.
pub fn cull_mode(side: Side) -> CullMode {
    match side {
        Side::Front => CullMode::Back,
        Side::Back => CullMode::Front,
        Side::Both => CullMode::None,
    }
}

/// Visible drawables in traversal order. Only a node's own flag decides its
/// visibility; children of hidden nodes are still drawn.
fn collect_drawables(scene: &Node, validate: bool, stats: &mut FrameStats) -> Vec<DrawItem> {
    let mut items = Vec::new();
    let mut any_skinned = false;
    scene.visit(|node: &Node, global: &Mat4| {
        if !node.visible {
            return;
        }
        for drawable in node.drawables() {
            let geometry = drawable.geometry().read();
            if geometry.vertex_count() == 0 {
                stats.skipped_drawables += 1;
                continue;
            }
            if validate {
                if let Err(e) = geometry.validate() {
                    tracing::warn!("Skipping drawable of node '{}': {}", node.name, e);
                    stats.skipped_drawables += 1;
                    continue;
                }
            }
            any_skinned |= geometry.is_skinned();
            items.push(DrawItem {
                geometry: Arc::clone(drawable.geometry()),
                material: drawable.material().cloned(),
                model: *global,
                bones: Vec::new(),
            });
        }
    });

    if any_skinned {
        let globals = scene.global_transforms();
        for item in &mut items {
            let geometry = item.geometry.read();
            if !geometry.is_skinned() {
                continue;
            }
            let inverse_model = item.model.inverse();
            item.bones = geometry
                .bones()
                .iter()
                .take(MAX_BONES)
                .map(|bone| {
                    let bone_global = globals.get(&bone.node).copied().unwrap_or(item.model);
                    inverse_model * bone_global * bone.offset
                })
                .collect();
        }
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::VertexAttribute;
    use crate::backend::mock::MockBackend;
    use approx::assert_relative_eq;
    use glam::Vec4;
    use xviz_scene::{DirectionalLight, Drawable, Geometry, Light};

    fn camera() -> Camera {
        let mut camera = Camera::perspective(1.0, 640.0 / 480.0, 0.1, 100.0);
        camera.look_at(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, Vec3::Y);
        camera
    }

    fn triangle() -> GeometryRef {
        Geometry::new(PrimitiveType::Triangles)
            .with_vertices(vec![Vec3::ZERO, Vec3::X, Vec3::Y])
            .with_normals(vec![Vec3::Z; 3])
            .into_shared()
    }

    fn phong() -> Option<Arc<Material>> {
        Some(Arc::new(Material::Phong(PhongMaterial::with_color(Vec3::ONE))))
    }

    fn sun(shadows: bool) -> Node {
        Node::new("sun").with_light(Light::Directional(DirectionalLight::default()).with_shadows(shadows))
    }

    fn mock_renderer() -> Renderer<MockBackend> {
        Renderer::new(MockBackend::new(), RendererConfig::default())
    }

    #[test]
    fn test_single_light_triangle_compiles_one_program() {
        let scene = Node::new("root")
            .with_child(sun(false))
            .with_child(Node::new("mesh").with_drawable(Drawable::new(triangle(), phong())));
        let mut renderer = mock_renderer();

        let stats = renderer.render(&scene, &camera(), true).unwrap();
        assert_eq!(stats.draw_calls, 1);
        assert_eq!(stats.shadow_passes, 0);
        assert_eq!(
            renderer.backend().compiled_labels(),
            vec!["phong:d1:ds0:s0:ss0:p0:ps0:sk0:dm0"]
        );

        renderer.render(&scene, &camera(), true).unwrap();
        assert_eq!(renderer.programs().compilations(), 1);
        assert_eq!(renderer.state(), FrameState::Idle);
        assert_eq!(renderer.backend().vertex_uploads(VertexAttribute::Position), 1);
    }

    #[test]
    fn test_missing_material_uses_default_phong() {
        let scene = Node::new("root").with_drawable(Drawable::new(triangle(), None));
        let mut renderer = mock_renderer();
        renderer.render(&scene, &camera(), false).unwrap();

        let draws = &renderer.backend().draws;
        assert_eq!(draws.len(), 1);
        assert_eq!(draws[0].cull, CullMode::Back);
        assert_eq!(
            renderer.backend().compiled_labels(),
            vec!["phong:d0:ds0:s0:ss0:p0:ps0:sk0:dm0"]
        );
        assert!(matches!(**renderer.default_material(), Material::Phong(_)));
    }

    #[test]
    fn test_hidden_node_skips_only_itself() {
        let mut hidden = Node::new("hidden").with_drawable(Drawable::new(triangle(), phong()));
        hidden.visible = false;
        let hidden = hidden.with_child(Node::new("child").with_drawable(Drawable::new(triangle(), phong())));
        let scene = Node::new("root").with_child(hidden);

        let mut renderer = mock_renderer();
        let stats = renderer.render(&scene, &camera(), true).unwrap();
        assert_eq!(stats.draw_calls, 1);
    }

    #[test]
    fn test_shadow_maps_created_once_per_light() {
        let scene = Node::new("root")
            .with_child(sun(true))
            .with_child(Node::new("mesh").with_drawable(Drawable::new(triangle(), phong())));
        let mut renderer = mock_renderer();

        let stats = renderer.render(&scene, &camera(), true).unwrap();
        assert_eq!(stats.shadow_passes, 1);
        // One depth draw plus one color draw.
        assert_eq!(stats.draw_calls, 2);
        renderer.render(&scene, &camera(), true).unwrap();

        let backend = renderer.backend();
        assert_eq!(backend.depth_targets.len(), 1);
        assert_eq!(renderer.shadow_map_count(), 1);
        assert!(matches!(backend.passes[0], PassTarget::Depth(_)));
        assert!(matches!(backend.passes[1], PassTarget::Default { .. }));
        let color_draw = backend
            .draws
            .iter()
            .find(|d| matches!(d.target, PassTarget::Default { .. }))
            .unwrap();
        assert_eq!(color_draw.shadow_units, vec![0]);
        assert_eq!(
            backend.compiled_labels(),
            vec!["shadow_depth:sk0", "phong:d0:ds1:s0:ss0:p0:ps0:sk0:dm0"]
        );
    }

    #[test]
    fn test_shadows_disabled_by_config() {
        let scene = Node::new("root")
            .with_child(sun(true))
            .with_child(Node::new("mesh").with_drawable(Drawable::new(triangle(), phong())));
        let config = RendererConfig {
            shadows_enabled: false,
            ..Default::default()
        };
        let mut renderer = Renderer::new(MockBackend::new(), config);
        let stats = renderer.render(&scene, &camera(), true).unwrap();
        assert_eq!(stats.shadow_passes, 0);
        assert!(renderer.backend().depth_targets.is_empty());
    }

    #[test]
    fn test_wireframe_draws_fill_then_edges() {
        let mut material = xviz_scene::WireframeMaterial {
            line_color: Vec4::ONE,
            fill_color: Vec4::new(0.2, 0.2, 0.2, 1.0),
            line_width: 1.0,
        };
        let scene = Node::new("root").with_drawable(Drawable::new(
            triangle(),
            Some(Arc::new(Material::Wireframe(material.clone()))),
        ));
        let mut renderer = mock_renderer();
        renderer.render(&scene, &camera(), true).unwrap();

        let draws = &renderer.backend().draws;
        assert_eq!(draws.len(), 2);
        assert_eq!(draws[0].topology, Topology::Triangles);
        assert_eq!(draws[1].topology, Topology::Lines);
        assert!(draws[1].indexed);
        assert_eq!(draws[1].count, 6);

        // A transparent fill draws edges only.
        material.fill_color = Vec4::ZERO;
        let scene = Node::new("root").with_drawable(Drawable::new(
            triangle(),
            Some(Arc::new(Material::Wireframe(material))),
        ));
        let mut renderer = mock_renderer();
        renderer.render(&scene, &camera(), true).unwrap();
        assert_eq!(renderer.backend().draws.len(), 1);
    }

    #[test]
    fn test_empty_and_invalid_geometry_is_skipped() {
        let empty = Geometry::new(PrimitiveType::Triangles).into_shared();
        let invalid = Geometry::new(PrimitiveType::Triangles)
            .with_vertices(vec![Vec3::ZERO; 3])
            .with_indices(vec![0, 1, 7])
            .into_shared();
        let scene = Node::new("root")
            .with_drawable(Drawable::new(empty, None))
            .with_drawable(Drawable::new(invalid, None))
            .with_drawable(Drawable::new(triangle(), None));
        let mut renderer = mock_renderer();
        let stats = renderer.render(&scene, &camera(), true).unwrap();
        assert_eq!(stats.skipped_drawables, 2);
        assert_eq!(stats.draw_calls, 1);
    }

    #[test]
    fn test_compile_failure_aborts_frame() {
        let scene = Node::new("root").with_drawable(Drawable::new(triangle(), None));
        let mut renderer = mock_renderer();
        renderer.backend_mut().fail_compile = true;

        let err = renderer.render(&scene, &camera(), true).unwrap_err();
        assert!(matches!(err, RenderError::ShaderCompilation { .. }));
        assert_eq!(renderer.state(), FrameState::Idle);

        // The pass was closed, so the next frame can run.
        renderer.backend_mut().fail_compile = false;
        assert!(renderer.render(&scene, &camera(), true).is_ok());
    }

    #[test]
    fn test_project_maps_view_center_to_viewport_center() {
        let mut renderer = mock_renderer();
        renderer.render(&Node::new("root"), &camera(), true).unwrap();
        let p = renderer.project(Vec3::ZERO);
        assert_relative_eq!(p.x, 320.0, epsilon = 1e-3);
        assert_relative_eq!(p.y, 240.0, epsilon = 1e-3);

        // Points above the center land above it in window coordinates.
        assert!(renderer.project(Vec3::Y).y < 240.0);

        renderer.resize(200, 100);
        renderer.render(&Node::new("root"), &camera(), true).unwrap();
        let p = renderer.project(Vec3::ZERO);
        assert_relative_eq!(p.x, 100.0, epsilon = 1e-3);
        assert_relative_eq!(p.y, 50.0, epsilon = 1e-3);
    }

    #[test]
    fn test_released_geometry_is_freed_next_frame() {
        let geometry = triangle();
        let scene = Node::new("root").with_drawable(Drawable::new(Arc::clone(&geometry), None));
        let mut renderer = mock_renderer();
        renderer.render(&scene, &camera(), true).unwrap();
        assert_eq!(renderer.meshes().live(), 1);

        renderer.release_geometry(&geometry);
        assert!(renderer.backend().destroyed_buffers.is_empty());
        renderer.render(&Node::new("root"), &camera(), true).unwrap();
        assert_eq!(renderer.meshes().live(), 0);
        assert_eq!(renderer.backend().destroyed_buffers.len(), 2);
    }

    #[test]
    fn test_shutdown_frees_everything() {
        let scene = Node::new("root")
            .with_child(sun(true))
            .with_drawable(Drawable::new(triangle(), None));
        let mut renderer = mock_renderer();
        renderer.render(&scene, &camera(), true).unwrap();

        renderer.shutdown();
        assert!(renderer.backend().buffers.is_empty());
        assert!(renderer.backend().depth_targets.is_empty());
        assert_eq!(renderer.meshes().state(), crate::resources::CacheState::Teardown);
    }

    #[test]
    fn test_moved_or_demoted_light_frees_its_shadow_map() {
        let mesh = || Node::new("mesh").with_drawable(Drawable::new(triangle(), phong()));
        let mut renderer = mock_renderer();
        let scene = Node::new("root").with_child(sun(true)).with_child(mesh());
        renderer.render(&scene, &camera(), true).unwrap();
        let first = renderer.backend().depth_targets.clone();

        // Re-parenting the light changes its path in the tree.
        let scene = Node::new("root")
            .with_child(Node::new("rig").with_child(sun(true)))
            .with_child(mesh());
        renderer.render(&scene, &camera(), true).unwrap();
        assert_eq!(renderer.shadow_map_count(), 1);
        assert_eq!(renderer.backend().depth_targets.len(), 1);
        assert!(renderer.backend().depth_targets.is_disjoint(&first));

        let scene = Node::new("root").with_child(sun(false)).with_child(mesh());
        renderer.render(&scene, &camera(), true).unwrap();
        assert_eq!(renderer.shadow_map_count(), 0);
        assert!(renderer.backend().depth_targets.is_empty());
    }

    #[test]
    fn test_clear_depth_keeps_color() {
        let mut renderer = mock_renderer();
        renderer.clear_depth().unwrap();
        assert_eq!(
            renderer.backend().passes,
            vec![PassTarget::Default {
                viewport: Viewport::default(),
                clear_color: None,
            }]
        );
        assert!(renderer.backend().draws.is_empty());
    }

    #[test]
    fn test_read_depth_uses_last_frame_planes() {
        let mut renderer = mock_renderer();
        renderer.render(&Node::new("root"), &camera(), true).unwrap();

        renderer.backend_mut().depth_value = 1.0;
        let depth = renderer.read_depth().unwrap();
        assert_eq!((depth.width, depth.height), (640, 480));
        assert_eq!(depth.distances.len(), 640 * 480);
        assert_relative_eq!(depth.zfar, 100.0);
        assert_relative_eq!(depth.get(0, 0).unwrap(), 100.0, epsilon = 0.1);
        assert_eq!(depth.get(640, 0), None);

        renderer.backend_mut().depth_value = 0.0;
        let depth = renderer.read_depth().unwrap();
        assert_relative_eq!(depth.get(639, 479).unwrap(), 0.1, epsilon = 1e-5);
    }

    #[test]
    fn test_render_after_shutdown_fails() {
        let scene = Node::new("root").with_drawable(Drawable::new(triangle(), None));
        let mut renderer = mock_renderer();
        renderer.shutdown();

        let err = renderer.render(&scene, &camera(), true).unwrap_err();
        assert_eq!(err, RenderError::ShutDown);
        assert!(renderer.backend().buffers.is_empty());
        assert!(renderer.backend().passes.is_empty());
        assert_eq!(renderer.clear_depth(), Err(RenderError::ShutDown));
    }

    #[test]
    fn test_cull_mode_follows_side() {
        assert_eq!(cull_mode(Side::Front), CullMode::Back);
        assert_eq!(cull_mode(Side::Back), CullMode::Front);
        assert_eq!(cull_mode(Side::Both), CullMode::None);
    }
}
