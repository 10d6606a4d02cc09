//! wgpu implementation of [`GpuBackend`].
//!
//! Draws are recorded between `begin_pass` and `end_pass`, then encoded and
//! submitted as one render pass. Per-draw uniforms are packed into a ring
//! buffer addressed with dynamic offsets.

use std::collections::HashMap;
use std::sync::Arc;

use wgpu::util::DeviceExt;

use super::gpu_resources;
use super::*;
use crate::constants::{shadow, MAX_SHADOW_MAPS, UNIFORM_ALIGNMENT};
use crate::uniforms::{DrawUniforms, FrameUniforms};

const FRAME_UNIFORM_SIZE: u64 = std::mem::size_of::<FrameUniforms>() as u64;
const DRAW_UNIFORM_SIZE: u64 = std::mem::size_of::<DrawUniforms>() as u64;

struct CompiledProgram {
    label: String,
    module: wgpu::ShaderModule,
    attributes: Vec<VertexAttribute>,
    pass: PassKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PipelineKey {
    program: ProgramId,
    topology: Topology,
    cull: CullMode,
}

struct GpuTexture {
    _texture: wgpu::Texture,
    view: wgpu::TextureView,
    sampler: wgpu::Sampler,
}

struct DepthTarget {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
}

struct DefaultTarget {
    view: wgpu::TextureView,
    width: u32,
    height: u32,
    depth_texture: wgpu::Texture,
    depth_view: wgpu::TextureView,
}

#[derive(Clone, Copy)]
enum VertexSource {
    Buffer(BufferId),
    Fallback,
}

struct RecordedDraw {
    pipeline: PipelineKey,
    vertex_sources: Vec<VertexSource>,
    index_buffer: Option<BufferId>,
    count: u32,
    uniform_offset: u32,
    material: Option<TextureId>,
    shadows: [Option<DepthTargetId>; MAX_SHADOW_MAPS],
}

struct ActivePass {
    target: PassTarget,
    draws: Vec<RecordedDraw>,
    staging: Vec<u8>,
}

/// GPU backend over a wgpu device and queue.
pub struct WgpuBackend {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    color_format: wgpu::TextureFormat,
    border_supported: bool,
    uniform_stride: u64,
    next_id: u64,

    frame_layout: wgpu::BindGroupLayout,
    material_layout: wgpu::BindGroupLayout,
    shadow_layout: wgpu::BindGroupLayout,
    color_pipeline_layout: wgpu::PipelineLayout,
    depth_pipeline_layout: wgpu::PipelineLayout,

    frame_buffer: wgpu::Buffer,
    draw_ring: wgpu::Buffer,
    draw_ring_capacity: u64,
    frame_bind_group: wgpu::BindGroup,

    white_texture: GpuTexture,
    dummy_shadows: Vec<DepthTarget>,
    shadow_sampler: wgpu::Sampler,
    fallback_vertices: wgpu::Buffer,
    fallback_capacity: u64,

    buffers: HashMap<BufferId, wgpu::Buffer>,
    textures: HashMap<TextureId, GpuTexture>,
    depth_targets: HashMap<DepthTargetId, DepthTarget>,
    programs: HashMap<ProgramId, CompiledProgram>,
    pipelines: HashMap<PipelineKey, wgpu::RenderPipeline>,
    material_groups: HashMap<Option<TextureId>, wgpu::BindGroup>,
    shadow_groups: HashMap<[Option<DepthTargetId>; MAX_SHADOW_MAPS], wgpu::BindGroup>,

    default_target: Option<DefaultTarget>,
    active: Option<ActivePass>,
}

impl WgpuBackend {
    /// Creates the backend for color targets of `color_format`.
    pub fn new(
        device: Arc<wgpu::Device>,
        queue: Arc<wgpu::Queue>,
        color_format: wgpu::TextureFormat,
    ) -> Self {
        let border_supported = device
            .features()
            .contains(wgpu::Features::ADDRESS_MODE_CLAMP_TO_BORDER);
        let alignment = (device.limits().min_uniform_buffer_offset_alignment as u64).max(UNIFORM_ALIGNMENT);
        let uniform_stride = gpu_resources::align_to(DRAW_UNIFORM_SIZE, alignment);

        let frame_layout =
            gpu_resources::create_frame_bind_group_layout(&device, FRAME_UNIFORM_SIZE, DRAW_UNIFORM_SIZE);
        let material_layout = gpu_resources::create_material_bind_group_layout(&device);
        let shadow_layout = gpu_resources::create_shadow_bind_group_layout(&device);

        let color_pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Color Pipeline Layout"),
            bind_group_layouts: &[&frame_layout, &material_layout, &shadow_layout],
            push_constant_ranges: &[],
        });
        let depth_pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Depth Pipeline Layout"),
            bind_group_layouts: &[&frame_layout],
            push_constant_ranges: &[],
        });

        let frame_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Frame Uniform Buffer"),
            contents: bytemuck::bytes_of(&FrameUniforms::default()),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });
        let draw_ring_capacity = uniform_stride * 64;
        let draw_ring = Self::create_draw_ring(&device, draw_ring_capacity);
        let frame_bind_group = gpu_resources::create_frame_bind_group(
            &device,
            &frame_layout,
            &frame_buffer,
            &draw_ring,
            DRAW_UNIFORM_SIZE,
        );

        let white_texture = Self::upload_texture(
            &device,
            &queue,
            &TextureDesc {
                label: "White Texture".into(),
                width: 1,
                height: 1,
                wrap_u: WrapMode::Repeat,
                wrap_v: WrapMode::Repeat,
                min_filter: FilterMode::Nearest,
                mag_filter: FilterMode::Nearest,
            },
            &[255; 4],
            border_supported,
        );
        let dummy_shadows = (0..MAX_SHADOW_MAPS)
            .map(|_| {
                let (texture, view) = gpu_resources::create_shadow_texture(&device, 1, 1);
                DepthTarget { texture, view }
            })
            .collect();
        let shadow_sampler = gpu_resources::create_shadow_sampler(&device);

        let fallback_capacity = 16 * 1024;
        let fallback_vertices = Self::create_fallback_vertices(&device, fallback_capacity);

        tracing::info!(
            "wgpu backend ready: format {:?}, draw uniform stride {}",
            color_format,
            uniform_stride
        );

        Self {
            device,
            queue,
            color_format,
            border_supported,
            uniform_stride,
            next_id: 0,
            frame_layout,
            material_layout,
            shadow_layout,
            color_pipeline_layout,
            depth_pipeline_layout,
            frame_buffer,
            draw_ring,
            draw_ring_capacity,
            frame_bind_group,
            white_texture,
            dummy_shadows,
            shadow_sampler,
            fallback_vertices,
            fallback_capacity,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            depth_targets: HashMap::new(),
            programs: HashMap::new(),
            pipelines: HashMap::new(),
            material_groups: HashMap::new(),
            shadow_groups: HashMap::new(),
            default_target: None,
            active: None,
        }
    }

    /// Returns the wgpu device.
    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    /// Returns the wgpu queue.
    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Returns the color target format pipelines are built for.
    pub fn color_format(&self) -> wgpu::TextureFormat {
        self.color_format
    }

    /// Sets the view drawn by default passes. The depth buffer follows its size.
    pub fn set_default_target(&mut self, view: wgpu::TextureView, width: u32, height: u32) {
        match self.default_target.as_mut() {
            Some(target) if target.width == width && target.height == height => {
                target.view = view;
            }
            _ => {
                let (depth_texture, depth_view) =
                    gpu_resources::create_depth_texture(&self.device, width, height);
                self.default_target = Some(DefaultTarget {
                    view,
                    width,
                    height,
                    depth_texture,
                    depth_view,
                });
            }
        }
    }

    fn next(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn create_draw_ring(device: &wgpu::Device, capacity: u64) -> wgpu::Buffer {
        device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Draw Uniform Ring"),
            size: capacity,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
    }

    fn create_fallback_vertices(device: &wgpu::Device, capacity: u64) -> wgpu::Buffer {
        // New buffers are zero-initialized.
        device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Fallback Vertex Buffer"),
            size: capacity,
            usage: wgpu::BufferUsages::VERTEX,
            mapped_at_creation: false,
        })
    }

    fn upload_texture(
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        desc: &TextureDesc,
        rgba: &[u8],
        border_supported: bool,
    ) -> GpuTexture {
        let size = wgpu::Extent3d {
            width: desc.width.max(1),
            height: desc.height.max(1),
            depth_or_array_layers: 1,
        };
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some(desc.label.as_str()),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8UnormSrgb,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: &texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            rgba,
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(4 * size.width),
                rows_per_image: Some(size.height),
            },
            size,
        );
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let sampler = gpu_resources::create_texture_sampler(
            device,
            desc.wrap_u,
            desc.wrap_v,
            desc.min_filter,
            desc.mag_filter,
            border_supported,
        );
        GpuTexture {
            _texture: texture,
            view,
            sampler,
        }
    }

    /// Runs `f` inside an error scope and reports the captured error, if any.
    fn scoped<T>(&self, filter: wgpu::ErrorFilter, f: impl FnOnce(&wgpu::Device) -> T) -> (T, Option<String>) {
        self.device.push_error_scope(filter);
        let value = f(&self.device);
        let error = pollster::block_on(self.device.pop_error_scope());
        (value, error.map(|e| e.to_string()))
    }

    fn ensure_pipeline(&mut self, key: PipelineKey) -> Result<(), GpuError> {
        if self.pipelines.contains_key(&key) {
            return Ok(());
        }
        let program = self
            .programs
            .get(&key.program)
            .ok_or_else(|| GpuError::InvalidHandle(format!("{:?}", key.program)))?;

        let attributes: Vec<[wgpu::VertexAttribute; 1]> = program
            .attributes
            .iter()
            .map(|a| {
                [wgpu::VertexAttribute {
                    format: a.format(),
                    offset: 0,
                    shader_location: a.location(),
                }]
            })
            .collect();
        let layouts: Vec<wgpu::VertexBufferLayout> = program
            .attributes
            .iter()
            .zip(attributes.iter())
            .map(|(a, attribute)| wgpu::VertexBufferLayout {
                array_stride: a.stride(),
                step_mode: wgpu::VertexStepMode::Vertex,
                attributes: attribute,
            })
            .collect();

        let color_targets = [Some(wgpu::ColorTargetState {
            format: self.color_format,
            blend: Some(wgpu::BlendState::ALPHA_BLENDING),
            write_mask: wgpu::ColorWrites::ALL,
        })];
        let (layout, fragment, depth_compare) = match program.pass {
            PassKind::Color => (
                &self.color_pipeline_layout,
                Some(wgpu::FragmentState {
                    module: &program.module,
                    entry_point: Some("fs_main"),
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    targets: &color_targets,
                }),
                wgpu::CompareFunction::Less,
            ),
            PassKind::Depth => (&self.depth_pipeline_layout, None, wgpu::CompareFunction::LessEqual),
        };

        let label = format!("{} Pipeline", program.label);
        let (pipeline, error) = self.scoped(wgpu::ErrorFilter::Validation, |device| {
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(label.as_str()),
                layout: Some(layout),
                vertex: wgpu::VertexState {
                    module: &program.module,
                    entry_point: Some("vs_main"),
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    buffers: &layouts,
                },
                fragment,
                primitive: wgpu::PrimitiveState {
                    topology: gpu_resources::topology(key.topology),
                    strip_index_format: None,
                    front_face: wgpu::FrontFace::Ccw,
                    cull_mode: gpu_resources::cull_face(key.cull),
                    unclipped_depth: false,
                    polygon_mode: wgpu::PolygonMode::Fill,
                    conservative: false,
                },
                depth_stencil: Some(wgpu::DepthStencilState {
                    format: shadow::DEPTH_FORMAT,
                    depth_write_enabled: true,
                    depth_compare,
                    stencil: wgpu::StencilState::default(),
                    bias: wgpu::DepthBiasState::default(),
                }),
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
                cache: None,
            })
        });
        if let Some(message) = error {
            tracing::error!("Pipeline {} failed: {}", label, message);
            return Err(GpuError::Pipeline(message));
        }
        tracing::debug!("Created pipeline {} ({:?}, {:?})", label, key.topology, key.cull);
        self.pipelines.insert(key, pipeline);
        Ok(())
    }

    fn ensure_material_group(&mut self, texture: Option<TextureId>) {
        if self.material_groups.contains_key(&texture) {
            return;
        }
        let gpu_texture = texture
            .and_then(|id| self.textures.get(&id))
            .unwrap_or(&self.white_texture);
        let group = gpu_resources::create_material_bind_group(
            &self.device,
            &self.material_layout,
            &gpu_texture.view,
            &gpu_texture.sampler,
        );
        self.material_groups.insert(texture, group);
    }

    fn ensure_shadow_group(&mut self, key: [Option<DepthTargetId>; MAX_SHADOW_MAPS]) {
        if self.shadow_groups.contains_key(&key) {
            return;
        }
        let views: [&wgpu::TextureView; MAX_SHADOW_MAPS] = std::array::from_fn(|unit| {
            key[unit]
                .and_then(|id| self.depth_targets.get(&id))
                .map(|t| &t.view)
                .unwrap_or(&self.dummy_shadows[unit].view)
        });
        let group = gpu_resources::create_shadow_bind_group(
            &self.device,
            &self.shadow_layout,
            views,
            &self.shadow_sampler,
        );
        self.shadow_groups.insert(key, group);
    }

    fn ensure_fallback(&mut self, vertex_count: u32) {
        let needed = vertex_count as u64 * 16;
        if needed <= self.fallback_capacity {
            return;
        }
        self.fallback_capacity = needed.next_power_of_two();
        self.fallback_vertices = Self::create_fallback_vertices(&self.device, self.fallback_capacity);
    }

    fn ensure_ring(&mut self, needed: u64) {
        if needed <= self.draw_ring_capacity {
            return;
        }
        self.draw_ring_capacity = needed.next_power_of_two();
        self.draw_ring = Self::create_draw_ring(&self.device, self.draw_ring_capacity);
        self.frame_bind_group = gpu_resources::create_frame_bind_group(
            &self.device,
            &self.frame_layout,
            &self.frame_buffer,
            &self.draw_ring,
            DRAW_UNIFORM_SIZE,
        );
    }

    fn encode(&self, pass: &ActivePass) -> Result<wgpu::CommandBuffer, GpuError> {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Render Encoder"),
            });
        {
            let depth_ops = Some(wgpu::Operations {
                load: wgpu::LoadOp::Clear(1.0),
                store: wgpu::StoreOp::Store,
            });
            let mut render_pass = match pass.target {
                PassTarget::Default {
                    viewport,
                    clear_color,
                } => {
                    let target = self.default_target.as_ref().ok_or(GpuError::NoTarget)?;
                    let load = match clear_color {
                        Some([r, g, b, a]) => wgpu::LoadOp::Clear(wgpu::Color {
                            r: r as f64,
                            g: g as f64,
                            b: b as f64,
                            a: a as f64,
                        }),
                        None => wgpu::LoadOp::Load,
                    };
                    let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                        label: Some("Color Pass"),
                        color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                            view: &target.view,
                            resolve_target: None,
                            ops: wgpu::Operations {
                                load,
                                store: wgpu::StoreOp::Store,
                            },
                        })],
                        depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                            view: &target.depth_view,
                            depth_ops,
                            stencil_ops: None,
                        }),
                        timestamp_writes: None,
                        occlusion_query_set: None,
                    });
                    if !viewport.is_empty() {
                        let x = viewport.x.min(target.width.saturating_sub(1));
                        let y = viewport.y.min(target.height.saturating_sub(1));
                        let w = viewport.width.min(target.width - x).max(1);
                        let h = viewport.height.min(target.height - y).max(1);
                        render_pass.set_viewport(x as f32, y as f32, w as f32, h as f32, 0.0, 1.0);
                    }
                    render_pass
                }
                PassTarget::Depth(id) => {
                    let target = self
                        .depth_targets
                        .get(&id)
                        .ok_or_else(|| GpuError::InvalidHandle(format!("{:?}", id)))?;
                    encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                        label: Some("Shadow Pass"),
                        color_attachments: &[],
                        depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                            view: &target.view,
                            depth_ops,
                            stencil_ops: None,
                        }),
                        timestamp_writes: None,
                        occlusion_query_set: None,
                    })
                }
            };

            for draw in &pass.draws {
                let Some(pipeline) = self.pipelines.get(&draw.pipeline) else {
                    continue;
                };
                render_pass.set_pipeline(pipeline);
                render_pass.set_bind_group(0, &self.frame_bind_group, &[draw.uniform_offset]);
                if let PassTarget::Default { .. } = pass.target {
                    if let Some(group) = self.material_groups.get(&draw.material) {
                        render_pass.set_bind_group(1, group, &[]);
                    }
                    if let Some(group) = self.shadow_groups.get(&draw.shadows) {
                        render_pass.set_bind_group(2, group, &[]);
                    }
                }
                let mut complete = true;
                for (slot, source) in draw.vertex_sources.iter().enumerate() {
                    let buffer = match source {
                        VertexSource::Buffer(id) => self.buffers.get(id),
                        VertexSource::Fallback => Some(&self.fallback_vertices),
                    };
                    match buffer {
                        Some(buffer) => render_pass.set_vertex_buffer(slot as u32, buffer.slice(..)),
                        None => complete = false,
                    }
                }
                if !complete {
                    tracing::warn!("Skipping draw with destroyed vertex buffer");
                    continue;
                }
                match draw.index_buffer {
                    Some(id) => {
                        let Some(buffer) = self.buffers.get(&id) else {
                            tracing::warn!("Skipping draw with destroyed index buffer");
                            continue;
                        };
                        render_pass.set_index_buffer(buffer.slice(..), wgpu::IndexFormat::Uint32);
                        render_pass.draw_indexed(0..draw.count, 0, 0..1);
                    }
                    None => render_pass.draw(0..draw.count, 0..1),
                }
            }
        }
        Ok(encoder.finish())
    }
}

impl GpuBackend for WgpuBackend {
    fn create_buffer(&mut self, kind: BufferKind, contents: &[u8]) -> Result<BufferId, GpuError> {
        let usage = match kind {
            BufferKind::Vertex(_) => wgpu::BufferUsages::VERTEX,
            BufferKind::Index => wgpu::BufferUsages::INDEX,
        } | wgpu::BufferUsages::COPY_DST;
        let label = format!("{:?} Buffer", kind);
        // Empty buffers are legal but cannot be bound; keep a minimal size.
        let padded;
        let contents = if contents.is_empty() {
            padded = [0u8; 4];
            &padded[..]
        } else {
            contents
        };
        let (buffer, error) = self.scoped(wgpu::ErrorFilter::OutOfMemory, |device| {
            device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label.as_str()),
                contents,
                usage,
            })
        });
        if let Some(message) = error {
            tracing::error!("Buffer allocation failed: {}", message);
            return Err(GpuError::Allocation(label));
        }
        let id = BufferId(self.next());
        self.buffers.insert(id, buffer);
        Ok(id)
    }

    fn write_buffer(&mut self, id: BufferId, contents: &[u8]) -> Result<(), GpuError> {
        let buffer = self
            .buffers
            .get(&id)
            .ok_or_else(|| GpuError::InvalidHandle(format!("{:?}", id)))?;
        if contents.len() as u64 > buffer.size() {
            return Err(GpuError::InvalidHandle(format!(
                "{:?}: write of {} bytes into {} bytes",
                id,
                contents.len(),
                buffer.size()
            )));
        }
        // Copies must be multiples of four bytes; every attribute stride is.
        self.queue.write_buffer(buffer, 0, contents);
        Ok(())
    }

    fn destroy_buffer(&mut self, id: BufferId) {
        if let Some(buffer) = self.buffers.remove(&id) {
            buffer.destroy();
        }
    }

    fn create_texture(&mut self, desc: &TextureDesc, rgba: &[u8]) -> Result<TextureId, GpuError> {
        let (texture, error) = self.scoped(wgpu::ErrorFilter::OutOfMemory, |device| {
            Self::upload_texture(device, &self.queue, desc, rgba, self.border_supported)
        });
        if let Some(message) = error {
            tracing::error!("Texture allocation failed: {}", message);
            return Err(GpuError::Allocation(desc.label.clone()));
        }
        let id = TextureId(self.next());
        self.textures.insert(id, texture);
        Ok(id)
    }

    fn destroy_texture(&mut self, id: TextureId) {
        if self.textures.remove(&id).is_some() {
            self.material_groups.remove(&Some(id));
        }
    }

    fn create_depth_target(&mut self, width: u32, height: u32) -> Result<DepthTargetId, GpuError> {
        let ((texture, view), error) = self.scoped(wgpu::ErrorFilter::OutOfMemory, |device| {
            gpu_resources::create_shadow_texture(device, width, height)
        });
        if let Some(message) = error {
            tracing::error!("Depth target allocation failed: {}", message);
            return Err(GpuError::Allocation("depth target".into()));
        }
        let id = DepthTargetId(self.next());
        self.depth_targets.insert(id, DepthTarget { texture, view });
        Ok(id)
    }

    fn destroy_depth_target(&mut self, id: DepthTargetId) {
        if let Some(target) = self.depth_targets.remove(&id) {
            target.texture.destroy();
            self.shadow_groups.retain(|key, _| !key.contains(&Some(id)));
        }
    }

    fn compile_program(&mut self, desc: &ProgramDescriptor<'_>) -> Result<ProgramId, GpuError> {
        let (module, error) = self.scoped(wgpu::ErrorFilter::Validation, |device| {
            device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(desc.label),
                source: wgpu::ShaderSource::Wgsl(desc.source.into()),
            })
        });
        if let Some(message) = error {
            return Err(GpuError::ShaderCompilation {
                label: desc.label.to_string(),
                message,
            });
        }
        let id = ProgramId(self.next());
        self.programs.insert(
            id,
            CompiledProgram {
                label: desc.label.to_string(),
                module,
                attributes: desc.attributes.to_vec(),
                pass: desc.pass,
            },
        );
        Ok(id)
    }

    fn set_frame_uniforms(&mut self, contents: &[u8]) -> Result<(), GpuError> {
        if contents.len() as u64 > FRAME_UNIFORM_SIZE {
            return Err(GpuError::InvalidHandle("frame uniforms too large".into()));
        }
        self.queue.write_buffer(&self.frame_buffer, 0, contents);
        Ok(())
    }

    fn begin_pass(&mut self, target: PassTarget) -> Result<(), GpuError> {
        if self.active.is_some() {
            return Err(GpuError::PassActive);
        }
        match target {
            PassTarget::Default { .. } if self.default_target.is_none() => {
                return Err(GpuError::NoTarget);
            }
            PassTarget::Depth(id) if !self.depth_targets.contains_key(&id) => {
                return Err(GpuError::InvalidHandle(format!("{:?}", id)));
            }
            _ => {}
        }
        self.active = Some(ActivePass {
            target,
            draws: Vec::new(),
            staging: Vec::new(),
        });
        Ok(())
    }

    fn draw(&mut self, call: &DrawCall<'_>) -> Result<(), GpuError> {
        let pipeline = PipelineKey {
            program: call.program,
            topology: call.topology,
            cull: call.cull,
        };
        self.ensure_pipeline(pipeline)?;
        let attributes = self
            .programs
            .get(&call.program)
            .map(|p| p.attributes.clone())
            .unwrap_or_default();

        let mut needs_fallback = false;
        let vertex_sources: Vec<VertexSource> = attributes
            .iter()
            .map(|attribute| {
                match call.vertex_buffers.iter().find(|(a, _)| a == attribute) {
                    Some((_, id)) => VertexSource::Buffer(*id),
                    None => {
                        needs_fallback = true;
                        VertexSource::Fallback
                    }
                }
            })
            .collect();
        if needs_fallback {
            self.ensure_fallback(call.vertex_count);
        }

        let mut shadows = [None; MAX_SHADOW_MAPS];
        for (unit, id) in call.shadow_maps {
            if let Some(slot) = shadows.get_mut(*unit as usize) {
                *slot = Some(*id);
            }
        }
        let is_color = matches!(
            self.active.as_ref().map(|p| p.target),
            Some(PassTarget::Default { .. })
        );
        if is_color {
            self.ensure_material_group(call.diffuse_texture);
            self.ensure_shadow_group(shadows);
        }

        let stride = self.uniform_stride as usize;
        let active = self.active.as_mut().ok_or(GpuError::NoActivePass)?;
        let uniform_offset = active.staging.len();
        active.staging.extend_from_slice(call.uniforms);
        active.staging.resize(uniform_offset + stride, 0);
        active.draws.push(RecordedDraw {
            pipeline,
            vertex_sources,
            index_buffer: call.index_buffer,
            count: call.count,
            uniform_offset: uniform_offset as u32,
            material: call.diffuse_texture,
            shadows,
        });
        Ok(())
    }

    fn end_pass(&mut self) -> Result<(), GpuError> {
        let pass = self.active.take().ok_or(GpuError::NoActivePass)?;
        if !pass.staging.is_empty() {
            self.ensure_ring(pass.staging.len() as u64);
            self.queue.write_buffer(&self.draw_ring, 0, &pass.staging);
        }
        let commands = self.encode(&pass)?;
        self.queue.submit(std::iter::once(commands));
        Ok(())
    }

    fn default_target_size(&self) -> (u32, u32) {
        self.default_target
            .as_ref()
            .map(|t| (t.width, t.height))
            .unwrap_or((0, 0))
    }

    fn read_depth(&mut self) -> Result<Vec<f32>, GpuError> {
        if self.active.is_some() {
            return Err(GpuError::PassActive);
        }
        let target = self.default_target.as_ref().ok_or(GpuError::NoTarget)?;
        let (width, height) = (target.width.max(1), target.height.max(1));
        let unpadded = width as u64 * 4;
        let padded = gpu_resources::align_to(unpadded, wgpu::COPY_BYTES_PER_ROW_ALIGNMENT as u64);

        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Depth Readback"),
            size: padded * height as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Depth Readback Encoder"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture: &target.depth_texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::DepthOnly,
            },
            wgpu::ImageCopyBuffer {
                buffer: &buffer,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(padded as u32),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = buffer.slice(..);
        let (tx, rx) = crossbeam_channel::bounded(1);
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|e| GpuError::Readback(e.to_string()))?
            .map_err(|e| GpuError::Readback(e.to_string()))?;

        let data = slice.get_mapped_range();
        let mut depth = Vec::with_capacity((width * height) as usize);
        for row in data.chunks(padded as usize) {
            depth.extend(
                row[..unpadded as usize]
                    .chunks_exact(4)
                    .map(bytemuck::pod_read_unaligned::<f32>),
            );
        }
        drop(data);
        buffer.unmap();
        Ok(depth)
    }
}
