//! Recording backend for tests.

use std::collections::{HashMap, HashSet};

use super::*;

#[derive(Debug, Clone)]
pub struct MockBuffer {
    pub kind: BufferKind,
    pub len: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedDraw {
    pub program: ProgramId,
    pub topology: Topology,
    pub cull: CullMode,
    pub count: u32,
    pub indexed: bool,
    pub attributes: Vec<VertexAttribute>,
    pub diffuse_texture: Option<TextureId>,
    pub shadow_units: Vec<u32>,
    pub target: PassTarget,
}

/// Backend that validates handles and counts every call.
#[derive(Debug, Default)]
pub struct MockBackend {
    next_id: u64,
    pub buffers: HashMap<BufferId, MockBuffer>,
    /// Creations plus writes, per buffer kind.
    pub uploads: HashMap<BufferKind, usize>,
    pub destroyed_buffers: Vec<BufferId>,
    pub textures: HashSet<TextureId>,
    pub textures_created: usize,
    pub depth_targets: HashSet<DepthTargetId>,
    pub programs: Vec<(ProgramId, String, String)>,
    pub passes: Vec<PassTarget>,
    pub draws: Vec<RecordedDraw>,
    pub frame_uniform_writes: usize,
    pub fail_compile: bool,
    pub fail_alloc: bool,
    /// Value returned for every pixel by `read_depth`.
    pub depth_value: f32,
    current_pass: Option<PassTarget>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn next(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn uploads_of(&self, kind: BufferKind) -> usize {
        self.uploads.get(&kind).copied().unwrap_or(0)
    }

    pub fn vertex_uploads(&self, attribute: VertexAttribute) -> usize {
        self.uploads_of(BufferKind::Vertex(attribute))
    }

    pub fn compiled_labels(&self) -> Vec<&str> {
        self.programs.iter().map(|(_, label, _)| label.as_str()).collect()
    }
}

impl GpuBackend for MockBackend {
    fn create_buffer(&mut self, kind: BufferKind, contents: &[u8]) -> Result<BufferId, GpuError> {
        if self.fail_alloc {
            return Err(GpuError::Allocation(format!("{:?} buffer", kind)));
        }
        let id = BufferId(self.next());
        self.buffers.insert(
            id,
            MockBuffer {
                kind,
                len: contents.len(),
            },
        );
        *self.uploads.entry(kind).or_default() += 1;
        Ok(id)
    }

    fn write_buffer(&mut self, id: BufferId, contents: &[u8]) -> Result<(), GpuError> {
        let buffer = self
            .buffers
            .get(&id)
            .ok_or_else(|| GpuError::InvalidHandle(format!("{:?}", id)))?;
        assert!(contents.len() <= buffer.len, "write past end of {:?}", id);
        *self.uploads.entry(buffer.kind).or_default() += 1;
        Ok(())
    }

    fn destroy_buffer(&mut self, id: BufferId) {
        assert!(self.buffers.remove(&id).is_some(), "double free of {:?}", id);
        self.destroyed_buffers.push(id);
    }

    fn create_texture(&mut self, desc: &TextureDesc, rgba: &[u8]) -> Result<TextureId, GpuError> {
        assert_eq!(rgba.len(), (desc.width * desc.height * 4) as usize);
        if self.fail_alloc {
            return Err(GpuError::Allocation(desc.label.clone()));
        }
        let id = TextureId(self.next());
        self.textures.insert(id);
        self.textures_created += 1;
        Ok(id)
    }

    fn destroy_texture(&mut self, id: TextureId) {
        assert!(self.textures.remove(&id), "double free of {:?}", id);
    }

    fn create_depth_target(&mut self, _width: u32, _height: u32) -> Result<DepthTargetId, GpuError> {
        if self.fail_alloc {
            return Err(GpuError::Allocation("depth target".into()));
        }
        let id = DepthTargetId(self.next());
        self.depth_targets.insert(id);
        Ok(id)
    }

    fn destroy_depth_target(&mut self, id: DepthTargetId) {
        assert!(self.depth_targets.remove(&id), "double free of {:?}", id);
    }

    fn compile_program(&mut self, desc: &ProgramDescriptor<'_>) -> Result<ProgramId, GpuError> {
        if self.fail_compile {
            return Err(GpuError::ShaderCompilation {
                label: desc.label.to_string(),
                message: "mock failure".into(),
            });
        }
        let id = ProgramId(self.next());
        self.programs
            .push((id, desc.label.to_string(), desc.source.to_string()));
        Ok(id)
    }

    fn set_frame_uniforms(&mut self, _contents: &[u8]) -> Result<(), GpuError> {
        self.frame_uniform_writes += 1;
        Ok(())
    }

    fn begin_pass(&mut self, target: PassTarget) -> Result<(), GpuError> {
        if self.current_pass.is_some() {
            return Err(GpuError::PassActive);
        }
        if let PassTarget::Depth(id) = target {
            if !self.depth_targets.contains(&id) {
                return Err(GpuError::InvalidHandle(format!("{:?}", id)));
            }
        }
        self.current_pass = Some(target);
        self.passes.push(target);
        Ok(())
    }

    fn draw(&mut self, call: &DrawCall<'_>) -> Result<(), GpuError> {
        let target = self.current_pass.ok_or(GpuError::NoActivePass)?;
        for (_, id) in call.vertex_buffers {
            if !self.buffers.contains_key(id) {
                return Err(GpuError::InvalidHandle(format!("{:?}", id)));
            }
        }
        if let Some(id) = call.index_buffer {
            if !self.buffers.contains_key(&id) {
                return Err(GpuError::InvalidHandle(format!("{:?}", id)));
            }
        }
        self.draws.push(RecordedDraw {
            program: call.program,
            topology: call.topology,
            cull: call.cull,
            count: call.count,
            indexed: call.index_buffer.is_some(),
            attributes: call.vertex_buffers.iter().map(|(a, _)| *a).collect(),
            diffuse_texture: call.diffuse_texture,
            shadow_units: call.shadow_maps.iter().map(|(unit, _)| *unit).collect(),
            target,
        });
        Ok(())
    }

    fn end_pass(&mut self) -> Result<(), GpuError> {
        self.current_pass.take().map(|_| ()).ok_or(GpuError::NoActivePass)
    }

    fn default_target_size(&self) -> (u32, u32) {
        (640, 480)
    }

    fn read_depth(&mut self) -> Result<Vec<f32>, GpuError> {
        if self.current_pass.is_some() {
            return Err(GpuError::PassActive);
        }
        let (width, height) = self.default_target_size();
        Ok(vec![self.depth_value; (width * height) as usize])
    }
}
