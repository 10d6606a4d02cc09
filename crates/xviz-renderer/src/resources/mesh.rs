//! GPU mesh cache.
//!
//! Each geometry gets one device buffer per present attribute. Entries live in
//! a generational slot table; the geometry only stores the [`SlotKey`], so a
//! recycled slot never aliases an old geometry. Released entries are queued
//! and destroyed by [`MeshCache::flush`] at the start of the next frame.

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use xviz_scene::{DirtyFlags, Geometry, GeometryRef, PrimitiveType, SlotKey};

use crate::backend::{BufferId, BufferKind, GpuBackend, Topology, VertexAttribute};
use crate::error::{GpuError, RenderError};

/// Lifecycle of a cache.
///
/// `Active` defers destruction to [`MeshCache::flush`]. `Teardown` is entered
/// once when the owner shuts down; from then on releases free immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheState {
    #[default]
    Active,
    Teardown,
}

/// Device buffers of one geometry.
#[derive(Debug, Clone)]
pub struct MeshResource {
    primitive: PrimitiveType,
    vertex_count: u32,
    vertex_buffers: Vec<(VertexAttribute, BufferId)>,
    /// Element count of each vertex buffer, same order.
    lengths: Vec<usize>,
    index_buffer: Option<BufferId>,
    index_count: u32,
    edges: Option<(BufferId, u32)>,
}

impl MeshResource {
    pub fn primitive(&self) -> PrimitiveType {
        self.primitive
    }

    pub fn topology(&self) -> Topology {
        match self.primitive {
            PrimitiveType::Triangles => Topology::Triangles,
            PrimitiveType::Lines => Topology::Lines,
            PrimitiveType::Points => Topology::Points,
        }
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    pub fn vertex_buffers(&self) -> &[(VertexAttribute, BufferId)] {
        &self.vertex_buffers
    }

    pub fn buffer(&self, attribute: VertexAttribute) -> Option<BufferId> {
        self.vertex_buffers
            .iter()
            .find(|(a, _)| *a == attribute)
            .map(|(_, id)| *id)
    }

    pub fn index_buffer(&self) -> Option<BufferId> {
        self.index_buffer
    }

    pub fn is_indexed(&self) -> bool {
        self.index_buffer.is_some() && self.index_count > 0
    }

    /// Indices drawn when indexed, vertices otherwise.
    pub fn draw_count(&self) -> u32 {
        if self.is_indexed() {
            self.index_count
        } else {
            self.vertex_count
        }
    }

    /// Line-list index buffer over the triangle edges, once built.
    pub fn edges(&self) -> Option<(BufferId, u32)> {
        self.edges
    }

    fn length_of(&self, attribute: VertexAttribute) -> usize {
        self.vertex_buffers
            .iter()
            .zip(&self.lengths)
            .find(|((a, _), _)| *a == attribute)
            .map(|(_, len)| *len)
            .unwrap_or(0)
    }

    fn destroy<B: GpuBackend + ?Sized>(self, backend: &mut B) {
        for (_, id) in self.vertex_buffers {
            backend.destroy_buffer(id);
        }
        if let Some(id) = self.index_buffer {
            backend.destroy_buffer(id);
        }
        if let Some((id, _)) = self.edges {
            backend.destroy_buffer(id);
        }
    }
}

struct Entry {
    geometry: Weak<RwLock<Geometry>>,
    resource: MeshResource,
}

#[derive(Default)]
struct Slot {
    generation: u32,
    /// `None` while free or while the released entry waits in the queue.
    entry: Option<Entry>,
}

struct Queued {
    key: SlotKey,
    geometry: Weak<RwLock<Geometry>>,
    resource: MeshResource,
}

/// Owns the device buffers of every geometry drawn so far.
#[derive(Default)]
pub struct MeshCache {
    slots: Vec<Slot>,
    free: Vec<u32>,
    queue: Vec<Queued>,
    state: CacheState,
}

impl MeshCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> CacheState {
        self.state
    }

    /// Returns the buffers of `geometry`, uploading or updating them first.
    ///
    /// A hit re-uploads only the attributes whose dirty flag is set.
    pub fn fetch<B: GpuBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        geometry: &GeometryRef,
    ) -> Result<&MeshResource, RenderError> {
        let index = self.fetch_index(backend, geometry)?;
        self.resource_at(index)
    }

    /// Builds the edge index buffer of a triangle mesh on first request.
    ///
    /// Returns `None` for line and point geometry.
    pub fn fetch_edges<B: GpuBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        geometry: &GeometryRef,
    ) -> Result<Option<(BufferId, u32)>, RenderError> {
        let index = self.fetch_index(backend, geometry)?;
        let existing = self.resource_at(index)?;
        if existing.primitive != PrimitiveType::Triangles {
            return Ok(None);
        }
        if let Some(edges) = existing.edges {
            return Ok(Some(edges));
        }

        let edges = edge_indices(&geometry.read());
        if edges.is_empty() {
            return Ok(None);
        }
        let id = backend.create_buffer(BufferKind::Index, bytemuck::cast_slice(&edges))?;
        tracing::debug!("Built {} wireframe edges", edges.len() / 2);
        let resource = self.resource_at_mut(index)?;
        resource.edges = Some((id, edges.len() as u32));
        Ok(resource.edges)
    }

    /// Queues the buffers of `geometry` for destruction, or destroys them now
    /// during teardown.
    pub fn release<B: GpuBackend + ?Sized>(&mut self, backend: &mut B, geometry: &GeometryRef) {
        let Some(key) = geometry.read().gpu_slot() else {
            return;
        };
        if !self.is_live(key, geometry) {
            return;
        }
        match self.state {
            CacheState::Active => self.enqueue(key.index as usize),
            CacheState::Teardown => {
                if let Some(entry) = self.take_slot(key.index as usize) {
                    entry.resource.destroy(backend);
                }
                geometry.write().set_gpu_slot(None);
            }
        }
    }

    /// Destroys every queued resource, including those of dropped geometries.
    ///
    /// Called once per frame before any fetch.
    pub fn flush<B: GpuBackend + ?Sized>(&mut self, backend: &mut B) {
        let dead: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| {
                slot.entry
                    .as_ref()
                    .is_some_and(|e| e.geometry.strong_count() == 0)
            })
            .map(|(i, _)| i)
            .collect();
        if !dead.is_empty() {
            tracing::debug!("Sweeping {} meshes of dropped geometries", dead.len());
        }
        for index in dead {
            self.enqueue(index);
        }

        let queue = std::mem::take(&mut self.queue);
        if !queue.is_empty() {
            tracing::debug!("Destroying {} released meshes", queue.len());
        }
        for queued in queue {
            queued.resource.destroy(backend);
            if let Some(geometry) = queued.geometry.upgrade() {
                let mut geometry = geometry.write();
                if geometry.gpu_slot() == Some(queued.key) {
                    geometry.set_gpu_slot(None);
                }
            }
            if let Some(slot) = self.slots.get_mut(queued.key.index as usize) {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(queued.key.index);
            }
        }
    }

    /// Enters [`CacheState::Teardown`] and destroys every resource now.
    pub fn begin_teardown<B: GpuBackend + ?Sized>(&mut self, backend: &mut B) {
        if self.state == CacheState::Teardown {
            return;
        }
        self.state = CacheState::Teardown;
        for index in 0..self.slots.len() {
            if self.slots[index].entry.is_some() {
                self.enqueue(index);
            }
        }
        self.flush(backend);
        tracing::debug!("Mesh cache torn down");
    }

    /// Entries holding device buffers.
    pub fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.entry.is_some()).count()
    }

    /// Entries waiting for the next flush.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    fn is_live(&self, key: SlotKey, geometry: &GeometryRef) -> bool {
        self.slots.get(key.index as usize).is_some_and(|slot| {
            slot.generation == key.generation
                && slot
                    .entry
                    .as_ref()
                    .is_some_and(|e| std::ptr::eq(e.geometry.as_ptr(), Arc::as_ptr(geometry)))
        })
    }

    fn resource_at(&self, index: usize) -> Result<&MeshResource, RenderError> {
        self.slots
            .get(index)
            .and_then(|s| s.entry.as_ref())
            .map(|e| &e.resource)
            .ok_or_else(|| GpuError::InvalidHandle(format!("mesh slot {}", index)).into())
    }

    fn resource_at_mut(&mut self, index: usize) -> Result<&mut MeshResource, RenderError> {
        self.slots
            .get_mut(index)
            .and_then(|s| s.entry.as_mut())
            .map(|e| &mut e.resource)
            .ok_or_else(|| GpuError::InvalidHandle(format!("mesh slot {}", index)).into())
    }

    fn fetch_index<B: GpuBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        geometry: &GeometryRef,
    ) -> Result<usize, RenderError> {
        let key = geometry.read().gpu_slot();
        if let Some(key) = key.filter(|k| self.is_live(*k, geometry)) {
            let index = key.index as usize;
            if self.update(backend, index, geometry)? {
                return Ok(index);
            }
            // Array sizes changed; the old buffers go through the queue.
            tracing::debug!("Mesh attribute sizes changed, re-creating buffers");
            self.enqueue(index);
        }
        self.create(backend, geometry)
    }

    /// Re-uploads dirty attributes in place. Returns false when a dirty
    /// array no longer fits its buffer.
    fn update<B: GpuBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        index: usize,
        geometry: &GeometryRef,
    ) -> Result<bool, RenderError> {
        let mut geometry = geometry.write();
        let dirty = geometry.dirty();
        if !dirty.any() {
            return Ok(true);
        }
        let resource = self.resource_at(index)?;
        let fits = (!dirty.vertices || geometry.vertices().len() == resource.length_of(VertexAttribute::Position))
            && (!dirty.normals || geometry.normals().len() == resource.length_of(VertexAttribute::Normal))
            && (!dirty.colors || geometry.colors().len() == resource.length_of(VertexAttribute::Color));
        if !fits {
            return Ok(false);
        }

        if dirty.vertices {
            if let Some(id) = resource.buffer(VertexAttribute::Position) {
                backend.write_buffer(id, bytemuck::cast_slice(&vec3_data(geometry.vertices())))?;
            }
        }
        if dirty.normals {
            if let Some(id) = resource.buffer(VertexAttribute::Normal) {
                backend.write_buffer(id, bytemuck::cast_slice(&vec3_data(geometry.normals())))?;
            }
        }
        if dirty.colors {
            if let Some(id) = resource.buffer(VertexAttribute::Color) {
                let colors: Vec<[f32; 4]> = geometry.colors().iter().map(|c| c.to_array()).collect();
                backend.write_buffer(id, bytemuck::cast_slice(&colors))?;
            }
        }
        tracing::debug!(
            "Updated mesh attributes: vertices={} normals={} colors={}",
            dirty.vertices,
            dirty.normals,
            dirty.colors
        );
        geometry.clear_dirty(dirty);
        Ok(true)
    }

    fn create<B: GpuBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        geometry_ref: &GeometryRef,
    ) -> Result<usize, RenderError> {
        let mut geometry = geometry_ref.write();
        debug_assert!(
            geometry.validate().is_ok(),
            "geometry has indices past its vertex count"
        );

        let mut uploads: Vec<(VertexAttribute, Vec<u8>, usize)> = Vec::new();
        let mut push = |attribute: VertexAttribute, bytes: Vec<u8>, len: usize| {
            if len > 0 {
                uploads.push((attribute, bytes, len));
            }
        };
        push(
            VertexAttribute::Position,
            bytemuck::cast_slice(&vec3_data(geometry.vertices())).to_vec(),
            geometry.vertices().len(),
        );
        push(
            VertexAttribute::Normal,
            bytemuck::cast_slice(&vec3_data(geometry.normals())).to_vec(),
            geometry.normals().len(),
        );
        let colors: Vec<[f32; 4]> = geometry.colors().iter().map(|c| c.to_array()).collect();
        push(VertexAttribute::Color, bytemuck::cast_slice(&colors).to_vec(), colors.len());
        for channel in 0..xviz_scene::MAX_UV_CHANNELS {
            let Some(attribute) = VertexAttribute::tex_coord(channel) else {
                continue;
            };
            let uvs: Vec<[f32; 2]> = geometry.tex_coords(channel).iter().map(|t| t.to_array()).collect();
            push(attribute, bytemuck::cast_slice(&uvs).to_vec(), uvs.len());
        }
        if geometry.is_skinned() {
            let ids: Vec<[u32; 4]> = geometry
                .weights()
                .iter()
                .map(|w| w.bones.map(|b| b.max(0) as u32))
                .collect();
            let weights: Vec<[f32; 4]> = geometry.weights().iter().map(|w| w.weights).collect();
            push(VertexAttribute::BoneIds, bytemuck::cast_slice(&ids).to_vec(), ids.len());
            push(
                VertexAttribute::BoneWeights,
                bytemuck::cast_slice(&weights).to_vec(),
                weights.len(),
            );
        }

        let mut resource = MeshResource {
            primitive: geometry.primitive(),
            vertex_count: geometry.vertex_count() as u32,
            vertex_buffers: Vec::with_capacity(uploads.len()),
            lengths: Vec::with_capacity(uploads.len()),
            index_buffer: None,
            index_count: 0,
            edges: None,
        };
        for (attribute, bytes, len) in uploads {
            match backend.create_buffer(BufferKind::Vertex(attribute), &bytes) {
                Ok(id) => {
                    resource.vertex_buffers.push((attribute, id));
                    resource.lengths.push(len);
                }
                Err(e) => {
                    resource.destroy(backend);
                    return Err(e.into());
                }
            }
        }
        if !geometry.indices().is_empty() {
            match backend.create_buffer(BufferKind::Index, bytemuck::cast_slice(geometry.indices())) {
                Ok(id) => {
                    resource.index_buffer = Some(id);
                    resource.index_count = geometry.indices().len() as u32;
                }
                Err(e) => {
                    resource.destroy(backend);
                    return Err(e.into());
                }
            }
        }

        let index = self.allocate_slot();
        let key = SlotKey {
            index: index as u32,
            generation: self.slots[index].generation,
        };
        tracing::debug!(
            "Uploaded mesh {:?}: {} vertices, {} buffers",
            geometry.id(),
            resource.vertex_count,
            resource.vertex_buffers.len() + resource.index_buffer.is_some() as usize
        );
        self.slots[index].entry = Some(Entry {
            geometry: Arc::downgrade(geometry_ref),
            resource,
        });
        geometry.set_gpu_slot(Some(key));
        geometry.clear_dirty(DirtyFlags {
            vertices: true,
            normals: true,
            colors: true,
        });
        Ok(index)
    }

    fn allocate_slot(&mut self) -> usize {
        match self.free.pop() {
            Some(index) => index as usize,
            None => {
                self.slots.push(Slot::default());
                self.slots.len() - 1
            }
        }
    }

    /// Moves a live entry to the destruction queue; the slot stays reserved
    /// until the flush.
    fn enqueue(&mut self, index: usize) {
        let Some(slot) = self.slots.get_mut(index) else {
            return;
        };
        let Some(entry) = slot.entry.take() else {
            return;
        };
        self.queue.push(Queued {
            key: SlotKey {
                index: index as u32,
                generation: slot.generation,
            },
            geometry: entry.geometry,
            resource: entry.resource,
        });
    }

    /// Frees a slot immediately, bypassing the queue.
    fn take_slot(&mut self, index: usize) -> Option<Entry> {
        let slot = self.slots.get_mut(index)?;
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index as u32);
        Some(entry)
    }
}

fn vec3_data(values: &[glam::Vec3]) -> Vec<[f32; 3]> {
    values.iter().map(|v| v.to_array()).collect()
}

/// Unique triangle edges as a line list, in first-seen order.
fn edge_indices(geometry: &Geometry) -> Vec<u32> {
    let triangles: Vec<[u32; 3]> = if geometry.indices().is_empty() {
        (0..geometry.vertex_count() as u32 / 3)
            .map(|t| [3 * t, 3 * t + 1, 3 * t + 2])
            .collect()
    } else {
        geometry
            .indices()
            .chunks_exact(3)
            .map(|c| [c[0], c[1], c[2]])
            .collect()
    };
    let mut seen = HashSet::new();
    let mut edges = Vec::new();
    for [a, b, c] in triangles {
        for (p, q) in [(a, b), (b, c), (c, a)] {
            if seen.insert((p.min(q), p.max(q))) {
                edges.push(p);
                edges.push(q);
            }
        }
    }
    edges
}
