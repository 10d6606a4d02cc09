//! GPU resource creation functions.
//!
//! Pure helpers for the textures, samplers and bind group layouts used by
//! [`super::WgpuBackend`].

use xviz_scene::{FilterMode, WrapMode};

use crate::constants::shadow;
use crate::constants::MAX_SHADOW_MAPS;

/// Create a depth texture and its view for the default render target.
pub fn create_depth_texture(
    device: &wgpu::Device,
    width: u32,
    height: u32,
) -> (wgpu::Texture, wgpu::TextureView) {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("Depth Texture"),
        size: wgpu::Extent3d {
            width: width.max(1),
            height: height.max(1),
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: shadow::DEPTH_FORMAT,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
        view_formats: &[],
    });
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    (texture, view)
}

/// Create a shadow map texture and its view.
pub fn create_shadow_texture(
    device: &wgpu::Device,
    width: u32,
    height: u32,
) -> (wgpu::Texture, wgpu::TextureView) {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("Shadow Map Texture"),
        size: wgpu::Extent3d {
            width: width.clamp(1, shadow::MAX_SIZE),
            height: height.clamp(1, shadow::MAX_SIZE),
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: shadow::DEPTH_FORMAT,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
        view_formats: &[],
    });
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    (texture, view)
}

/// Create a shadow sampler with comparison function.
pub fn create_shadow_sampler(device: &wgpu::Device) -> wgpu::Sampler {
    device.create_sampler(&wgpu::SamplerDescriptor {
        label: Some("Shadow Sampler"),
        address_mode_u: wgpu::AddressMode::ClampToEdge,
        address_mode_v: wgpu::AddressMode::ClampToEdge,
        address_mode_w: wgpu::AddressMode::ClampToEdge,
        mag_filter: wgpu::FilterMode::Linear,
        min_filter: wgpu::FilterMode::Linear,
        mipmap_filter: wgpu::FilterMode::Nearest,
        compare: Some(wgpu::CompareFunction::LessEqual),
        ..Default::default()
    })
}

/// Map a wrap mode; decal falls back to clamping without border support.
pub fn address_mode(wrap: WrapMode, border_supported: bool) -> wgpu::AddressMode {
    match wrap {
        WrapMode::Repeat => wgpu::AddressMode::Repeat,
        WrapMode::Clamp => wgpu::AddressMode::ClampToEdge,
        WrapMode::Decal if border_supported => wgpu::AddressMode::ClampToBorder,
        WrapMode::Decal => wgpu::AddressMode::ClampToEdge,
    }
}

pub fn filter_mode(filter: FilterMode) -> wgpu::FilterMode {
    match filter {
        FilterMode::Nearest => wgpu::FilterMode::Nearest,
        FilterMode::Linear => wgpu::FilterMode::Linear,
    }
}

/// Create a color texture sampler.
pub fn create_texture_sampler(
    device: &wgpu::Device,
    wrap_u: WrapMode,
    wrap_v: WrapMode,
    min_filter: FilterMode,
    mag_filter: FilterMode,
    border_supported: bool,
) -> wgpu::Sampler {
    let decal = border_supported && (wrap_u == WrapMode::Decal || wrap_v == WrapMode::Decal);
    device.create_sampler(&wgpu::SamplerDescriptor {
        label: Some("Texture Sampler"),
        address_mode_u: address_mode(wrap_u, border_supported),
        address_mode_v: address_mode(wrap_v, border_supported),
        address_mode_w: wgpu::AddressMode::ClampToEdge,
        mag_filter: filter_mode(mag_filter),
        min_filter: filter_mode(min_filter),
        mipmap_filter: wgpu::FilterMode::Nearest,
        border_color: decal.then_some(wgpu::SamplerBorderColor::TransparentBlack),
        ..Default::default()
    })
}

/// Group 0: frame uniforms plus the dynamically offset draw uniforms.
pub fn create_frame_bind_group_layout(
    device: &wgpu::Device,
    frame_size: u64,
    draw_size: u64,
) -> wgpu::BindGroupLayout {
    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("Frame Bind Group Layout"),
        entries: &[
            wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: wgpu::BufferSize::new(frame_size),
                },
                count: None,
            },
            wgpu::BindGroupLayoutEntry {
                binding: 1,
                visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: true,
                    min_binding_size: wgpu::BufferSize::new(draw_size),
                },
                count: None,
            },
        ],
    })
}

/// Create the frame bind group over the frame buffer and the draw ring.
pub fn create_frame_bind_group(
    device: &wgpu::Device,
    layout: &wgpu::BindGroupLayout,
    frame_buffer: &wgpu::Buffer,
    draw_ring: &wgpu::Buffer,
    draw_size: u64,
) -> wgpu::BindGroup {
    device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("Frame Bind Group"),
        layout,
        entries: &[
            wgpu::BindGroupEntry {
                binding: 0,
                resource: frame_buffer.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer: draw_ring,
                    offset: 0,
                    size: wgpu::BufferSize::new(draw_size),
                }),
            },
        ],
    })
}

/// Group 1: diffuse texture and its sampler.
pub fn create_material_bind_group_layout(device: &wgpu::Device) -> wgpu::BindGroupLayout {
    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("Material Bind Group Layout"),
        entries: &[
            wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Texture {
                    sample_type: wgpu::TextureSampleType::Float { filterable: true },
                    view_dimension: wgpu::TextureViewDimension::D2,
                    multisampled: false,
                },
                count: None,
            },
            wgpu::BindGroupLayoutEntry {
                binding: 1,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                count: None,
            },
        ],
    })
}

pub fn create_material_bind_group(
    device: &wgpu::Device,
    layout: &wgpu::BindGroupLayout,
    view: &wgpu::TextureView,
    sampler: &wgpu::Sampler,
) -> wgpu::BindGroup {
    device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("Material Bind Group"),
        layout,
        entries: &[
            wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::TextureView(view),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: wgpu::BindingResource::Sampler(sampler),
            },
        ],
    })
}

/// Group 2: one depth texture per shadow unit plus the comparison sampler.
pub fn create_shadow_bind_group_layout(device: &wgpu::Device) -> wgpu::BindGroupLayout {
    let mut entries: Vec<wgpu::BindGroupLayoutEntry> = (0..MAX_SHADOW_MAPS as u32)
        .map(|binding| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Depth,
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
            count: None,
        })
        .collect();
    entries.push(wgpu::BindGroupLayoutEntry {
        binding: MAX_SHADOW_MAPS as u32,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Comparison),
        count: None,
    });
    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("Shadow Bind Group Layout"),
        entries: &entries,
    })
}

pub fn create_shadow_bind_group(
    device: &wgpu::Device,
    layout: &wgpu::BindGroupLayout,
    views: [&wgpu::TextureView; MAX_SHADOW_MAPS],
    sampler: &wgpu::Sampler,
) -> wgpu::BindGroup {
    let mut entries: Vec<wgpu::BindGroupEntry> = views
        .iter()
        .enumerate()
        .map(|(binding, view)| wgpu::BindGroupEntry {
            binding: binding as u32,
            resource: wgpu::BindingResource::TextureView(*view),
        })
        .collect();
    entries.push(wgpu::BindGroupEntry {
        binding: MAX_SHADOW_MAPS as u32,
        resource: wgpu::BindingResource::Sampler(sampler),
    });
    device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("Shadow Bind Group"),
        layout,
        entries: &entries,
    })
}

pub fn topology(topology: super::Topology) -> wgpu::PrimitiveTopology {
    match topology {
        super::Topology::Triangles => wgpu::PrimitiveTopology::TriangleList,
        super::Topology::Lines => wgpu::PrimitiveTopology::LineList,
        super::Topology::Points => wgpu::PrimitiveTopology::PointList,
    }
}

pub fn cull_face(cull: super::CullMode) -> Option<wgpu::Face> {
    match cull {
        super::CullMode::None => None,
        super::CullMode::Front => Some(wgpu::Face::Front),
        super::CullMode::Back => Some(wgpu::Face::Back),
    }
}

/// Round `size` up to a multiple of `alignment`.
pub fn align_to(size: u64, alignment: u64) -> u64 {
    size.div_ceil(alignment) * alignment
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_to() {
        assert_eq!(align_to(1, 256), 256);
        assert_eq!(align_to(256, 256), 256);
        assert_eq!(align_to(4400, 256), 4608);
    }

    #[test]
    fn test_decal_without_border_support_clamps() {
        assert_eq!(address_mode(WrapMode::Decal, false), wgpu::AddressMode::ClampToEdge);
        assert_eq!(address_mode(WrapMode::Decal, true), wgpu::AddressMode::ClampToBorder);
        assert_eq!(address_mode(WrapMode::Repeat, false), wgpu::AddressMode::Repeat);
    }
}
