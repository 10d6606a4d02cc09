//! Headless xviz host: renders a demo scene offscreen and writes a PNG.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use glam::{Mat4, Vec3, Vec4};
use xviz_renderer::{DepthBuffer, Renderer, RendererConfig, WgpuBackend};
use xviz_scene::{
    Attenuation, Camera, DirectionalLight, Drawable, Geometry, Light, LightColors, Material, Node,
    PhongMaterial, PointLight, ShadowCamera, ShadowSettings,
};

const COLOR_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8UnormSrgb;

#[derive(Parser, Debug)]
#[command(name = "xviz-offscreen", about = "Render an xviz demo scene to a PNG file")]
struct Args {
    /// Output image path
    #[arg(short, long, default_value = "xviz.png")]
    output: PathBuf,

    #[arg(long, default_value_t = 800)]
    width: u32,

    #[arg(long, default_value_t = 600)]
    height: u32,

    /// Renderer config file (RON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Render without shadow maps
    #[arg(long)]
    no_shadows: bool,

    /// Also write the depth buffer as a 16-bit PNG of millimeters
    #[arg(long)]
    depth: Option<PathBuf>,
}

fn main() -> Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "xviz_offscreen=info,xviz_renderer=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    if args.width == 0 || args.height == 0 {
        return Err(anyhow!("image size must be non-zero"));
    }

    let mut config = match &args.config {
        Some(path) => RendererConfig::load(path)?,
        None => RendererConfig::default(),
    };
    if args.no_shadows {
        config.shadows_enabled = false;
    }

    let (device, queue) = pollster::block_on(create_device())?;
    let (device, queue) = (Arc::new(device), Arc::new(queue));

    let target = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("Offscreen Color"),
        size: wgpu::Extent3d {
            width: args.width,
            height: args.height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: COLOR_FORMAT,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
        view_formats: &[],
    });
    let view = target.create_view(&wgpu::TextureViewDescriptor::default());

    let mut backend = WgpuBackend::new(Arc::clone(&device), Arc::clone(&queue), COLOR_FORMAT);
    backend.set_default_target(view, args.width, args.height);
    let mut renderer = Renderer::new(backend, config);

    let scene = demo_scene();
    let mut camera = Camera::perspective(
        45_f32.to_radians(),
        args.width as f32 / args.height as f32,
        0.1,
        100.0,
    )
    .with_background(Vec4::new(0.12, 0.12, 0.15, 1.0));
    camera.look_at(Vec3::new(4.0, 3.0, 6.0), Vec3::ZERO, Vec3::Y);

    let stats = renderer.render(&scene, &camera, true)?;
    tracing::info!(
        "Rendered {} draw calls, {} shadow passes, {} programs",
        stats.draw_calls,
        stats.shadow_passes,
        stats.programs_compiled
    );

    let pixels = read_back(&device, &queue, &target, args.width, args.height)?;
    let image = image::RgbaImage::from_raw(args.width, args.height, pixels)
        .ok_or_else(|| anyhow!("read back buffer has the wrong size"))?;
    image
        .save(&args.output)
        .with_context(|| format!("failed to write {:?}", args.output))?;
    tracing::info!("Wrote {:?}", args.output);

    if let Some(path) = &args.depth {
        let depth = renderer.read_depth()?;
        depth_image(&depth)
            .save(path)
            .with_context(|| format!("failed to write {:?}", path))?;
        tracing::info!("Wrote depth {:?}", path);
    }

    renderer.shutdown();
    Ok(())
}

/// Distances in millimeters; background pixels are written as zero.
fn depth_image(depth: &DepthBuffer) -> image::ImageBuffer<image::Luma<u16>, Vec<u16>> {
    let background = depth.zfar * 0.99;
    image::ImageBuffer::from_fn(depth.width, depth.height, |x, y| {
        let z = depth.get(x, y).unwrap_or(depth.zfar);
        if z >= background {
            image::Luma([0])
        } else {
            image::Luma([(z * 1000.0).round().clamp(0.0, u16::MAX as f32) as u16])
        }
    })
}

async fn create_device() -> Result<(wgpu::Device, wgpu::Queue)> {
    let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());
    let adapter = instance
        .request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::LowPower,
            force_fallback_adapter: false,
            compatible_surface: None,
        })
        .await
        .ok_or_else(|| anyhow!("no suitable GPU adapter"))?;
    tracing::info!("Using adapter {}", adapter.get_info().name);

    let (device, queue) = adapter
        .request_device(
            &wgpu::DeviceDescriptor {
                label: Some("xviz-offscreen device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::downlevel_defaults().using_resolution(adapter.limits()),
                memory_hints: wgpu::MemoryHints::default(),
            },
            None,
        )
        .await
        .context("failed to create device")?;
    Ok((device, queue))
}

/// Copies `texture` into tightly packed RGBA rows.
fn read_back(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    texture: &wgpu::Texture,
    width: u32,
    height: u32,
) -> Result<Vec<u8>> {
    let unpadded = width * 4;
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    let padded = unpadded.div_ceil(align) * align;

    let buffer = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("Offscreen Readback"),
        size: padded as u64 * height as u64,
        usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
        mapped_at_creation: false,
    });

    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("Offscreen Readback Encoder"),
    });
    encoder.copy_texture_to_buffer(
        wgpu::ImageCopyTexture {
            texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        wgpu::ImageCopyBuffer {
            buffer: &buffer,
            layout: wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(padded),
                rows_per_image: Some(height),
            },
        },
        wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
    );
    queue.submit(std::iter::once(encoder.finish()));

    let slice = buffer.slice(..);
    let (tx, rx) = crossbeam_channel::bounded(1);
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = tx.send(result);
    });
    device.poll(wgpu::Maintain::Wait);
    rx.recv()
        .context("map callback dropped")?
        .context("failed to map read back buffer")?;

    let data = slice.get_mapped_range();
    let mut pixels = Vec::with_capacity((unpadded * height) as usize);
    for row in data.chunks(padded as usize) {
        pixels.extend_from_slice(&row[..unpadded as usize]);
    }
    drop(data);
    buffer.unmap();
    Ok(pixels)
}

fn phong(color: Vec3) -> Option<Arc<Material>> {
    Some(Arc::new(Material::Phong(
        PhongMaterial::with_color(color).with_specular(Vec3::splat(0.4), 32.0),
    )))
}

/// Ground plane with a cube and a sphere, lit by a shadowed sun and a lamp.
fn demo_scene() -> Node {
    let ground = Geometry::plane(10.0, 10.0).into_shared();
    let cube = Geometry::cube(Vec3::splat(0.5)).into_shared();
    let sphere = Geometry::sphere(0.6, 32, 16).into_shared();

    let sun = DirectionalLight {
        position: Vec3::new(3.0, 6.0, 2.0),
        target: Vec3::ZERO,
        colors: LightColors {
            ambient: Vec3::splat(0.1),
            diffuse: Vec3::splat(0.8),
            specular: Vec3::splat(0.6),
        },
        shadow: ShadowSettings {
            casts_shadows: true,
            bias: 0.005,
            camera: ShadowCamera::default(),
        },
    };
    let lamp = PointLight {
        position: Vec3::new(-2.0, 2.0, 2.0),
        attenuation: Attenuation {
            constant: 1.0,
            linear: 0.09,
            quadratic: 0.032,
        },
        colors: LightColors {
            ambient: Vec3::ZERO,
            diffuse: Vec3::new(0.6, 0.5, 0.3),
            specular: Vec3::splat(0.3),
        },
        ..Default::default()
    };

    Node::new("root")
        .with_child(Node::new("sun").with_light(Light::Directional(sun)))
        .with_child(Node::new("lamp").with_light(Light::Point(lamp)))
        .with_child(
            Node::new("ground")
                .with_transform(Mat4::from_rotation_x(-std::f32::consts::FRAC_PI_2))
                .with_drawable(Drawable::new(ground, phong(Vec3::new(0.6, 0.6, 0.6)))),
        )
        .with_child(
            Node::new("cube")
                .with_transform(Mat4::from_translation(Vec3::new(-0.8, 0.5, 0.0)))
                .with_drawable(Drawable::new(cube, phong(Vec3::new(0.8, 0.3, 0.2)))),
        )
        .with_child(
            Node::new("sphere")
                .with_transform(Mat4::from_translation(Vec3::new(1.0, 0.6, 0.5)))
                .with_drawable(Drawable::new(sphere, phong(Vec3::new(0.2, 0.4, 0.8)))),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_image_in_millimeters() {
        let depth = DepthBuffer {
            width: 2,
            height: 1,
            znear: 0.1,
            zfar: 100.0,
            distances: vec![2.5, 100.0],
        };
        let image = depth_image(&depth);
        assert_eq!(image.get_pixel(0, 0).0, [2500]);
        assert_eq!(image.get_pixel(1, 0).0, [0]);
    }
}
