//! GPU texture cache.
//!
//! Textures are keyed by image identity plus sampler and uploaded as RGBA8. Images given by
//! URI are fetched and decoded on a worker thread; the result comes back over
//! a channel and is uploaded in [`TextureCache::process_pending`], never while
//! a pass is being recorded.

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use xviz_scene::{Image, ImageId, ImageSource, PixelFormat, Sampler2D, Texture2D};

use crate::backend::{GpuBackend, TextureDesc, TextureId};
use crate::error::{RenderError, TextureError};

/// Resolves an image URI to encoded bytes.
pub trait ImageFetcher: Send + Sync {
    fn fetch(&self, uri: &str) -> Result<Vec<u8>, TextureError>;
}

/// Reads URIs as file system paths; a `file://` prefix is accepted.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileFetcher;

impl ImageFetcher for FileFetcher {
    fn fetch(&self, uri: &str) -> Result<Vec<u8>, TextureError> {
        let path = uri.strip_prefix("file://").unwrap_or(uri);
        std::fs::read(path).map_err(|e| TextureError::Fetch {
            uri: uri.to_string(),
            message: e.to_string(),
        })
    }
}

/// A texture resident on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureResource {
    pub id: TextureId,
    pub width: u32,
    pub height: u32,
}

/// Decoded RGBA8 pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct Pixels {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

/// One device texture per image and sampler pair.
type TextureKey = (ImageId, Sampler2D);

#[derive(Debug)]
enum Entry {
    Ready(TextureResource),
    /// Waiting for a worker.
    Loading,
    /// Not retried until the image is released.
    Failed,
}

struct Loaded {
    image: ImageId,
    result: Result<Pixels, TextureError>,
}

/// Owns the device textures of every image drawn so far.
pub struct TextureCache {
    entries: HashMap<TextureKey, Entry>,
    fetcher: Arc<dyn ImageFetcher>,
    sender: Sender<Loaded>,
    receiver: Receiver<Loaded>,
}

impl Default for TextureCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TextureCache {
    pub fn new() -> Self {
        Self::with_fetcher(Arc::new(FileFetcher))
    }

    pub fn with_fetcher(fetcher: Arc<dyn ImageFetcher>) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self {
            entries: HashMap::new(),
            fetcher,
            sender,
            receiver,
        }
    }

    /// Returns the device texture of `texture`'s image.
    ///
    /// `Ok(None)` means the texture is not available (still loading, or it
    /// failed) and the caller should draw without it. Device errors are fatal.
    pub fn fetch<B: GpuBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        texture: &Texture2D,
    ) -> Result<Option<TextureResource>, RenderError> {
        let image = &texture.image;
        let key = (image.id(), texture.sampler);
        match self.entries.get(&key) {
            Some(Entry::Ready(resource)) => return Ok(Some(*resource)),
            Some(Entry::Loading) | Some(Entry::Failed) => return Ok(None),
            None => {}
        }

        let pixels = match image.source() {
            ImageSource::Uri(uri) => {
                // Other samplers of the same image share one worker.
                if self.loading_keys(image.id()).is_empty() {
                    self.spawn_load(image.id(), uri.clone());
                }
                self.entries.insert(key, Entry::Loading);
                return Ok(None);
            }
            ImageSource::Raw { .. } | ImageSource::Encoded(_) => decode(image),
        };
        self.finish(backend, key, pixels)
    }

    /// Uploads textures whose workers have finished. Returns how many became
    /// ready.
    pub fn process_pending<B: GpuBackend + ?Sized>(&mut self, backend: &mut B) -> Result<usize, RenderError> {
        let mut ready = 0;
        for loaded in self.receiver.try_iter().collect::<Vec<_>>() {
            // No keys left means the image was released while loading.
            for key in self.loading_keys(loaded.image) {
                if self.finish(backend, key, loaded.result.clone())?.is_some() {
                    ready += 1;
                }
            }
        }
        Ok(ready)
    }

    /// Frees the textures of `image` now, for every sampler it was drawn with.
    pub fn release<B: GpuBackend + ?Sized>(&mut self, backend: &mut B, image: &Image) {
        let id = image.id();
        self.entries.retain(|(image_id, _), entry| {
            if *image_id != id {
                return true;
            }
            if let Entry::Ready(resource) = entry {
                backend.destroy_texture(resource.id);
                tracing::debug!("Released texture {}", id.0);
            }
            false
        });
    }

    /// Frees every texture.
    pub fn clear<B: GpuBackend + ?Sized>(&mut self, backend: &mut B) {
        for (_, entry) in self.entries.drain() {
            if let Entry::Ready(resource) = entry {
                backend.destroy_texture(resource.id);
            }
        }
    }

    /// Textures resident on the device.
    pub fn len(&self) -> usize {
        self.entries
            .values()
            .filter(|e| matches!(e, Entry::Ready(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Images with a worker still running.
    pub fn loading(&self) -> usize {
        self.entries
            .values()
            .filter(|e| matches!(e, Entry::Loading))
            .count()
    }

    fn loading_keys(&self, image: ImageId) -> Vec<TextureKey> {
        self.entries
            .iter()
            .filter(|(key, entry)| key.0 == image && matches!(entry, Entry::Loading))
            .map(|(key, _)| *key)
            .collect()
    }

    fn spawn_load(&self, image: ImageId, uri: String) {
        let fetcher = Arc::clone(&self.fetcher);
        let sender = self.sender.clone();
        tracing::debug!("Fetching texture {}", uri);
        std::thread::spawn(move || {
            let result = fetcher.fetch(&uri).and_then(|bytes| decode_encoded(&bytes));
            // The cache may be gone; nothing to do then.
            let _ = sender.send(Loaded { image, result });
        });
    }

    fn finish<B: GpuBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        key: TextureKey,
        pixels: Result<Pixels, TextureError>,
    ) -> Result<Option<TextureResource>, RenderError> {
        let (image, sampler) = key;
        let pixels = match pixels {
            Ok(pixels) => pixels,
            Err(e) => {
                tracing::warn!("Texture {} unavailable: {}", image.0, e);
                self.entries.insert(key, Entry::Failed);
                return Ok(None);
            }
        };
        let desc = TextureDesc {
            label: format!("Texture {}", image.0),
            width: pixels.width,
            height: pixels.height,
            wrap_u: sampler.wrap_u,
            wrap_v: sampler.wrap_v,
            min_filter: sampler.min_filter,
            mag_filter: sampler.mag_filter,
        };
        let id = backend.create_texture(&desc, &pixels.rgba)?;
        let resource = TextureResource {
            id,
            width: pixels.width,
            height: pixels.height,
        };
        tracing::debug!("Uploaded texture {} ({}x{})", image.0, pixels.width, pixels.height);
        self.entries.insert(key, Entry::Ready(resource));
        Ok(Some(resource))
    }
}

/// Converts an in-memory image to RGBA8.
pub fn decode(image: &Image) -> Result<Pixels, TextureError> {
    match image.source() {
        ImageSource::Raw {
            format,
            width,
            height,
            data,
        } => {
            if *width == 0 || *height == 0 {
                return Err(TextureError::Empty);
            }
            let rgba = match format {
                PixelFormat::Rgba32 => data.clone(),
                PixelFormat::Rgb24 => data
                    .chunks_exact(3)
                    .flat_map(|p| [p[0], p[1], p[2], 255])
                    .collect(),
                PixelFormat::Gray8 => data.iter().flat_map(|&g| [g, g, g, 255]).collect(),
            };
            Ok(Pixels {
                width: *width,
                height: *height,
                rgba,
            })
        }
        ImageSource::Encoded(bytes) => decode_encoded(bytes),
        ImageSource::Uri(uri) => Err(TextureError::Fetch {
            uri: uri.clone(),
            message: "URI images are decoded by the texture cache".into(),
        }),
    }
}

fn decode_encoded(bytes: &[u8]) -> Result<Pixels, TextureError> {
    let decoded = image::load_from_memory(bytes).map_err(|e| TextureError::Decode(e.to_string()))?;
    let rgba = decoded.to_rgba8();
    let (width, height) = rgba.dimensions();
    if width == 0 || height == 0 {
        return Err(TextureError::Empty);
    }
    Ok(Pixels {
        width,
        height,
        rgba: rgba.into_raw(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockBackend;
    use std::time::{Duration, Instant};
    use xviz_scene::WrapMode;

    fn png_bytes() -> Vec<u8> {
        let img = image::RgbaImage::from_pixel(2, 3, image::Rgba([10, 20, 30, 255]));
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    struct MemoryFetcher(Vec<u8>);

    impl ImageFetcher for MemoryFetcher {
        fn fetch(&self, uri: &str) -> Result<Vec<u8>, TextureError> {
            match uri {
                "mem://ok" => Ok(self.0.clone()),
                _ => Err(TextureError::Fetch {
                    uri: uri.to_string(),
                    message: "not found".into(),
                }),
            }
        }
    }

    fn wait_for<B: GpuBackend>(cache: &mut TextureCache, backend: &mut B) {
        let start = Instant::now();
        while cache.loading() > 0 && start.elapsed() < Duration::from_secs(5) {
            cache.process_pending(backend).unwrap();
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_raw_rgb_is_expanded_to_rgba() {
        let image = Image::raw(PixelFormat::Rgb24, 1, 2, vec![1, 2, 3, 4, 5, 6]).unwrap();
        let pixels = decode(&image).unwrap();
        assert_eq!(pixels.rgba, vec![1, 2, 3, 255, 4, 5, 6, 255]);

        let gray = Image::raw(PixelFormat::Gray8, 1, 1, vec![7]).unwrap();
        assert_eq!(decode(&gray).unwrap().rgba, vec![7, 7, 7, 255]);
    }

    #[test]
    fn test_fetch_uploads_once_per_image() {
        let mut backend = MockBackend::new();
        let mut cache = TextureCache::new();
        let texture = Texture2D::new(Arc::new(Image::encoded(png_bytes())));

        let first = cache.fetch(&mut backend, &texture).unwrap().unwrap();
        assert_eq!((first.width, first.height), (2, 3));
        // A clone shares the image and therefore the texture.
        let second = cache.fetch(&mut backend, &texture.clone()).unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(backend.textures_created, 1);
    }

    #[test]
    fn test_each_sampler_gets_its_own_texture() {
        let mut backend = MockBackend::new();
        let mut cache = TextureCache::new();
        let image = Arc::new(Image::raw(PixelFormat::Rgba32, 1, 1, vec![0; 4]).unwrap());
        let repeat = Texture2D::new(Arc::clone(&image));
        let clamp = Texture2D::new(Arc::clone(&image)).with_sampler(Sampler2D {
            wrap_u: WrapMode::Clamp,
            wrap_v: WrapMode::Clamp,
            ..Default::default()
        });

        let a = cache.fetch(&mut backend, &repeat).unwrap().unwrap();
        let b = cache.fetch(&mut backend, &clamp).unwrap().unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(cache.fetch(&mut backend, &clamp).unwrap(), Some(b));
        assert_eq!(backend.textures_created, 2);

        cache.release(&mut backend, &image);
        assert!(backend.textures.is_empty());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_decode_failure_is_remembered() {
        let mut backend = MockBackend::new();
        let mut cache = TextureCache::new();
        let texture = Texture2D::new(Arc::new(Image::encoded(vec![0, 1, 2, 3])));

        assert!(cache.fetch(&mut backend, &texture).unwrap().is_none());
        assert!(cache.fetch(&mut backend, &texture).unwrap().is_none());
        assert_eq!(backend.textures_created, 0);
    }

    #[test]
    fn test_release_frees_texture() {
        let mut backend = MockBackend::new();
        let mut cache = TextureCache::new();
        let image = Arc::new(Image::raw(PixelFormat::Rgba32, 1, 1, vec![0; 4]).unwrap());
        let texture = Texture2D::new(Arc::clone(&image));
        cache.fetch(&mut backend, &texture).unwrap();
        assert_eq!(backend.textures.len(), 1);

        cache.release(&mut backend, &image);
        assert!(backend.textures.is_empty());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_uri_images_load_asynchronously() {
        let mut backend = MockBackend::new();
        let mut cache = TextureCache::with_fetcher(Arc::new(MemoryFetcher(png_bytes())));
        let ok = Texture2D::new(Arc::new(Image::from_uri("mem://ok")));
        let missing = Texture2D::new(Arc::new(Image::from_uri("mem://missing")));

        assert!(cache.fetch(&mut backend, &ok).unwrap().is_none());
        assert!(cache.fetch(&mut backend, &missing).unwrap().is_none());
        assert_eq!(cache.loading(), 2);
        wait_for(&mut cache, &mut backend);

        assert!(cache.fetch(&mut backend, &ok).unwrap().is_some());
        assert!(cache.fetch(&mut backend, &missing).unwrap().is_none());
        assert_eq!(backend.textures_created, 1);
    }

    #[test]
    fn test_clear_frees_everything() {
        let mut backend = MockBackend::new();
        let mut cache = TextureCache::new();
        for _ in 0..3 {
            let image = Image::raw(PixelFormat::Gray8, 1, 1, vec![0]).unwrap();
            cache
                .fetch(&mut backend, &Texture2D::new(Arc::new(image)))
                .unwrap();
        }
        assert_eq!(cache.len(), 3);
        cache.clear(&mut backend);
        assert!(backend.textures.is_empty());
    }
}
