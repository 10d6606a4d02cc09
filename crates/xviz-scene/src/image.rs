//! Images and 2D textures referenced by materials.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SceneError;

/// Identity of an image. Clones of an `Image` share it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageId(pub Uuid);

impl ImageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ImageId {
    fn default() -> Self {
        Self::new()
    }
}

/// Layout of raw pixel data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb24,
    Rgba32,
    Gray8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb24 => 3,
            PixelFormat::Rgba32 => 4,
            PixelFormat::Gray8 => 1,
        }
    }
}

/// Where the pixels of an image come from.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageSource {
    /// Uncompressed pixels, rows top to bottom.
    Raw {
        format: PixelFormat,
        width: u32,
        height: u32,
        data: Vec<u8>,
    },
    /// A compressed file payload (PNG, JPEG, ...).
    Encoded(Vec<u8>),
    /// A location resolved asynchronously by the texture cache.
    Uri(String),
}

/// Immutable image data with a stable identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    id: ImageId,
    source: ImageSource,
}

impl Image {
    /// Creates an image from raw pixels, checking the buffer size.
    pub fn raw(format: PixelFormat, width: u32, height: u32, data: Vec<u8>) -> Result<Self, SceneError> {
        let expected = width as usize * height as usize * format.bytes_per_pixel();
        if data.len() != expected {
            return Err(SceneError::ImageSize {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self::from_source(ImageSource::Raw {
            format,
            width,
            height,
            data,
        }))
    }

    pub fn encoded(bytes: Vec<u8>) -> Self {
        Self::from_source(ImageSource::Encoded(bytes))
    }

    pub fn from_uri(uri: impl Into<String>) -> Self {
        Self::from_source(ImageSource::Uri(uri.into()))
    }

    pub fn from_source(source: ImageSource) -> Self {
        Self {
            id: ImageId::new(),
            source,
        }
    }

    pub fn id(&self) -> ImageId {
        self.id
    }

    pub fn source(&self) -> &ImageSource {
        &self.source
    }
}

/// Texture coordinate wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum WrapMode {
    #[default]
    Repeat,
    Clamp,
    /// Outside [0, 1] samples the border (transparent black).
    Decal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FilterMode {
    Nearest,
    #[default]
    Linear,
}

/// Sampling state applied when the texture is uploaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Sampler2D {
    pub wrap_u: WrapMode,
    pub wrap_v: WrapMode,
    pub min_filter: FilterMode,
    pub mag_filter: FilterMode,
}

/// An image plus the sampler used to read it.
#[derive(Debug, Clone, PartialEq)]
pub struct Texture2D {
    pub image: Arc<Image>,
    pub sampler: Sampler2D,
}

impl Texture2D {
    pub fn new(image: Arc<Image>) -> Self {
        Self {
            image,
            sampler: Sampler2D::default(),
        }
    }

    pub fn with_sampler(mut self, sampler: Sampler2D) -> Self {
        self.sampler = sampler;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_image_size_check() {
        assert!(Image::raw(PixelFormat::Rgb24, 2, 2, vec![0; 12]).is_ok());
        assert_eq!(
            Image::raw(PixelFormat::Rgba32, 2, 2, vec![0; 12]),
            Err(SceneError::ImageSize {
                expected: 16,
                actual: 12
            })
        );
    }

    #[test]
    fn test_clone_shares_identity() {
        let a = Image::from_uri("file:///tmp/a.png");
        let b = a.clone();
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), Image::from_uri("file:///tmp/a.png").id());
    }
}
