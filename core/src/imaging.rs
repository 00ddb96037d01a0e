//! Image normalization for the retina specialist.
//!
//! The classifier was trained on RGB images resized to a fixed square
//! resolution and rescaled by `1/255`. Inference must reproduce that
//! preprocessing exactly, so everything here is a pure function of the
//! input bytes and the normalizer settings.

use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use ndarray::Array3;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Square input resolution the specialist was trained with
pub const DEFAULT_INPUT_SIZE: u32 = 224;

/// Channels per pixel after normalization (RGB)
pub const CHANNELS: usize = 3;

const RESCALE: f32 = 1.0 / 255.0;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("Failed to read image {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to decode image: {0}")]
    Decode(String),

    #[error("Image has zero spatial extent ({width}x{height})")]
    Empty { width: u32, height: u32 },
}

impl ImageError {
    /// True when the source file does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, ImageError::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

/// Where the raw image comes from
#[derive(Debug, Clone, Copy)]
pub enum ImageSource<'a> {
    Path(&'a Path),
    Bytes(&'a [u8]),
    Bitmap(&'a DynamicImage),
}

/// Resize policy. Fixed per normalizer so repeated calls never diverge.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Interpolation {
    /// Nearest neighbour, the default of the training-time data generator
    #[default]
    Nearest,
    Bilinear,
}

impl Interpolation {
    fn filter(self) -> FilterType {
        match self {
            Interpolation::Nearest => FilterType::Nearest,
            Interpolation::Bilinear => FilterType::Triangle,
        }
    }
}

/// Normalized `height x width x channel` tensor with values in `[0, 1]`
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor(Array3<f32>);

impl ImageTensor {
    pub fn from_array(array: Array3<f32>) -> Self {
        Self(array)
    }

    /// `(height, width, channels)`
    pub fn shape(&self) -> (usize, usize, usize) {
        self.0.dim()
    }

    pub fn as_array(&self) -> &Array3<f32> {
        &self.0
    }

    pub fn into_array(self) -> Array3<f32> {
        self.0
    }

    /// Row-major view of the pixel data
    pub fn values(&self) -> impl Iterator<Item = f32> + '_ {
        self.0.iter().copied()
    }
}

/// Deterministic image → tensor transform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageNormalizer {
    size: u32,
    interpolation: Interpolation,
}

impl Default for ImageNormalizer {
    fn default() -> Self {
        Self::new(DEFAULT_INPUT_SIZE, Interpolation::default())
    }
}

impl ImageNormalizer {
    pub fn new(size: u32, interpolation: Interpolation) -> Self {
        Self {
            size: size.max(1),
            interpolation,
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn interpolation(&self) -> Interpolation {
        self.interpolation
    }

    /// Decode, resize, convert to f32 and rescale by 1/255, in that order.
    pub fn normalize(&self, source: ImageSource<'_>) -> Result<ImageTensor, ImageError> {
        match source {
            ImageSource::Path(path) => {
                let bytes = std::fs::read(path).map_err(|source| ImageError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                self.normalize_bitmap(&decode(&bytes)?)
            }
            ImageSource::Bytes(bytes) => self.normalize_bitmap(&decode(bytes)?),
            ImageSource::Bitmap(image) => self.normalize_bitmap(image),
        }
    }

    fn normalize_bitmap(&self, image: &DynamicImage) -> Result<ImageTensor, ImageError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(ImageError::Empty { width, height });
        }

        let rgb = image.to_rgb8();
        let resized = image::imageops::resize(&rgb, self.size, self.size, self.interpolation.filter());

        let side = self.size as usize;
        let data: Vec<f32> = resized
            .into_raw()
            .into_iter()
            .map(|v| f32::from(v) * RESCALE)
            .collect();

        Array3::from_shape_vec((side, side, CHANNELS), data)
            .map(ImageTensor)
            .map_err(|e| ImageError::Decode(format!("unexpected pixel buffer shape: {e}")))
    }
}

fn decode(bytes: &[u8]) -> Result<DynamicImage, ImageError> {
    if bytes.is_empty() {
        return Err(ImageError::Decode("empty image buffer".into()));
    }
    image::load_from_memory(bytes).map_err(|e| ImageError::Decode(e.to_string()))
}

/// MIME type of an encoded image, if the format is recognized
pub fn media_type(bytes: &[u8]) -> Option<&'static str> {
    image::guess_format(bytes).ok().map(|f| f.to_mime_type())
}
