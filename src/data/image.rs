//! Image loading, preprocessing and the per-example pixel slot
//!
//! Every packed example carries one pixel tensor of shape `(1, 3, H, W)`.
//! Conversations without an image get an all-zero placeholder of the same
//! shape so batches stay regular.

use candle_core::{DType, Device, Tensor};
use image::{imageops::FilterType, DynamicImage};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use super::conversation::Conversation;
use crate::config::ImageConfig;
use crate::error::{Error, Result};

/// Resolves an image reference to a decoded image
pub trait ImageLoader: Send + Sync {
    /// Load the image named by `reference`
    fn load(&self, reference: &str) -> Result<DynamicImage>;
}

/// Turns a decoded image into a model-ready pixel tensor
pub trait ImageProcessor: Send + Sync {
    /// Process one image into a `(1, 3, H, W)` tensor
    fn process(&self, image: &DynamicImage) -> Result<Tensor>;

    /// Side length of the square output
    fn image_size(&self) -> usize;
}

/// Loads images from the local file system
#[derive(Debug, Clone, Default)]
pub struct FsImageLoader {
    base_dir: Option<PathBuf>,
}

impl FsImageLoader {
    /// Loader resolving relative references against the working directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Loader resolving relative references against `base_dir`
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: Some(base_dir.into()),
        }
    }

    fn resolve(&self, reference: &str) -> PathBuf {
        let path = Path::new(reference);
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }
}

impl ImageLoader for FsImageLoader {
    fn load(&self, reference: &str) -> Result<DynamicImage> {
        let path = self.resolve(reference);
        image::open(&path).map_err(|e| Error::image(format!("Failed to open image {}: {}", path.display(), e)))
    }
}

/// CLIP-style processor: resize, rescale, per-channel normalise, NCHW layout
#[derive(Debug, Clone)]
pub struct ClipImageProcessor {
    config: ImageConfig,
}

impl ClipImageProcessor {
    /// Create a new processor
    pub fn new(config: ImageConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Processor settings
    pub fn config(&self) -> &ImageConfig {
        &self.config
    }
}

impl ImageProcessor for ClipImageProcessor {
    fn process(&self, image: &DynamicImage) -> Result<Tensor> {
        let size = u32::try_from(self.config.size)
            .map_err(|_| Error::image(format!("Image size {} does not fit in u32", self.config.size)))?;
        let rgb = image.resize_exact(size, size, FilterType::Triangle).to_rgb8();

        let (width, height) = (rgb.width() as usize, rgb.height() as usize);
        let num_pixels = width * height;
        let pixels = rgb.as_raw();

        // Interleaved RGB -> planar CHW
        let mut data = Vec::with_capacity(3 * num_pixels);
        for c in 0..3 {
            let mean = self.config.mean[c];
            let std = self.config.std[c];
            let scale = self.config.rescale_factor;
            data.extend((0..num_pixels).map(|i| (pixels[i * 3 + c] as f32 * scale - mean) / std));
        }

        Ok(Tensor::from_vec(data, (1, 3, height, width), &Device::Cpu)?)
    }

    fn image_size(&self) -> usize {
        self.config.size
    }
}

/// Produces the pixel tensor attached to every example of a conversation
#[derive(Clone)]
pub struct ImageSlotResolver {
    loader: Arc<dyn ImageLoader>,
    processor: Arc<dyn ImageProcessor>,
}

impl ImageSlotResolver {
    /// Create a new resolver
    pub fn new(loader: Arc<dyn ImageLoader>, processor: Arc<dyn ImageProcessor>) -> Self {
        Self { loader, processor }
    }

    /// Shape of every tensor this resolver returns
    pub fn pixel_shape(&self) -> (usize, usize, usize, usize) {
        let size = self.processor.image_size();
        (1, 3, size, size)
    }

    /// All-zero tensor used when a conversation carries no image
    pub fn placeholder(&self) -> Result<Tensor> {
        Ok(Tensor::zeros(self.pixel_shape(), DType::F32, &Device::Cpu)?)
    }

    /// Pixel tensor for a conversation.
    ///
    /// Only the first content part of the first message is consulted. A
    /// referenced image that cannot be loaded is an error.
    pub fn resolve(&self, conversation: &Conversation) -> Result<Tensor> {
        let Some(reference) = conversation.image_reference() else {
            return self.placeholder();
        };

        debug!("Loading image {}", reference);
        let image = self.loader.load(reference)?;
        let pixels = self.processor.process(&image)?;

        let expected = self.pixel_shape();
        if pixels.dims() != [expected.0, expected.1, expected.2, expected.3] {
            return Err(Error::image(format!(
                "Processor returned shape {:?} for {}, expected {:?}",
                pixels.dims(),
                reference,
                expected
            )));
        }

        Ok(pixels)
    }
}
