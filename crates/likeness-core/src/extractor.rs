//! Face image → descriptor.
//!
//! A [`FeatureExtractor`] pairs an optional *locator* (any [`FaceDetector`],
//! used when the input is a whole photo rather than a crop) with one
//! [`Encoder`] variant. "No face found" is a normal `Ok(None)`; errors are
//! reserved for malformed input or a failing model.

use crate::alignment;
use crate::detector::{primary_region, DetectorError, FaceDetector};
use crate::histogram::{self, LbphParams};
use crate::recognizer::{EmbeddingModel, RecognizerError};
use crate::types::{Descriptor, FaceRegion};
use image::imageops::{self, FilterType};
use image::DynamicImage;
use std::borrow::Cow;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("cannot read image {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("image is empty")]
    EmptyImage,
    #[error("face region does not overlap the {width}x{height} image")]
    RegionOutsideImage { width: u32, height: u32 },
    #[error("face locator failed: {0}")]
    Locator(#[from] DetectorError),
    #[error("embedding model failed: {0}")]
    Model(#[from] RecognizerError),
    #[error("embedding has {actual} values, expected {expected}")]
    WrongDimension { expected: usize, actual: usize },
    #[error("embedding model returned a zero vector")]
    ZeroEmbedding,
    #[error("embedding model returned a non-finite value at index {index}")]
    NonFiniteEmbedding { index: usize },
}

/// How a located face is turned into numbers.
pub enum Encoder {
    /// Pre-trained embedding network; output is L2-normalized.
    Embedding {
        model: Box<dyn EmbeddingModel>,
        dimension: usize,
    },
    /// Legacy LBP spatial histogram over a grayscale crop.
    Histogram(LbphParams),
    /// Detector landmarks relative to the face box, L2-normalized.
    Landmarks,
}

pub struct FeatureExtractor {
    locator: Option<Box<dyn FaceDetector>>,
    encoder: Encoder,
}

impl FeatureExtractor {
    pub fn new(encoder: Encoder) -> Self {
        Self {
            locator: None,
            encoder,
        }
    }

    pub fn embedding(model: Box<dyn EmbeddingModel>, dimension: usize) -> Self {
        Self::new(Encoder::Embedding { model, dimension })
    }

    pub fn histogram(params: LbphParams) -> Self {
        Self::new(Encoder::Histogram(params))
    }

    /// Landmark descriptors need regions with landmarks: give it a locator
    /// for whole photos, or pass detector regions to
    /// [`extract_region`](Self::extract_region).
    pub fn landmarks() -> Self {
        Self::new(Encoder::Landmarks)
    }

    /// Locate the face inside every input passed to [`extract`](Self::extract).
    pub fn with_locator(mut self, locator: Box<dyn FaceDetector>) -> Self {
        self.locator = Some(locator);
        self
    }

    /// Configuration identifier; galleries built with a different one are rejected.
    pub fn id(&self) -> String {
        match &self.encoder {
            Encoder::Embedding { model, dimension } => format!(
                "embedding:{}:{}:{}",
                model.version(),
                model.input_size(),
                dimension
            ),
            Encoder::Histogram(params) => params.id(),
            Encoder::Landmarks => "landmarks:5".to_string(),
        }
    }

    pub fn dimension(&self) -> usize {
        match &self.encoder {
            Encoder::Embedding { dimension, .. } => *dimension,
            Encoder::Histogram(params) => params.dimension(),
            Encoder::Landmarks => 10,
        }
    }

    /// Describe the face in `image`.
    ///
    /// With a locator the first located face is used and `Ok(None)` means the
    /// locator found nothing. Without one the whole image is the face crop.
    pub fn extract(&mut self, image: &DynamicImage) -> Result<Option<Descriptor>, ExtractionError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(ExtractionError::EmptyImage);
        }

        let region = match self.locator.as_mut() {
            Some(locator) => match primary_region(locator.detect(image)?) {
                Some(region) => Some(region),
                None => {
                    tracing::debug!("locator found no face");
                    return Ok(None);
                }
            },
            None => None,
        };
        self.encode(image, region.as_ref())
    }

    /// Describe a region already located in `frame`, without re-detecting.
    pub fn extract_region(
        &mut self,
        frame: &DynamicImage,
        region: &FaceRegion,
    ) -> Result<Option<Descriptor>, ExtractionError> {
        if frame.width() == 0 || frame.height() == 0 {
            return Err(ExtractionError::EmptyImage);
        }
        self.encode(frame, Some(region))
    }

    fn encode(
        &mut self,
        image: &DynamicImage,
        region: Option<&FaceRegion>,
    ) -> Result<Option<Descriptor>, ExtractionError> {
        match &mut self.encoder {
            Encoder::Embedding { model, dimension } => {
                let size = model.input_size();
                let aligned = region
                    .and_then(|r| r.landmarks.as_ref())
                    .and_then(|lm| alignment::align_face(&image.to_rgb8(), lm, size));
                let face = match aligned {
                    Some(face) => face,
                    None => {
                        let crop = crop(image, region)?;
                        imageops::resize(&crop.to_rgb8(), size, size, FilterType::Triangle)
                    }
                };

                let raw = model.embed(&face)?;
                if raw.len() != *dimension {
                    return Err(ExtractionError::WrongDimension {
                        expected: *dimension,
                        actual: raw.len(),
                    });
                }
                if let Some(index) = raw.iter().position(|v| !v.is_finite()) {
                    return Err(ExtractionError::NonFiniteEmbedding { index });
                }
                let descriptor = Descriptor::new(raw).l2_normalized();
                if descriptor.norm() == 0.0 {
                    return Err(ExtractionError::ZeroEmbedding);
                }
                Ok(Some(descriptor))
            }
            Encoder::Histogram(params) => {
                let gray = crop(image, region)?.to_luma8();
                let face = imageops::resize(
                    &gray,
                    params.input_size,
                    params.input_size,
                    FilterType::Triangle,
                );
                Ok(Some(Descriptor::new(histogram::spatial_histogram(
                    &face, params,
                ))))
            }
            Encoder::Landmarks => Ok(region.and_then(landmark_descriptor)),
        }
    }
}

/// Crop `image` to `region`; the whole image when there is no region.
fn crop<'a>(
    image: &'a DynamicImage,
    region: Option<&FaceRegion>,
) -> Result<Cow<'a, DynamicImage>, ExtractionError> {
    let Some(region) = region else {
        return Ok(Cow::Borrowed(image));
    };
    let (width, height) = (image.width(), image.height());
    let rect = region
        .clip(width, height)
        .ok_or(ExtractionError::RegionOutsideImage { width, height })?;
    Ok(Cow::Owned(image.crop_imm(
        rect.x,
        rect.y,
        rect.width,
        rect.height,
    )))
}

fn landmark_descriptor(region: &FaceRegion) -> Option<Descriptor> {
    let landmarks = region.landmarks?;
    if region.width <= 0.0 || region.height <= 0.0 {
        return None;
    }
    let values = landmarks
        .iter()
        .flat_map(|&(x, y)| {
            [
                (x - region.x) / region.width,
                (y - region.y) / region.height,
            ]
        })
        .collect();
    let descriptor = Descriptor::new(values).l2_normalized();
    (descriptor.norm() > 0.0).then_some(descriptor)
}
