use crate::classifier::{Classifier, ClassifyError};
use crate::detector::{primary_region, DetectorError, FaceDetector};
use crate::extractor::{ExtractionError, FeatureExtractor};
use crate::gallery::Gallery;
use crate::types::{Descriptor, FaceRegion, MatchResult};
use image::DynamicImage;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("gallery was built by `{gallery}`, but the extractor is `{extractor}`")]
    ExtractorMismatch { gallery: String, extractor: String },
    #[error("gallery dimension {gallery} does not match extractor dimension {extractor}")]
    DimensionMismatch { gallery: usize, extractor: usize },
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("extraction error: {0}")]
    Extraction(#[from] ExtractionError),
    #[error("classification error: {0}")]
    Classify(#[from] ClassifyError),
}

/// One identified face.
#[derive(Debug, Clone, Serialize)]
pub struct Identification {
    pub region: FaceRegion,
    pub result: MatchResult,
}

/// Detector, extractor, classifier and gallery, loaded once and shared by
/// every identification for the life of the process.
pub struct Engine {
    detector: Box<dyn FaceDetector>,
    extractor: FeatureExtractor,
    classifier: Classifier,
    gallery: Arc<Gallery>,
}

impl Engine {
    /// Assemble the engine, refusing a gallery built by another extractor.
    pub fn new(
        detector: Box<dyn FaceDetector>,
        extractor: FeatureExtractor,
        classifier: Classifier,
        gallery: Arc<Gallery>,
    ) -> Result<Self, EngineError> {
        let extractor_id = extractor.id();
        if gallery.extractor() != extractor_id {
            return Err(EngineError::ExtractorMismatch {
                gallery: gallery.extractor().to_string(),
                extractor: extractor_id,
            });
        }
        if gallery.dimension() != extractor.dimension() {
            return Err(EngineError::DimensionMismatch {
                gallery: gallery.dimension(),
                extractor: extractor.dimension(),
            });
        }
        if gallery.is_empty() {
            tracing::warn!("gallery is empty, every face will be reported as unknown");
        }

        tracing::info!(
            extractor = %extractor_id,
            dimension = gallery.dimension(),
            identities = gallery.len(),
            strategy = ?classifier.strategy(),
            metric = %classifier.metric(),
            threshold = ?classifier.threshold(),
            "engine ready"
        );
        Ok(Self {
            detector,
            extractor,
            classifier,
            gallery,
        })
    }

    pub fn gallery(&self) -> &Arc<Gallery> {
        &self.gallery
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    /// First region reported by the detector, if any.
    pub fn detect_primary(&mut self, image: &DynamicImage) -> Result<Option<FaceRegion>, DetectorError> {
        Ok(primary_region(self.detector.detect(image)?))
    }

    pub fn describe(
        &mut self,
        image: &DynamicImage,
        region: &FaceRegion,
    ) -> Result<Option<Descriptor>, ExtractionError> {
        self.extractor.extract_region(image, region)
    }

    pub fn classify(&self, descriptor: &Descriptor) -> Result<MatchResult, ClassifyError> {
        self.classifier.classify(descriptor, &self.gallery)
    }

    /// Detect, describe and classify the primary face of a still image.
    ///
    /// `Ok(None)` when no face was found or it could not be described.
    pub fn identify(&mut self, image: &DynamicImage) -> Result<Option<Identification>, EngineError> {
        let Some(region) = self.detect_primary(image)? else {
            return Ok(None);
        };
        let Some(descriptor) = self.describe(image, &region)? else {
            return Ok(None);
        };
        let result = self.classify(&descriptor)?;
        Ok(Some(Identification { region, result }))
    }

    /// Release the native sessions.
    pub fn shutdown(self) {
        tracing::info!(identities = self.gallery.len(), "engine shut down");
    }
}
