//! Startup of the process-wide recognition state.

use crate::config::{Config, ExtractorKind};
use anyhow::{Context, Result};
use likeness_core::{Engine, FaceDetector, FeatureExtractor, Gallery, OnnxEmbedder, ScrfdDetector};
use std::sync::Arc;

pub fn load_detector(config: &Config) -> Result<Box<dyn FaceDetector>> {
    let path = config.detector_model_path();
    let detector = ScrfdDetector::load(&path, config.detection_confidence)
        .with_context(|| format!("loading face detector {}", path.display()))?;
    Ok(Box::new(detector))
}

/// Build the configured extractor.
///
/// With `locate`, the extractor finds the face itself (training on whole
/// photos); otherwise it expects regions from the caller.
pub fn build_extractor(config: &Config, locate: bool) -> Result<FeatureExtractor> {
    let extractor = match config.extractor {
        ExtractorKind::Embedding => {
            let path = config.embedding_model_path();
            let model = OnnxEmbedder::load(&path, config.embedder_input())
                .with_context(|| format!("loading embedding model {}", path.display()))?;
            FeatureExtractor::embedding(Box::new(model), config.embedding_dimension)
        }
        ExtractorKind::Histogram => FeatureExtractor::histogram(config.lbph),
        ExtractorKind::Landmarks => FeatureExtractor::landmarks(),
    };

    if locate {
        Ok(extractor.with_locator(load_detector(config)?))
    } else {
        Ok(extractor)
    }
}

/// Load models and gallery once; the gallery must match the extractor.
pub fn build_engine(config: &Config) -> Result<Engine> {
    config.validate()?;
    let classifier = config.classifier()?;
    let extractor = build_extractor(config, false)?;
    let gallery = Gallery::load_for(&config.gallery_path, &extractor.id(), extractor.dimension())
        .with_context(|| format!("loading gallery {}", config.gallery_path.display()))?;
    let detector = load_detector(config)?;

    Ok(Engine::new(detector, extractor, classifier, Arc::new(gallery))?)
}
