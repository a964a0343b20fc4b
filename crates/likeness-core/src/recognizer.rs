//! Embedding network capability and its ONNX Runtime adapter.
//!
//! The network itself is pre-trained and supplied externally (ArcFace
//! `w600k_r50`, FaceNet exports, ...). The adapter only handles tensor layout
//! and pixel normalization; L2 normalization happens in the extractor.

use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("embedding model not found: {0}")]
    ModelNotFound(String),
    #[error("embedding inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// A face embedding network.
pub trait EmbeddingModel: Send {
    /// Identifier of the loaded weights, recorded in gallery artifacts.
    fn version(&self) -> &str;

    /// Side length of the square RGB input the network expects.
    fn input_size(&self) -> u32;

    /// Raw embedding of an aligned face crop.
    fn embed(&mut self, face: &RgbImage) -> Result<Vec<f32>, RecognizerError>;
}

/// Input geometry and pixel normalization of an embedding network.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmbedderInput {
    pub size: u32,
    pub mean: f32,
    pub std: f32,
}

impl EmbedderInput {
    /// InsightFace ArcFace: 112×112, symmetric normalization to [-1, 1].
    pub const ARCFACE: Self = Self {
        size: 112,
        mean: 127.5,
        std: 127.5,
    };

    /// facenet-pytorch InceptionResnetV1: 160×160, fixed prewhitening.
    pub const FACENET: Self = Self {
        size: 160,
        mean: 127.5,
        std: 128.0,
    };
}

pub struct OnnxEmbedder {
    session: Session,
    input: EmbedderInput,
    version: String,
}

impl OnnxEmbedder {
    /// Load an embedding network; its version is the model file stem.
    pub fn load(model_path: &Path, input: EmbedderInput) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(
                model_path.display().to_string(),
            ));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let version = model_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unknown".to_string());

        tracing::info!(
            path = %model_path.display(),
            version = %version,
            input_size = input.size,
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            "loaded embedding model"
        );

        Ok(Self {
            session,
            input,
            version,
        })
    }
}

impl EmbeddingModel for OnnxEmbedder {
    fn version(&self) -> &str {
        &self.version
    }

    fn input_size(&self) -> u32 {
        self.input.size
    }

    fn embed(&mut self, face: &RgbImage) -> Result<Vec<f32>, RecognizerError> {
        let tensor = to_tensor(face, &self.input);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(tensor.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding output: {e}")))?;
        Ok(raw.to_vec())
    }
}

/// Convert an RGB crop into a normalized 1×3×N×N tensor, resizing if needed.
fn to_tensor(face: &RgbImage, input: &EmbedderInput) -> Array4<f32> {
    let size = input.size;
    let resized;
    let face = if face.dimensions() == (size, size) {
        face
    } else {
        resized = imageops::resize(face, size, size, FilterType::Triangle);
        &resized
    };

    let n = size as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, n, n));
    for (x, y, pixel) in face.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - input.mean) / input.std;
        }
    }
    tensor
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_tensor_shape() {
        let face = RgbImage::from_pixel(112, 112, Rgb([128, 128, 128]));
        let tensor = to_tensor(&face, &EmbedderInput::ARCFACE);
        assert_eq!(tensor.shape(), &[1, 3, 112, 112]);
    }

    #[test]
    fn test_tensor_resizes_to_input() {
        let face = RgbImage::from_pixel(50, 70, Rgb([10, 20, 30]));
        let tensor = to_tensor(&face, &EmbedderInput::FACENET);
        assert_eq!(tensor.shape(), &[1, 3, 160, 160]);
    }

    #[test]
    fn test_tensor_normalization_per_channel() {
        let face = RgbImage::from_pixel(112, 112, Rgb([255, 127, 0]));
        let tensor = to_tensor(&face, &EmbedderInput::ARCFACE);
        assert!((tensor[[0, 0, 5, 5]] - 1.0).abs() < 1e-6);
        assert!((tensor[[0, 1, 5, 5]] - (127.0 - 127.5) / 127.5).abs() < 1e-6);
        assert!((tensor[[0, 2, 5, 5]] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_load_missing_model() {
        let result = OnnxEmbedder::load(Path::new("/nonexistent/w600k_r50.onnx"), EmbedderInput::ARCFACE);
        assert!(matches!(result, Err(RecognizerError::ModelNotFound(_))));
    }
}
