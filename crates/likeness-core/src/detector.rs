//! Face detector capability and its SCRFD adapter.
//!
//! The matching pipeline only depends on [`FaceDetector`]. [`ScrfdDetector`]
//! runs an InsightFace SCRFD export through ONNX Runtime: letterboxed RGB
//! input, anchor-free decoding over three strides, greedy NMS.

use crate::types::FaceRegion;
use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;
pub const DEFAULT_NMS_THRESHOLD: f32 = 0.4;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("detector model not found: {0}")]
    ModelNotFound(String),
    #[error("detector inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Locates faces in an image.
///
/// Implementations return regions sorted best first; an empty vector means
/// the image holds no detectable face.
pub trait FaceDetector: Send {
    fn detect(&mut self, image: &DynamicImage) -> Result<Vec<FaceRegion>, DetectorError>;
}

/// Single-face policy: when a detector reports several faces, the first
/// (highest ranked) one is used and the rest are ignored.
pub fn primary_region(regions: Vec<FaceRegion>) -> Option<FaceRegion> {
    regions.into_iter().next()
}

/// Mapping from letterboxed model space back to frame space.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor positions (score, bbox, kps) for one stride.
type LevelOutputs = (usize, usize, usize);

pub struct ScrfdDetector {
    session: Session,
    layout: [LevelOutputs; 3],
    confidence_threshold: f32,
    nms_threshold: f32,
}

impl ScrfdDetector {
    /// Load an SCRFD ONNX export (e.g. `det_10g.onnx`).
    pub fn load(model_path: &Path, confidence_threshold: f32) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(
                model_path.display().to_string(),
            ));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();
        if names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD export needs 9 outputs (score/bbox/kps per stride), found {}",
                names.len()
            )));
        }

        let layout = output_layout(&names);
        tracing::info!(
            path = %model_path.display(),
            outputs = ?names,
            ?layout,
            "loaded SCRFD detector"
        );

        Ok(Self {
            session,
            layout,
            confidence_threshold,
            nms_threshold: DEFAULT_NMS_THRESHOLD,
        })
    }
}

impl FaceDetector for ScrfdDetector {
    fn detect(&mut self, image: &DynamicImage) -> Result<Vec<FaceRegion>, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(DetectorError::InferenceFailed("empty image".into()));
        }

        let (input, letterbox) = letterbox_tensor(&image.to_rgb8());
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (level, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.layout[level];
            let (_, scores) = outputs[score_idx].try_extract_tensor::<f32>().map_err(|e| {
                DetectorError::InferenceFailed(format!("scores at stride {stride}: {e}"))
            })?;
            let (_, boxes) = outputs[bbox_idx].try_extract_tensor::<f32>().map_err(|e| {
                DetectorError::InferenceFailed(format!("boxes at stride {stride}: {e}"))
            })?;
            let (_, kps) = outputs[kps_idx].try_extract_tensor::<f32>().map_err(|e| {
                DetectorError::InferenceFailed(format!("landmarks at stride {stride}: {e}"))
            })?;

            decode_level(
                &mut candidates,
                scores,
                boxes,
                kps,
                stride,
                &letterbox,
                self.confidence_threshold,
            );
        }

        Ok(non_max_suppression(candidates, self.nms_threshold))
    }
}

/// Resolve output tensor positions by name (`score_8`, `bbox_16`, `kps_32`, ...),
/// falling back to the conventional positional order
/// `[scores 8/16/32, boxes 8/16/32, kps 8/16/32]`.
fn output_layout(names: &[String]) -> [LevelOutputs; 3] {
    let position = |kind: &str, stride: usize| {
        let wanted = format!("{kind}_{stride}");
        names.iter().position(|n| *n == wanted)
    };

    let named: Option<Vec<LevelOutputs>> = SCRFD_STRIDES
        .iter()
        .map(|&s| Some((position("score", s)?, position("bbox", s)?, position("kps", s)?)))
        .collect();

    match named {
        Some(levels) => [levels[0], levels[1], levels[2]],
        None => [(0, 3, 6), (1, 4, 7), (2, 5, 8)],
    }
}

/// Letterbox an RGB image into a normalized 1x3x640x640 tensor.
fn letterbox_tensor(rgb: &RgbImage) -> (Array4<f32>, Letterbox) {
    let (width, height) = rgb.dimensions();
    let side = SCRFD_INPUT_SIZE as f32;
    let scale = (side / width as f32).min(side / height as f32);

    let new_w = ((width as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
    let new_h = ((height as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
    let pad_x = (SCRFD_INPUT_SIZE - new_w) / 2;
    let pad_y = (SCRFD_INPUT_SIZE - new_h) / 2;

    let resized = imageops::resize(rgb, new_w, new_h, FilterType::Triangle);

    // Zeros are the normalized value of the mean-colored padding.
    let n = SCRFD_INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, n, n));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let tx = (x + pad_x) as usize;
        let ty = (y + pad_y) as usize;
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    let letterbox = Letterbox {
        scale,
        pad_x: pad_x as f32,
        pad_y: pad_y as f32,
    };
    (tensor, letterbox)
}

/// Decode the anchors of one stride whose score clears `threshold`.
fn decode_level(
    out: &mut Vec<FaceRegion>,
    scores: &[f32],
    boxes: &[f32],
    kps: &[f32],
    stride: usize,
    letterbox: &Letterbox,
    threshold: f32,
) {
    let cells = SCRFD_INPUT_SIZE as usize / stride;
    let step = stride as f32;

    for row in 0..cells {
        for col in 0..cells {
            let (cx, cy) = (col as f32 * step, row as f32 * step);

            for anchor in 0..SCRFD_ANCHORS_PER_CELL {
                let idx = (row * cells + col) * SCRFD_ANCHORS_PER_CELL + anchor;
                let Some(&score) = scores.get(idx) else {
                    return;
                };
                if score <= threshold {
                    continue;
                }
                let Some(d) = boxes.get(idx * 4..idx * 4 + 4) else {
                    continue;
                };

                let (x0, y0) = letterbox.to_frame(cx - d[0] * step, cy - d[1] * step);
                let (x1, y1) = letterbox.to_frame(cx + d[2] * step, cy + d[3] * step);
                let landmarks = kps.get(idx * 10..idx * 10 + 10).map(|k| {
                    std::array::from_fn(|i| {
                        letterbox.to_frame(cx + k[2 * i] * step, cy + k[2 * i + 1] * step)
                    })
                });

                out.push(FaceRegion {
                    x: x0,
                    y: y0,
                    width: x1 - x0,
                    height: y1 - y0,
                    confidence: score,
                    landmarks,
                });
            }
        }
    }
}

/// Greedy NMS; the result is sorted by descending confidence.
fn non_max_suppression(mut regions: Vec<FaceRegion>, iou_threshold: f32) -> Vec<FaceRegion> {
    regions.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<FaceRegion> = Vec::new();
    for region in regions {
        if kept.iter().all(|k| k.iou(&region) <= iou_threshold) {
            kept.push(region);
        }
    }
    kept
}
