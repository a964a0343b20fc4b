use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::time::Instant;

/// Label reported when no gallery identity clears the acceptance threshold.
pub const UNKNOWN_LABEL: &str = "unknown";

/// Face region reported by a detector, in frame pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Integer rectangle fully inside an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl FaceRegion {
    /// Region without landmarks and with full confidence.
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            confidence: 1.0,
            landmarks: None,
        }
    }

    /// Clip the region to an image of `width` x `height` pixels.
    ///
    /// Returns `None` when nothing of the region lies inside the image.
    pub fn clip(&self, width: u32, height: u32) -> Option<PixelRect> {
        let coords = [self.x, self.y, self.width, self.height];
        if coords.iter().any(|v| !v.is_finite()) {
            return None;
        }

        let x0 = self.x.max(0.0).floor();
        let y0 = self.y.max(0.0).floor();
        let x1 = (self.x + self.width).min(width as f32).ceil();
        let y1 = (self.y + self.height).min(height as f32).ceil();
        if x1 <= x0 || y1 <= y0 {
            return None;
        }

        Some(PixelRect {
            x: x0 as u32,
            y: y0 as u32,
            width: (x1 - x0) as u32,
            height: (y1 - y0) as u32,
        })
    }

    /// Intersection-over-union with another region.
    pub fn iou(&self, other: &FaceRegion) -> f32 {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = (self.x + self.width).min(other.x + other.width);
        let bottom = (self.y + self.height).min(other.y + other.height);

        let inter = (right - left).max(0.0) * (bottom - top).max(0.0);
        let union = self.width * self.height + other.width * other.height - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }
}

/// Fixed-length face descriptor: an embedding or a flattened histogram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Descriptor {
    values: Vec<f32>,
}

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Euclidean (L2) norm.
    pub fn norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    /// Scale to unit length. A zero vector is returned unchanged.
    pub fn l2_normalized(mut self) -> Self {
        let norm = self.norm();
        if norm > 0.0 {
            for v in &mut self.values {
                *v /= norm;
            }
        }
        self
    }

    /// Cosine similarity in [-1, 1]; 0.0 when either vector is zero.
    pub fn cosine_similarity(&self, other: &Descriptor) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;
        for (a, b) in self.values.iter().zip(&other.values) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            dot / denom
        } else {
            0.0
        }
    }

    pub fn euclidean_distance(&self, other: &Descriptor) -> f32 {
        self.values
            .iter()
            .zip(&other.values)
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Symmetric chi-square distance, `sum 2(a-b)^2 / (a+b)`, as used by
    /// LBPH recognizers. Bins where both values are zero contribute nothing.
    pub fn chi_square_distance(&self, other: &Descriptor) -> f32 {
        self.values
            .iter()
            .zip(&other.values)
            .filter(|(a, b)| **a + **b > 0.0)
            .map(|(a, b)| 2.0 * (a - b).powi(2) / (a + b))
            .sum()
    }

    /// Arithmetic mean of equal-length descriptors, summed in slice order.
    ///
    /// Returns `None` for an empty slice or mismatched lengths.
    pub fn mean(descriptors: &[Descriptor]) -> Option<Descriptor> {
        let first = descriptors.first()?;
        let dim = first.len();
        if descriptors.iter().any(|d| d.len() != dim) {
            return None;
        }

        let mut sums = vec![0.0f64; dim];
        for d in descriptors {
            for (sum, v) in sums.iter_mut().zip(&d.values) {
                *sum += *v as f64;
            }
        }
        let count = descriptors.len() as f64;
        Some(Descriptor::new(
            sums.into_iter().map(|s| (s / count) as f32).collect(),
        ))
    }
}

/// Comparison direction of a score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    /// Distances: smaller scores are better matches.
    LowerIsBetter,
    /// Similarities: larger scores are better matches.
    HigherIsBetter,
}

impl Polarity {
    /// Order two scores best-first.
    pub fn compare(self, a: f32, b: f32) -> Ordering {
        match self {
            Polarity::LowerIsBetter => a.total_cmp(&b),
            Polarity::HigherIsBetter => b.total_cmp(&a),
        }
    }

    pub fn is_better(self, candidate: f32, incumbent: f32) -> bool {
        self.compare(candidate, incumbent) == Ordering::Less
    }

    /// Score that every real score beats.
    pub fn worst(self) -> f32 {
        match self {
            Polarity::LowerIsBetter => f32::INFINITY,
            Polarity::HigherIsBetter => f32::NEG_INFINITY,
        }
    }
}

/// Outcome of classifying one probe descriptor against a gallery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    /// Accepted identity; `None` means "unknown".
    pub identity: Option<String>,
    /// Nominally closest identity, reported even when it was rejected.
    pub candidate: Option<String>,
    pub score: f32,
    pub polarity: Polarity,
}

impl MatchResult {
    pub fn unknown(candidate: Option<String>, score: f32, polarity: Polarity) -> Self {
        Self {
            identity: None,
            candidate,
            score,
            polarity,
        }
    }

    pub fn is_match(&self) -> bool {
        self.identity.is_some()
    }

    /// Accepted identity name, or [`UNKNOWN_LABEL`].
    pub fn label(&self) -> &str {
        self.identity.as_deref().unwrap_or(UNKNOWN_LABEL)
    }
}

/// One decoded video frame or still image.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: DynamicImage,
    pub sequence: u64,
    pub timestamp: Instant,
}

impl Frame {
    pub fn new(image: DynamicImage, sequence: u64) -> Self {
        Self {
            image,
            sequence,
            timestamp: Instant::now(),
        }
    }
}
