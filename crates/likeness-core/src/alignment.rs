//! Face alignment via a 4-DOF similarity transform.
//!
//! Five detected landmarks are mapped onto the ArcFace reference points
//! (scaled to the embedding model's input size) with a closed-form
//! least-squares fit, and the face is warped into a square crop.

use image::{Rgb, RgbImage};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};

/// ArcFace reference landmarks for a 112×112 crop.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];
const REFERENCE_SIZE: f32 = 112.0;

/// Similarity transform `p' = [a -b; b a] p + t` (scale, rotation, translation).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl Similarity {
    /// Least-squares similarity mapping `src` points onto `dst` points.
    ///
    /// Returns `None` for fewer than two point pairs or coincident sources.
    pub fn estimate(src: &[(f32, f32)], dst: &[(f32, f32)]) -> Option<Self> {
        let n = src.len().min(dst.len());
        if n < 2 {
            return None;
        }

        let centroid = |pts: &[(f32, f32)]| {
            let (sx, sy) = pts[..n]
                .iter()
                .fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
            (sx / n as f32, sy / n as f32)
        };
        let (scx, scy) = centroid(src);
        let (dcx, dcy) = centroid(dst);

        let (mut num_a, mut num_b, mut denom) = (0.0f32, 0.0f32, 0.0f32);
        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst).take(n) {
            let (sx, sy) = (sx - scx, sy - scy);
            let (dx, dy) = (dx - dcx, dy - dcy);
            num_a += sx * dx + sy * dy;
            num_b += sx * dy - sy * dx;
            denom += sx * sx + sy * sy;
        }
        if denom < 1e-9 {
            return None;
        }

        let a = num_a / denom;
        let b = num_b / denom;
        Some(Self {
            a,
            b,
            tx: dcx - (a * scx - b * scy),
            ty: dcy - (b * scx + a * scy),
        })
    }

    pub fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }

    /// Uniform scale factor of the transform.
    pub fn scale(&self) -> f32 {
        (self.a * self.a + self.b * self.b).sqrt()
    }

    fn projection(&self) -> Option<Projection> {
        Projection::from_matrix([
            self.a, -self.b, self.tx, //
            self.b, self.a, self.ty, //
            0.0, 0.0, 1.0,
        ])
    }
}

/// Reference landmark positions for a `size`×`size` crop.
pub fn reference_landmarks(size: u32) -> [(f32, f32); 5] {
    let k = size as f32 / REFERENCE_SIZE;
    REFERENCE_LANDMARKS_112.map(|(x, y)| (x * k, y * k))
}

/// Warp the face described by `landmarks` into a canonical `size`×`size` crop.
///
/// Pixels sampled from outside `image` are black. Returns `None` when the
/// landmarks are degenerate.
pub fn align_face(image: &RgbImage, landmarks: &[(f32, f32); 5], size: u32) -> Option<RgbImage> {
    let transform = Similarity::estimate(landmarks, &reference_landmarks(size))?;
    let projection = transform.projection()?;

    let mut aligned = RgbImage::new(size, size);
    warp_into(
        image,
        &projection,
        Interpolation::Bilinear,
        Rgb([0, 0, 0]),
        &mut aligned,
    );
    Some(aligned)
}
