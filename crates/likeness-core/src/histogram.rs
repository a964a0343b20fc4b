//! Local Binary Pattern histograms (the legacy LBPH descriptor).
//!
//! Each pixel gets an 8-bit code from comparing eight circularly sampled
//! neighbors at `radius` with the center. Codes are histogrammed per cell of
//! a `grid_x`×`grid_y` grid and each cell histogram is divided by its pixel
//! count; the cells are concatenated row-major.

use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;

const NEIGHBORS: usize = 8;
const BINS: usize = 1 << NEIGHBORS;
/// Interpolated samples this close to the center count as equal.
const SAMPLE_TOLERANCE: f32 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LbphParams {
    pub radius: u32,
    pub grid_x: u32,
    pub grid_y: u32,
    /// Faces are resized to `input_size`×`input_size` before encoding.
    pub input_size: u32,
}

impl Default for LbphParams {
    fn default() -> Self {
        Self {
            radius: 1,
            grid_x: 8,
            grid_y: 8,
            input_size: 200,
        }
    }
}

impl LbphParams {
    pub fn dimension(&self) -> usize {
        (self.grid_x * self.grid_y) as usize * BINS
    }

    pub fn id(&self) -> String {
        format!(
            "lbph:r{}:g{}x{}:s{}",
            self.radius, self.grid_x, self.grid_y, self.input_size
        )
    }

    /// Check that every grid cell covers at least one code.
    pub fn validate(&self) -> Result<(), String> {
        if self.radius == 0 || self.grid_x == 0 || self.grid_y == 0 {
            return Err(format!("radius and grid must be positive: {self:?}"));
        }
        let coded = self.input_size.saturating_sub(2 * self.radius);
        if coded < self.grid_x.max(self.grid_y) {
            return Err(format!(
                "input size {} leaves {coded} coded pixels, fewer than the {}x{} grid",
                self.input_size, self.grid_x, self.grid_y
            ));
        }
        Ok(())
    }
}

/// LBP code image of size `(width - 2r) × (height - 2r)`.
fn lbp_codes(gray: &GrayImage, radius: u32) -> (Vec<u8>, usize, usize) {
    let (w, h) = gray.dimensions();
    let r = radius as usize;
    let (w, h) = (w as usize, h as usize);
    if w <= 2 * r || h <= 2 * r {
        return (Vec::new(), 0, 0);
    }
    let (out_w, out_h) = (w - 2 * r, h - 2 * r);
    let px = |x: usize, y: usize| gray.get_pixel(x as u32, y as u32)[0] as f32;

    let mut codes = vec![0u8; out_w * out_h];
    for n in 0..NEIGHBORS {
        let angle = 2.0 * PI * n as f32 / NEIGHBORS as f32;
        let sx = radius as f32 * angle.cos();
        let sy = -(radius as f32) * angle.sin();

        // Bilinear weights are constant for a given sampling offset.
        let (fx, fy) = (sx.floor(), sy.floor());
        let (cx, cy) = (sx.ceil(), sy.ceil());
        let (tx, ty) = (sx - fx, sy - fy);
        let w1 = (1.0 - tx) * (1.0 - ty);
        let w2 = tx * (1.0 - ty);
        let w3 = (1.0 - tx) * ty;
        let w4 = tx * ty;
        let (fx, fy, cx, cy) = (fx as isize, fy as isize, cx as isize, cy as isize);

        for y in r..h - r {
            for x in r..w - r {
                let at = |dx: isize, dy: isize| {
                    px((x as isize + dx) as usize, (y as isize + dy) as usize)
                };
                let sample = w1 * at(fx, fy) + w2 * at(cx, fy) + w3 * at(fx, cy) + w4 * at(cx, cy);
                if sample + SAMPLE_TOLERANCE >= px(x, y) {
                    codes[(y - r) * out_w + (x - r)] |= 1 << n;
                }
            }
        }
    }
    (codes, out_w, out_h)
}

/// Concatenated per-cell LBP histograms, each normalized by its pixel count.
pub fn spatial_histogram(gray: &GrayImage, params: &LbphParams) -> Vec<f32> {
    let (codes, w, h) = lbp_codes(gray, params.radius);
    let (gx, gy) = (params.grid_x as usize, params.grid_y as usize);
    let mut hist = vec![0.0f32; gx * gy * BINS];

    let (cell_w, cell_h) = (w / gx, h / gy);
    if cell_w == 0 || cell_h == 0 {
        return hist;
    }
    let cell_pixels = (cell_w * cell_h) as f32;

    for row in 0..gy {
        for col in 0..gx {
            let bins = &mut hist[(row * gx + col) * BINS..(row * gx + col + 1) * BINS];
            for y in row * cell_h..(row + 1) * cell_h {
                for &code in &codes[y * w + col * cell_w..y * w + (col + 1) * cell_w] {
                    bins[code as usize] += 1.0;
                }
            }
            for b in bins.iter_mut() {
                *b /= cell_pixels;
            }
        }
    }
    hist
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn small() -> LbphParams {
        LbphParams {
            radius: 1,
            grid_x: 2,
            grid_y: 2,
            input_size: 16,
        }
    }

    #[test]
    fn test_dimension_and_id() {
        let p = LbphParams::default();
        assert_eq!(p.dimension(), 8 * 8 * 256);
        assert_eq!(p.id(), "lbph:r1:g8x8:s200");
    }

    #[test]
    fn test_validate() {
        assert!(LbphParams::default().validate().is_ok());
        assert!(LbphParams { input_size: 8, ..LbphParams::default() }.validate().is_err());
        assert!(LbphParams { radius: 0, ..LbphParams::default() }.validate().is_err());
    }

    #[test]
    fn test_uniform_image_sets_every_bit() {
        let gray = GrayImage::from_pixel(16, 16, Luma([90]));
        let (codes, w, h) = lbp_codes(&gray, 1);
        assert_eq!((w, h), (14, 14));
        assert!(codes.iter().all(|&c| c == 255));
    }

    #[test]
    fn test_bright_center_clears_every_bit() {
        let mut gray = GrayImage::from_pixel(3, 3, Luma([10]));
        gray.put_pixel(1, 1, Luma([200]));
        let (codes, _, _) = lbp_codes(&gray, 1);
        assert_eq!(codes, vec![0]);
    }

    #[test]
    fn test_histogram_cells_are_normalized() {
        let gray = GrayImage::from_fn(16, 16, |x, y| Luma([((x * 13 + y * 7) % 256) as u8]));
        let params = small();
        let hist = spatial_histogram(&gray, &params);
        assert_eq!(hist.len(), params.dimension());
        for cell in hist.chunks(256) {
            assert!((cell.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_histogram_deterministic() {
        let gray = GrayImage::from_fn(16, 16, |x, y| Luma([(x * y % 256) as u8]));
        assert_eq!(
            spatial_histogram(&gray, &small()),
            spatial_histogram(&gray, &small())
        );
    }
}
