//! Raw grayscale frames and pixel format conversion.

use std::time::Instant;

/// One grayscale frame as delivered by the camera.
#[derive(Debug, Clone)]
pub struct GrayFrame {
    /// Row-major luma, `width * height` bytes.
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Driver sequence number.
    pub sequence: u32,
    pub timestamp: Instant,
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid {format} buffer length: expected {expected}, got {actual}")]
    InvalidLength {
        format: &'static str,
        expected: usize,
        actual: usize,
    },
}

fn check_len(format: &'static str, buf: &[u8], expected: usize) -> Result<(), FrameError> {
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            format,
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// 8-bit GREY: the first `width * height` bytes as-is.
pub fn grey_to_grayscale(buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let pixels = (width * height) as usize;
    check_len("GREY", buf, pixels)?;
    Ok(buf[..pixels].to_vec())
}

/// Packed YUYV 4:2:2 (`[Y0, U, Y1, V]` per pixel pair): keep the Y bytes.
pub fn yuyv_to_grayscale(buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    check_len("YUYV", buf, expected)?;
    Ok(buf[..expected].iter().step_by(2).copied().collect())
}

/// 16-bit little-endian luma, reduced to its high byte.
pub fn y16_to_grayscale(buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    check_len("Y16", buf, expected)?;
    Ok(buf[..expected]
        .chunks_exact(2)
        .map(|px| (u16::from_le_bytes([px[0], px[1]]) >> 8) as u8)
        .collect())
}
