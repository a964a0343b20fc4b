//! Frame sources: V4L2 cameras and still images on disk.

use anyhow::{Context, Result};
use image::{DynamicImage, GrayImage};
use likeness_core::realtime::{CaptureError, FrameSource};
use likeness_core::training::IMAGE_EXTENSIONS;
use likeness_core::Frame;
use likeness_hw::{Camera, CameraError};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

pub struct CameraSource {
    camera: Camera,
}

impl CameraSource {
    pub fn open(device: &str, width: u32, height: u32) -> Result<Self> {
        let camera = Camera::open(device, width, height)
            .with_context(|| format!("opening camera {device}"))?;
        Ok(Self { camera })
    }
}

impl FrameSource for CameraSource {
    fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        let raw = self.camera.next_frame().map_err(capture_error)?;
        let sequence = u64::from(raw.sequence);
        let gray = GrayImage::from_raw(raw.width, raw.height, raw.data).ok_or_else(|| {
            CaptureError::BadFrame(format!("frame {sequence} does not match {}x{}", raw.width, raw.height))
        })?;
        Ok(Frame {
            image: DynamicImage::ImageLuma8(gray),
            sequence,
            timestamp: raw.timestamp,
        })
    }

    fn release(&mut self) {
        self.camera.release();
    }
}

/// A buffer the converter rejects costs one frame; anything else is the device.
fn capture_error(e: CameraError) -> CaptureError {
    match e {
        CameraError::Frame(_) => CaptureError::BadFrame(e.to_string()),
        other => CaptureError::Device(other.to_string()),
    }
}

/// Replays image files as frames, in order. Unreadable files are skipped.
pub struct ImageSource {
    paths: VecDeque<PathBuf>,
    sequence: u64,
}

impl ImageSource {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self {
            paths: paths.into(),
            sequence: 0,
        }
    }

    /// Every image file directly inside `dir`, sorted by name.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
            let path = entry?.path();
            if path.is_file() && has_image_extension(&path) {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(Self::new(paths))
    }
}

impl FrameSource for ImageSource {
    fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        while let Some(path) = self.paths.pop_front() {
            match image::open(&path) {
                Ok(image) => {
                    self.sequence += 1;
                    tracing::debug!(path = %path.display(), seq = self.sequence, "frame loaded");
                    return Ok(Frame::new(image, self.sequence));
                }
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable frame"),
            }
        }
        Err(CaptureError::EndOfStream)
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

/// Open `video_source`: a camera index, a `/dev/...` path, an image file or
/// a directory of images.
pub fn open_source(video_source: &str, width: u32, height: u32) -> Result<Box<dyn FrameSource>> {
    if let Ok(index) = video_source.parse::<u32>() {
        let device = format!("/dev/video{index}");
        return Ok(Box::new(CameraSource::open(&device, width, height)?));
    }
    if video_source.starts_with("/dev/") {
        return Ok(Box::new(CameraSource::open(video_source, width, height)?));
    }

    let path = Path::new(video_source);
    if path.is_dir() {
        Ok(Box::new(ImageSource::from_dir(path)?))
    } else if path.is_file() {
        Ok(Box::new(ImageSource::new(vec![path.to_path_buf()])))
    } else {
        anyhow::bail!("video source {video_source} is not a camera, image or directory")
    }
}
