//! V4L2 capture through the `v4l` crate.

use crate::frame::{self, GrayFrame};
use std::path::Path;
use std::time::Instant;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::capability::Flags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const STREAM_BUFFERS: u32 = 4;
const MAX_DEVICE_INDEX: u32 = 16;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("no such device: {0}")]
    DeviceNotFound(String),
    #[error("{0} is busy")]
    DeviceBusy(String),
    #[error("{0} is not a video capture device")]
    CaptureNotSupported(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error(transparent)]
    Frame(#[from] frame::FrameError),
}

/// A V4L2 node that supports video capture.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Pixel layouts the camera can convert to 8-bit luma.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Yuyv,
    Grey,
    Y16,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"GREY" => Some(PixelFormat::Grey),
            b"Y16 " | b"Y16\0" => Some(PixelFormat::Y16),
            _ => None,
        }
    }

    fn to_luma(self, buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, frame::FrameError> {
        match self {
            PixelFormat::Yuyv => frame::yuyv_to_grayscale(buf, width, height),
            PixelFormat::Grey => frame::grey_to_grayscale(buf, width, height),
            PixelFormat::Y16 => frame::y16_to_grayscale(buf, width, height),
        }
    }
}

/// Streaming camera handle.
///
/// The mmap stream starts lazily on the first [`next_frame`](Self::next_frame)
/// and stops on [`release`](Self::release) or drop.
pub struct Camera {
    stream: Option<MmapStream<'static>>,
    device: Device,
    pub device_path: String,
    pub width: u32,
    pub height: u32,
    pub fourcc: FourCC,
    format: PixelFormat,
}

impl Camera {
    /// Open `device_path` and ask for `width`×`height`.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }
        let device = Device::with_path(device_path).map_err(|e| {
            let msg = e.to_string();
            if msg.contains("busy") || msg.contains("EBUSY") {
                CameraError::DeviceBusy(device_path.to_string())
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {msg}"))
            }
        })?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::CaptureFailed(format!("querying capabilities: {e}")))?;
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            return Err(CameraError::CaptureNotSupported(device_path.to_string()));
        }

        let (negotiated, format) = negotiate(&device, width, height)?;
        tracing::info!(
            device = device_path,
            card = %caps.card,
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?negotiated.fourcc,
            "camera opened"
        );

        Ok(Self {
            stream: None,
            device,
            device_path: device_path.to_string(),
            width: negotiated.width,
            height: negotiated.height,
            fourcc: negotiated.fourcc,
            format,
        })
    }

    /// Block until the driver hands over the next frame.
    pub fn next_frame(&mut self) -> Result<GrayFrame, CameraError> {
        let stream = match &mut self.stream {
            Some(stream) => stream,
            slot => {
                let stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
                    .map_err(|e| CameraError::CaptureFailed(format!("starting stream: {e}")))?;
                tracing::debug!(device = %self.device_path, "stream started");
                slot.insert(stream)
            }
        };

        let (buf, meta) = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("dequeuing buffer: {e}")))?;
        let data = self.format.to_luma(buf, self.width, self.height)?;

        Ok(GrayFrame {
            data,
            width: self.width,
            height: self.height,
            sequence: meta.sequence,
            timestamp: Instant::now(),
        })
    }

    /// Stop streaming and unmap the buffers. The device stays open.
    pub fn release(&mut self) {
        if self.stream.take().is_some() {
            tracing::info!(device = %self.device_path, "camera released");
        }
    }

    /// Capture-capable nodes among `/dev/video0` .. `/dev/video15`.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..MAX_DEVICE_INDEX)
            .map(|i| format!("/dev/video{i}"))
            .filter(|path| Path::new(path).exists())
            .filter_map(|path| {
                let caps = Device::with_path(&path).ok()?.query_caps().ok()?;
                caps.capabilities.contains(Flags::VIDEO_CAPTURE).then(|| DeviceInfo {
                    path,
                    name: caps.card,
                    driver: caps.driver,
                    bus: caps.bus,
                })
            })
            .collect()
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        self.release();
    }
}

/// Request YUYV at the given size; keep whatever supported layout the driver
/// settles on.
fn negotiate(device: &Device, width: u32, height: u32) -> Result<(v4l::Format, PixelFormat), CameraError> {
    let mut requested = device
        .format()
        .map_err(|e| CameraError::FormatNegotiationFailed(format!("reading format: {e}")))?;
    requested.fourcc = FourCC::new(b"YUYV");
    requested.width = width;
    requested.height = height;

    let negotiated = device
        .set_format(&requested)
        .map_err(|e| CameraError::FormatNegotiationFailed(format!("setting format: {e}")))?;
    let format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
        CameraError::FormatNegotiationFailed(format!(
            "driver chose {:?}, which is not YUYV, GREY or Y16",
            negotiated.fourcc
        ))
    })?;
    Ok((negotiated, format))
}
