//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, PixelFormat};
use facegate_core::{CaptureError, Frame, FrameSource};
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const DARK_FRAME_THRESHOLD: f32 = 0.95;
const STREAM_BUFFERS: u32 = 4;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
}

/// V4L2 camera device handle.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
    /// Flip frames left-to-right, as a preview mirror would.
    mirror: bool,
}

impl Camera {
    /// Open a V4L2 device and negotiate a grayscale-convertible format near
    /// the requested resolution.
    pub fn open(
        device_path: &str,
        width: u32,
        height: u32,
        mirror: bool,
    ) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::DeviceNotFound(format!("{device_path}: query caps: {e}")))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        let mut fmt = device
            .format()
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("get format: {e}")))?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = width;
        fmt.height = height;

        let negotiated = device
            .set_format(&fmt)
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("set format: {e}")))?;

        let fourcc = negotiated.fourcc;
        let pixel_format = if fourcc == FourCC::new(b"YUYV") {
            PixelFormat::Yuyv
        } else if fourcc == FourCC::new(b"GREY") {
            PixelFormat::Grey
        } else if fourcc == FourCC::new(b"Y16 ") {
            PixelFormat::Y16
        } else {
            return Err(CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format {fourcc:?} (need YUYV, GREY or Y16)"
            )));
        };

        tracing::info!(
            device = device_path,
            card = %caps.card,
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            mirror,
            "camera opened"
        );

        Ok(Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            fourcc,
            pixel_format,
            mirror,
        })
    }

    /// Start streaming. Frames are pulled from the returned source until it
    /// is dropped.
    pub fn stream(&self) -> Result<CameraStream<'_>, CaptureError> {
        let stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| {
                CaptureError::DeviceUnavailable(format!("{}: mmap stream: {e}", self.device_path))
            })?;
        Ok(CameraStream { camera: self, stream })
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..16)
            .filter_map(|i| {
                let path = format!("/dev/video{i}");
                if !Path::new(&path).exists() {
                    return None;
                }
                let caps = Device::with_path(&path).ok()?.query_caps().ok()?;
                if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                    return None;
                }
                Some(DeviceInfo {
                    path,
                    name: caps.card,
                    driver: caps.driver,
                })
            })
            .collect()
    }
}

/// Live stream over an open camera.
pub struct CameraStream<'a> {
    camera: &'a Camera,
    stream: MmapStream<'a>,
}

impl FrameSource for CameraStream<'_> {
    /// Dequeue failures, short buffers and dark frames are hiccups, not errors.
    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        let cam = self.camera;
        let (buf, meta) = match self.stream.next() {
            Ok(next) => next,
            Err(e) => {
                tracing::warn!(error = %e, "failed to dequeue buffer");
                return Ok(None);
            }
        };

        let mut gray = match frame::to_grayscale(buf, cam.pixel_format, cam.width, cam.height) {
            Ok(gray) => gray,
            Err(e) => {
                tracing::warn!(error = %e, seq = meta.sequence, "unusable buffer");
                return Ok(None);
            }
        };

        if frame::is_dark_frame(&gray, DARK_FRAME_THRESHOLD) {
            tracing::debug!(seq = meta.sequence, "skipping dark frame");
            return Ok(None);
        }
        if cam.mirror {
            frame::mirror_horizontal(&mut gray, cam.width);
        }

        Ok(Some(Frame {
            data: gray,
            width: cam.width,
            height: cam.height,
            sequence: meta.sequence,
        }))
    }
}
