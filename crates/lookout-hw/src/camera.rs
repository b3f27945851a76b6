//! Camera backends: device enumeration and blocking frame streams.
//!
//! [`V4lBackend`] drives real V4L2 devices via the `v4l` crate.

use crate::frame;
use lookout_core::{Frame, PixelFormat};
use serde::Serialize;
use std::io;
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Linux `EBUSY`.
const EBUSY: i32 = 16;

const REQUESTED_WIDTH: u32 = 640;
const REQUESTED_HEIGHT: u32 = 480;
const MMAP_BUFFERS: u32 = 4;
const MAX_VIDEO_NODES: u32 = 64;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CaptureError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("permission denied opening {0}; is the user in the 'video' group?")]
    PermissionDenied(String),
    #[error("device busy: {0}")]
    DeviceBusy(String),
    #[error("device disconnected: {0}")]
    Disconnected(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("streaming not supported by {0}")]
    StreamingNotSupported(String),
    #[error("no camera device available")]
    NoDevice,
}

/// A discovered camera.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    /// Stable identifier passed back to `open` (a device path for V4L2).
    pub id: String,
    /// Human-readable name.
    pub label: String,
    pub driver: String,
    pub bus: String,
}

/// Source of camera devices.
///
/// Calls block; the capture manager runs them off the async runtime.
pub trait CameraBackend: Send + Sync + 'static {
    /// Enumerate capture devices in a stable order.
    fn list_devices(&self) -> Result<Vec<DeviceInfo>, CaptureError>;

    /// Acquire an exclusive stream on `device_id`.
    fn open(&self, device_id: &str) -> Result<Box<dyn CameraStream>, CaptureError>;
}

/// An open device producing frames. Dropping it releases the device.
pub trait CameraStream {
    fn device_id(&self) -> &str;

    /// Block until the next frame is available.
    fn next_frame(&mut self) -> Result<Frame, CaptureError>;
}

/// V4L2 backend scanning `/dev/video*`.
#[derive(Debug, Default, Clone, Copy)]
pub struct V4lBackend;

impl CameraBackend for V4lBackend {
    fn list_devices(&self) -> Result<Vec<DeviceInfo>, CaptureError> {
        let mut devices = Vec::new();

        for i in 0..MAX_VIDEO_NODES {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                id: path,
                label: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        Ok(devices)
    }

    fn open(&self, device_id: &str) -> Result<Box<dyn CameraStream>, CaptureError> {
        Ok(Box::new(V4lCamera::open(device_id)?))
    }
}

/// Pixel layouts this backend can turn into a [`Frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RawFormat {
    /// YUYV 4:2:2 packed, converted to RGB.
    Yuyv,
    /// 8-bit grayscale, passed through.
    Grey,
    /// Packed RGB24, passed through.
    Rgb3,
}

impl RawFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        if fourcc == FourCC::new(b"YUYV") {
            Some(RawFormat::Yuyv)
        } else if fourcc == FourCC::new(b"GREY") {
            Some(RawFormat::Grey)
        } else if fourcc == FourCC::new(b"RGB3") {
            Some(RawFormat::Rgb3)
        } else {
            None
        }
    }
}

/// Open V4L2 capture stream.
pub struct V4lCamera {
    // Declared before `device` so buffers are unmapped before the fd closes.
    stream: MmapStream<'static>,
    _device: Device,
    device_path: String,
    width: u32,
    height: u32,
    format: RawFormat,
}

impl V4lCamera {
    /// Open a V4L2 device by path (e.g., "/dev/video0") and start streaming.
    pub fn open(device_path: &str) -> Result<Self, CaptureError> {
        if !Path::new(device_path).exists() {
            return Err(CaptureError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| open_error(device_path, e))?;

        let caps = device.query_caps().map_err(|e| {
            CaptureError::CaptureFailed(format!("{device_path}: failed to query capabilities: {e}"))
        })?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CaptureError::StreamingNotSupported(device_path.to_string()));
        }

        let mut fmt = device.format().map_err(|e| {
            CaptureError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = REQUESTED_WIDTH;
        fmt.height = REQUESTED_HEIGHT;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CaptureError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let format = RawFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
            CaptureError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {:?} (need YUYV, GREY, or RGB3)",
                negotiated.fourcc
            ))
        })?;

        let stream = MmapStream::with_buffers(&device, BufType::VideoCapture, MMAP_BUFFERS)
            .map_err(|e| CaptureError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;

        tracing::info!(
            device = device_path,
            card = %caps.card,
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?negotiated.fourcc,
            "camera opened"
        );

        Ok(Self {
            stream,
            _device: device,
            device_path: device_path.to_string(),
            width: negotiated.width,
            height: negotiated.height,
            format,
        })
    }
}

impl CameraStream for V4lCamera {
    fn device_id(&self) -> &str {
        &self.device_path
    }

    fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        let (buf, meta) = self.stream.next().map_err(|e| {
            CaptureError::Disconnected(format!("{}: failed to dequeue buffer: {e}", self.device_path))
        })?;

        let pixels = self.width as usize * self.height as usize;
        let (data, pixel_format) = match self.format {
            RawFormat::Yuyv => (
                frame::yuyv_to_rgb(buf, self.width, self.height),
                PixelFormat::Rgb8,
            ),
            RawFormat::Grey => (frame::take_exact(buf, pixels), PixelFormat::Gray8),
            RawFormat::Rgb3 => (frame::take_exact(buf, pixels * 3), PixelFormat::Rgb8),
        };
        let data = data.map_err(|e| CaptureError::CaptureFailed(e.to_string()))?;

        Frame::new(data, self.width, self.height, pixel_format, meta.sequence as u64)
            .map_err(|e| CaptureError::CaptureFailed(e.to_string()))
    }
}

fn open_error(device_path: &str, e: io::Error) -> CaptureError {
    match e.kind() {
        io::ErrorKind::NotFound => CaptureError::DeviceNotFound(device_path.to_string()),
        io::ErrorKind::PermissionDenied => CaptureError::PermissionDenied(device_path.to_string()),
        _ if e.raw_os_error() == Some(EBUSY) => CaptureError::DeviceBusy(device_path.to_string()),
        _ => CaptureError::CaptureFailed(format!("{device_path}: {e}")),
    }
}
