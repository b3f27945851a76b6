//! Test-pattern camera backend for running without hardware.

use crate::camera::{CameraBackend, CameraStream, CaptureError, DeviceInfo};
use lookout_core::{Frame, PixelFormat};
use std::time::{Duration, Instant};

/// Backend exposing virtual cameras that render a scrolling gradient.
#[derive(Debug, Clone)]
pub struct SyntheticBackend {
    devices: Vec<String>,
    width: u32,
    height: u32,
    frame_interval: Duration,
}

impl Default for SyntheticBackend {
    fn default() -> Self {
        Self::new(["synthetic0"])
    }
}

impl SyntheticBackend {
    /// Virtual cameras with the given ids, 320x240 at ~30 fps.
    pub fn new<I, S>(devices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            devices: devices.into_iter().map(Into::into).collect(),
            width: 320,
            height: 240,
            frame_interval: Duration::from_millis(33),
        }
    }

    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }
}

impl CameraBackend for SyntheticBackend {
    fn list_devices(&self) -> Result<Vec<DeviceInfo>, CaptureError> {
        Ok(self
            .devices
            .iter()
            .map(|id| DeviceInfo {
                id: id.clone(),
                label: format!("Synthetic camera ({id})"),
                driver: "synthetic".into(),
                bus: "virtual".into(),
            })
            .collect())
    }

    fn open(&self, device_id: &str) -> Result<Box<dyn CameraStream>, CaptureError> {
        if !self.devices.iter().any(|d| d == device_id) {
            return Err(CaptureError::DeviceNotFound(device_id.to_string()));
        }
        Ok(Box::new(SyntheticStream {
            device_id: device_id.to_string(),
            width: self.width,
            height: self.height,
            frame_interval: self.frame_interval,
            sequence: 0,
            next_due: Instant::now(),
        }))
    }
}

struct SyntheticStream {
    device_id: String,
    width: u32,
    height: u32,
    frame_interval: Duration,
    sequence: u64,
    next_due: Instant,
}

impl CameraStream for SyntheticStream {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        let now = Instant::now();
        if self.next_due > now {
            std::thread::sleep(self.next_due - now);
        }
        self.next_due = Instant::now() + self.frame_interval;
        self.sequence += 1;

        let offset = self.sequence as u32;
        let mut data = Vec::with_capacity((self.width * self.height * 3) as usize);
        for y in 0..self.height {
            for x in 0..self.width {
                data.push(((x + offset) % 256) as u8);
                data.push((y % 256) as u8);
                data.push(((x + y) % 256) as u8);
            }
        }

        Frame::new(data, self.width, self.height, PixelFormat::Rgb8, self.sequence)
            .map_err(|e| CaptureError::CaptureFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lists_configured_devices() {
        let backend = SyntheticBackend::new(["a", "b"]);
        let ids: Vec<_> = backend
            .list_devices()
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_frames_have_increasing_sequence() {
        let backend = SyntheticBackend::new(["cam"])
            .with_resolution(8, 4)
            .with_frame_interval(Duration::ZERO);
        let mut stream = backend.open("cam").unwrap();
        let a = stream.next_frame().unwrap();
        let b = stream.next_frame().unwrap();
        assert_eq!((a.width, a.height, a.data.len()), (8, 4, 96));
        assert!(b.sequence > a.sequence);
        assert_eq!(stream.device_id(), "cam");
    }

    #[test]
    fn test_unknown_device() {
        let backend = SyntheticBackend::default();
        assert!(matches!(
            backend.open("nope"),
            Err(CaptureError::DeviceNotFound(_))
        ));
    }
}
