//! V4L2 camera as a presence-session frame source.

use image::{DynamicImage, GrayImage};
use vigil_core::{CaptureError, FrameSource};
use vigil_hw::{Camera, CameraError, CameraSettings, Frame};

pub struct CameraSource {
    camera: Camera,
}

impl CameraSource {
    pub fn open(settings: &CameraSettings) -> Result<Self, CaptureError> {
        let camera = Camera::open(settings).map_err(|e| match e {
            CameraError::DeviceNotFound(_) | CameraError::DeviceBusy(_) => {
                CaptureError::Unavailable(e.to_string())
            }
            other => CaptureError::Unavailable(format!("{}: {other}", settings.device_path)),
        })?;
        Ok(Self { camera })
    }
}

impl FrameSource for CameraSource {
    fn capture(&mut self) -> Result<DynamicImage, CaptureError> {
        let frame = self
            .camera
            .capture_frame()
            .map_err(|e| CaptureError::Failed(e.to_string()))?;
        if frame.is_dark {
            return Err(CaptureError::Failed(format!(
                "dark frame (seq {}, avg brightness {:.1})",
                frame.sequence,
                frame.avg_brightness()
            )));
        }
        frame_to_image(frame)
    }
}

/// Wrap a grayscale frame without copying its buffer.
pub fn frame_to_image(frame: Frame) -> Result<DynamicImage, CaptureError> {
    let (width, height, len) = (frame.width, frame.height, frame.data.len());
    GrayImage::from_raw(width, height, frame.data)
        .map(DynamicImage::ImageLuma8)
        .ok_or_else(|| {
            CaptureError::Failed(format!("frame buffer of {len} bytes does not fit {width}x{height}"))
        })
}
