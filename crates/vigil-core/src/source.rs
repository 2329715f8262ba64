//! Frame capture capability.

use image::DynamicImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("capture device unavailable: {0}")]
    Unavailable(String),
    #[error("capture failed: {0}")]
    Failed(String),
}

/// A device that yields one frame per call.
///
/// The device is released when the source is dropped.
pub trait FrameSource {
    fn capture(&mut self) -> Result<DynamicImage, CaptureError>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn capture(&mut self) -> Result<DynamicImage, CaptureError> {
        (**self).capture()
    }
}
