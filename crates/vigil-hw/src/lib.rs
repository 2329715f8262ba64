//! vigil-hw — V4L2 camera access and grayscale frame handling.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, CameraSettings, DeviceInfo};
pub use frame::{Frame, PixelFormat};
