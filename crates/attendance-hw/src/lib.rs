//! attendance-hw: hardware access for the check-in client.
//!
//! V4L2 camera capture producing RGB frames, and position fixes from gpsd.

pub mod camera;
pub mod frame;
pub mod gpsd;

pub use camera::{Camera, CameraError, FrameStream, PixelFormat};
pub use gpsd::GpsdSource;
