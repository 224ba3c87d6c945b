//! Still-image capture: rasterizes a video frame into a PNG blob.

use crate::types::{Frame, ImageBlob};
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder};

pub const PNG_CONTENT_TYPE: &str = "image/png";

/// Encodes frames handed to it by the presence monitor.
#[derive(Debug, Clone, Default)]
pub struct SnapshotCapturer;

impl SnapshotCapturer {
    pub fn new() -> Self {
        Self
    }

    /// Encode `frame` as PNG.
    ///
    /// Returns `None` when the frame is not ready (no dimensions or a short
    /// buffer) or when encoding fails; callers must not upload in that case.
    pub fn capture(&self, frame: &Frame) -> Option<ImageBlob> {
        if !frame.is_ready() {
            tracing::warn!(
                width = frame.width,
                height = frame.height,
                len = frame.data.len(),
                "video source not ready; no snapshot"
            );
            return None;
        }

        let pixels = (frame.width as usize) * (frame.height as usize) * 3;
        let mut bytes = Vec::new();
        let encoder = PngEncoder::new(&mut bytes);
        if let Err(err) = encoder.write_image(
            &frame.data[..pixels],
            frame.width,
            frame.height,
            ExtendedColorType::Rgb8,
        ) {
            tracing::warn!(error = %err, "PNG encoding failed");
            return None;
        }

        tracing::debug!(
            seq = frame.sequence,
            bytes = bytes.len(),
            "snapshot captured"
        );

        Some(ImageBlob {
            bytes,
            content_type: PNG_CONTENT_TYPE,
            filename: format!("snapshot-{}.png", frame.sequence),
        })
    }
}
