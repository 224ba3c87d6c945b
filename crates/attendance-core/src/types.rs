use serde::{Deserialize, Serialize};

/// A latitude/longitude pair in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

/// Bounding box for a detected face.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

/// A single RGB8 video frame.
#[derive(Clone)]
pub struct Frame {
    /// Packed RGB pixel data (width * height * 3 bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
}

impl Frame {
    /// Whether the buffer actually holds a full frame.
    pub fn is_ready(&self) -> bool {
        self.width > 0
            && self.height > 0
            && self.data.len() >= (self.width as usize) * (self.height as usize) * 3
    }

    /// Average pixel brightness (0.0–255.0) across all channels.
    pub fn avg_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|&b| b as f32).sum::<f32>() / self.data.len() as f32
    }
}

/// An encoded still image, ready for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBlob {
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
    /// Suggested filename for the multipart part.
    pub filename: String,
}

impl ImageBlob {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(width: u32, height: u32, len: usize) -> Frame {
        Frame {
            data: vec![10; len],
            width,
            height,
            timestamp: std::time::Instant::now(),
            sequence: 0,
        }
    }

    #[test]
    fn test_frame_ready_requires_full_buffer() {
        assert!(frame(2, 2, 12).is_ready());
        assert!(!frame(2, 2, 11).is_ready());
        assert!(!frame(0, 2, 12).is_ready());
    }

    #[test]
    fn test_frame_brightness() {
        assert!((frame(2, 2, 12).avg_brightness() - 10.0).abs() < 1e-6);
        assert_eq!(frame(0, 0, 0).avg_brightness(), 0.0);
    }
}
