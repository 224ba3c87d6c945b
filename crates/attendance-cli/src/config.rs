use attendance_core::detector::SCRFD_MODEL_FILE;
use attendance_core::{Geofence, Location};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_OFFICE: Location = Location::new(13.821285112356703, 100.03890459620975);
pub const DEFAULT_RADIUS_M: f64 = 200.0;

/// Client configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the attendance service.
    pub server_url: String,
    /// Centre of the geofence.
    pub office: Location,
    /// Geofence radius in metres.
    pub radius_m: f64,
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// gpsd host:port.
    pub gpsd_addr: String,
    /// Timeout in seconds for one location fix.
    pub location_timeout_secs: u64,
    /// How long an attempt waits for the armed snapshot.
    pub capture_wait_ms: u64,
    /// Number of warmup frames to discard after the stream starts.
    pub warmup_frames: usize,
}

impl Config {
    /// Load configuration from `ATTENDANCE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let model_dir = std::env::var("ATTENDANCE_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| attendance_core::default_model_dir());

        Self {
            server_url: std::env::var("ATTENDANCE_SERVER_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:3000".to_string()),
            office: Location::new(
                env_f64("ATTENDANCE_OFFICE_LAT", DEFAULT_OFFICE.latitude),
                env_f64("ATTENDANCE_OFFICE_LNG", DEFAULT_OFFICE.longitude),
            ),
            radius_m: env_f64("ATTENDANCE_ALLOWED_RADIUS_M", DEFAULT_RADIUS_M),
            camera_device: std::env::var("ATTENDANCE_CAMERA_DEVICE")
                .unwrap_or_else(|_| "/dev/video0".to_string()),
            model_dir,
            gpsd_addr: std::env::var("ATTENDANCE_GPSD_ADDR")
                .unwrap_or_else(|_| attendance_hw::gpsd::DEFAULT_GPSD_ADDR.to_string()),
            location_timeout_secs: env_u64("ATTENDANCE_LOCATION_TIMEOUT_SECS", 10),
            capture_wait_ms: env_u64("ATTENDANCE_CAPTURE_WAIT_MS", 1500),
            warmup_frames: env_usize("ATTENDANCE_WARMUP_FRAMES", 4),
        }
    }

    pub fn geofence(&self) -> Geofence {
        Geofence::new(self.office, self.radius_m)
    }

    pub fn location_timeout(&self) -> Duration {
        Duration::from_secs(self.location_timeout_secs)
    }

    pub fn capture_wait(&self) -> Duration {
        Duration::from_millis(self.capture_wait_ms)
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join(SCRFD_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
