//! attendance-core: the check-in decision pipeline.
//!
//! Face presence gates an attempt, the geofence gates the reported position,
//! and a snapshot armed at the start of the attempt is captured on the next
//! frame that shows a face. [`coordinator::CheckInCoordinator`] ties the
//! three together and hands the result to an [`api::AttendanceApi`].

pub mod api;
pub mod coordinator;
pub mod detector;
pub mod geo;
pub mod location;
pub mod presence;
pub mod snapshot;
pub mod types;

pub use api::{AttendanceApi, AttendanceRecord, CheckInSubmission, RecordRef, SubmitError};
pub use coordinator::{CheckInCoordinator, CheckInError, CheckInReceipt, CheckInState};
pub use detector::{FaceDetector, ScrfdDetector};
pub use geo::{distance_m, Geofence};
pub use location::{GeolocationProbe, LocationError, PositionSource};
pub use presence::{PresenceHandle, PresenceMonitor};
pub use snapshot::SnapshotCapturer;
pub use types::{BoundingBox, Frame, ImageBlob, Location};

/// Default model directory: `$XDG_DATA_HOME/attendance/models`.
pub fn default_model_dir() -> std::path::PathBuf {
    let data_dir = std::env::var("XDG_DATA_HOME")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            std::path::PathBuf::from(home).join(".local/share")
        });
    data_dir.join("attendance").join("models")
}
