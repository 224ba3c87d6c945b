//! Check-in state machine.
//!
//! One attempt walks `Idle → AwaitingLocation → AwaitingCapture → Submitting`
//! and ends in `Succeeded`, `LocationRejected` or `Failed`. A new attempt is
//! rejected while another is in flight. Every exit path, including the
//! attempt future being dropped, clears the armed capture.

use crate::api::{AttendanceApi, CheckInSubmission, RecordRef, SubmitError};
use crate::geo::Geofence;
use crate::location::{GeolocationProbe, LocationError, PositionSource};
use crate::presence::PresenceHandle;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

pub const DEFAULT_CAPTURE_WAIT: Duration = Duration::from_millis(1500);

#[derive(Debug, Clone, PartialEq)]
pub enum CheckInState {
    Idle,
    AwaitingLocation,
    AwaitingCapture,
    Submitting,
    Succeeded {
        record_id: i64,
        created_at: DateTime<Utc>,
    },
    LocationRejected {
        reason: String,
    },
    Failed {
        reason: String,
    },
}

impl CheckInState {
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            Self::AwaitingLocation | Self::AwaitingCapture | Self::Submitting
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded { .. } | Self::LocationRejected { .. } | Self::Failed { .. }
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CheckInError {
    #[error("a check-in attempt is already in progress")]
    AttemptInProgress,
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("no face detected")]
    PresenceRejected,
    #[error("outside the allowed area: {distance_m} m from the office (limit {radius_m} m)")]
    OutOfRange { distance_m: u64, radius_m: f64 },
    #[error("{0}")]
    LocationTimeout(LocationError),
    #[error("no image captured")]
    CaptureMissing,
    #[error("upload failed: {0}")]
    SubmitNetwork(String),
    #[error("server rejected check-in ({status}): {message}")]
    SubmitServer { status: u16, message: String },
}

impl CheckInError {
    /// Stable code for logs and machine-readable output.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AttemptInProgress => "ATTEMPT_IN_PROGRESS",
            Self::DeviceUnavailable(_) => "DEVICE_UNAVAILABLE",
            Self::PresenceRejected => "PRESENCE_REJECTED",
            Self::OutOfRange { .. } => "LOCATION_OUT_OF_RANGE",
            Self::LocationTimeout(_) => "LOCATION_TIMEOUT",
            Self::CaptureMissing => "CAPTURE_MISSING",
            Self::SubmitNetwork(_) => "SUBMIT_NETWORK_ERROR",
            Self::SubmitServer { .. } => "SUBMIT_SERVER_ERROR",
        }
    }
}

impl From<LocationError> for CheckInError {
    fn from(err: LocationError) -> Self {
        match err {
            LocationError::Timeout(_) => Self::LocationTimeout(err),
            LocationError::PermissionDenied(_) | LocationError::Unavailable(_) => {
                Self::DeviceUnavailable(err.to_string())
            }
        }
    }
}

impl From<SubmitError> for CheckInError {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::Network(msg) => Self::SubmitNetwork(msg),
            SubmitError::Server { status, message } => Self::SubmitServer { status, message },
        }
    }
}

/// Result of a successful check-in.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckInReceipt {
    pub record: RecordRef,
    pub distance_m: f64,
}

/// Coordinates presence, geolocation, capture and submission for one
/// attempt at a time.
pub struct CheckInCoordinator<S, A> {
    presence: PresenceHandle,
    probe: GeolocationProbe<S>,
    api: A,
    geofence: Geofence,
    capture_wait: Duration,
    state: watch::Sender<CheckInState>,
}

enum Gate {
    Busy,
    Device(String),
    NoFace,
    Open,
}

impl<S: PositionSource, A: AttendanceApi> CheckInCoordinator<S, A> {
    pub fn new(
        presence: PresenceHandle,
        probe: GeolocationProbe<S>,
        api: A,
        geofence: Geofence,
        capture_wait: Duration,
    ) -> Self {
        let (state, _) = watch::channel(CheckInState::Idle);
        Self {
            presence,
            probe,
            api,
            geofence,
            capture_wait,
            state,
        }
    }

    pub fn state(&self) -> CheckInState {
        self.state.borrow().clone()
    }

    /// Observe every state transition.
    pub fn subscribe(&self) -> watch::Receiver<CheckInState> {
        self.state.subscribe()
    }

    pub fn geofence(&self) -> &Geofence {
        &self.geofence
    }

    /// Run one check-in attempt for `period`.
    pub async fn check_in(&self, period: &str) -> Result<CheckInReceipt, CheckInError> {
        let mut gate = Gate::Busy;
        self.state.send_if_modified(|state| {
            if state.is_in_flight() {
                return false;
            }
            gate = if let Some(reason) = self.presence.device_unavailable() {
                Gate::Device(reason)
            } else if !self.presence.is_present() {
                Gate::NoFace
            } else {
                Gate::Open
            };
            let next = if matches!(gate, Gate::Open) {
                CheckInState::AwaitingLocation
            } else {
                CheckInState::Idle
            };
            let changed = *state != next;
            *state = next;
            changed
        });

        match gate {
            Gate::Busy => {
                tracing::warn!(period, "check-in rejected: attempt in progress");
                return Err(CheckInError::AttemptInProgress);
            }
            Gate::Device(reason) => {
                tracing::warn!(period, reason = %reason, "check-in rejected: device unavailable");
                return Err(CheckInError::DeviceUnavailable(reason));
            }
            Gate::NoFace => {
                tracing::info!(period, "check-in rejected: no face present");
                return Err(CheckInError::PresenceRejected);
            }
            Gate::Open => {}
        }

        let _guard = AttemptGuard {
            presence: &self.presence,
            state: &self.state,
        };

        // Anything still armed belongs to an earlier attempt.
        self.presence.disarm();
        let ticket = self
            .presence
            .arm_capture()
            .ok_or_else(|| self.fail(CheckInError::AttemptInProgress))?;

        tracing::info!(period, "check-in started; awaiting location");

        let location = match self.probe.get_current_location().await {
            Ok(location) => location,
            Err(err) => return Err(self.reject_location(err.into())),
        };

        let verdict = self.geofence.check(location);
        if !verdict.within {
            return Err(self.reject_location(CheckInError::OutOfRange {
                distance_m: verdict.rounded_distance_m(),
                radius_m: self.geofence.radius_m,
            }));
        }

        tracing::info!(
            period,
            distance_m = verdict.distance_m,
            "location accepted; awaiting capture"
        );
        self.state.send_replace(CheckInState::AwaitingCapture);

        let image = match ticket.wait(self.capture_wait).await {
            Some(image) if !image.is_empty() => image,
            _ => return Err(self.fail(CheckInError::CaptureMissing)),
        };

        self.state.send_replace(CheckInState::Submitting);
        let submission = CheckInSubmission {
            period: period.to_string(),
            image,
            location,
        };

        match self.api.submit(submission).await {
            Ok(record) => {
                tracing::info!(
                    period,
                    record_id = record.id,
                    image = %record.image,
                    "check-in recorded"
                );
                self.state.send_replace(CheckInState::Succeeded {
                    record_id: record.id,
                    created_at: record.created_at,
                });
                Ok(CheckInReceipt {
                    record,
                    distance_m: verdict.distance_m,
                })
            }
            Err(err) => Err(self.fail(err.into())),
        }
    }

    fn reject_location(&self, err: CheckInError) -> CheckInError {
        tracing::info!(code = err.code(), error = %err, "location rejected");
        self.presence.disarm();
        self.state.send_replace(CheckInState::LocationRejected {
            reason: err.to_string(),
        });
        err
    }

    fn fail(&self, err: CheckInError) -> CheckInError {
        tracing::warn!(code = err.code(), error = %err, "check-in failed");
        self.presence.disarm();
        self.state.send_replace(CheckInState::Failed {
            reason: err.to_string(),
        });
        err
    }
}

/// Clears the armed capture and any in-flight state when an attempt ends,
/// including when its future is dropped mid-flight.
struct AttemptGuard<'a> {
    presence: &'a PresenceHandle,
    state: &'a watch::Sender<CheckInState>,
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        self.presence.disarm();
        self.state.send_if_modified(|state| {
            if state.is_in_flight() {
                *state = CheckInState::Failed {
                    reason: "attempt cancelled".into(),
                };
                true
            } else {
                false
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::EARTH_RADIUS_M;
    use crate::location::LocationError;
    use crate::presence::PresenceMonitor;
    use crate::types::{BoundingBox, Frame, Location};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    const OFFICE: Location = Location::new(13.821285, 100.038904);

    fn north_of(meters: f64) -> Location {
        let dlat = (meters / EARTH_RADIUS_M).to_degrees();
        Location::new(OFFICE.latitude + dlat, OFFICE.longitude)
    }

    #[derive(Clone)]
    struct FakeSource {
        result: Result<Location, LocationError>,
        delay: Duration,
        calls: Arc<AtomicUsize>,
    }

    impl FakeSource {
        fn at(location: Location) -> Self {
            Self {
                result: Ok(location),
                delay: Duration::ZERO,
                calls: Arc::default(),
            }
        }

        fn delayed(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl PositionSource for FakeSource {
        async fn current_position(&self) -> Result<Location, LocationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.result.clone()
        }
    }

    #[derive(Clone, Default)]
    struct FakeApi {
        submissions: Arc<Mutex<Vec<CheckInSubmission>>>,
        fail_with: Option<SubmitError>,
    }

    #[async_trait]
    impl AttendanceApi for FakeApi {
        async fn submit(&self, submission: CheckInSubmission) -> Result<RecordRef, SubmitError> {
            let mut submissions = self.submissions.lock().unwrap();
            if let Some(err) = &self.fail_with {
                return Err(err.clone());
            }
            let period = submission.period.clone();
            submissions.push(submission);
            Ok(RecordRef {
                id: submissions.len() as i64,
                image: format!("img-{}.png", submissions.len()),
                period,
                created_at: Utc::now(),
            })
        }
    }

    fn frame(seq: u32) -> Frame {
        Frame {
            data: vec![120; 8 * 8 * 3],
            width: 8,
            height: 8,
            timestamp: std::time::Instant::now(),
            sequence: seq,
        }
    }

    fn face() -> BoundingBox {
        BoundingBox {
            x: 1.0,
            y: 1.0,
            width: 4.0,
            height: 4.0,
            confidence: 0.8,
        }
    }

    type TestCoordinator = CheckInCoordinator<FakeSource, FakeApi>;

    fn coordinator(
        source: FakeSource,
        api: FakeApi,
    ) -> (Arc<TestCoordinator>, PresenceMonitor) {
        let monitor = PresenceMonitor::new(PresenceHandle::new());
        let coordinator = CheckInCoordinator::new(
            monitor.handle().clone(),
            GeolocationProbe::new(source, Duration::from_secs(10)),
            api,
            Geofence::new(OFFICE, 200.0),
            DEFAULT_CAPTURE_WAIT,
        );
        (Arc::new(coordinator), monitor)
    }

    /// Run an attempt while a fake detection loop feeds face frames at ~30 fps.
    async fn run_with_faces(
        coordinator: &Arc<TestCoordinator>,
        monitor: &mut PresenceMonitor,
        period: &str,
    ) -> Result<CheckInReceipt, CheckInError> {
        monitor.on_frame_processed(&frame(0), &[face()]);
        let task = tokio::spawn({
            let coordinator = coordinator.clone();
            let period = period.to_string();
            async move { coordinator.check_in(&period).await }
        });
        let mut seq = 1;
        while !task.is_finished() {
            monitor.on_frame_processed(&frame(seq), &[face()]);
            seq += 1;
            tokio::time::sleep(Duration::from_millis(33)).await;
        }
        task.await.unwrap()
    }

    #[tokio::test]
    async fn test_no_face_rejects_without_side_effects() {
        let source = FakeSource::at(OFFICE);
        let api = FakeApi::default();
        let (coordinator, _monitor) = coordinator(source.clone(), api.clone());

        let err = coordinator.check_in("เช้า").await.unwrap_err();

        assert_eq!(err, CheckInError::PresenceRejected);
        assert_eq!(err.code(), "PRESENCE_REJECTED");
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
        assert!(api.submissions.lock().unwrap().is_empty());
        assert!(!coordinator.presence.is_armed());
        assert_eq!(coordinator.state(), CheckInState::Idle);
    }

    #[tokio::test]
    async fn test_device_unavailable_rejects() {
        let source = FakeSource::at(OFFICE);
        let (coordinator, monitor) = coordinator(source.clone(), FakeApi::default());
        monitor.handle().set_device_unavailable("/dev/video0: not found");

        let err = coordinator.check_in("เช้า").await.unwrap_err();
        assert!(matches!(err, CheckInError::DeviceUnavailable(_)));
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_check_in() {
        let api = FakeApi::default();
        let (coordinator, mut monitor) = coordinator(FakeSource::at(OFFICE), api.clone());

        let receipt = run_with_faces(&coordinator, &mut monitor, "เช้า")
            .await
            .unwrap();

        assert_eq!(receipt.record.id, 1);
        assert_eq!(receipt.record.period, "เช้า");
        assert_eq!(receipt.distance_m, 0.0);
        assert!(matches!(
            coordinator.state(),
            CheckInState::Succeeded { record_id: 1, .. }
        ));

        let submissions = api.submissions.lock().unwrap();
        assert_eq!(submissions.len(), 1);
        assert!(!submissions[0].image.is_empty());
        assert_eq!(submissions[0].location, OFFICE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_before_location_is_kept() {
        let api = FakeApi::default();
        let source = FakeSource::at(OFFICE).delayed(Duration::from_secs(3));
        let (coordinator, mut monitor) = coordinator(source, api.clone());
        monitor.on_frame_processed(&frame(0), &[face()]);

        let task = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.check_in("บ่าย").await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(coordinator.state(), CheckInState::AwaitingLocation);

        // The only face frame arrives long before the location does.
        monitor.on_frame_processed(&frame(1), &[face()]);
        assert!(!coordinator.presence.is_armed());

        let receipt = task.await.unwrap().unwrap();
        assert_eq!(receipt.record.period, "บ่าย");
        assert_eq!(api.submissions.lock().unwrap()[0].image.filename, "snapshot-1.png");
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_range_rejected_with_distance() {
        let api = FakeApi::default();
        let (coordinator, mut monitor) = coordinator(FakeSource::at(north_of(300.0)), api.clone());

        let err = run_with_faces(&coordinator, &mut monitor, "เช้า")
            .await
            .unwrap_err();

        match err {
            CheckInError::OutOfRange { distance_m, .. } => {
                assert!((295..=305).contains(&distance_m), "distance {distance_m}")
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            coordinator.state(),
            CheckInState::LocationRejected { .. }
        ));
        assert!(api.submissions.lock().unwrap().is_empty());
        assert!(!coordinator.presence.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_boundary_point_accepted() {
        let (coordinator, mut monitor) =
            coordinator(FakeSource::at(north_of(200.0)), FakeApi::default());
        assert!(run_with_faces(&coordinator, &mut monitor, "เช้า").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_location_failure_maps_to_device_unavailable() {
        let source = FakeSource {
            result: Err(LocationError::PermissionDenied("denied".into())),
            delay: Duration::ZERO,
            calls: Arc::default(),
        };
        let (coordinator, mut monitor) = coordinator(source, FakeApi::default());
        monitor.on_frame_processed(&frame(0), &[face()]);

        let err = coordinator.check_in("เช้า").await.unwrap_err();
        assert_eq!(err.code(), "DEVICE_UNAVAILABLE");
        assert!(matches!(
            coordinator.state(),
            CheckInState::LocationRejected { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_location_timeout() {
        let source = FakeSource::at(OFFICE).delayed(Duration::from_secs(60));
        let (coordinator, mut monitor) = coordinator(source, FakeApi::default());
        monitor.on_frame_processed(&frame(0), &[face()]);

        let err = coordinator.check_in("เช้า").await.unwrap_err();
        assert_eq!(err.code(), "LOCATION_TIMEOUT");
        assert!(!coordinator.presence.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_missing_when_no_face_frame_follows() {
        let api = FakeApi::default();
        let (coordinator, mut monitor) = coordinator(FakeSource::at(OFFICE), api.clone());
        monitor.on_frame_processed(&frame(0), &[face()]);

        let err = coordinator.check_in("เช้า").await.unwrap_err();

        assert_eq!(err, CheckInError::CaptureMissing);
        assert!(matches!(coordinator.state(), CheckInState::Failed { .. }));
        assert!(!coordinator.presence.is_armed());
        assert!(api.submissions.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_attempt_rejected() {
        let source = FakeSource::at(OFFICE).delayed(Duration::from_secs(2));
        let (coordinator, mut monitor) = coordinator(source.clone(), FakeApi::default());
        monitor.on_frame_processed(&frame(0), &[face()]);

        let first = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.check_in("เช้า").await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = coordinator.check_in("เช้า").await.unwrap_err();
        assert_eq!(err, CheckInError::AttemptInProgress);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        monitor.on_frame_processed(&frame(1), &[face()]);
        assert!(first.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_attempt_does_not_leak_armed_capture() {
        let api = FakeApi::default();
        let (coordinator, mut monitor) = coordinator(FakeSource::at(OFFICE), api.clone());
        monitor.on_frame_processed(&frame(0), &[face()]);

        // First attempt fails partway: the capture never arrives.
        assert!(coordinator.check_in("เช้า").await.is_err());
        assert!(!coordinator.presence.is_armed());

        // A later face frame must not be attributed to the failed attempt.
        monitor.on_frame_processed(&frame(1), &[face()]);

        let receipt = run_with_faces(&coordinator, &mut monitor, "บ่าย")
            .await
            .unwrap();
        assert_eq!(receipt.record.period, "บ่าย");
        let submissions = api.submissions.lock().unwrap();
        assert_eq!(submissions.len(), 1);
        assert_ne!(submissions[0].image.filename, "snapshot-1.png");
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_error_surfaces_status() {
        let api = FakeApi {
            fail_with: Some(SubmitError::Server {
                status: 503,
                message: "database unavailable".into(),
            }),
            ..FakeApi::default()
        };
        let (coordinator, mut monitor) = coordinator(FakeSource::at(OFFICE), api);

        let err = run_with_faces(&coordinator, &mut monitor, "เช้า")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SUBMIT_SERVER_ERROR");
        assert!(err.to_string().contains("503"));
        assert!(matches!(coordinator.state(), CheckInState::Failed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_attempt_resets_state() {
        let source = FakeSource::at(OFFICE).delayed(Duration::from_secs(5));
        let (coordinator, mut monitor) = coordinator(source, FakeApi::default());
        monitor.on_frame_processed(&frame(0), &[face()]);

        let _ = tokio::time::timeout(Duration::from_millis(100), coordinator.check_in("เช้า")).await;

        assert!(!coordinator.state().is_in_flight());
        assert!(!coordinator.presence.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transitions_are_published() {
        let (coordinator, mut monitor) =
            coordinator(FakeSource::at(OFFICE), FakeApi::default());
        let mut rx = coordinator.subscribe();
        let seen = tokio::spawn(async move {
            let mut states = Vec::new();
            while rx.changed().await.is_ok() {
                let state = rx.borrow_and_update().clone();
                let done = state.is_terminal();
                states.push(state);
                if done {
                    break;
                }
            }
            states
        });

        run_with_faces(&coordinator, &mut monitor, "เช้า").await.unwrap();
        let states = seen.await.unwrap();
        let (last, rest) = states.split_last().unwrap();
        assert!(matches!(last, CheckInState::Succeeded { .. }));
        assert!(rest.iter().all(CheckInState::is_in_flight));
    }
}
