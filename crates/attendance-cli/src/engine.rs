//! Presence engine: camera and detector on a dedicated OS thread feeding a
//! [`PresenceMonitor`].

use attendance_core::detector::DetectorError;
use attendance_core::{FaceDetector, Frame, PresenceHandle, PresenceMonitor, ScrfdDetector};
use attendance_hw::frame::is_dark_frame;
use attendance_hw::{Camera, CameraError};
use thiserror::Error;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};

/// Frames with more than this share of near-black pixels skip detection.
const DARK_FRAME_THRESHOLD: f32 = 0.95;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Counters reported when the engine stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub frames: u64,
    pub dark_frames: u64,
    pub face_frames: u64,
}

/// Messages sent to the engine thread.
enum EngineRequest {
    Stop {
        reply: oneshot::Sender<EngineStats>,
    },
}

/// Handle to the running engine thread. Dropping it stops the thread.
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Stop the loop and return its counters.
    pub async fn shutdown(self) -> Result<EngineStats, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Stop { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// Open the camera, load the detector and start the presence loop.
///
/// Fails fast if either resource is unavailable. A camera failure after
/// startup is reported through [`PresenceHandle::set_device_unavailable`]
/// and ends the loop.
pub fn spawn_engine(
    camera_device: &str,
    scrfd_path: &str,
    warmup_frames: usize,
    presence: PresenceHandle,
) -> Result<EngineHandle, EngineError> {
    let camera = Camera::open(camera_device)?;
    tracing::info!(
        device = camera_device,
        width = camera.width,
        height = camera.height,
        fourcc = ?camera.fourcc,
        "camera opened"
    );

    let mut detector = ScrfdDetector::load(scrfd_path)?;
    tracing::info!(path = scrfd_path, "SCRFD detector loaded");

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(1);

    std::thread::Builder::new()
        .name("attendance-presence".into())
        .spawn(move || {
            tracing::info!("presence thread started");
            let mut monitor = PresenceMonitor::new(presence);

            let mut stream = match camera.stream() {
                Ok(stream) => stream,
                Err(err) => {
                    tracing::error!(error = %err, "failed to start streaming");
                    monitor.handle().set_device_unavailable(err.to_string());
                    return;
                }
            };

            if !discard_warmup(|| stream.next_frame(), warmup_frames, &monitor) {
                return;
            }

            let stats = run_presence_loop(
                || stream.next_frame(),
                &mut detector,
                &mut monitor,
                &mut rx,
            );
            tracing::info!(
                frames = stats.frames,
                dark = stats.dark_frames,
                faces = stats.face_frames,
                "presence thread exiting"
            );
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

/// Read and drop the first `count` frames. A camera error ends warmup,
/// marks the device unavailable and returns `false`.
fn discard_warmup<F>(mut next_frame: F, count: usize, monitor: &PresenceMonitor) -> bool
where
    F: FnMut() -> Result<Frame, CameraError>,
{
    if count == 0 {
        return true;
    }
    tracing::info!(count, "discarding warmup frames");
    for n in 0..count {
        if let Err(err) = next_frame() {
            tracing::error!(error = %err, frame = n, "camera failed during warmup");
            monitor.handle().set_device_unavailable(err.to_string());
            return false;
        }
    }
    true
}

/// Pull frames until asked to stop, the handle is dropped, or the camera
/// fails.
fn run_presence_loop<F, D>(
    mut next_frame: F,
    detector: &mut D,
    monitor: &mut PresenceMonitor,
    rx: &mut mpsc::Receiver<EngineRequest>,
) -> EngineStats
where
    F: FnMut() -> Result<Frame, CameraError>,
    D: FaceDetector + ?Sized,
{
    let mut stats = EngineStats::default();

    loop {
        match rx.try_recv() {
            Ok(EngineRequest::Stop { reply }) => {
                let _ = reply.send(stats);
                return stats;
            }
            Err(TryRecvError::Disconnected) => return stats,
            Err(TryRecvError::Empty) => {}
        }

        let frame = match next_frame() {
            Ok(frame) => frame,
            Err(err) => {
                tracing::error!(error = %err, "camera failed; stopping presence loop");
                monitor.handle().set_device_unavailable(err.to_string());
                return stats;
            }
        };
        stats.frames += 1;

        if is_dark_frame(&frame.data, DARK_FRAME_THRESHOLD) {
            stats.dark_frames += 1;
            monitor.on_frame_processed(&frame, &[]);
            continue;
        }

        let faces = match detector.detect(&frame) {
            Ok(faces) => faces,
            Err(err) => {
                tracing::warn!(error = %err, seq = frame.sequence, "detection failed");
                Vec::new()
            }
        };
        if !faces.is_empty() {
            stats.face_frames += 1;
        }
        monitor.on_frame_processed(&frame, &faces);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use attendance_core::BoundingBox;
    use std::collections::VecDeque;
    use std::time::{Duration, Instant};

    fn frame(seq: u32, value: u8) -> Frame {
        Frame {
            data: vec![value; 4 * 4 * 3],
            width: 4,
            height: 4,
            timestamp: Instant::now(),
            sequence: seq,
        }
    }

    fn face() -> BoundingBox {
        BoundingBox {
            x: 0.0,
            y: 0.0,
            width: 2.0,
            height: 2.0,
            confidence: 0.9,
        }
    }

    /// Reports a face on every frame whose sequence number is in `hits`.
    struct ScriptedDetector {
        hits: Vec<u32>,
    }

    impl FaceDetector for ScriptedDetector {
        fn detect(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, DetectorError> {
            if self.hits.contains(&frame.sequence) {
                Ok(vec![face()])
            } else {
                Ok(Vec::new())
            }
        }
    }

    #[tokio::test]
    async fn test_face_frame_fires_armed_capture() {
        let presence = PresenceHandle::new();
        let ticket = presence.arm_capture().unwrap();
        let mut monitor = PresenceMonitor::new(presence.clone());
        let mut detector = ScriptedDetector { hits: vec![2] };
        let (_tx, mut rx) = mpsc::channel(1);

        let mut frames: VecDeque<Result<Frame, CameraError>> =
            (0..3).map(|i| Ok(frame(i, 128))).collect();
        frames.push_back(Err(CameraError::CaptureFailed("unplugged".into())));

        let stats = run_presence_loop(
            || frames.pop_front().unwrap(),
            &mut detector,
            &mut monitor,
            &mut rx,
        );

        assert_eq!(stats.frames, 3);
        assert_eq!(stats.face_frames, 1);
        let blob = ticket.wait(Duration::from_millis(10)).await.unwrap();
        assert_eq!(blob.filename, "snapshot-2.png");
    }

    #[test]
    fn test_dark_frames_skip_detection() {
        let presence = PresenceHandle::new();
        let mut monitor = PresenceMonitor::new(presence.clone());
        // Would report a face on every frame if asked.
        let mut detector = ScriptedDetector { hits: vec![0, 1] };
        let (_tx, mut rx) = mpsc::channel(1);

        let mut frames: VecDeque<Result<Frame, CameraError>> =
            vec![Ok(frame(0, 0)), Ok(frame(1, 0))].into();
        frames.push_back(Err(CameraError::DeviceBusy));

        let stats = run_presence_loop(
            || frames.pop_front().unwrap(),
            &mut detector,
            &mut monitor,
            &mut rx,
        );
        assert_eq!(stats.dark_frames, 2);
        assert_eq!(stats.face_frames, 0);
        assert!(!presence.is_present());
    }

    #[test]
    fn test_camera_failure_marks_device_unavailable() {
        let presence = PresenceHandle::new();
        let mut monitor = PresenceMonitor::new(presence.clone());
        let mut detector = ScriptedDetector { hits: vec![0] };
        let (_tx, mut rx) = mpsc::channel(1);

        let mut frames: VecDeque<Result<Frame, CameraError>> =
            vec![Ok(frame(0, 128)), Err(CameraError::DeviceBusy)].into();

        run_presence_loop(
            || frames.pop_front().unwrap(),
            &mut detector,
            &mut monitor,
            &mut rx,
        );
        assert!(presence.device_unavailable().is_some());
        assert!(!presence.is_present());
    }

    #[tokio::test]
    async fn test_stop_request_returns_stats() {
        let presence = PresenceHandle::new();
        let mut monitor = PresenceMonitor::new(presence);
        let mut detector = ScriptedDetector { hits: Vec::new() };
        let (tx, mut rx) = mpsc::channel(1);

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(EngineRequest::Stop { reply: reply_tx }).await.unwrap();

        let stats = run_presence_loop(
            || -> Result<Frame, CameraError> { panic!("no frame should be read after stop") },
            &mut detector,
            &mut monitor,
            &mut rx,
        );
        assert_eq!(stats, EngineStats::default());
        assert_eq!(reply_rx.await.unwrap(), stats);
    }

    #[test]
    fn test_warmup_discards_frames() {
        let presence = PresenceHandle::new();
        let monitor = PresenceMonitor::new(presence.clone());
        let mut read = 0;

        assert!(discard_warmup(
            || {
                read += 1;
                Ok(frame(read, 128))
            },
            3,
            &monitor
        ));
        assert_eq!(read, 3);
        assert!(presence.device_unavailable().is_none());
    }

    #[test]
    fn test_warmup_failure_marks_device_unavailable() {
        let presence = PresenceHandle::new();
        let monitor = PresenceMonitor::new(presence.clone());
        let mut frames: VecDeque<Result<Frame, CameraError>> =
            vec![Ok(frame(0, 128)), Err(CameraError::DeviceBusy), Ok(frame(2, 128))].into();

        assert!(!discard_warmup(|| frames.pop_front().unwrap(), 3, &monitor));
        assert_eq!(frames.len(), 1);
        assert!(presence.device_unavailable().is_some());
    }

    #[test]
    fn test_dropped_handle_ends_loop() {
        let presence = PresenceHandle::new();
        let mut monitor = PresenceMonitor::new(presence);
        let mut detector = ScriptedDetector { hits: Vec::new() };
        let (tx, mut rx) = mpsc::channel::<EngineRequest>(1);
        drop(tx);

        let stats = run_presence_loop(
            || Ok(frame(0, 128)),
            &mut detector,
            &mut monitor,
            &mut rx,
        );
        assert_eq!(stats.frames, 0);
    }
}
