//! Face-presence tracking and the capture-on-next-detection trigger.
//!
//! The detection loop owns a [`PresenceMonitor`] and feeds it every processed
//! frame in order. The check-in coordinator holds a [`PresenceHandle`] onto
//! the same shared state: it reads the presence flag and arms a one-shot
//! capture. The armed capture is a `oneshot` sender that the monitor takes
//! out of its slot on the first frame that shows a face, so a capture fires
//! at most once per arming.

use crate::snapshot::SnapshotCapturer;
use crate::types::{BoundingBox, Frame, ImageBlob};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;

#[derive(Default)]
struct PresenceState {
    present: AtomicBool,
    armed: Mutex<Option<oneshot::Sender<ImageBlob>>>,
    /// Set when the capture device failed to open or stopped delivering.
    device_error: Mutex<Option<String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Clone-safe view of the presence state used by the coordinator.
#[derive(Clone, Default)]
pub struct PresenceHandle {
    inner: Arc<PresenceState>,
}

impl PresenceHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the most recently processed frame contained a face.
    pub fn is_present(&self) -> bool {
        self.inner.present.load(Ordering::Acquire)
    }

    /// Arm a capture for the next frame that contains a face.
    ///
    /// Returns `None` while a capture is already pending; the pending one is
    /// left untouched.
    pub fn arm_capture(&self) -> Option<CaptureTicket> {
        let mut slot = lock(&self.inner.armed);
        if slot.as_ref().is_some_and(|tx| !tx.is_closed()) {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        *slot = Some(tx);
        tracing::debug!("capture armed");
        Some(CaptureTicket { rx })
    }

    /// Whether a live capture is pending.
    pub fn is_armed(&self) -> bool {
        lock(&self.inner.armed)
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Drop any pending capture. Returns true if one was pending.
    pub fn disarm(&self) -> bool {
        let was_armed = lock(&self.inner.armed)
            .take()
            .is_some_and(|tx| !tx.is_closed());
        if was_armed {
            tracing::debug!("capture disarmed");
        }
        was_armed
    }

    /// Record that the capture device failed. Presence then stays false for
    /// the lifetime of the process.
    pub fn set_device_unavailable(&self, reason: impl Into<String>) {
        self.inner.present.store(false, Ordering::Release);
        *lock(&self.inner.device_error) = Some(reason.into());
    }

    pub fn device_unavailable(&self) -> Option<String> {
        lock(&self.inner.device_error).clone()
    }
}

/// Receiving end of an armed capture.
///
/// Dropping the ticket cancels the capture.
pub struct CaptureTicket {
    rx: oneshot::Receiver<ImageBlob>,
}

impl CaptureTicket {
    /// Wait up to `timeout` for the snapshot.
    ///
    /// Returns `None` if the wait expires, or if the monitor fired but had
    /// no usable frame.
    pub async fn wait(self, timeout: Duration) -> Option<ImageBlob> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(blob)) => Some(blob),
            Ok(Err(_)) => None,
            Err(_) => None,
        }
    }
}

/// Consumes detection results frame by frame.
pub struct PresenceMonitor {
    handle: PresenceHandle,
    capturer: SnapshotCapturer,
}

impl PresenceMonitor {
    pub fn new(handle: PresenceHandle) -> Self {
        Self {
            handle,
            capturer: SnapshotCapturer::new(),
        }
    }

    pub fn handle(&self) -> &PresenceHandle {
        &self.handle
    }

    /// Update presence from one frame's detections and fire an armed capture
    /// if this frame shows a face. Returns the new presence value.
    pub fn on_frame_processed(&mut self, frame: &Frame, detections: &[BoundingBox]) -> bool {
        let present = !detections.is_empty();
        let previous = self.handle.inner.present.swap(present, Ordering::AcqRel);
        if previous != present {
            tracing::debug!(present, faces = detections.len(), seq = frame.sequence, "presence changed");
        }

        if present {
            let pending = lock(&self.handle.inner.armed).take();
            if let Some(tx) = pending {
                if tx.is_closed() {
                    tracing::debug!("armed capture was cancelled; skipping");
                } else if let Some(blob) = self.capturer.capture(frame) {
                    tracing::info!(seq = frame.sequence, bytes = blob.len(), "armed capture fired");
                    let _ = tx.send(blob);
                }
                // A failed capture drops `tx`, which the ticket sees as "no image".
            }
        }

        present
    }
}
