//! Camera capture pipeline.
//!
//! A [`CaptureDevice`] hands out a lazy, endless stream of frames that
//! cannot be restarted once it dies. The [`CaptureSupervisor`] wraps the
//! device so the verification reducer can tear a capture down and start a
//! fresh one, identified by a monotonically increasing generation number.
//!
//! At most one generation runs at a time: claiming a higher generation
//! (by starting it, or by retiring it without a stream) ends every stream
//! of a lower one.

use futures::stream::{BoxStream, StreamExt};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::{mpsc, watch};

/// One decoder callback
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// The decoder ran but found no code
    Empty,
    /// Decoded QR text, as read
    Decoded(String),
}

/// Camera errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    /// The user refused camera access
    #[error("Camera access denied")]
    PermissionDenied,

    /// No usable camera
    #[error("Camera unavailable: {0}")]
    Unavailable(String),
}

/// What a running capture reports
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CaptureEvent {
    /// A decoder callback
    Frame(Frame),
    /// The capture could not start
    Failed(CaptureError),
}

/// Source of frame streams
pub trait CaptureDevice: Send + Sync {
    /// Start a new capture
    ///
    /// # Errors
    ///
    /// Returns a [`CaptureError`] when the camera cannot be opened.
    fn start(&self) -> Result<BoxStream<'static, Frame>, CaptureError>;
}

/// Restartable wrapper around a [`CaptureDevice`]
#[derive(Clone)]
pub struct CaptureSupervisor {
    device: Arc<RwLock<Arc<dyn CaptureDevice>>>,
    claimed: Arc<watch::Sender<u64>>,
}

impl CaptureSupervisor {
    /// Supervise `device`
    #[must_use]
    pub fn new(device: Arc<dyn CaptureDevice>) -> Self {
        let (claimed, _) = watch::channel(0);
        Self {
            device: Arc::new(RwLock::new(device)),
            claimed: Arc::new(claimed),
        }
    }

    /// Swap the camera. Takes effect on the next started generation.
    pub fn attach(&self, device: Arc<dyn CaptureDevice>) {
        *self.device.write().unwrap_or_else(PoisonError::into_inner) = device;
    }

    /// Highest generation claimed so far
    #[must_use]
    pub fn current_generation(&self) -> u64 {
        *self.claimed.borrow()
    }

    /// Claim `generation`; false if a higher one was already claimed
    fn claim(&self, generation: u64) -> bool {
        self.claimed.send_if_modified(|current| {
            if generation > *current {
                *current = generation;
                true
            } else {
                false
            }
        });
        *self.claimed.borrow() == generation
    }

    /// End every capture below `generation` without starting a new one
    pub fn retire(&self, generation: u64) {
        let _ = self.claim(generation);
    }

    /// Lazily start capture `generation`
    ///
    /// The stream ends as soon as a higher generation is claimed. It ends
    /// immediately if one already was by the time it is first polled.
    #[must_use]
    pub fn run(&self, generation: u64) -> BoxStream<'static, CaptureEvent> {
        let supervisor = self.clone();
        Box::pin(async_stream::stream! {
            if !supervisor.claim(generation) {
                tracing::debug!(generation, "Capture superseded before start");
                return;
            }
            let device = Arc::clone(&*supervisor.device.read().unwrap_or_else(PoisonError::into_inner));
            match device.start() {
                Err(error) => {
                    tracing::warn!(generation, %error, "Capture failed to start");
                    yield CaptureEvent::Failed(error);
                },
                Ok(frames) => {
                    let mut claimed = supervisor.claimed.subscribe();
                    let superseded = async move {
                        loop {
                            let current = *claimed.borrow_and_update();
                            if current != generation || claimed.changed().await.is_err() {
                                break;
                            }
                        }
                    };
                    let mut frames = frames.take_until(Box::pin(superseded));
                    while let Some(frame) = frames.next().await {
                        yield CaptureEvent::Frame(frame);
                    }
                    tracing::debug!(generation, "Capture ended");
                },
            }
        })
    }
}

/// Camera driven by hand, for the demo binary and tests
///
/// Every [`CaptureDevice::start`] opens a fresh channel; frames pushed with
/// [`ManualCamera::show`] go to the most recent capture only.
#[derive(Clone, Default)]
pub struct ManualCamera {
    inner: Arc<Mutex<ManualCameraState>>,
}

#[derive(Default)]
struct ManualCameraState {
    current: Option<mpsc::UnboundedSender<Frame>>,
    frozen: Vec<mpsc::UnboundedSender<Frame>>,
    starts: usize,
    refuse_next: usize,
}

impl ManualCamera {
    /// New camera, not started
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ManualCameraState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver a frame to the running capture
    ///
    /// Returns false when no capture is listening (never started, stopped
    /// or superseded).
    pub fn show(&self, frame: Frame) -> bool {
        self.state()
            .current
            .as_ref()
            .is_some_and(|tx| tx.send(frame).is_ok())
    }

    /// Deliver a decoded payload
    pub fn show_text(&self, text: impl Into<String>) -> bool {
        self.show(Frame::Decoded(text.into()))
    }

    /// Simulate the pipeline dying silently: the stream stays open but no
    /// frame will ever arrive again
    pub fn freeze(&self) {
        let mut state = self.state();
        if let Some(tx) = state.current.take() {
            state.frozen.push(tx);
        }
    }

    /// Refuse the next `count` starts with `PermissionDenied`
    pub fn refuse_next_starts(&self, count: usize) {
        self.state().refuse_next = count;
    }

    /// How many captures were started
    #[must_use]
    pub fn starts(&self) -> usize {
        self.state().starts
    }

    /// Whether a capture is currently listening
    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.state().current.as_ref().is_some_and(|tx| !tx.is_closed())
    }
}

impl CaptureDevice for ManualCamera {
    fn start(&self) -> Result<BoxStream<'static, Frame>, CaptureError> {
        let mut state = self.state();
        state.starts += 1;
        if state.refuse_next > 0 {
            state.refuse_next -= 1;
            return Err(CaptureError::PermissionDenied);
        }
        let (tx, mut rx) = mpsc::unbounded_channel();
        state.current = Some(tx);
        Ok(Box::pin(async_stream::stream! {
            while let Some(frame) = rx.recv().await {
                yield frame;
            }
        }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn next(stream: &mut BoxStream<'static, CaptureEvent>) -> Option<CaptureEvent> {
        tokio::time::timeout(Duration::from_millis(200), stream.next())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn frames_flow_until_superseded() {
        let camera = ManualCamera::new();
        let supervisor = CaptureSupervisor::new(Arc::new(camera.clone()));

        let mut first = supervisor.run(1);
        // Lazy: nothing starts before the first poll.
        assert_eq!(camera.starts(), 0);
        let pending = tokio::spawn(async move {
            let event = next(&mut first).await;
            (event, first)
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(camera.show_text("hello"));
        let (event, mut first) = pending.await.unwrap();
        assert_eq!(event, Some(CaptureEvent::Frame(Frame::Decoded("hello".to_string()))));

        supervisor.retire(2);
        assert_eq!(next(&mut first).await, None);
        assert_eq!(supervisor.current_generation(), 2);
    }

    #[tokio::test]
    async fn stale_generation_never_starts() {
        let camera = ManualCamera::new();
        let supervisor = CaptureSupervisor::new(Arc::new(camera.clone()));
        supervisor.retire(5);

        let mut stale = supervisor.run(3);
        assert_eq!(next(&mut stale).await, None);
        assert_eq!(camera.starts(), 0);
    }

    #[tokio::test]
    async fn refused_start_reports_failure() {
        let camera = ManualCamera::new();
        camera.refuse_next_starts(1);
        let supervisor = CaptureSupervisor::new(Arc::new(camera.clone()));

        let mut stream = supervisor.run(1);
        assert_eq!(
            next(&mut stream).await,
            Some(CaptureEvent::Failed(CaptureError::PermissionDenied))
        );
        assert_eq!(next(&mut stream).await, None);
    }

    #[tokio::test]
    async fn attached_device_serves_next_generation() {
        let old = ManualCamera::new();
        let new = ManualCamera::new();
        let supervisor = CaptureSupervisor::new(Arc::new(old.clone()));
        supervisor.attach(Arc::new(new.clone()));

        let mut stream = supervisor.run(1);
        let handle = tokio::spawn(async move { next(&mut stream).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(new.show(Frame::Empty));
        assert_eq!(handle.await.unwrap(), Some(CaptureEvent::Frame(Frame::Empty)));
        assert_eq!(old.starts(), 0);
    }
}
