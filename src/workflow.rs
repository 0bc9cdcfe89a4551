//! Image acquisition and prediction state machine.
//!
//! All state lives in one [`WorkflowState`] value owned by
//! [`PredictionWorkflow`]. Actions run synchronously on the owner; slow work
//! (camera permission, classifier round trip) runs on spawned tasks that
//! report back through an event channel. Every task carries the request
//! token it was started with, and a result is applied only while that token
//! is still the current one.

use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::WorkflowError;
use crate::image_source::{Image, ImageSource, SelectedFile};
use crate::media_capture::{CameraSession, MediaCaptureController};
use crate::prediction_client::{Classifier, PredictionCandidate, PredictionOutcome, Predictions};

/// Identity of one asynchronous request (camera open or prediction).
pub type RequestId = u64;

#[derive(Debug)]
pub enum CameraPhase {
    /// Waiting for the device to grant access.
    Requesting { request: RequestId },
    Streaming(CameraSession),
}

#[derive(Debug)]
pub enum WorkflowState {
    Idle { notice: Option<WorkflowError> },
    CameraActive(CameraPhase),
    ImageReady { image: Image },
    Predicting { image: Image, request: RequestId },
    Success { image: Image, predictions: Predictions, show_all: bool },
    Error { image: Option<Image>, error: WorkflowError },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    CameraActive,
    ImageReady,
    Predicting,
    Success,
    Error,
}

impl WorkflowState {
    pub fn phase(&self) -> Phase {
        match self {
            WorkflowState::Idle { .. } => Phase::Idle,
            WorkflowState::CameraActive(_) => Phase::CameraActive,
            WorkflowState::ImageReady { .. } => Phase::ImageReady,
            WorkflowState::Predicting { .. } => Phase::Predicting,
            WorkflowState::Success { .. } => Phase::Success,
            WorkflowState::Error { .. } => Phase::Error,
        }
    }
}

impl Default for WorkflowState {
    fn default() -> Self {
        WorkflowState::Idle { notice: None }
    }
}

/// Completion of a spawned task.
#[derive(Debug)]
pub enum WorkflowEvent {
    CameraOpened {
        request: RequestId,
        result: Result<CameraSession, WorkflowError>,
    },
    PredictionResolved {
        request: RequestId,
        outcome: PredictionOutcome,
    },
}

/// Read-only view handed to the presentation layer.
#[derive(Debug, Clone)]
pub struct WorkflowSnapshot {
    pub phase: Phase,
    pub image: Option<Image>,
    pub predictions: Option<Predictions>,
    pub show_all: bool,
    pub error: Option<WorkflowError>,
    pub camera_streaming: bool,
}

impl WorkflowSnapshot {
    pub fn is_loading(&self) -> bool {
        self.phase == Phase::Predicting
    }

    pub fn primary(&self) -> Option<&PredictionCandidate> {
        self.predictions.as_ref().map(|p| p.primary())
    }

    /// Alternatives to render: empty unless the toggle is on.
    pub fn visible_alternatives(&self) -> &[PredictionCandidate] {
        match &self.predictions {
            Some(predictions) if self.show_all => predictions.alternatives(),
            _ => &[],
        }
    }

    /// Whether the "show alternatives" control applies at all.
    pub fn has_alternatives(&self) -> bool {
        self.predictions.as_ref().map_or(false, |p| p.len() > 1)
    }
}

pub struct PredictionWorkflow {
    state: WorkflowState,
    camera: MediaCaptureController,
    source: ImageSource,
    classifier: Arc<dyn Classifier>,
    auto_predict: bool,
    sequence: RequestId,
    /// Camera open still running on a task, current or not.
    camera_request: Option<RequestId>,
    in_flight: usize,
    events_tx: mpsc::UnboundedSender<WorkflowEvent>,
    events_rx: mpsc::UnboundedReceiver<WorkflowEvent>,
}

impl PredictionWorkflow {
    /// Workflow starting in `Idle`. With `auto_predict` off, acquisitions
    /// stop in `ImageReady` until [`predict`](Self::predict) is called.
    pub fn new(
        camera: MediaCaptureController,
        source: ImageSource,
        classifier: Arc<dyn Classifier>,
        auto_predict: bool,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            state: WorkflowState::default(),
            camera,
            source,
            classifier,
            auto_predict,
            sequence: 0,
            camera_request: None,
            in_flight: 0,
            events_tx,
            events_rx,
        }
    }

    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    pub fn camera(&self) -> &MediaCaptureController {
        &self.camera
    }

    /// Number of spawned tasks whose completion has not been applied yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Everything the presentation layer needs to draw the current state.
    pub fn snapshot(&self) -> WorkflowSnapshot {
        let mut snapshot = WorkflowSnapshot {
            phase: self.phase(),
            image: None,
            predictions: None,
            show_all: false,
            error: None,
            camera_streaming: false,
        };

        match &self.state {
            WorkflowState::Idle { notice } => snapshot.error = notice.clone(),
            WorkflowState::CameraActive(CameraPhase::Streaming(session)) => {
                snapshot.camera_streaming = session.is_streaming();
            }
            WorkflowState::CameraActive(CameraPhase::Requesting { .. }) => {}
            WorkflowState::ImageReady { image } | WorkflowState::Predicting { image, .. } => {
                snapshot.image = Some(image.clone());
            }
            WorkflowState::Success {
                image,
                predictions,
                show_all,
            } => {
                snapshot.image = Some(image.clone());
                snapshot.predictions = Some(predictions.clone());
                snapshot.show_all = *show_all;
            }
            WorkflowState::Error { image, error } => {
                snapshot.image = image.clone();
                snapshot.error = Some(error.clone());
            }
        }
        snapshot
    }

    fn next_request(&mut self) -> RequestId {
        self.sequence += 1;
        self.sequence
    }

    fn take_state(&mut self) -> WorkflowState {
        std::mem::take(&mut self.state)
    }

    /// Leave whatever state we are in, closing an open camera on the way.
    fn leave_current(&mut self) {
        if let WorkflowState::CameraActive(CameraPhase::Streaming(mut session)) = self.take_state()
        {
            self.camera.close(&mut session);
        }
    }

    /// Switch to camera mode and request the device.
    ///
    /// Any image, result or pending prediction is dropped. Access is granted
    /// asynchronously; until then the state is `CameraActive(Requesting)`.
    pub fn open_camera(&mut self) {
        if matches!(self.state, WorkflowState::CameraActive(_)) {
            log::debug!("Camera already active, ignoring open");
            return;
        }
        self.leave_current();

        // Adopt an open that is still running rather than asking twice
        let request = match self.camera_request {
            Some(request) => {
                log::debug!("Reusing pending camera request {}", request);
                request
            }
            None => {
                let request = self.next_request();
                self.camera_request = Some(request);
                self.in_flight += 1;

                let camera = self.camera.clone();
                let events = self.events_tx.clone();
                tokio::spawn(async move {
                    let result = camera.open().await;
                    let _ = events.send(WorkflowEvent::CameraOpened { request, result });
                });
                request
            }
        };

        log::info!("Camera requested (request {})", request);
        self.state = WorkflowState::CameraActive(CameraPhase::Requesting { request });
    }

    /// Leave camera mode without taking a photo.
    pub fn cancel_camera(&mut self) {
        match self.take_state() {
            WorkflowState::CameraActive(phase) => {
                if let CameraPhase::Streaming(mut session) = phase {
                    self.camera.close(&mut session);
                }
                log::info!("Camera cancelled");
                self.state = WorkflowState::Idle { notice: None };
            }
            other => {
                log::debug!("Cancel ignored in {:?}", other.phase());
                self.state = other;
            }
        }
    }

    /// Take the current frame and start its prediction. The camera is closed
    /// whether or not a frame could be taken.
    pub fn capture(&mut self) {
        match self.take_state() {
            WorkflowState::CameraActive(CameraPhase::Streaming(mut session)) => {
                let captured = self.camera.capture_frame(&mut session);
                // Close regardless of how the capture went
                self.camera.close(&mut session);
                drop(session);

                match captured {
                    Ok(image) => self.acquired(image),
                    Err(error) => {
                        log::warn!("Capture failed: {}", error);
                        self.state = WorkflowState::Error { image: None, error };
                    }
                }
            }
            WorkflowState::CameraActive(CameraPhase::Requesting { .. }) => {
                log::warn!("Capture requested before the camera was granted");
                self.state = WorkflowState::Error {
                    image: None,
                    error: WorkflowError::FrameNotReady,
                };
            }
            other => {
                log::debug!("Capture ignored in {:?}", other.phase());
                self.state = other;
            }
        }
    }

    /// Use a picked file as the image, replacing whatever came before.
    /// An open camera is closed first.
    pub fn select_file(&mut self, file: &SelectedFile) {
        self.leave_current();

        match self.source.from_file(file) {
            Ok(image) => {
                log::info!("Selected {} ({} bytes)", file.name, image.len());
                self.acquired(image);
            }
            Err(error) => {
                log::warn!("Rejected {} ({}): {}", file.name, error.kind(), error);
                self.state = WorkflowState::Error { image: None, error };
            }
        }
    }

    /// Start the prediction for an image waiting in `ImageReady`.
    pub fn predict(&mut self) {
        match self.take_state() {
            WorkflowState::ImageReady { image } => self.begin_prediction(image),
            other => {
                log::debug!("Predict ignored in {:?}", other.phase());
                self.state = other;
            }
        }
    }

    /// Back to `Idle`. Does nothing while the camera is active.
    pub fn reset(&mut self) {
        match self.take_state() {
            WorkflowState::CameraActive(phase) => {
                log::debug!("Reset ignored while the camera is active");
                self.state = WorkflowState::CameraActive(phase);
            }
            previous => {
                if let WorkflowState::Predicting { request, .. } = &previous {
                    log::info!(
                        "Reset while request {} is pending, its result will be dropped",
                        request
                    );
                }
                self.state = WorkflowState::Idle { notice: None };
            }
        }
    }

    /// Flip alternative visibility. Only applies to a success with more
    /// than one candidate.
    pub fn toggle_show_all(&mut self) {
        if let WorkflowState::Success {
            predictions,
            show_all,
            ..
        } = &mut self.state
        {
            if predictions.len() > 1 {
                *show_all = !*show_all;
            }
        }
    }

    /// Close any open camera. Safe to call more than once.
    pub fn shutdown(&mut self) {
        if matches!(self.state, WorkflowState::CameraActive(_)) {
            self.leave_current();
        }
        log::info!(
            "Workflow shut down ({} open camera session(s))",
            self.camera.open_session_count()
        );
    }

    fn acquired(&mut self, image: Image) {
        if self.auto_predict {
            self.begin_prediction(image);
        } else {
            self.state = WorkflowState::ImageReady { image };
        }
    }

    fn begin_prediction(&mut self, image: Image) {
        let request = self.next_request();
        self.in_flight += 1;

        let classifier = Arc::clone(&self.classifier);
        let events = self.events_tx.clone();
        let upload = image.clone();
        tokio::spawn(async move {
            let outcome = classifier.predict(&upload).await;
            let _ = events.send(WorkflowEvent::PredictionResolved { request, outcome });
        });

        log::info!("Prediction request {} started", request);
        self.state = WorkflowState::Predicting { image, request };
    }

    /// Wait for the next task completion without applying it.
    pub async fn next_event(&mut self) -> Option<WorkflowEvent> {
        self.events_rx.recv().await
    }

    /// Fold a task completion into the state. Completions of superseded
    /// requests are dropped, and a stale camera grant is closed.
    pub fn apply(&mut self, event: WorkflowEvent) {
        self.in_flight = self.in_flight.saturating_sub(1);

        match event {
            WorkflowEvent::CameraOpened { request, result } => {
                if self.camera_request == Some(request) {
                    self.camera_request = None;
                }
                self.camera_opened(request, result);
            }
            WorkflowEvent::PredictionResolved { request, outcome } => {
                self.prediction_resolved(request, outcome);
            }
        }
    }

    fn camera_opened(&mut self, request: RequestId, result: Result<CameraSession, WorkflowError>) {
        let current = matches!(
            self.state,
            WorkflowState::CameraActive(CameraPhase::Requesting { request: pending }) if pending == request
        );

        match (current, result) {
            (true, Ok(session)) => {
                log::info!("Camera streaming (session {})", session.id());
                self.state = WorkflowState::CameraActive(CameraPhase::Streaming(session));
            }
            (true, Err(error)) => {
                log::warn!("Camera unavailable: {}", error);
                self.state = WorkflowState::Idle {
                    notice: Some(error),
                };
            }
            (false, Ok(mut session)) => {
                log::warn!("Camera granted for stale request {}, closing it", request);
                self.camera.close(&mut session);
            }
            (false, Err(_)) => {
                log::debug!("Dropping camera failure for stale request {}", request);
            }
        }
    }

    fn prediction_resolved(&mut self, request: RequestId, outcome: PredictionOutcome) {
        let image = match self.take_state() {
            WorkflowState::Predicting {
                image,
                request: pending,
            } if pending == request => image,
            other => {
                log::warn!("Discarding result of superseded request {}", request);
                self.state = other;
                return;
            }
        };

        self.state = match outcome {
            Ok(predictions) => {
                log::info!(
                    "Request {} succeeded: {} ({})",
                    request,
                    predictions.primary().label,
                    predictions.primary().confidence_percent()
                );
                WorkflowState::Success {
                    image,
                    predictions,
                    show_all: false,
                }
            }
            Err(error) => {
                log::warn!("Request {} failed ({}): {}", request, error.kind(), error);
                WorkflowState::Error {
                    image: Some(image),
                    error,
                }
            }
        };
    }

    /// Apply the next completion. Returns false when nothing is in flight.
    pub async fn process_next(&mut self) -> bool {
        if self.in_flight == 0 {
            return false;
        }
        match self.next_event().await {
            Some(event) => {
                self.apply(event);
                true
            }
            None => false,
        }
    }

    /// Apply completions until no task is in flight.
    pub async fn settle(&mut self) {
        while self.process_next().await {}
    }
}

impl Drop for PredictionWorkflow {
    fn drop(&mut self) {
        self.leave_current();
    }
}
