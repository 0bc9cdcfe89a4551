use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::camera_device::{CaptureDevice, VideoStream};
use crate::error::WorkflowError;
use crate::image_source::{Image, ImageSource};

/// Handle to an open camera stream.
///
/// The stream is released by [`MediaCaptureController::close`] or, on any
/// other exit path, when the session is dropped.
pub struct CameraSession {
    id: u64,
    stream: Option<Box<dyn VideoStream>>,
    open_sessions: Arc<AtomicUsize>,
}

impl CameraSession {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Whether the stream has produced a frame yet.
    pub fn is_streaming(&self) -> bool {
        self.stream
            .as_ref()
            .and_then(|stream| stream.dimensions())
            .is_some()
    }

    fn release(&mut self) -> bool {
        match self.stream.take() {
            Some(mut stream) => {
                stream.stop();
                self.open_sessions.fetch_sub(1, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }
}

impl Drop for CameraSession {
    fn drop(&mut self) {
        if self.release() {
            log::info!("Camera session {} released on drop", self.id);
        }
    }
}

impl std::fmt::Debug for CameraSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraSession")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Owns the camera device and hands out at most one session at a time.
#[derive(Clone)]
pub struct MediaCaptureController {
    device: Arc<dyn CaptureDevice>,
    source: ImageSource,
    open_sessions: Arc<AtomicUsize>,
    next_session_id: Arc<AtomicU64>,
}

impl MediaCaptureController {
    /// Controller over `device`; captured frames are encoded by `source`.
    pub fn new(device: Arc<dyn CaptureDevice>, source: ImageSource) -> Self {
        Self {
            device,
            source,
            open_sessions: Arc::new(AtomicUsize::new(0)),
            next_session_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn device_name(&self) -> &str {
        self.device.name()
    }

    /// Sessions currently holding the device. Never more than one.
    pub fn open_session_count(&self) -> usize {
        self.open_sessions.load(Ordering::SeqCst)
    }

    /// Request camera access and start streaming.
    ///
    /// Fails with [`WorkflowError::CameraUnavailable`] on denial, device
    /// error, or while another session is open. No session is left open on
    /// failure.
    pub async fn open(&self) -> Result<CameraSession, WorkflowError> {
        if self.open_session_count() > 0 {
            return Err(WorkflowError::CameraUnavailable(
                "camera already in use".to_string(),
            ));
        }

        log::info!("Opening camera ({})...", self.device.name());
        let stream = self.device.open_stream().await.map_err(|e| {
            log::warn!("Camera open failed: {}", e);
            match e {
                WorkflowError::CameraUnavailable(_) => e,
                other => WorkflowError::CameraUnavailable(other.to_string()),
            }
        })?;

        // The device was granted while another open completed
        if self.open_sessions.fetch_add(1, Ordering::SeqCst) > 0 {
            let mut stream = stream;
            stream.stop();
            self.open_sessions.fetch_sub(1, Ordering::SeqCst);
            return Err(WorkflowError::CameraUnavailable(
                "camera already in use".to_string(),
            ));
        }

        let id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
        log::info!("Camera session {} opened", id);
        Ok(CameraSession {
            id,
            stream: Some(stream),
            open_sessions: Arc::clone(&self.open_sessions),
        })
    }

    /// Sample the current frame of an open, streaming session.
    pub fn capture_frame(&self, session: &mut CameraSession) -> Result<Image, WorkflowError> {
        let stream = session
            .stream
            .as_mut()
            .ok_or(WorkflowError::FrameNotReady)?;

        match stream.dimensions() {
            Some((width, height)) if width > 0 && height > 0 => {}
            _ => {
                log::warn!("Capture requested before session {} produced a frame", session.id);
                return Err(WorkflowError::FrameNotReady);
            }
        }

        let frame = stream.sample().map_err(|e| {
            log::warn!("Frame sampling failed: {}", e);
            WorkflowError::FrameNotReady
        })?;

        log::info!(
            "Captured {}x{} frame from session {}",
            frame.width(),
            frame.height(),
            session.id
        );
        self.source.from_frame(&frame)
    }

    /// Stop the stream. Closing an already closed session does nothing.
    pub fn close(&self, session: &mut CameraSession) {
        if session.release() {
            log::info!("Camera session {} closed", session.id);
        }
    }
}
