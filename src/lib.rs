//! Medicinal plant identification.
//!
//! A plant photo comes from a file or a live camera, goes to a remote
//! classifier, and the ranked species with their ayurvedic uses come back.
//! [`workflow::PredictionWorkflow`] owns the whole acquisition and
//! prediction lifecycle; everything else plugs into it.

pub mod camera_device;
pub mod config;
pub mod error;
pub mod image_source;
pub mod media_capture;
pub mod prediction_client;
pub mod render;
pub mod workflow;

pub use config::Config;
pub use error::WorkflowError;
pub use image_source::{Image, ImageSource, SelectedFile};
pub use media_capture::{CameraSession, MediaCaptureController};
pub use prediction_client::{
    Classifier, HttpPredictionClient, PredictionCandidate, PredictionOutcome, Predictions,
};
pub use workflow::{Phase, PredictionWorkflow, WorkflowSnapshot, WorkflowState};
