use thiserror::Error;

/// Every failure the acquisition and prediction workflow can surface.
///
/// All variants are recoverable: the workflow turns them into state and a
/// reset or a fresh acquisition always gets the user going again.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum WorkflowError {
    #[error("Camera unavailable: {0}")]
    CameraUnavailable(String),

    #[error("Camera frame not ready yet")]
    FrameNotReady,

    #[error("Invalid image file: {0}")]
    InvalidFile(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Invalid response from classifier: {0}")]
    InvalidResponse(String),
}

impl WorkflowError {
    /// Network and malformed-response failures are shown the same way.
    pub fn is_network_failure(&self) -> bool {
        matches!(
            self,
            WorkflowError::NetworkError(_) | WorkflowError::InvalidResponse(_)
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WorkflowError::CameraUnavailable(_) => "CameraUnavailable",
            WorkflowError::FrameNotReady => "FrameNotReady",
            WorkflowError::InvalidFile(_) => "InvalidFile",
            WorkflowError::NetworkError(_) => "NetworkError",
            WorkflowError::InvalidResponse(_) => "InvalidResponse",
        }
    }
}
