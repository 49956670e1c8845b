//! Error taxonomy for the capture pipeline.
//!
//! Camera-level failures end the stream. Everything that can go wrong while
//! handling a single capture event is recoverable: it is logged against the
//! event's sequence number and the loop moves on to the next frame.

use thiserror::Error;

/// Failure of the external vision round trip or of parsing its reply.
#[derive(Debug, Error)]
pub enum RecognitionError {
    #[error("vision service unreachable: {0}")]
    Transport(String),
    #[error("vision service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("vision service reply contained no text")]
    EmptyReply,
    #[error("could not parse vision reply: {0}")]
    Parse(String),
    #[error("could not encode capture for recognition: {0}")]
    Encode(String),
}

/// Failure to write a capture image or to submit its record.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("jpeg encode failed: {0}")]
    Encode(String),
    #[error("image write to {path} failed: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("record store '{store}' rejected capture: {message}")]
    Record { store: String, message: String },
}

/// Pipeline-level error.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("cannot open camera {source_name}: {message}")]
    CameraOpen {
        source_name: String,
        message: String,
    },
    #[error("frame read from {source_name} failed: {message}")]
    FrameRead {
        source_name: String,
        message: String,
    },
    #[error(transparent)]
    Recognition(#[from] RecognitionError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl CaptureError {
    /// Fatal errors stop the pipeline; the rest are per-event.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CaptureError::CameraOpen { .. } | CaptureError::FrameRead { .. } | CaptureError::Config(_)
        )
    }

    pub(crate) fn camera_open(source_name: &str, err: &anyhow::Error) -> Self {
        CaptureError::CameraOpen {
            source_name: source_name.to_string(),
            message: format!("{:#}", err),
        }
    }

    pub(crate) fn frame_read(source_name: &str, err: &anyhow::Error) -> Self {
        CaptureError::FrameRead {
            source_name: source_name.to_string(),
            message: format!("{:#}", err),
        }
    }
}
