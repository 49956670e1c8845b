//! Motion-triggered vehicle capture.
//!
//! Watches a camera feed, detects motion by frame differencing, and for each
//! accepted trigger asks a hosted vision model for the licence plate and
//! vehicle type, then stores the frame and the result.
//!
//! # Data flow
//!
//! ```text
//! camera -> FrameDifferencer -> MotionGate -> Recognizer -> PersistenceSink
//! ```
//!
//! The flow runs one way. Only camera failures end the stream; a failed
//! recognition or write affects the one capture it belongs to.
//!
//! # Module Structure
//!
//! - `frame`: captured frames and their grayscale derivatives
//! - `ingest`: camera sources (HTTP MJPEG/snapshot, V4L2, synthetic)
//! - `detect`: frame differencing and the cooldown gate
//! - `recognize`: vision model client and reply parsing
//! - `sink` / `storage`: capture images and record stores
//! - `pipeline`: the per-frame loop
//! - `config` / `error`: startup configuration and the error taxonomy

pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod recognize;
pub mod sink;
pub mod storage;

pub use config::CaptureConfig;
pub use detect::{
    should_capture, DifferencerConfig, FrameDifferencer, MotionGate, MotionRegion, MotionScore,
};
pub use error::{CaptureError, PersistenceError, RecognitionError};
pub use frame::{Frame, GrayFrame};
pub use ingest::{open_source, CameraSettings, FrameSource, SourceStats};
pub use pipeline::{CaptureEvent, CapturePipeline, PipelineReport, PipelineState, StopSignal};
pub use recognize::{
    Recognizer, ResponseFormat, VehicleCategory, VehicleRecognitionResult, VisionModel,
};
pub use sink::{PersistenceSink, SinkConfig, StoredRecord};
pub use storage::{CaptureRecord, RecordStore, SubmitOutcome};
