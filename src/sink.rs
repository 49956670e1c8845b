//! Persistence sink: capture image on disk, then record stores.
//!
//! The image write always happens first and is the only part that decides
//! whether a capture counts as stored. Record stores see the result after the
//! image exists, so every record points at a real file.

use chrono::{DateTime, Local};
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use std::borrow::Cow;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::detect::MotionRegion;
use crate::error::{PersistenceError, RecognitionError};
use crate::frame::{encode_jpeg, DEFAULT_JPEG_QUALITY};
use crate::pipeline::CaptureEvent;
use crate::recognize::VehicleRecognitionResult;
use crate::storage::{CaptureRecord, RecordStore, SubmitOutcome};

const ANNOTATION_COLOR: Rgb<u8> = Rgb([0, 255, 0]);

#[derive(Clone, Debug)]
pub struct SinkConfig {
    pub output_dir: PathBuf,
    pub jpeg_quality: u8,
    /// Draw motion bounding boxes onto the saved image.
    pub annotate: bool,
    /// Fail the store call when any record store rejects or skips the capture.
    pub require_record: bool,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("captures"),
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            annotate: false,
            require_record: false,
        }
    }
}

/// Outcome of a successful `store` call.
#[derive(Clone, Debug)]
pub struct StoredRecord {
    pub sequence_number: u64,
    pub image_path: PathBuf,
    /// Stores that accepted the record.
    pub submitted: Vec<String>,
    /// Stores that rejected it (only non-empty when records are best-effort).
    pub rejected: Vec<String>,
    /// Stores that declined it without error, e.g. no plate for the parking api.
    pub skipped: Vec<String>,
}

pub struct PersistenceSink {
    config: SinkConfig,
    stores: Vec<Box<dyn RecordStore>>,
}

impl PersistenceSink {
    pub fn new(config: SinkConfig) -> Self {
        Self {
            config,
            stores: Vec::new(),
        }
    }

    pub fn with_store(mut self, store: Box<dyn RecordStore>) -> Self {
        self.stores.push(store);
        self
    }

    pub fn config(&self) -> &SinkConfig {
        &self.config
    }

    pub fn store_names(&self) -> Vec<String> {
        self.stores.iter().map(|s| s.name().to_string()).collect()
    }

    pub fn store(
        &mut self,
        event: &CaptureEvent,
        result: Option<&VehicleRecognitionResult>,
    ) -> Result<StoredRecord, PersistenceError> {
        self.persist(event, None, result, None)
    }

    /// Store a capture whose recognition failed; the error is kept on the record.
    pub fn store_unrecognized(
        &mut self,
        event: &CaptureEvent,
        error: &RecognitionError,
    ) -> Result<StoredRecord, PersistenceError> {
        self.persist(event, None, None, Some(error.to_string()))
    }

    /// Like `store`/`store_unrecognized`, reusing `jpeg` (the frame already
    /// encoded at this sink's quality) instead of encoding again. Annotated
    /// sinks still draw and re-encode.
    pub fn store_encoded(
        &mut self,
        event: &CaptureEvent,
        jpeg: &[u8],
        outcome: Result<&VehicleRecognitionResult, &RecognitionError>,
    ) -> Result<StoredRecord, PersistenceError> {
        match outcome {
            Ok(result) => self.persist(event, Some(jpeg), Some(result), None),
            Err(err) => self.persist(event, Some(jpeg), None, Some(err.to_string())),
        }
    }

    fn persist(
        &mut self,
        event: &CaptureEvent,
        encoded: Option<&[u8]>,
        result: Option<&VehicleRecognitionResult>,
        recognition_error: Option<String>,
    ) -> Result<StoredRecord, PersistenceError> {
        let jpeg = match encoded {
            Some(bytes) if !self.config.annotate => Cow::Borrowed(bytes),
            _ => Cow::Owned(self.encode(event)?),
        };

        let image_path = self
            .config
            .output_dir
            .join(capture_file_name(event.timestamp(), event.sequence_number()));
        write_new_file(&self.config.output_dir, &image_path, &jpeg)?;

        let record = CaptureRecord {
            sequence_number: event.sequence_number(),
            captured_at: event.timestamp(),
            image_path: image_path.clone(),
            recognition: result.cloned(),
            recognition_error,
        };

        let mut submitted = Vec::new();
        let mut rejected = Vec::new();
        let mut skipped = Vec::new();
        let mut first_failure = None;
        for store in self.stores.iter_mut() {
            let name = store.name().to_string();
            match store.submit(&record) {
                Ok(SubmitOutcome::Stored) => submitted.push(name),
                Ok(SubmitOutcome::Skipped(reason)) => {
                    log::info!(
                        "capture #{}: record store {} skipped it: {}",
                        record.sequence_number,
                        name,
                        reason
                    );
                    if first_failure.is_none() {
                        first_failure = Some(PersistenceError::Record {
                            store: name.clone(),
                            message: format!("skipped: {}", reason),
                        });
                    }
                    skipped.push(name);
                }
                Err(err) => {
                    log::warn!(
                        "capture #{}: record store {} failed: {:#}",
                        record.sequence_number,
                        name,
                        err
                    );
                    if first_failure.is_none() {
                        first_failure = Some(PersistenceError::Record {
                            store: name.clone(),
                            message: format!("{:#}", err),
                        });
                    }
                    rejected.push(name);
                }
            }
        }
        if self.config.require_record {
            if let Some(err) = first_failure {
                return Err(err);
            }
        }

        Ok(StoredRecord {
            sequence_number: record.sequence_number,
            image_path,
            submitted,
            rejected,
            skipped,
        })
    }

    fn encode(&self, event: &CaptureEvent) -> Result<Vec<u8>, PersistenceError> {
        if self.config.annotate {
            let mut image = event.frame().image().clone();
            draw_regions(&mut image, event.regions());
            encode_jpeg(&image, self.config.jpeg_quality)
        } else {
            event.frame().encode_jpeg(self.config.jpeg_quality)
        }
        .map_err(|e| PersistenceError::Encode(format!("{:#}", e)))
    }
}

/// `vehicle_<YYYYMMDD_HHMMSS>_<seq>.jpg`
pub fn capture_file_name(timestamp: DateTime<Local>, sequence_number: u64) -> String {
    format!(
        "vehicle_{}_{}.jpg",
        timestamp.format("%Y%m%d_%H%M%S"),
        sequence_number
    )
}

fn write_new_file(dir: &Path, path: &Path, bytes: &[u8]) -> Result<(), PersistenceError> {
    let io_err = |path: &Path, source| PersistenceError::Io {
        path: path.display().to_string(),
        source,
    };
    fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
    // create_new: an existing capture is never replaced.
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| io_err(path, e))?;
    file.write_all(bytes).map_err(|e| io_err(path, e))?;
    file.sync_all().map_err(|e| io_err(path, e))
}

fn draw_regions(image: &mut RgbImage, regions: &[MotionRegion]) {
    for region in regions.iter().filter(|r| r.width > 0 && r.height > 0) {
        let outer = Rect::at(region.x as i32, region.y as i32).of_size(region.width, region.height);
        draw_hollow_rect_mut(image, outer, ANNOTATION_COLOR);
        if region.width > 2 && region.height > 2 {
            let inner = Rect::at(region.x as i32 + 1, region.y as i32 + 1)
                .of_size(region.width - 2, region.height - 2);
            draw_hollow_rect_mut(image, inner, ANNOTATION_COLOR);
        }
    }
}
