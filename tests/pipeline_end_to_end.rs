use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Local};
use image::{Rgb, RgbImage};

use autolog_capture::detect::DEFAULT_COOLDOWN;
use autolog_capture::storage::SqliteRecordStore;
use autolog_capture::{
    CapturePipeline, DifferencerConfig, Frame, FrameDifferencer, FrameSource, MotionGate,
    PersistenceSink, PipelineState, RecognitionError, Recognizer, ResponseFormat, SinkConfig,
    SourceStats, StopSignal, VisionModel,
};

const WIDTH: u32 = 320;
const HEIGHT: u32 = 240;

/// One scripted frame: where the blob is (if anywhere) and when it was taken.
#[derive(Clone, Copy)]
struct Shot {
    blob_x: Option<u32>,
    at_ms: u64,
}

/// Plays a fixed list of frames, then stops the pipeline.
struct ScriptedSource {
    shots: Vec<Shot>,
    next: usize,
    started: Instant,
    wall_start: DateTime<Local>,
    stop: StopSignal,
    released: Rc<RefCell<bool>>,
}

impl ScriptedSource {
    fn new(shots: Vec<Shot>, stop: StopSignal) -> Self {
        Self {
            shots,
            next: 0,
            started: Instant::now(),
            wall_start: Local::now(),
            stop,
            released: Rc::new(RefCell::new(false)),
        }
    }

    fn timestamp_of(&self, index: usize) -> DateTime<Local> {
        self.wall_start + chrono::Duration::milliseconds(self.shots[index].at_ms as i64)
    }

    fn render(shot: Shot) -> RgbImage {
        let mut img = RgbImage::from_pixel(WIDTH, HEIGHT, Rgb([60, 60, 60]));
        if let Some(x0) = shot.blob_x {
            for y in 80..170 {
                for x in x0..x0 + 100 {
                    img.put_pixel(x, y, Rgb([230, 230, 230]));
                }
            }
        }
        img
    }
}

impl FrameSource for ScriptedSource {
    fn describe(&self) -> String {
        "test://scripted".into()
    }

    fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        let Some(shot) = self.shots.get(self.next).copied() else {
            return Err(anyhow!("script exhausted"));
        };
        let index = self.next;
        self.next += 1;
        if self.next == self.shots.len() {
            self.stop.stop();
        }
        Ok(Frame::with_time(
            Self::render(shot),
            self.timestamp_of(index),
            self.started + Duration::from_millis(shot.at_ms),
        ))
    }

    fn release(&mut self) {
        *self.released.borrow_mut() = true;
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.next as u64,
            source: self.describe(),
        }
    }
}

struct ScriptedModel {
    reply: Option<&'static str>,
    calls: Rc<RefCell<u32>>,
    /// Last image sent for recognition.
    seen: Rc<RefCell<Vec<u8>>>,
}

impl VisionModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    fn generate(
        &mut self,
        _prompt: &str,
        image: &[u8],
        mime_type: &str,
    ) -> Result<String, RecognitionError> {
        assert_eq!(mime_type, "image/jpeg");
        assert_eq!(&image[..2], &[0xFF, 0xD8]);
        *self.calls.borrow_mut() += 1;
        *self.seen.borrow_mut() = image.to_vec();
        match self.reply {
            Some(text) => Ok(text.to_string()),
            None => Err(RecognitionError::Status {
                status: 503,
                body: "overloaded".into(),
            }),
        }
    }
}

#[derive(Clone, Default)]
struct SharedOutput(Rc<RefCell<Vec<u8>>>);

impl Write for SharedOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    db_path: String,
    captures_dir: std::path::PathBuf,
    calls: Rc<RefCell<u32>>,
    seen: Rc<RefCell<Vec<u8>>>,
    output: SharedOutput,
}

fn run_script(
    shots: Vec<Shot>,
    reply: Option<&'static str>,
) -> Result<(Harness, autolog_capture::PipelineReport, ScriptedSource)> {
    let dir = tempfile::tempdir()?;
    let db_path = dir.path().join("captures.db").display().to_string();
    let captures_dir = dir.path().join("captures");
    let calls = Rc::new(RefCell::new(0));
    let seen = Rc::new(RefCell::new(Vec::new()));
    let output = SharedOutput::default();

    let sink = PersistenceSink::new(SinkConfig {
        output_dir: captures_dir.clone(),
        ..SinkConfig::default()
    })
    .with_store(Box::new(SqliteRecordStore::open(&db_path)?));

    let stop = StopSignal::new();
    let mut source = ScriptedSource::new(shots, stop.clone());
    let mut pipeline = CapturePipeline::new(
        FrameDifferencer::new(DifferencerConfig::default()),
        MotionGate::new(DEFAULT_COOLDOWN),
        Recognizer::new(
            ScriptedModel {
                reply,
                calls: calls.clone(),
                seen: seen.clone(),
            },
            ResponseFormat::TextLines,
        ),
        sink,
        stop,
    )
    .with_output(Box::new(output.clone()));

    let report = pipeline.run(&mut source)?;
    assert_eq!(pipeline.state(), PipelineState::Stopped);
    Ok((
        Harness {
            _dir: dir,
            db_path,
            captures_dir,
            calls,
            seen,
            output,
        },
        report,
        source,
    ))
}

/// Frames 1-3 static, 4-6 a moving blob, 7-10 static; 100 ms apart.
fn ten_frame_script() -> Vec<Shot> {
    (0..10)
        .map(|i| Shot {
            blob_x: match i {
                3 => Some(30),
                4 => Some(90),
                5 => Some(150),
                _ => None,
            },
            at_ms: i * 100,
        })
        .collect()
}

#[test]
fn ten_frame_burst_captures_once_at_frame_four() -> Result<()> {
    let (harness, report, source) =
        run_script(ten_frame_script(), Some("Number Plate: AB12CD\nVehicle Type: Car"))?;

    assert_eq!(report.frames_processed, 10);
    assert_eq!(report.captures, 1);
    assert_eq!(report.recognition_failures, 0);
    assert_eq!(report.persistence_failures, 0);
    assert_eq!(*harness.calls.borrow(), 1);
    assert!(*source.released.borrow());

    let store = SqliteRecordStore::open(&harness.db_path)?;
    let rows = store.recent(10)?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].sequence_number, 0);
    assert_eq!(rows[0].captured_at, source.timestamp_of(3).to_rfc3339());
    assert_eq!(rows[0].license_plate.as_deref(), Some("AB12CD"));
    assert_eq!(rows[0].vehicle_type.as_deref(), Some("Car"));

    let files: Vec<_> = std::fs::read_dir(&harness.captures_dir)?
        .collect::<std::io::Result<Vec<_>>>()?;
    assert_eq!(files.len(), 1);
    let name = files[0].file_name().to_string_lossy().into_owned();
    assert!(name.starts_with("vehicle_") && name.ends_with("_0.jpg"), "{}", name);
    // The saved file is the exact JPEG the recognizer saw.
    assert_eq!(std::fs::read(files[0].path())?, *harness.seen.borrow());

    let printed = String::from_utf8(harness.output.0.borrow().clone())?;
    let line: serde_json::Value = serde_json::from_str(printed.trim())?;
    assert_eq!(
        line,
        serde_json::json!({"number_plate": "AB12CD", "vehicle_type": "Car"})
    );
    Ok(())
}

#[test]
fn static_scene_never_captures() -> Result<()> {
    let shots = (0..12).map(|i| Shot { blob_x: None, at_ms: i * 500 }).collect();
    let (harness, report, _source) = run_script(shots, Some("Number Plate: X\nVehicle Type: Car"))?;
    assert_eq!(report.captures, 0);
    assert_eq!(*harness.calls.borrow(), 0);
    assert!(!harness.captures_dir.exists());
    Ok(())
}

#[test]
fn bursts_after_cooldown_get_consecutive_sequence_numbers() -> Result<()> {
    let mut shots: Vec<Shot> = (0..4).map(|i| Shot { blob_x: None, at_ms: i * 100 }).collect();
    shots.push(Shot { blob_x: Some(40), at_ms: 400 });
    shots.push(Shot { blob_x: None, at_ms: 500 });
    shots.push(Shot { blob_x: None, at_ms: 2_000 });
    // 2.6 s after the first capture: outside the 2 s cooldown.
    shots.push(Shot { blob_x: Some(180), at_ms: 3_000 });
    shots.push(Shot { blob_x: None, at_ms: 3_100 });

    let (harness, report, _source) =
        run_script(shots, Some("Number Plate: Not detected\nVehicle Type: Truck"))?;
    assert_eq!(report.captures, 2);

    let rows = SqliteRecordStore::open(&harness.db_path)?.recent(10)?;
    let mut sequences: Vec<u64> = rows.iter().map(|r| r.sequence_number).collect();
    sequences.sort_unstable();
    assert_eq!(sequences, vec![0, 1]);
    assert!(rows.iter().all(|r| r.license_plate.is_none()));
    Ok(())
}

#[test]
fn recognition_failure_still_persists_the_frame() -> Result<()> {
    let (harness, report, _source) = run_script(ten_frame_script(), None)?;

    assert_eq!(report.captures, 1);
    assert_eq!(report.recognition_failures, 1);
    assert_eq!(report.persistence_failures, 0);
    assert!(harness.output.0.borrow().is_empty());

    let rows = SqliteRecordStore::open(&harness.db_path)?.recent(10)?;
    assert_eq!(rows.len(), 1);
    assert!(rows[0].license_plate.is_none());
    assert!(rows[0]
        .recognition_error
        .as_deref()
        .is_some_and(|e| e.contains("503")));
    assert!(std::path::Path::new(&rows[0].image_path).exists());
    Ok(())
}

/// Wraps a real source and requests a stop after `limit` frames.
struct StopAfter<S> {
    inner: S,
    limit: u64,
    served: u64,
    stop: StopSignal,
}

impl<S: FrameSource> FrameSource for StopAfter<S> {
    fn describe(&self) -> String {
        self.inner.describe()
    }

    fn connect(&mut self) -> Result<()> {
        self.inner.connect()
    }

    fn next_frame(&mut self) -> Result<Frame> {
        self.served += 1;
        if self.served >= self.limit {
            self.stop.stop();
        }
        self.inner.next_frame()
    }

    fn release(&mut self) {
        self.inner.release()
    }

    fn stats(&self) -> SourceStats {
        self.inner.stats()
    }
}

#[test]
fn synthetic_sweep_triggers_one_capture() -> Result<()> {
    use autolog_capture::ingest::SyntheticSource;
    use autolog_capture::CameraSettings;

    let dir = tempfile::tempdir()?;
    let calls = Rc::new(RefCell::new(0));
    let stop = StopSignal::new();
    let mut source = StopAfter {
        inner: SyntheticSource::new(CameraSettings {
            url: "stub://sweep".into(),
            width: 320,
            height: 240,
            target_fps: 0,
            ..CameraSettings::default()
        })?,
        limit: 12,
        served: 0,
        stop: stop.clone(),
    };

    let mut pipeline = CapturePipeline::new(
        FrameDifferencer::new(DifferencerConfig::default()),
        MotionGate::new(DEFAULT_COOLDOWN),
        Recognizer::new(
            ScriptedModel {
                reply: Some("{\"licensePlate\": \"KA01AB1234\", \"vehicleType\": \"Car\", \"confidence\": \"high\"}"),
                calls: calls.clone(),
                seen: Rc::new(RefCell::new(Vec::new())),
            },
            ResponseFormat::Json,
        ),
        PersistenceSink::new(SinkConfig {
            output_dir: dir.path().to_path_buf(),
            ..SinkConfig::default()
        }),
        stop,
    )
    .with_output(Box::new(std::io::sink()));

    let report = pipeline.run(&mut source)?;
    assert_eq!(report.frames_processed, 12);
    assert_eq!(report.captures, 1);
    assert_eq!(*calls.borrow(), 1);
    assert!(!source.inner.is_healthy());
    Ok(())
}
