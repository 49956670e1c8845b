//! Capture pipeline: the per-frame loop.
//!
//! Single-threaded and synchronous. The loop blocks on the camera, the
//! differencer compares each frame against the previous one, the gate decides,
//! and a capture runs recognition and persistence inline before the next
//! frame is read. At most one recognition call is ever in flight.

use chrono::{DateTime, Local};
use std::io::{self, BufRead, Write};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::detect::{FrameDifferencer, MotionGate, MotionRegion, MotionScore};
use crate::error::{CaptureError, RecognitionError};
use crate::frame::{Frame, GrayFrame};
use crate::ingest::FrameSource;
use crate::recognize::{Recognizer, VisionModel};
use crate::sink::PersistenceSink;

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Initializing,
    Streaming,
    Stopped,
}

/// One accepted trigger. Immutable once built.
pub struct CaptureEvent {
    frame: Frame,
    timestamp: DateTime<Local>,
    sequence_number: u64,
    score: MotionScore,
}

impl CaptureEvent {
    pub fn new(frame: Frame, sequence_number: u64, score: MotionScore) -> Self {
        Self {
            timestamp: frame.captured_at(),
            frame,
            sequence_number,
            score,
        }
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub fn timestamp(&self) -> DateTime<Local> {
        self.timestamp
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn regions(&self) -> &[MotionRegion] {
        self.score.regions()
    }

    /// Bounding-box area of the biggest region that triggered the capture.
    pub fn largest_area(&self) -> u64 {
        self.score.largest_area()
    }
}

/// Cooperative quit flag, checked before every frame read.
#[derive(Clone, Debug, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Stop on SIGINT, SIGTERM or SIGHUP (ctrlc `termination` feature). Only
    /// one handler may be installed per process.
    pub fn install_ctrlc(&self) -> anyhow::Result<()> {
        let signal = self.clone();
        ctrlc::set_handler(move || {
            log::info!("interrupt received, stopping");
            signal.stop();
        })?;
        Ok(())
    }

    /// Stop when a line reading `q` arrives on stdin. End of input leaves the
    /// flag alone so the daemon keeps running without a terminal.
    pub fn watch_stdin(&self) -> thread::JoinHandle<()> {
        let signal = self.clone();
        thread::spawn(move || signal.watch_lines(io::stdin().lock()))
    }

    fn watch_lines<R: BufRead>(&self, reader: R) {
        for line in reader.lines() {
            match line {
                Ok(line) if line.trim().eq_ignore_ascii_case("q") => {
                    log::info!("quit requested from stdin");
                    self.stop();
                    return;
                }
                Ok(_) => {}
                Err(err) => {
                    log::debug!("stdin closed: {}", err);
                    return;
                }
            }
        }
    }
}

/// Counters returned when the loop ends cleanly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineReport {
    pub frames_processed: u64,
    pub captures: u64,
    pub recognition_failures: u64,
    pub persistence_failures: u64,
    pub final_state: PipelineState,
}

impl PipelineReport {
    fn new() -> Self {
        Self {
            frames_processed: 0,
            captures: 0,
            recognition_failures: 0,
            persistence_failures: 0,
            final_state: PipelineState::Initializing,
        }
    }
}

/// Releases the wrapped source when dropped, whichever way `run` exits.
struct ReleaseGuard<'a, S: FrameSource + ?Sized> {
    source: &'a mut S,
}

impl<S: FrameSource + ?Sized> Deref for ReleaseGuard<'_, S> {
    type Target = S;

    fn deref(&self) -> &S {
        &*self.source
    }
}

impl<S: FrameSource + ?Sized> DerefMut for ReleaseGuard<'_, S> {
    fn deref_mut(&mut self) -> &mut S {
        &mut *self.source
    }
}

impl<S: FrameSource + ?Sized> Drop for ReleaseGuard<'_, S> {
    fn drop(&mut self) {
        self.source.release();
    }
}

pub struct CapturePipeline<M> {
    differencer: FrameDifferencer,
    gate: MotionGate,
    recognizer: Recognizer<M>,
    sink: PersistenceSink,
    stop: StopSignal,
    output: Box<dyn Write>,
    state: PipelineState,
    next_sequence: u64,
}

impl<M: VisionModel> CapturePipeline<M> {
    pub fn new(
        differencer: FrameDifferencer,
        gate: MotionGate,
        recognizer: Recognizer<M>,
        sink: PersistenceSink,
        stop: StopSignal,
    ) -> Self {
        Self {
            differencer,
            gate,
            recognizer,
            sink,
            stop,
            output: Box::new(io::stdout()),
            state: PipelineState::Initializing,
            next_sequence: 0,
        }
    }

    /// Where recognition results are printed, one JSON object per line.
    pub fn with_output(mut self, output: Box<dyn Write>) -> Self {
        self.output = output;
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Drive `source` until a stop is requested or the camera fails.
    ///
    /// Camera failures come back as `CameraOpen` / `FrameRead`. Recognition and
    /// persistence failures are logged per event and counted in the report.
    pub fn run<S: FrameSource + ?Sized>(
        &mut self,
        source: &mut S,
    ) -> Result<PipelineReport, CaptureError> {
        self.state = PipelineState::Initializing;
        let mut source = ReleaseGuard { source };
        let source_name = source.describe();
        let mut report = PipelineReport::new();

        log::info!("connecting to camera {}", source_name);
        if let Err(err) = source.connect() {
            self.state = PipelineState::Stopped;
            log::error!("camera {} failed to open: {:#}", source_name, err);
            return Err(CaptureError::camera_open(&source_name, &err));
        }
        self.state = PipelineState::Streaming;
        log::info!(
            "streaming from {} (cooldown {:?}, min area {} px)",
            source_name,
            self.gate.cooldown(),
            self.differencer.config().min_area
        );

        let mut previous: Option<GrayFrame> = None;
        let mut last_health_log = Instant::now();

        loop {
            if self.stop.is_stopped() {
                log::info!("stop requested");
                break;
            }

            let frame = match source.next_frame() {
                Ok(frame) => frame,
                Err(err) => {
                    self.state = PipelineState::Stopped;
                    log::error!(
                        "frame read from {} failed after {} frames, {} captures: {:#}",
                        source_name,
                        report.frames_processed,
                        report.captures,
                        err
                    );
                    return Err(CaptureError::frame_read(&source_name, &err));
                }
            };
            report.frames_processed += 1;

            let (gray, score) = self.differencer.diff(previous.as_ref(), &frame);
            previous = Some(gray);

            let now = frame.captured_instant();
            if self.gate.check(&score, now) {
                self.gate.record(now);
                let event = CaptureEvent::new(frame, self.next_sequence, score);
                self.next_sequence += 1;
                report.captures += 1;
                self.handle_event(&event, &mut report);
            }

            if last_health_log.elapsed() >= HEALTH_LOG_INTERVAL {
                let stats = source.stats();
                log::info!(
                    "camera health={} frames={} source={} captures={}",
                    source.is_healthy(),
                    stats.frames_captured,
                    stats.source,
                    report.captures
                );
                last_health_log = Instant::now();
            }
        }

        self.state = PipelineState::Stopped;
        report.final_state = self.state;
        log::info!(
            "pipeline stopped: {} frames, {} captures, {} recognition failures, {} persistence failures",
            report.frames_processed,
            report.captures,
            report.recognition_failures,
            report.persistence_failures
        );
        Ok(report)
    }

    fn handle_event(&mut self, event: &CaptureEvent, report: &mut PipelineReport) {
        let seq = event.sequence_number();
        log::info!(
            "capture #{}: motion in {} region(s), largest {} px",
            seq,
            event.regions().len(),
            event.largest_area()
        );

        // One encode serves both the vision request and the saved file.
        let jpeg = event.frame().encode_jpeg(self.sink.config().jpeg_quality);
        let outcome = match &jpeg {
            Ok(bytes) => self.recognizer.recognize(bytes),
            Err(err) => Err(RecognitionError::Encode(format!("{:#}", err))),
        };

        match &outcome {
            Ok(result) => {
                let line = result.to_output_json(self.recognizer.format());
                if let Err(err) = writeln!(self.output, "{}", line).and_then(|_| self.output.flush()) {
                    log::warn!("capture #{}: could not print result: {}", seq, err);
                }
                log::info!(
                    "capture #{}: plate={} type={}",
                    seq,
                    result.plate.as_deref().unwrap_or("-"),
                    result.vehicle_category
                );
            }
            Err(err) => {
                report.recognition_failures += 1;
                log::warn!("capture #{}: recognition failed: {}", seq, err);
            }
        }

        let stored = match (jpeg.as_deref(), outcome.as_ref()) {
            (Ok(bytes), outcome) => self.sink.store_encoded(event, bytes, outcome),
            (Err(_), Ok(result)) => self.sink.store(event, Some(result)),
            (Err(_), Err(err)) => self.sink.store_unrecognized(event, err),
        };

        match stored {
            Ok(record) => log::info!("capture #{}: saved {}", seq, record.image_path.display()),
            Err(err) => {
                report.persistence_failures += 1;
                log::error!("capture #{}: {}", seq, err);
            }
        }
    }
}
