//! autologd - motion-triggered vehicle capture daemon
//!
//! This daemon:
//! 1. Reads frames from the configured camera (HTTP stream, V4L2 device or stub)
//! 2. Differences each frame against the previous one
//! 3. On motion outside the cooldown, recognizes plate and vehicle type
//! 4. Saves the frame and forwards the result to the configured record stores
//!
//! Stop with Ctrl-C, SIGTERM or by typing `q` and Enter.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use autolog_capture::{open_source, CaptureConfig, CapturePipeline, StopSignal};

#[derive(Parser, Debug)]
#[command(author, version, about = "Motion-triggered vehicle capture daemon")]
struct Args {
    /// Config file (.toml, otherwise JSON).
    #[arg(long, env = "AUTOLOG_CONFIG")]
    config: Option<PathBuf>,

    /// Camera address; overrides the config file and AUTOLOG_CAMERA_URL.
    #[arg(long)]
    camera_url: Option<String>,

    /// Do not watch stdin for `q`.
    #[arg(long, default_value_t = false)]
    no_stdin: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = CaptureConfig::load_from(args.config.as_deref())?;
    if let Some(url) = args.camera_url.as_deref() {
        cfg = cfg.with_camera_url(url)?;
    }

    let stop = StopSignal::new();
    stop.install_ctrlc()?;
    let _stdin_watcher = (!args.no_stdin).then(|| stop.watch_stdin());

    let sink = cfg.sink()?;
    log::info!(
        "autologd {} writing captures to {} (records: {})",
        env!("CARGO_PKG_VERSION"),
        cfg.output.output_dir.display(),
        if sink.store_names().is_empty() {
            "none".to_string()
        } else {
            sink.store_names().join(", ")
        }
    );
    log::info!(
        "vision model {} ({:?} replies)",
        cfg.vision.gemini.model,
        cfg.vision.response_format
    );

    let mut source = open_source(&cfg.camera)?;
    let mut pipeline = CapturePipeline::new(
        cfg.differencer(),
        cfg.gate(),
        cfg.recognizer(),
        sink,
        stop,
    );

    let report = pipeline.run(&mut source)?;
    log::info!(
        "autologd stopped after {} frames with {} captures",
        report.frames_processed,
        report.captures
    );
    Ok(())
}
