//! recognize_image - run plate and vehicle-type recognition on one image file.
//!
//! Prints the result as a single JSON object on stdout, in the shape of the
//! configured reply format.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;

use autolog_capture::recognize::{GeminiClient, Recognizer, ResponseFormat};
use autolog_capture::CaptureConfig;

#[derive(Parser, Debug)]
#[command(author, version, about = "Recognize plate and vehicle type in an image")]
struct Args {
    /// Image to analyze (JPEG or PNG).
    image: PathBuf,

    /// Config file (.toml, otherwise JSON).
    #[arg(long, env = "AUTOLOG_CONFIG")]
    config: Option<PathBuf>,

    /// Reply format: text_lines or json. Overrides the config.
    #[arg(long)]
    format: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let cfg = CaptureConfig::load_from(args.config.as_deref())?;
    let format = match args.format.as_deref() {
        Some(raw) => raw.parse::<ResponseFormat>().map_err(|e| anyhow!(e))?,
        None => cfg.vision.response_format,
    };

    let bytes = std::fs::read(&args.image)
        .with_context(|| format!("read image {}", args.image.display()))?;
    let mime_type = match image::guess_format(&bytes) {
        Ok(image::ImageFormat::Png) => "image/png",
        Ok(image::ImageFormat::Jpeg) => "image/jpeg",
        Ok(other) => return Err(anyhow!("unsupported image format {:?}", other)),
        Err(err) => return Err(anyhow!("unrecognized image data: {}", err)),
    };

    let mut recognizer = Recognizer::new(GeminiClient::new(cfg.vision.gemini.clone()), format);
    let result = recognizer.recognize_as(&bytes, mime_type)?;
    println!("{}", result.to_output_json(format));
    Ok(())
}
