use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::detect::{DifferencerConfig, FrameDifferencer, MotionGate, DEFAULT_COOLDOWN};
use crate::error::CaptureError;
use crate::ingest::CameraSettings;
use crate::recognize::{GeminiClient, GeminiConfig, Recognizer, ResponseFormat};
use crate::sink::{PersistenceSink, SinkConfig};
use crate::storage::{GateRole, ParkingApiStore, SqliteRecordStore};

const DEFAULT_API_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CaptureConfigFile {
    camera: Option<CameraConfigFile>,
    motion: Option<MotionConfigFile>,
    vision: Option<VisionConfigFile>,
    output: Option<OutputConfigFile>,
    records: Option<RecordsConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CameraConfigFile {
    url: Option<String>,
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
    connect_timeout_secs: Option<u64>,
    read_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct MotionConfigFile {
    min_area: Option<u64>,
    threshold: Option<u8>,
    blur_sigma: Option<f32>,
    dilate_iterations: Option<u8>,
    cooldown_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct VisionConfigFile {
    api_key: Option<String>,
    model: Option<String>,
    endpoint: Option<String>,
    response_format: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct OutputConfigFile {
    dir: Option<PathBuf>,
    jpeg_quality: Option<u8>,
    annotate: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RecordsConfigFile {
    db_path: Option<String>,
    api_base_url: Option<String>,
    gate_role: Option<String>,
    require_record: Option<bool>,
    api_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct MotionSettings {
    pub differencer: DifferencerConfig,
    pub cooldown: Duration,
}

#[derive(Debug, Clone)]
pub struct VisionSettings {
    pub gemini: GeminiConfig,
    pub response_format: ResponseFormat,
}

#[derive(Debug, Clone)]
pub struct RecordSettings {
    /// Local SQLite capture log. Disabled when unset.
    pub db_path: Option<String>,
    /// Parking API base URL. Disabled when unset.
    pub api_base_url: Option<String>,
    pub gate_role: GateRole,
    pub api_timeout: Duration,
}

/// Process configuration, built once at startup and passed to constructors.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub camera: CameraSettings,
    pub motion: MotionSettings,
    pub vision: VisionSettings,
    pub output: SinkConfig,
    pub records: RecordSettings,
}

impl CaptureConfig {
    /// Load from `$AUTOLOG_CONFIG` (if set), then environment overrides.
    pub fn load() -> Result<Self, CaptureError> {
        let path = std::env::var("AUTOLOG_CONFIG").ok().map(PathBuf::from);
        Self::load_from(path.as_deref())
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self, CaptureError> {
        Self::try_load(path).map_err(|e| CaptureError::Config(format!("{:#}", e)))
    }

    fn try_load(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => CaptureConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: CaptureConfigFile) -> Result<Self> {
        let camera_defaults = CameraSettings::default();
        let camera_file = file.camera.unwrap_or_default();
        let camera = CameraSettings {
            url: camera_file.url.unwrap_or(camera_defaults.url),
            target_fps: camera_file.target_fps.unwrap_or(camera_defaults.target_fps),
            width: camera_file.width.unwrap_or(camera_defaults.width),
            height: camera_file.height.unwrap_or(camera_defaults.height),
            connect_timeout: camera_file
                .connect_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(camera_defaults.connect_timeout),
            read_timeout: camera_file
                .read_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(camera_defaults.read_timeout),
        };

        let diff_defaults = DifferencerConfig::default();
        let motion_file = file.motion.unwrap_or_default();
        let motion = MotionSettings {
            differencer: DifferencerConfig {
                blur_sigma: motion_file.blur_sigma.unwrap_or(diff_defaults.blur_sigma),
                threshold: motion_file.threshold.unwrap_or(diff_defaults.threshold),
                dilate_iterations: motion_file
                    .dilate_iterations
                    .unwrap_or(diff_defaults.dilate_iterations),
                min_area: motion_file.min_area.unwrap_or(diff_defaults.min_area),
            },
            cooldown: motion_file
                .cooldown_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_COOLDOWN),
        };

        let gemini_defaults = GeminiConfig::default();
        let vision_file = file.vision.unwrap_or_default();
        let response_format = match vision_file.response_format.as_deref() {
            Some(raw) => ResponseFormat::from_str(raw).map_err(|e| anyhow!(e))?,
            None => ResponseFormat::default(),
        };
        let vision = VisionSettings {
            gemini: GeminiConfig {
                api_key: vision_file.api_key.unwrap_or_default(),
                model: vision_file.model.unwrap_or(gemini_defaults.model),
                endpoint: vision_file.endpoint.unwrap_or(gemini_defaults.endpoint),
                timeout: vision_file
                    .timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(gemini_defaults.timeout),
            },
            response_format,
        };

        let sink_defaults = SinkConfig::default();
        let output_file = file.output.unwrap_or_default();
        let records_file = file.records.unwrap_or_default();
        let output = SinkConfig {
            output_dir: output_file.dir.unwrap_or(sink_defaults.output_dir),
            jpeg_quality: output_file.jpeg_quality.unwrap_or(sink_defaults.jpeg_quality),
            annotate: output_file.annotate.unwrap_or(sink_defaults.annotate),
            require_record: records_file
                .require_record
                .unwrap_or(sink_defaults.require_record),
        };

        let gate_role = match records_file.gate_role.as_deref() {
            Some(raw) => GateRole::from_str(raw).map_err(|e| anyhow!(e))?,
            None => GateRole::default(),
        };
        let records = RecordSettings {
            db_path: records_file.db_path,
            api_base_url: records_file.api_base_url,
            gate_role,
            api_timeout: Duration::from_secs(
                records_file
                    .api_timeout_secs
                    .unwrap_or(DEFAULT_API_TIMEOUT_SECS),
            ),
        };

        Ok(Self {
            camera,
            motion,
            vision,
            output,
            records,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(url) = env_string("AUTOLOG_CAMERA_URL") {
            self.camera.url = url;
        }
        if let Some(key) = env_string("GOOGLE_API_KEY") {
            self.vision.gemini.api_key = key;
        }
        if let Some(model) = env_string("AUTOLOG_VISION_MODEL") {
            self.vision.gemini.model = model;
        }
        if let Some(format) = env_string("AUTOLOG_RESPONSE_FORMAT") {
            self.vision.response_format = format
                .parse()
                .map_err(|e: String| anyhow!("AUTOLOG_RESPONSE_FORMAT: {}", e))?;
        }
        if let Some(dir) = env_string("AUTOLOG_OUTPUT_DIR") {
            self.output.output_dir = PathBuf::from(dir);
        }
        if let Some(ms) = env_string("AUTOLOG_COOLDOWN_MS") {
            let ms: u64 = ms
                .parse()
                .map_err(|_| anyhow!("AUTOLOG_COOLDOWN_MS must be an integer number of milliseconds"))?;
            self.motion.cooldown = Duration::from_millis(ms);
        }
        if let Some(area) = env_string("AUTOLOG_MIN_AREA") {
            self.motion.differencer.min_area = area
                .parse()
                .map_err(|_| anyhow!("AUTOLOG_MIN_AREA must be an integer pixel area"))?;
        }
        if let Some(path) = env_string("AUTOLOG_DB_PATH") {
            self.records.db_path = Some(path);
        }
        if let Some(url) = env_string("AUTOLOG_API_URL") {
            self.records.api_base_url = Some(url);
        }
        if let Some(role) = env_string("AUTOLOG_GATE_ROLE") {
            self.records.gate_role = role
                .parse()
                .map_err(|e: String| anyhow!("AUTOLOG_GATE_ROLE: {}", e))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.camera.url.trim().is_empty() {
            return Err(anyhow!("camera url must not be empty"));
        }
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(anyhow!("camera width and height must be greater than zero"));
        }
        let motion = &self.motion.differencer;
        if !(motion.blur_sigma.is_finite() && motion.blur_sigma > 0.0) {
            return Err(anyhow!("motion.blur_sigma must be a positive number"));
        }
        if motion.min_area == 0 {
            return Err(anyhow!("motion.min_area must be greater than zero"));
        }
        if self.vision.gemini.api_key.trim().is_empty() {
            return Err(anyhow!(
                "vision api key missing: set GOOGLE_API_KEY or vision.api_key"
            ));
        }
        if self.vision.gemini.model.trim().is_empty() {
            return Err(anyhow!("vision.model must not be empty"));
        }
        if !(1..=100).contains(&self.output.jpeg_quality) {
            return Err(anyhow!("output.jpeg_quality must be between 1 and 100"));
        }
        if let Some(url) = &self.records.api_base_url {
            let parsed = url::Url::parse(url).with_context(|| format!("records.api_base_url {}", url))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(anyhow!("records.api_base_url must be http or https"));
            }
        }
        if self.output.require_record
            && self.records.db_path.is_none()
            && self.records.api_base_url.is_none()
        {
            return Err(anyhow!(
                "records.require_record is set but no record store is configured"
            ));
        }
        Ok(())
    }

    /// Override the camera address after loading (command-line flag).
    pub fn with_camera_url(mut self, url: &str) -> Result<Self, CaptureError> {
        if url.trim().is_empty() {
            return Err(CaptureError::Config("camera url must not be empty".into()));
        }
        self.camera.url = url.to_string();
        Ok(self)
    }

    pub fn differencer(&self) -> FrameDifferencer {
        FrameDifferencer::new(self.motion.differencer.clone())
    }

    pub fn gate(&self) -> MotionGate {
        MotionGate::new(self.motion.cooldown)
    }

    pub fn recognizer(&self) -> Recognizer<GeminiClient> {
        Recognizer::new(
            GeminiClient::new(self.vision.gemini.clone()),
            self.vision.response_format,
        )
    }

    /// Persistence sink with every configured record store attached.
    pub fn sink(&self) -> Result<PersistenceSink> {
        let mut sink = PersistenceSink::new(self.output.clone());
        if let Some(path) = &self.records.db_path {
            sink = sink.with_store(Box::new(SqliteRecordStore::open(path)?));
        }
        if let Some(url) = &self.records.api_base_url {
            sink = sink.with_store(Box::new(ParkingApiStore::new(
                url,
                self.records.gate_role,
                self.records.api_timeout,
            )?));
        }
        Ok(sink)
    }
}

fn read_config_file(path: &Path) -> Result<CaptureConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
