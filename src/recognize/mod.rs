//! Plate and vehicle-type recognition through an external vision model.
//!
//! The model is a black box taking an instruction and image bytes and returning
//! text. Two reply contracts are supported, selected by [`ResponseFormat`]:
//!
//! - `TextLines`: `Number Plate: <plate>` / `Vehicle Type: <type>`. Parsing never
//!   fails; missing or malformed lines fall back to `"Not detected"` / `"unknown"`.
//! - `Json`: a single object `{licensePlate, vehicleType, confidence}`. Anything
//!   that is not such an object is a `RecognitionError::Parse`.
//!
//! No retries: one failed round trip is reported to the caller as is.

mod gemini;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::RecognitionError;

pub use gemini::{GeminiClient, GeminiConfig, DEFAULT_GEMINI_ENDPOINT, DEFAULT_GEMINI_MODEL};

pub const PLATE_NOT_DETECTED: &str = "Not detected";
pub const TYPE_UNKNOWN: &str = "unknown";
pub const JPEG_MIME: &str = "image/jpeg";

pub const TEXT_LINES_PROMPT: &str = "Analyze this vehicle image and extract the number plate and vehicle type. Return the result in the format:\nNumber Plate: <plate>\nVehicle Type: <type>";

pub const JSON_PROMPT: &str = r#"Analyze this image and identify:
1. The license plate number (if visible)
2. The vehicle type (must be one of: Bike, Car, Truck, Scooter, Others)

Return ONLY a JSON object with this format:
{
  "licensePlate": "the license plate text or null if not visible",
  "vehicleType": "one of: Bike, Car, Truck, Scooter, Others",
  "confidence": "high/medium/low"
}"#;

/// Vehicle category. The closed set is what the parking API accepts;
/// `Other` carries free text the model produced that maps to none of them.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum VehicleCategory {
    Bike,
    Car,
    Truck,
    Scooter,
    Others,
    Unknown,
    Other(String),
}

impl VehicleCategory {
    /// Map model output onto the closed set when possible.
    pub fn normalize(raw: &str) -> Self {
        let cleaned = raw.trim().trim_matches(|c| c == '"' || c == '.' || c == '*').trim();
        let key = cleaned.to_ascii_lowercase().replace(['-', ' '], "_");
        match key.as_str() {
            "" | "unknown" | "not_detected" | "none" | "null" => VehicleCategory::Unknown,
            "bike" | "motorbike" | "motorcycle" | "two_wheeler" | "bicycle" => VehicleCategory::Bike,
            "car" | "four_wheeler" | "sedan" | "suv" | "hatchback" => VehicleCategory::Car,
            "truck" | "lorry" | "pickup" | "pickup_truck" => VehicleCategory::Truck,
            "scooter" | "moped" => VehicleCategory::Scooter,
            "others" | "other" => VehicleCategory::Others,
            _ => VehicleCategory::Other(cleaned.to_string()),
        }
    }

    /// Lower-case value used by the parking API, for members of the closed set.
    pub fn api_value(&self) -> Option<&'static str> {
        match self {
            VehicleCategory::Bike => Some("bike"),
            VehicleCategory::Car => Some("car"),
            VehicleCategory::Truck => Some("truck"),
            VehicleCategory::Scooter => Some("scooter"),
            VehicleCategory::Others => Some("others"),
            VehicleCategory::Unknown | VehicleCategory::Other(_) => None,
        }
    }
}

impl fmt::Display for VehicleCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VehicleCategory::Bike => f.write_str("Bike"),
            VehicleCategory::Car => f.write_str("Car"),
            VehicleCategory::Truck => f.write_str("Truck"),
            VehicleCategory::Scooter => f.write_str("Scooter"),
            VehicleCategory::Others => f.write_str("Others"),
            VehicleCategory::Unknown => f.write_str(TYPE_UNKNOWN),
            VehicleCategory::Other(text) => f.write_str(text),
        }
    }
}

impl Serialize for VehicleCategory {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for VehicleCategory {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(VehicleCategory::normalize(&raw))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl FromStr for Confidence {
    type Err = RecognitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(Confidence::High),
            "medium" => Ok(Confidence::Medium),
            "low" => Ok(Confidence::Low),
            other => Err(RecognitionError::Parse(format!(
                "unknown confidence '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Confidence::High => "high",
            Confidence::Medium => "medium",
            Confidence::Low => "low",
        })
    }
}

/// Structured result of one recognition call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleRecognitionResult {
    pub plate: Option<String>,
    pub vehicle_category: VehicleCategory,
    pub confidence: Option<Confidence>,
}

impl VehicleRecognitionResult {
    /// JSON object printed for a capture, in the shape of the chosen reply contract.
    pub fn to_output_json(&self, format: ResponseFormat) -> Value {
        match format {
            ResponseFormat::TextLines => json!({
                "number_plate": self.plate.as_deref().unwrap_or(PLATE_NOT_DETECTED),
                "vehicle_type": self.vehicle_category.to_string(),
            }),
            ResponseFormat::Json => json!({
                "licensePlate": self.plate,
                "vehicleType": self.vehicle_category.to_string(),
                "confidence": self.confidence.map(|c| c.to_string()),
            }),
        }
    }
}

/// Which reply contract to request from the model.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    #[default]
    TextLines,
    Json,
}

impl ResponseFormat {
    pub fn prompt(self) -> &'static str {
        match self {
            ResponseFormat::TextLines => TEXT_LINES_PROMPT,
            ResponseFormat::Json => JSON_PROMPT,
        }
    }

    pub fn parse_reply(self, reply: &str) -> Result<VehicleRecognitionResult, RecognitionError> {
        match self {
            ResponseFormat::TextLines => Ok(parse_text_lines(reply).into()),
            ResponseFormat::Json => parse_json_reply(reply),
        }
    }
}

impl FromStr for ResponseFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "text" | "text_lines" | "lines" => Ok(ResponseFormat::TextLines),
            "json" => Ok(ResponseFormat::Json),
            other => Err(format!(
                "unknown response format '{}'; expected text_lines or json",
                other
            )),
        }
    }
}

/// Raw values from a text-line reply, defaults already substituted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextLinesReply {
    pub number_plate: String,
    pub vehicle_type: String,
}

/// Lenient two-line parser. Never fails.
pub fn parse_text_lines(reply: &str) -> TextLinesReply {
    let mut lines = reply.split('\n');
    let number_plate = lines
        .next()
        .and_then(value_after_separator)
        .unwrap_or_else(|| PLATE_NOT_DETECTED.to_string());
    let vehicle_type = lines
        .next()
        .and_then(value_after_separator)
        .unwrap_or_else(|| TYPE_UNKNOWN.to_string());
    TextLinesReply {
        number_plate,
        vehicle_type,
    }
}

fn value_after_separator(line: &str) -> Option<String> {
    let (_, value) = line.split_once(": ")?;
    Some(value.trim().to_string())
}

impl From<TextLinesReply> for VehicleRecognitionResult {
    fn from(reply: TextLinesReply) -> Self {
        let plate = match reply.number_plate.as_str() {
            "" | PLATE_NOT_DETECTED => None,
            value => Some(value.to_string()),
        };
        VehicleRecognitionResult {
            plate,
            vehicle_category: VehicleCategory::normalize(&reply.vehicle_type),
            confidence: None,
        }
    }
}

/// Strict JSON parser.
///
/// A surrounding markdown code fence is tolerated; the object inside must carry
/// `licensePlate` (string or null), `vehicleType` and `confidence`.
pub fn parse_json_reply(reply: &str) -> Result<VehicleRecognitionResult, RecognitionError> {
    let body = strip_code_fence(reply);
    let value: Value = serde_json::from_str(body)
        .map_err(|e| RecognitionError::Parse(format!("reply is not JSON: {}", e)))?;
    let object = value
        .as_object()
        .ok_or_else(|| RecognitionError::Parse("reply is not a JSON object".into()))?;

    let field = |name: &str| {
        object
            .get(name)
            .ok_or_else(|| RecognitionError::Parse(format!("missing field '{}'", name)))
    };

    let plate = match field("licensePlate")? {
        Value::Null => None,
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("null") {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        other => {
            return Err(RecognitionError::Parse(format!(
                "licensePlate must be a string or null, got {}",
                other
            )))
        }
    };
    let vehicle_category = match field("vehicleType")? {
        Value::String(s) => VehicleCategory::normalize(s),
        Value::Null => VehicleCategory::Unknown,
        other => {
            return Err(RecognitionError::Parse(format!(
                "vehicleType must be a string, got {}",
                other
            )))
        }
    };
    let confidence = match field("confidence")? {
        Value::Null => None,
        Value::String(s) => Some(s.parse::<Confidence>()?),
        other => {
            return Err(RecognitionError::Parse(format!(
                "confidence must be a string, got {}",
                other
            )))
        }
    };

    Ok(VehicleRecognitionResult {
        plate,
        vehicle_category,
        confidence,
    })
}

fn strip_code_fence(reply: &str) -> &str {
    let trimmed = reply.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.strip_suffix("```").unwrap_or(rest);
    rest.trim()
}

/// Text-generating vision model: instruction plus image in, free text out.
pub trait VisionModel {
    /// Identifier for logs.
    fn name(&self) -> &str;

    fn generate(
        &mut self,
        prompt: &str,
        image: &[u8],
        mime_type: &str,
    ) -> Result<String, RecognitionError>;
}

impl<M: VisionModel + ?Sized> VisionModel for Box<M> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn generate(
        &mut self,
        prompt: &str,
        image: &[u8],
        mime_type: &str,
    ) -> Result<String, RecognitionError> {
        (**self).generate(prompt, image, mime_type)
    }
}

/// Recognition adapter: owns the model client and the reply contract.
pub struct Recognizer<M> {
    model: M,
    format: ResponseFormat,
}

impl<M: VisionModel> Recognizer<M> {
    pub fn new(model: M, format: ResponseFormat) -> Self {
        Self { model, format }
    }

    pub fn format(&self) -> ResponseFormat {
        self.format
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Recognize a JPEG-encoded vehicle image.
    pub fn recognize(&mut self, image_bytes: &[u8]) -> Result<VehicleRecognitionResult, RecognitionError> {
        self.recognize_as(image_bytes, JPEG_MIME)
    }

    pub fn recognize_as(
        &mut self,
        image_bytes: &[u8],
        mime_type: &str,
    ) -> Result<VehicleRecognitionResult, RecognitionError> {
        let reply = self
            .model
            .generate(self.format.prompt(), image_bytes, mime_type)?;
        log::debug!("{} replied with {} bytes", self.model.name(), reply.len());
        self.format.parse_reply(&reply)
    }
}
