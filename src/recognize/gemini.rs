use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::VisionModel;
use crate::error::RecognitionError;

pub const DEFAULT_GEMINI_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-1.5-flash";

/// Longest error body kept in a `RecognitionError::Status`.
const MAX_ERROR_BODY: usize = 512;

#[derive(Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    /// Base URL of the REST API, without the `/models/...` suffix.
    pub endpoint: String,
    pub timeout: Duration,
}

impl std::fmt::Debug for GeminiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiConfig")
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("endpoint", &self.endpoint)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: DEFAULT_GEMINI_MODEL.to_string(),
            endpoint: DEFAULT_GEMINI_ENDPOINT.to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Blocking client for the Gemini `generateContent` endpoint.
pub struct GeminiClient {
    config: GeminiConfig,
    agent: ureq::Agent,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(config.timeout).build();
        Self { config, agent }
    }

    fn url(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.config.endpoint.trim_end_matches('/'),
            self.config.model
        )
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: [Content<'a>; 1],
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: [Part<'a>; 2],
}

#[derive(Serialize)]
#[serde(untagged)]
enum Part<'a> {
    Text {
        text: &'a str,
    },
    InlineData {
        inline_data: InlineData<'a>,
    },
}

#[derive(Serialize)]
struct InlineData<'a> {
    mime_type: &'a str,
    data: String,
}

#[derive(Serialize)]
struct GenerationConfig {
    temperature: f32,
}

#[derive(Deserialize, Debug)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize, Debug)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize, Debug)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize, Debug)]
struct CandidatePart {
    text: Option<String>,
}

fn build_request<'a>(prompt: &'a str, image: &[u8], mime_type: &'a str) -> GenerateRequest<'a> {
    GenerateRequest {
        contents: [Content {
            parts: [
                Part::Text { text: prompt },
                Part::InlineData {
                    inline_data: InlineData {
                        mime_type,
                        data: BASE64.encode(image),
                    },
                },
            ],
        }],
        generation_config: GenerationConfig { temperature: 0.0 },
    }
}

/// Concatenated text parts of the first candidate.
fn reply_text(body: &str) -> Result<String, RecognitionError> {
    let response: GenerateResponse = serde_json::from_str(body)
        .map_err(|e| RecognitionError::Parse(format!("vision response body: {}", e)))?;
    let text: String = response
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter_map(|p| p.text)
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();
    if text.trim().is_empty() {
        return Err(RecognitionError::EmptyReply);
    }
    Ok(text)
}

impl VisionModel for GeminiClient {
    fn name(&self) -> &str {
        &self.config.model
    }

    fn generate(
        &mut self,
        prompt: &str,
        image: &[u8],
        mime_type: &str,
    ) -> Result<String, RecognitionError> {
        let body = serde_json::to_string(&build_request(prompt, image, mime_type))
            .map_err(|e| RecognitionError::Encode(e.to_string()))?;

        let response = self
            .agent
            .post(&self.url())
            .set("Content-Type", "application/json")
            .set("x-goog-api-key", &self.config.api_key)
            .send_string(&body);

        let response = match response {
            Ok(response) => response,
            Err(ureq::Error::Status(status, response)) => {
                let mut body = response.into_string().unwrap_or_default();
                if body.len() > MAX_ERROR_BODY {
                    let mut cut = MAX_ERROR_BODY;
                    while !body.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    body.truncate(cut);
                }
                return Err(RecognitionError::Status { status, body });
            }
            Err(ureq::Error::Transport(transport)) => {
                return Err(RecognitionError::Transport(transport.to_string()));
            }
        };

        let text = response
            .into_string()
            .map_err(|e| RecognitionError::Transport(format!("read vision response: {}", e)))?;
        reply_text(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn request_carries_prompt_and_base64_image() {
        let request = build_request("describe", b"\xFF\xD8jpeg", "image/jpeg");
        let value: Value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({
                "contents": [{
                    "parts": [
                        {"text": "describe"},
                        {"inline_data": {"mime_type": "image/jpeg", "data": "/9hqcGVn"}}
                    ]
                }],
                "generationConfig": {"temperature": 0.0}
            })
        );
    }

    #[test]
    fn reply_text_joins_parts_of_first_candidate() {
        let body = r#"{"candidates":[{"content":{"parts":[{"text":"Number Plate: AB12CD\n"},{"text":"Vehicle Type: Car"}]}},{"content":{"parts":[{"text":"ignored"}]}}]}"#;
        assert_eq!(reply_text(body).unwrap(), "Number Plate: AB12CD\nVehicle Type: Car");
    }

    #[test]
    fn reply_without_text_is_empty_reply() {
        assert!(matches!(reply_text(r#"{"candidates":[]}"#), Err(RecognitionError::EmptyReply)));
        assert!(matches!(
            reply_text(r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#),
            Err(RecognitionError::EmptyReply)
        ));
        assert!(matches!(reply_text("<html>"), Err(RecognitionError::Parse(_))));
    }

    #[test]
    fn url_joins_endpoint_and_model() {
        let client = GeminiClient::new(GeminiConfig {
            endpoint: "http://localhost:9000/v1beta/".into(),
            ..GeminiConfig::default()
        });
        assert_eq!(
            client.url(),
            "http://localhost:9000/v1beta/models/gemini-1.5-flash:generateContent"
        );
    }

    #[test]
    fn unreachable_service_is_a_transport_error() {
        let mut client = GeminiClient::new(GeminiConfig {
            endpoint: "http://127.0.0.1:9".into(),
            timeout: Duration::from_secs(2),
            ..GeminiConfig::default()
        });
        assert!(matches!(
            client.generate("prompt", b"jpeg", "image/jpeg"),
            Err(RecognitionError::Transport(_))
        ));
    }
}
