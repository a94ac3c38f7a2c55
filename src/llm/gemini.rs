use crate::llm::provider::{parse_history, ProviderAdapter};
use crate::llm::AdapterError;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Url;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiMessage>,
}

#[derive(Debug, Serialize)]
struct GeminiMessage {
    parts: Vec<GeminiPart>,
    role: &'static str,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Option<Vec<GeminiCandidate>>,
    #[serde(default)]
    error: Option<GeminiError>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Option<Vec<GeminiPart>>,
}

#[derive(Debug, Deserialize)]
struct GeminiError {
    #[serde(default)]
    message: Option<String>,
}

/// Google Gemini `generateContent` adapter
pub struct GeminiAdapter {
    base_url: String,
    model: String,
}

impl GeminiAdapter {
    pub fn default_base_url() -> String {
        "https://generativelanguage.googleapis.com/v1beta".to_string()
    }

    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: "gemini-2.0-flash".to_string(),
        }
    }
}

impl ProviderAdapter for GeminiAdapter {
    fn provider(&self) -> &str {
        "gemini"
    }

    fn display_name(&self) -> &str {
        "Gemini Pro"
    }

    fn endpoint_url(&self, credential: &str) -> Result<Url, AdapterError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        Url::parse_with_params(&url, &[("key", credential)])
            .map_err(|e| AdapterError::Provider(format!("Invalid endpoint URL '{url}': {e}")))
    }

    fn build_headers(&self, _credential: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers
    }

    fn build_request_body(&self, message: &str, history: &str) -> serde_json::Value {
        let mut contents: Vec<GeminiMessage> = parse_history(history)
            .into_iter()
            .map(|turn| GeminiMessage {
                parts: vec![GeminiPart {
                    text: Some(turn.text.to_string()),
                }],
                role: if turn.is_user { "user" } else { "model" },
            })
            .collect();

        contents.push(GeminiMessage {
            parts: vec![GeminiPart {
                text: Some(message.to_string()),
            }],
            role: "user",
        });

        serde_json::to_value(GeminiRequest { contents }).unwrap_or_default()
    }

    fn extract_answer_text(&self, body: &serde_json::Value) -> Result<String, AdapterError> {
        let response: GeminiResponse = serde_json::from_value(body.clone())
            .map_err(|e| AdapterError::MalformedResponse(e.to_string()))?;

        if let Some(error) = response.error {
            return Err(AdapterError::Provider(
                error
                    .message
                    .unwrap_or_else(|| "Unknown API error".to_string()),
            ));
        }

        let text = response
            .candidates
            .and_then(|candidates| candidates.into_iter().next())
            .and_then(|candidate| candidate.content)
            .and_then(|content| content.parts)
            .and_then(|parts| parts.into_iter().next())
            .and_then(|part| part.text)
            .ok_or_else(|| {
                AdapterError::MalformedResponse("no candidate text in Gemini response".to_string())
            })?;

        let text = text.trim();
        if text.is_empty() {
            return Err(AdapterError::EmptyAnswer);
        }
        Ok(text.to_string())
    }
}
