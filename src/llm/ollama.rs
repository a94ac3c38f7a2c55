use crate::llm::TransportError;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
    options: &'a GenerateOptions,
}

/// Sampling options sent with every generate request
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct GenerateOptions {
    pub temperature: f32,
    pub num_ctx: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_predict: Option<i64>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            num_ctx: 4096,
            num_predict: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagsModel>,
}

#[derive(Debug, Deserialize)]
struct TagsModel {
    name: String,
}

/// Client for a local Ollama server
#[derive(Clone)]
pub struct OllamaClient {
    client: Client,
    base_url: String,
}

impl OllamaClient {
    pub fn default_base_url() -> String {
        "http://localhost:11434".to_string()
    }

    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn tags_url(&self) -> String {
        format!("{}/api/tags", self.base_url)
    }

    fn generate_url(&self) -> String {
        format!("{}/api/generate", self.base_url)
    }

    /// Build the single-string prompt the generate endpoint expects
    pub fn build_prompt(context: &str, message: &str) -> String {
        format!("{context}\n\nHuman: {message}\n\nAssistant:")
    }

    /// Lightweight reachability check against the tags endpoint
    pub async fn probe(&self, timeout: Duration) -> Result<(), TransportError> {
        let response = self
            .client
            .get(self.tags_url())
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TransportError::Unreachable(format!(
                "status {} from {}",
                response.status(),
                self.tags_url()
            )));
        }
        Ok(())
    }

    /// Start a streaming generation. The returned response has a success status;
    /// its body is NDJSON.
    pub async fn generate(
        &self,
        model: &str,
        prompt: String,
        options: &GenerateOptions,
    ) -> Result<Response, TransportError> {
        let request = GenerateRequest {
            model,
            prompt,
            stream: true,
            options,
        };

        debug!(
            "Sending generate request to Ollama: model '{}', {} prompt bytes",
            model,
            request.prompt.len()
        );

        let response = self
            .client
            .post(self.generate_url())
            .json(&request)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(TransportError::Rejected {
                status: status.as_u16(),
                message: error_message_from_body(&error_text),
            });
        }

        Ok(response)
    }

    /// Names of the locally installed models
    pub async fn list_models(&self, timeout: Duration) -> Result<Vec<String>, TransportError> {
        let response = self
            .client
            .get(self.tags_url())
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Rejected {
                status: status.as_u16(),
                message: "failed to list models".to_string(),
            });
        }

        let tags: TagsResponse = response
            .json()
            .await
            .map_err(|e| TransportError::Network(format!("Failed to parse model list: {e}")))?;
        Ok(tags.models.into_iter().map(|model| model.name).collect())
    }
}

/// Ollama reports failures as `{"error": "..."}`; fall back to the raw body
fn error_message_from_body(body: &str) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: String,
    }

    match serde_json::from_str::<ErrorBody>(body) {
        Ok(parsed) => parsed.error,
        Err(_) if body.trim().is_empty() => "Unknown error".to_string(),
        Err(_) => body.trim().to_string(),
    }
}
