use crate::llm::{AdapterError, GeminiAdapter};
use reqwest::header::HeaderMap;
use reqwest::Url;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Translation between the chat request and a hosted provider's wire format
pub trait ProviderAdapter: Send + Sync {
    /// Provider name, also used to look up stored credentials (`<provider>ApiKey`)
    fn provider(&self) -> &str;

    /// Human-readable model name
    fn display_name(&self) -> &str;

    fn endpoint_url(&self, credential: &str) -> Result<Url, AdapterError>;

    fn build_headers(&self, credential: &str) -> HeaderMap;

    fn build_request_body(&self, message: &str, history: &str) -> serde_json::Value;

    fn extract_answer_text(&self, body: &serde_json::Value) -> Result<String, AdapterError>;
}

/// Maps model ids to hosted provider adapters. Unknown ids are local models.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: BTreeMap<String, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in hosted models
    pub fn with_defaults(gemini_base_url: &str) -> Self {
        let mut registry = Self::new();
        registry.register("gemini-api", Arc::new(GeminiAdapter::new(gemini_base_url)));
        registry
    }

    pub fn register(&mut self, model_id: &str, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(model_id.to_string(), adapter);
    }

    pub fn resolve(&self, model_id: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(model_id).cloned()
    }

    pub fn model_ids(&self) -> impl Iterator<Item = &str> {
        self.adapters.keys().map(String::as_str)
    }
}

/// One turn of a flattened transcript
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryTurn<'a> {
    pub is_user: bool,
    pub text: &'a str,
}

/// Re-parse a `"Role: text"` transcript. Entries without a role prefix or with
/// empty text are dropped; a role other than "user" counts as the model.
pub fn parse_history(history: &str) -> Vec<HistoryTurn<'_>> {
    history
        .split("\n\n")
        .filter_map(|entry| {
            let (role, text) = entry.split_once(": ")?;
            let text = text.trim();
            if role.trim().is_empty() || text.is_empty() {
                return None;
            }
            Some(HistoryTurn {
                is_user: role.trim().eq_ignore_ascii_case("user"),
                text,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_known_and_unknown_models() {
        let registry = ProviderRegistry::with_defaults("https://example.invalid/v1beta");
        assert!(registry.resolve("gemini-api").is_some());
        assert!(registry.resolve("deepseek-r1:1.5b").is_none());
        assert_eq!(registry.model_ids().collect::<Vec<_>>(), vec!["gemini-api"]);
    }

    #[test]
    fn test_parse_history() {
        let turns = parse_history("User: hello\n\nAssistant: hi: there\n\ngarbage\n\nUser:   ");
        assert_eq!(
            turns,
            vec![
                HistoryTurn {
                    is_user: true,
                    text: "hello"
                },
                HistoryTurn {
                    is_user: false,
                    text: "hi: there"
                },
            ]
        );
        assert!(parse_history("").is_empty());
    }
}
