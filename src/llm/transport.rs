//! Chat transport: routes a chat request to the local model server or a hosted
//! provider and relays demultiplexed snapshots to the caller.
//!
//! Every turn ends in exactly one terminal event (`done: true`), except when the
//! caller cancels. After a cancel nothing further is emitted.

use crate::llm::demux::{parse_line, EmissionGate, LineBuffer, ParsedLine, SkipReason, ThinkDemux};
use crate::llm::ollama::{GenerateOptions, OllamaClient};
use crate::llm::provider::{ProviderAdapter, ProviderRegistry};
use crate::llm::streaming::{ChunkStream, HttpChunkStream};
use crate::llm::{
    AdapterError, ChatEvent, ChatRequest, EventCallback, ModelInfo, Snapshot, TransportError,
    TurnOutcome,
};
use reqwest::Client;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use unicode_segmentation::UnicodeSegmentation;

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Model used when the request does not name one
    pub default_model: String,
    pub ollama_base_url: String,
    pub options: GenerateOptions,
    pub probe_timeout: Duration,
    /// Overall limit for one turn
    pub request_timeout: Duration,
    /// Limit between two chunks of a local stream
    pub idle_timeout: Duration,
    /// Minimum interval between progress events
    pub emit_interval: Duration,
    /// Pacing of the synthetic stream for hosted models
    pub word_delay: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            default_model: "deepseek-r1:1.5b".to_string(),
            ollama_base_url: OllamaClient::default_base_url(),
            options: GenerateOptions::default(),
            probe_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(300),
            idle_timeout: Duration::from_secs(30),
            emit_interval: Duration::from_millis(50),
            word_delay: Duration::from_millis(20),
        }
    }
}

enum LineFlow {
    Continue,
    Done,
    Cancelled,
    Failed(TransportError),
}

pub struct ChatTransport {
    client: Client,
    ollama: OllamaClient,
    registry: ProviderRegistry,
    config: TransportConfig,
    // Provider name -> credential used when a request carries none
    fallback_credentials: HashMap<String, String>,
}

impl ChatTransport {
    pub fn new(config: TransportConfig, registry: ProviderRegistry) -> Self {
        let client = Client::new();
        Self {
            ollama: OllamaClient::new(client.clone(), &config.ollama_base_url),
            client,
            registry,
            config,
            fallback_credentials: HashMap::new(),
        }
    }

    pub fn with_fallback_credential(mut self, provider: &str, credential: String) -> Self {
        self.fallback_credentials
            .insert(provider.to_string(), credential);
        self
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Local models first, then the hosted ones. An unreachable local server only
    /// removes the local entries.
    pub async fn list_models(&self) -> Vec<ModelInfo> {
        let mut models = match self.ollama.list_models(self.config.probe_timeout).await {
            Ok(names) => names
                .into_iter()
                .map(|name| ModelInfo {
                    id: name.clone(),
                    name,
                    hosted: false,
                })
                .collect(),
            Err(e) => {
                warn!("Could not list local models: {}", e);
                Vec::new()
            }
        };

        for id in self.registry.model_ids() {
            if let Some(adapter) = self.registry.resolve(id) {
                models.push(ModelInfo {
                    id: id.to_string(),
                    name: adapter.display_name().to_string(),
                    hosted: true,
                });
            }
        }
        models
    }

    /// Whether the local model server answers the probe
    pub async fn local_server_reachable(&self) -> bool {
        match self.ollama.probe(self.config.probe_timeout).await {
            Ok(()) => true,
            Err(e) => {
                debug!("Health probe failed: {}", e);
                false
            }
        }
    }

    /// Run one chat turn, reporting progress through `callback`.
    ///
    /// A callback error is treated like a cancel: the consumer is gone.
    pub async fn send(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
        callback: &EventCallback,
    ) -> TurnOutcome {
        let model = match request.model.trim() {
            "" => self.config.default_model.as_str(),
            model => model,
        };

        match self.registry.resolve(model) {
            Some(adapter) => {
                info!("Sending chat turn to hosted model '{}'", model);
                self.send_hosted(adapter.as_ref(), request, cancel, callback)
                    .await
            }
            None => {
                info!("Sending chat turn to local model '{}'", model);
                self.send_local(model, request, cancel, callback).await
            }
        }
    }

    fn fail(error: TransportError, partial: Snapshot, callback: &EventCallback) -> TurnOutcome {
        warn!("Chat turn failed: {}", error);
        if let Err(e) = callback(&ChatEvent::failed(&error, &partial)) {
            debug!("Could not deliver failure event: {}", e);
        }
        TurnOutcome::Failed { error, partial }
    }

    async fn send_local(
        &self,
        model: &str,
        request: &ChatRequest,
        cancel: &CancellationToken,
        callback: &EventCallback,
    ) -> TurnOutcome {
        let probe = tokio::select! {
            biased;
            _ = cancel.cancelled() => return TurnOutcome::Cancelled(Snapshot::default()),
            result = self.ollama.probe(self.config.probe_timeout) => result,
        };
        if let Err(error) = probe {
            return Self::fail(error, Snapshot::default(), callback);
        }

        let deadline = Instant::now() + self.config.request_timeout;
        let prompt = OllamaClient::build_prompt(&request.context, &request.message);

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return TurnOutcome::Cancelled(Snapshot::default()),
            _ = tokio::time::sleep_until(deadline) => {
                return Self::fail(
                    TransportError::TimedOut(self.config.request_timeout),
                    Snapshot::default(),
                    callback,
                );
            }
            result = self.ollama.generate(model, prompt, &self.config.options) => result,
        };

        match response {
            Ok(response) => {
                let mut chunks = HttpChunkStream::new(response);
                self.pump(&mut chunks, deadline, cancel, callback).await
            }
            Err(error) => Self::fail(error, Snapshot::default(), callback),
        }
    }

    /// Read loop: fold every chunk into the demultiplexer and emit throttled snapshots
    pub(crate) async fn pump(
        &self,
        chunks: &mut dyn ChunkStream,
        deadline: Instant,
        cancel: &CancellationToken,
        callback: &EventCallback,
    ) -> TurnOutcome {
        let mut demux = ThinkDemux::new();
        let mut lines = LineBuffer::new();
        let mut gate = EmissionGate::new(self.config.emit_interval);
        let idle = self.config.idle_timeout;
        let mut idle_deadline = Instant::now() + idle;

        'read: loop {
            let flush_at = gate.flush_at();
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return TurnOutcome::Cancelled(demux.snapshot()),
                _ = tokio::time::sleep_until(deadline) => {
                    return Self::fail(
                        TransportError::TimedOut(self.config.request_timeout),
                        demux.finish(),
                        callback,
                    );
                }
                // Held-back text becomes visible even if upstream goes quiet
                _ = tokio::time::sleep_until(flush_at.unwrap_or(deadline)), if flush_at.is_some() => {
                    if gate.ready(Instant::now()) {
                        let event = ChatEvent::progress(&demux.snapshot(), demux.is_thinking());
                        if let Err(e) = callback(&event) {
                            debug!("Consumer went away: {}", e);
                            return TurnOutcome::Cancelled(demux.snapshot());
                        }
                    }
                    continue;
                }
                next = tokio::time::timeout_at(idle_deadline, chunks.next_chunk()) => next,
            };
            idle_deadline = Instant::now() + idle;

            let chunk = match next {
                Err(_) => return Self::fail(TransportError::Stalled(idle), demux.finish(), callback),
                Ok(Err(error)) => return Self::fail(error, demux.finish(), callback),
                Ok(Ok(None)) => break,
                Ok(Ok(Some(chunk))) => chunk,
            };

            for line in lines.push(&chunk) {
                match Self::handle_line(&line, &mut demux, &mut gate, cancel, callback) {
                    LineFlow::Continue => {}
                    LineFlow::Done => break 'read,
                    LineFlow::Cancelled => return TurnOutcome::Cancelled(demux.snapshot()),
                    LineFlow::Failed(error) => return Self::fail(error, demux.finish(), callback),
                }
            }
        }

        if let Some(line) = lines.flush() {
            match Self::handle_line(&line, &mut demux, &mut gate, cancel, callback) {
                LineFlow::Continue | LineFlow::Done => {}
                LineFlow::Cancelled => return TurnOutcome::Cancelled(demux.snapshot()),
                LineFlow::Failed(error) => return Self::fail(error, demux.finish(), callback),
            }
        }

        let snapshot = demux.finish();
        if let Err(e) = callback(&ChatEvent::finished(&snapshot)) {
            debug!("Could not deliver final event: {}", e);
        }
        TurnOutcome::Completed(snapshot)
    }

    fn handle_line(
        line: &[u8],
        demux: &mut ThinkDemux,
        gate: &mut EmissionGate,
        cancel: &CancellationToken,
        callback: &EventCallback,
    ) -> LineFlow {
        if cancel.is_cancelled() {
            return LineFlow::Cancelled;
        }

        match parse_line(line) {
            ParsedLine::Skip(SkipReason::Blank) => LineFlow::Continue,
            ParsedLine::Skip(reason) => {
                warn!("Skipping stream line: {:?}", reason);
                trace!("Skipped line: '{}'", String::from_utf8_lossy(line));
                LineFlow::Continue
            }
            ParsedLine::UpstreamError(message) => {
                LineFlow::Failed(TransportError::Upstream(message))
            }
            ParsedLine::Fragment { text, done } => {
                trace!("Received fragment '{}'", text);
                demux.push(&text);
                if done {
                    return LineFlow::Done;
                }
                if gate.ready(Instant::now()) {
                    let event = ChatEvent::progress(&demux.snapshot(), demux.is_thinking());
                    if let Err(e) = callback(&event) {
                        debug!("Consumer went away: {}", e);
                        return LineFlow::Cancelled;
                    }
                }
                LineFlow::Continue
            }
        }
    }

    async fn send_hosted(
        &self,
        adapter: &dyn ProviderAdapter,
        request: &ChatRequest,
        cancel: &CancellationToken,
        callback: &EventCallback,
    ) -> TurnOutcome {
        let credential = request
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(str::to_string)
            .or_else(|| self.fallback_credentials.get(adapter.provider()).cloned());

        let Some(credential) = credential else {
            return Self::fail(
                TransportError::MissingCredential(adapter.provider().to_string()),
                Snapshot::default(),
                callback,
            );
        };

        let answer = tokio::select! {
            biased;
            _ = cancel.cancelled() => return TurnOutcome::Cancelled(Snapshot::default()),
            result = self.fetch_hosted_answer(adapter, &credential, request) => result,
        };

        match answer {
            Ok(answer) => self.replay_words(&answer, cancel, callback).await,
            Err(error) => Self::fail(error, Snapshot::default(), callback),
        }
    }

    async fn fetch_hosted_answer(
        &self,
        adapter: &dyn ProviderAdapter,
        credential: &str,
        request: &ChatRequest,
    ) -> Result<String, TransportError> {
        let url = adapter.endpoint_url(credential)?;
        let body = adapter.build_request_body(&request.message, &request.context);

        trace!(
            "Sending {} request:\n{}",
            adapter.provider(),
            serde_json::to_string_pretty(&body).unwrap_or_default()
        );

        let response = self
            .client
            .post(url)
            .headers(adapter.build_headers(credential))
            .json(&body)
            .timeout(self.config.request_timeout)
            .send()
            .await
            .map_err(|e| self.classify_reqwest_error(e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| self.classify_reqwest_error(e))?;
        let parsed = serde_json::from_str::<serde_json::Value>(&text).ok();

        if !status.is_success() {
            let message = parsed
                .as_ref()
                .and_then(|body| match adapter.extract_answer_text(body) {
                    Err(AdapterError::Provider(message)) => Some(message),
                    _ => None,
                })
                .unwrap_or_else(|| match text.trim() {
                    "" => status.canonical_reason().unwrap_or("Unknown error").to_string(),
                    body => body.to_string(),
                });
            return Err(TransportError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let body = parsed.ok_or_else(|| {
            AdapterError::MalformedResponse("response body is not JSON".to_string())
        })?;
        Ok(adapter.extract_answer_text(&body)?)
    }

    fn classify_reqwest_error(&self, error: reqwest::Error) -> TransportError {
        if error.is_timeout() {
            TransportError::TimedOut(self.config.request_timeout)
        } else {
            // Strip the URL, it carries the credential for some providers
            TransportError::Network(error.without_url().to_string())
        }
    }

    /// Re-chunk a complete answer into a paced word-by-word stream
    async fn replay_words(
        &self,
        answer: &str,
        cancel: &CancellationToken,
        callback: &EventCallback,
    ) -> TurnOutcome {
        let mut snapshot = Snapshot::default();

        for piece in word_pieces(answer) {
            if cancel.is_cancelled() {
                return TurnOutcome::Cancelled(snapshot);
            }
            snapshot.response.push_str(piece);
            if let Err(e) = callback(&ChatEvent::progress(&snapshot, false)) {
                debug!("Consumer went away: {}", e);
                return TurnOutcome::Cancelled(snapshot);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return TurnOutcome::Cancelled(snapshot),
                _ = tokio::time::sleep(self.config.word_delay) => {}
            }
        }

        if let Err(e) = callback(&ChatEvent::finished(&snapshot)) {
            debug!("Could not deliver final event: {}", e);
        }
        TurnOutcome::Completed(snapshot)
    }
}

/// Split text into words, each carrying the whitespace that follows it
fn word_pieces(text: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    // End of the whitespace run following the last word
    let mut end = 0;
    let mut seen_word = false;

    for (index, segment) in text.split_word_bound_indices() {
        if segment.chars().all(char::is_whitespace) {
            if seen_word {
                end = index + segment.len();
            }
        } else {
            if end > start {
                pieces.push(&text[start..end]);
                start = end;
            }
            seen_word = true;
        }
    }

    if start < text.len() {
        pieces.push(&text[start..]);
    }
    pieces
}
