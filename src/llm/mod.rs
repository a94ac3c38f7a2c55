pub mod demux;
pub mod gemini;
pub mod ollama;
pub mod provider;
pub mod streaming;
pub mod transport;
pub mod types;

#[cfg(test)]
mod tests;

pub use gemini::GeminiAdapter;
pub use ollama::OllamaClient;
pub use provider::ProviderRegistry;
pub use transport::{ChatTransport, TransportConfig};
pub use types::*;

/// Receives every event of a chat turn in order. Returning an error tells the
/// transport the consumer is gone.
pub type EventCallback = Box<dyn Fn(&ChatEvent) -> anyhow::Result<()> + Send + Sync>;
