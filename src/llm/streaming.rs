//! Chunk sources for streamed upstream responses
//!
//! The transport reads through [`ChunkStream`] so the same read loop serves
//! live HTTP bodies and scripted sources in tests.

use crate::llm::TransportError;
use async_trait::async_trait;
use reqwest::Response;

#[async_trait]
pub trait ChunkStream: Send {
    /// Next chunk of raw bytes, `None` at end of stream
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, TransportError>;
}

/// Real HTTP response chunk stream
pub struct HttpChunkStream {
    response: Response,
}

impl HttpChunkStream {
    pub fn new(response: Response) -> Self {
        Self { response }
    }
}

#[async_trait]
impl ChunkStream for HttpChunkStream {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        match self.response.chunk().await {
            Ok(Some(chunk)) => Ok(Some(chunk.to_vec())),
            Ok(None) => Ok(None),
            Err(e) => Err(TransportError::Network(format!("HTTP chunk error: {e}"))),
        }
    }
}
