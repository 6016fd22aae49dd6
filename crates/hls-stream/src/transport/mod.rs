//! # Transport
//!
//! The network seam of the engine. The loader only needs a single `GET` that
//! reports status, content type and a streamed body; [`HttpTransport`] is the
//! default implementation.

mod http;
pub mod proxy;

use std::pin::Pin;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};

use crate::error::TransportError;

pub use http::HttpTransport;

/// Streamed response body
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

/// Response head plus an unread body.
pub struct TransportResponse {
    pub status: u16,
    pub status_text: String,
    pub content_type: Option<String>,
    body: ByteStream,
}

impl TransportResponse {
    pub fn new(
        status: u16,
        status_text: impl Into<String>,
        content_type: Option<String>,
        body: ByteStream,
    ) -> Self {
        Self {
            status,
            status_text: status_text.into(),
            content_type,
            body,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Reads the whole body into memory.
    pub async fn bytes(self) -> Result<Bytes, TransportError> {
        let mut body = self.body;
        let mut buf = BytesMut::new();
        while let Some(chunk) = body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }

    pub fn into_stream(self) -> ByteStream {
        self.body
    }
}

impl std::fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .field("status_text", &self.status_text)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

/// Issues a `GET` for a URL.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<TransportResponse, TransportError>;
}
