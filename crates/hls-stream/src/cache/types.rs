//! # Cache Types
//!
//! Values produced by the loader and held by the cache.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::transport::ByteStream;

/// Body of a loaded resource.
#[derive(Debug, Clone)]
pub enum Payload {
    /// Decoded text (manifests, session data).
    Text(Arc<str>),
    /// Fully buffered binary body (segments, keys, init maps).
    Binary(Bytes),
    /// Unbuffered response body, handed over as-is.
    Raw(RawBody),
}

impl Payload {
    /// Accounted size in bytes, or `None` for bodies that cannot be cached.
    ///
    /// Text counts two bytes per UTF-16 code unit.
    pub fn weight(&self) -> Option<u64> {
        match self {
            Payload::Text(text) => Some(text.encode_utf16().count() as u64 * 2),
            Payload::Binary(bytes) => Some(bytes.len() as u64),
            Payload::Raw(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Payload::Binary(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Buffered content as bytes. `None` for raw bodies.
    pub fn to_bytes(&self) -> Option<Bytes> {
        match self {
            Payload::Text(text) => Some(Bytes::copy_from_slice(text.as_bytes())),
            Payload::Binary(bytes) => Some(bytes.clone()),
            Payload::Raw(_) => None,
        }
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, Payload::Raw(_))
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(Arc::from(text))
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(Arc::from(text))
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Payload::Binary(bytes)
    }
}

/// A response body that has not been buffered.
///
/// Clones share the same underlying stream, which can be taken exactly once.
#[derive(Clone)]
pub struct RawBody {
    stream: Arc<Mutex<Option<ByteStream>>>,
}

impl RawBody {
    pub fn new(stream: ByteStream) -> Self {
        Self {
            stream: Arc::new(Mutex::new(Some(stream))),
        }
    }

    /// Takes the body stream. Returns `None` once another holder took it.
    pub fn take(&self) -> Option<ByteStream> {
        self.stream.lock().take()
    }

    pub fn is_taken(&self) -> bool {
        self.stream.lock().is_none()
    }
}

impl fmt::Debug for RawBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawBody")
            .field("taken", &self.is_taken())
            .finish()
    }
}

/// A loaded resource: decoded body plus the response content type.
#[derive(Debug, Clone)]
pub struct Resource {
    pub data: Payload,
    pub mime_type: Option<String>,
}

impl Resource {
    pub fn new(data: impl Into<Payload>) -> Self {
        Self {
            data: data.into(),
            mime_type: None,
        }
    }

    pub fn with_mime_type(mut self, mime_type: Option<String>) -> Self {
        self.mime_type = mime_type;
        self
    }
}

/// Entry in the memory cache
#[derive(Debug, Clone)]
pub(crate) struct CacheEntry {
    pub(crate) resource: Resource,
    /// Accounted size, fixed at insertion
    pub(crate) size: u64,
}
