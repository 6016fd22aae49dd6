use std::sync::Arc;

/// Failure of the underlying transport. Passed through to callers unchanged.
#[derive(Debug, thiserror::Error, Clone)]
pub enum TransportError {
    #[error("Network error: {source}")]
    Network {
        #[from]
        source: Arc<reqwest::Error>,
    },
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: Arc<std::io::Error>,
    },
    #[error("Invalid proxy configuration: {0}")]
    Proxy(String),
    #[error("TLS configuration error: {0}")]
    Tls(String),
    #[error("{0}")]
    Other(String),
}

// Manual implementations because of the Arc wrapping.
impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        TransportError::Network {
            source: Arc::new(err),
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io {
            source: Arc::new(err),
        }
    }
}

/// Errors surfaced by the loader and the session.
///
/// Every variant that stems from a request carries the URL it was issued for, so a
/// consumer can correlate a failure with the variant or rendition it selected.
/// The type is `Clone` because one failed fetch is delivered to every caller that
/// was waiting on the same URL.
#[derive(Debug, thiserror::Error, Clone)]
pub enum HlsError {
    #[error("{status} {status_text} ({url})")]
    HttpStatus {
        url: String,
        status: u16,
        status_text: String,
    },
    #[error("Transport error for {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: TransportError,
    },
    #[error("Failed to decode response body of {url}: {reason}")]
    Decode { url: String, reason: String },
    #[error("Invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("Malformed manifest {url}: {reason}")]
    MalformedManifest { url: String, reason: String },
    #[error("Session data at {url} must be formatted as JSON: {reason}")]
    MalformedSessionData { url: String, reason: String },
    #[error("Internal error: {0}")]
    Internal(String),
}

impl HlsError {
    /// URL of the request that failed, if the error is tied to one.
    pub fn url(&self) -> Option<&str> {
        match self {
            HlsError::HttpStatus { url, .. }
            | HlsError::Transport { url, .. }
            | HlsError::Decode { url, .. }
            | HlsError::InvalidUrl { url, .. }
            | HlsError::MalformedManifest { url, .. }
            | HlsError::MalformedSessionData { url, .. } => Some(url),
            HlsError::Internal(_) => None,
        }
    }

    /// HTTP status code for non-2xx responses.
    pub fn status(&self) -> Option<u16> {
        match self {
            HlsError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type HlsResult<T> = Result<T, HlsError>;
