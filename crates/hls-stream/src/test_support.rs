//! In-memory transport and helpers shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::TransportError;
use crate::transport::{Transport, TransportResponse};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer() // Write to test output
        .try_init();
}

#[derive(Debug, Clone)]
pub struct FakeResponse {
    status: u16,
    status_text: String,
    content_type: Option<String>,
    body: Bytes,
    failure: Option<String>,
}

impl FakeResponse {
    pub fn ok_text(body: &str) -> Self {
        Self::ok_bytes(Bytes::copy_from_slice(body.as_bytes()))
            .with_content_type("application/vnd.apple.mpegurl")
    }

    pub fn ok_bytes(body: impl Into<Bytes>) -> Self {
        Self {
            status: 200,
            status_text: "OK".to_string(),
            content_type: None,
            body: body.into(),
            failure: None,
        }
    }

    pub fn status(status: u16, status_text: &str) -> Self {
        Self {
            status,
            status_text: status_text.to_string(),
            content_type: None,
            body: Bytes::new(),
            failure: None,
        }
    }

    /// The request fails before any response arrives.
    pub fn network_failure(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            ..Self::status(0, "")
        }
    }

    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_string());
        self
    }
}

/// Serves canned responses per URL and records each fetch.
///
/// A route holds a sequence of responses; each fetch consumes one and the last
/// one repeats. Unknown URLs answer `404 Not Found`.
#[derive(Default)]
pub struct FakeTransport {
    routes: Mutex<HashMap<String, VecDeque<FakeResponse>>>,
    log: Mutex<Vec<(String, Instant)>>,
    delay: Option<Duration>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every fetch takes this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn route(&self, url: &str, response: FakeResponse) {
        self.route_sequence(url, vec![response]);
    }

    pub fn route_sequence(&self, url: &str, responses: Vec<FakeResponse>) {
        self.routes
            .lock()
            .insert(url.to_string(), responses.into_iter().collect());
    }

    pub fn fetch_count(&self, url: &str) -> usize {
        self.log.lock().iter().filter(|(u, _)| u == url).count()
    }

    pub fn fetch_times(&self, url: &str) -> Vec<Instant> {
        self.log
            .lock()
            .iter()
            .filter(|(u, _)| u == url)
            .map(|(_, at)| *at)
            .collect()
    }

    /// Highest number of fetches that were in progress at once
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn next_response(&self, url: &str) -> FakeResponse {
        let mut routes = self.routes.lock();
        match routes.get_mut(url) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        }
        .unwrap_or_else(|| FakeResponse::status(404, "Not Found"))
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn fetch(&self, url: &str) -> Result<TransportResponse, TransportError> {
        self.log.lock().push((url.to_string(), Instant::now()));
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        let response = self.next_response(url);
        if let Some(message) = response.failure {
            return Err(TransportError::Other(message));
        }

        // Split the body so readers have to reassemble it
        let body = response.body;
        let mid = body.len() / 2;
        let chunks = vec![Ok(body.slice(..mid)), Ok(body.slice(mid..))];
        Ok(TransportResponse::new(
            response.status,
            response.status_text,
            response.content_type,
            Box::pin(stream::iter(chunks)),
        ))
    }
}
