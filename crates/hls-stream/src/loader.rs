//! # Loader
//!
//! Fetches resources over a [`Transport`] with three guarantees:
//!
//! - a cached URL is served from memory, never synchronously;
//! - concurrent loads of one URL share a single request, and every caller
//!   receives the outcome in the order it asked;
//! - at most `concurrency` requests are on the network at any time, the rest
//!   wait for a permit.
//!
//! Successful results are cached even for callers that bypass the cache on
//! read. Nothing is retried here.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{Semaphore, oneshot};
use tracing::{debug, trace, warn};

use crate::cache::{MemoryCache, Payload, RawBody, Resource};
use crate::config::LoaderConfig;
use crate::error::{HlsError, HlsResult};
use crate::transport::Transport;

/// Per-call options of [`Loader::load`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadOptions {
    /// Skip the cache lookup. The result is still cached.
    pub no_cache: bool,
    /// Keep the body as bytes instead of decoding it as UTF-8 text
    pub read_as_buffer: bool,
    /// Hand over the body stream without reading it
    pub raw_response: bool,
}

impl LoadOptions {
    pub fn text() -> Self {
        Self::default()
    }

    pub fn buffer() -> Self {
        Self {
            read_as_buffer: true,
            ..Self::default()
        }
    }

    pub fn with_no_cache(mut self) -> Self {
        self.no_cache = true;
        self
    }

    pub fn with_raw_response(mut self, raw: bool) -> Self {
        self.raw_response = raw;
        self
    }
}

type Waiter = oneshot::Sender<HlsResult<Resource>>;

struct LoaderInner {
    transport: Arc<dyn Transport>,
    cache: Mutex<MemoryCache>,
    /// URLs with a request in flight, and everyone waiting on each
    waitlist: Mutex<HashMap<String, Vec<Waiter>>>,
    permits: Semaphore,
}

/// Deduplicating, concurrency-bounded resource loader.
///
/// Cloning is cheap; clones share the cache and the waitlist. Loads spawn onto
/// the current Tokio runtime.
#[derive(Clone)]
pub struct Loader {
    inner: Arc<LoaderInner>,
}

impl fmt::Debug for Loader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loader")
            .field("in_flight", &self.in_flight())
            .field("cached", &self.inner.cache.lock().len())
            .field("available_permits", &self.inner.permits.available_permits())
            .finish()
    }
}

impl Loader {
    pub fn new(transport: Arc<dyn Transport>, config: &LoaderConfig) -> Self {
        Self {
            inner: Arc::new(LoaderInner {
                transport,
                cache: Mutex::new(MemoryCache::new(config.max_cache_size)),
                waitlist: Mutex::new(HashMap::new()),
                permits: Semaphore::new(config.effective_concurrency()),
            }),
        }
    }

    /// Loads `url`.
    ///
    /// The request is registered when this is called, not when the returned
    /// future is first polled. When a request for `url` is already in flight the
    /// caller joins it, and the options of the caller that started it apply.
    pub fn load(&self, url: &str, options: LoadOptions) -> BoxFuture<'static, HlsResult<Resource>> {
        if !options.no_cache {
            let hit = self.inner.cache.lock().get(url);
            if let Some(resource) = hit {
                trace!(url = %url, "Cache hit");
                return async move {
                    tokio::task::yield_now().await;
                    Ok(resource)
                }
                .boxed();
            }
        }

        let (tx, rx) = oneshot::channel();
        let start = match self.inner.waitlist.lock().entry(url.to_owned()) {
            Entry::Occupied(mut waiters) => {
                waiters.get_mut().push(tx);
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(vec![tx]);
                true
            }
        };

        if start {
            let mut broadcast = Broadcast {
                inner: self.inner.clone(),
                url: url.to_owned(),
                settled: false,
            };
            tokio::spawn(async move {
                let result = match broadcast.inner.permits.acquire().await {
                    Ok(_permit) => {
                        fetch(broadcast.inner.transport.as_ref(), &broadcast.url, options).await
                    }
                    Err(_) => Err(HlsError::Internal("loader was shut down".to_string())),
                };
                broadcast.settle(result);
            });
        } else {
            trace!(url = %url, "Joined in-flight request");
        }

        let url = url.to_owned();
        async move {
            rx.await.unwrap_or_else(|_| {
                Err(HlsError::Internal(format!("request for {url} was dropped")))
            })
        }
        .boxed()
    }

    /// Number of URLs with a request in flight
    pub fn in_flight(&self) -> usize {
        self.inner.waitlist.lock().len()
    }

    pub fn is_in_flight(&self, url: &str) -> bool {
        self.inner.waitlist.lock().contains_key(url)
    }

    pub fn is_cached(&self, url: &str) -> bool {
        self.inner.cache.lock().contains(url)
    }

    pub fn cache_size_bytes(&self) -> u64 {
        self.inner.cache.lock().size_bytes()
    }

    pub fn clear_cache(&self) {
        self.inner.cache.lock().clear();
    }
}

/// Delivers the outcome of one request to its waiters.
///
/// Dropping it unsettled (the task panicked or the runtime shut down) still
/// releases every waiter, with an error.
struct Broadcast {
    inner: Arc<LoaderInner>,
    url: String,
    settled: bool,
}

impl Broadcast {
    fn settle(&mut self, result: HlsResult<Resource>) {
        self.settled = true;
        if let Ok(resource) = &result {
            self.inner.cache.lock().put(self.url.clone(), resource.clone());
        }

        let waiters = self.inner.waitlist.lock().remove(&self.url).unwrap_or_default();
        trace!(url = %self.url, waiters = waiters.len(), "Request settled");
        for waiter in waiters {
            // The receiver may have been dropped
            let _ = waiter.send(result.clone());
        }
    }
}

impl Drop for Broadcast {
    fn drop(&mut self) {
        if !self.settled {
            let reason = format!("request for {} ended without a result", self.url);
            self.settle(Err(HlsError::Internal(reason)));
        }
    }
}

async fn fetch(transport: &dyn Transport, url: &str, options: LoadOptions) -> HlsResult<Resource> {
    debug!(url = %url, "GET");
    let response = transport
        .fetch(url)
        .await
        .map_err(|source| HlsError::Transport {
            url: url.to_owned(),
            source,
        })?;

    if !response.is_success() {
        warn!(url = %url, status = response.status, "Request failed");
        return Err(HlsError::HttpStatus {
            url: url.to_owned(),
            status: response.status,
            status_text: response.status_text,
        });
    }

    let mime_type = response.content_type.clone();
    let data = if options.raw_response {
        Payload::Raw(RawBody::new(response.into_stream()))
    } else {
        let body = response
            .bytes()
            .await
            .map_err(|source| HlsError::Transport {
                url: url.to_owned(),
                source,
            })?;
        if options.read_as_buffer {
            Payload::Binary(body)
        } else {
            let text = std::str::from_utf8(&body).map_err(|e| HlsError::Decode {
                url: url.to_owned(),
                reason: e.to_string(),
            })?;
            Payload::from(text.strip_prefix('\u{feff}').unwrap_or(text))
        }
    };

    Ok(Resource::new(data).with_mime_type(mime_type))
}
