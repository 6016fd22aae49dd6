use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::cache::DEFAULT_MAX_CACHE_SIZE;
use crate::transport::proxy::ProxyConfig;

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";

/// Default number of simultaneous network requests
pub const DEFAULT_CONCURRENCY: usize = 6;

/// Top-level configuration of an HLS read session
#[derive(Debug, Clone)]
pub struct HlsStreamConfig {
    pub http: HttpConfig,
    pub loader: LoaderConfig,

    /// Deliver segment and init-map bodies as unbuffered streams, untrimmed.
    ///
    /// Loads of one URL are coalesced into one request, so every segment and
    /// init map that points at the same file shares a single take-once
    /// [`RawBody`](crate::cache::RawBody). Only the first
    /// [`RawBody::take`](crate::cache::RawBody::take) gets the stream; the
    /// other holders see [`RawBody::is_taken`](crate::cache::RawBody::is_taken).
    /// Byte-range playlists that address one file are better read buffered.
    pub raw_response: bool,

    /// Multiplier of the target duration before re-polling a manifest whose
    /// content did not change
    pub unchanged_backoff_factor: f64,

    /// Multiplier of the target duration between polls of a live manifest
    pub live_reload_factor: f64,

    /// Lower bound on any reload delay
    pub min_reload_interval: Duration,
}

impl Default for HlsStreamConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            loader: LoaderConfig::default(),
            raw_response: false,
            unchanged_backoff_factor: 1.5,
            live_reload_factor: 1.0,
            min_reload_interval: Duration::from_secs(1),
        }
    }
}

impl HlsStreamConfig {
    pub fn builder() -> crate::builder::HlsStreamConfigBuilder {
        crate::builder::HlsStreamConfigBuilder::new()
    }

    /// Delay before re-polling a live manifest with the given target duration.
    pub(crate) fn reload_delay(&self, target_duration: f64) -> Duration {
        self.scaled_delay(target_duration, self.live_reload_factor)
    }

    /// Delay before retrying a manifest that came back unchanged.
    pub(crate) fn unchanged_delay(&self, target_duration: f64) -> Duration {
        self.scaled_delay(target_duration, self.unchanged_backoff_factor)
    }

    fn scaled_delay(&self, target_duration: f64, factor: f64) -> Duration {
        let secs = target_duration * factor;
        let delay = if secs.is_finite() && secs > 0.0 {
            Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
        } else {
            Duration::ZERO
        };
        delay.max(self.min_reload_interval)
    }
}

/// Loader sizing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Maximum simultaneous network requests
    pub concurrency: usize,
    /// Cache capacity in bytes
    pub max_cache_size: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            max_cache_size: DEFAULT_MAX_CACHE_SIZE,
        }
    }
}

impl LoaderConfig {
    /// Concurrency, never below one.
    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.max(1)
    }
}

/// HTTP client options for [`HttpTransport`](crate::transport::HttpTransport)
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Overall timeout for a request, zero disables it
    pub timeout: Duration,

    /// Time allowed to establish a connection, zero disables it
    pub connect_timeout: Duration,

    pub follow_redirects: bool,

    pub user_agent: String,

    /// Headers sent with every request
    pub headers: HeaderMap,

    pub proxy: Option<ProxyConfig>,

    /// Honour system proxy settings when no explicit proxy is set
    pub use_system_proxy: bool,

    pub pool_max_idle_per_host: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            follow_redirects: true,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: HttpConfig::default_headers(),
            proxy: None,
            use_system_proxy: true,
            pool_max_idle_per_host: DEFAULT_CONCURRENCY,
        }
    }
}

impl HttpConfig {
    pub fn default_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_static(
                "application/vnd.apple.mpegurl,application/x-mpegurl,video/mp2t,*/*;q=0.8",
            ),
        );
        headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );
        headers
    }
}
