//! # Builder for HlsStreamConfig
//!
//! ```
//! use std::time::Duration;
//! use hls_stream::HlsStreamConfig;
//! use hls_stream::transport::proxy::{ProxyConfig, ProxyType};
//!
//! let config = HlsStreamConfig::builder()
//!     .with_concurrency(4)
//!     .with_max_cache_size(32 * 1024 * 1024)
//!     .with_timeout(Duration::from_secs(20))
//!     .with_header("Referer", "https://example.com/")
//!     .with_proxy(ProxyConfig::new("http://proxy.example.com:8080", ProxyType::Http))
//!     .build();
//!
//! assert_eq!(config.loader.concurrency, 4);
//! assert!(!config.http.use_system_proxy);
//! ```

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::config::{HlsStreamConfig, HttpConfig, LoaderConfig};
use crate::transport::proxy::ProxyConfig;

/// Fluent builder for [`HlsStreamConfig`]
#[derive(Debug, Clone, Default)]
pub struct HlsStreamConfigBuilder {
    config: HlsStreamConfig,
}

impl HlsStreamConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maximum simultaneous network requests; zero is treated as one
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.config.loader.concurrency = concurrency.max(1);
        self
    }

    pub fn with_max_cache_size(mut self, bytes: u64) -> Self {
        self.config.loader.max_cache_size = bytes;
        self
    }

    pub fn with_loader_config(mut self, loader: LoaderConfig) -> Self {
        self.config.loader = LoaderConfig {
            concurrency: loader.effective_concurrency(),
            ..loader
        };
        self
    }

    pub fn with_raw_response(mut self, raw: bool) -> Self {
        self.config.raw_response = raw;
        self
    }

    pub fn with_unchanged_backoff_factor(mut self, factor: f64) -> Self {
        self.config.unchanged_backoff_factor = factor;
        self
    }

    pub fn with_live_reload_factor(mut self, factor: f64) -> Self {
        self.config.live_reload_factor = factor;
        self
    }

    pub fn with_min_reload_interval(mut self, interval: Duration) -> Self {
        self.config.min_reload_interval = interval;
        self
    }

    pub fn with_http_config(mut self, http: HttpConfig) -> Self {
        self.config.http = http;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.http.timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.http.connect_timeout = timeout;
        self
    }

    pub fn with_follow_redirects(mut self, follow: bool) -> Self {
        self.config.http.follow_redirects = follow;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.http.user_agent = user_agent.into();
        self
    }

    /// Adds a header; invalid names or values are ignored
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        if let (Ok(name), Ok(value)) = (
            name.as_ref().parse::<HeaderName>(),
            HeaderValue::from_str(value.as_ref()),
        ) {
            self.config.http.headers.insert(name, value);
        }
        self
    }

    /// Replaces all headers
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.config.http.headers = headers;
        self
    }

    /// An explicit proxy turns off the system proxy
    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.config.http.proxy = Some(proxy);
        self.config.http.use_system_proxy = false;
        self
    }

    /// Ignored while an explicit proxy is configured
    pub fn with_system_proxy(mut self, use_system_proxy: bool) -> Self {
        if self.config.http.proxy.is_none() {
            self.config.http.use_system_proxy = use_system_proxy;
        }
        self
    }

    pub fn build(self) -> HlsStreamConfig {
        self.config
    }
}
