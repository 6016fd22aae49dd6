use reqwest::Proxy;

use crate::error::TransportError;

/// Which requests a proxy applies to
#[derive(Debug, Clone, PartialEq, Eq, Copy)]
pub enum ProxyType {
    Http,
    Https,
    Socks5,
    /// Every scheme
    All,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyAuth {
    pub username: String,
    pub password: String,
}

/// Explicit proxy for manifest and segment requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Proxy server URL, e.g. `http://proxy.example.com:8080`
    pub url: String,
    pub proxy_type: ProxyType,
    pub auth: Option<ProxyAuth>,
}

impl ProxyConfig {
    pub fn new(url: impl Into<String>, proxy_type: ProxyType) -> Self {
        Self {
            url: url.into(),
            proxy_type,
            auth: None,
        }
    }

    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some(ProxyAuth {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    /// Proxy URL as handed to reqwest; SOCKS5 proxies get their scheme added when missing.
    fn effective_url(&self) -> String {
        match self.proxy_type {
            ProxyType::Socks5 if !self.url.starts_with("socks5://") => {
                format!("socks5://{}", self.url)
            }
            _ => self.url.clone(),
        }
    }

    pub(crate) fn build(&self) -> Result<Proxy, TransportError> {
        let url = self.effective_url();
        let proxy = match self.proxy_type {
            ProxyType::Http => Proxy::http(&url),
            ProxyType::Https => Proxy::https(&url),
            ProxyType::Socks5 | ProxyType::All => Proxy::all(&url),
        }
        .map_err(|e| TransportError::Proxy(format!("{url}: {e}")))?;

        Ok(match &self.auth {
            Some(auth) => proxy.basic_auth(&auth.username, &auth.password),
            None => proxy,
        })
    }
}
