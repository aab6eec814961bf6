use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};
use url::Url;

use crate::config::{Credentials, ValidationConfig};
use crate::error::ValidationError;
use crate::types::ProxyProtocol;

/// Checks whether a local tunnel port carries traffic.
#[async_trait]
pub trait ProxyProbe: Send + Sync + 'static {
    async fn check(&self, port: u16) -> Result<ProxyProtocol, ValidationError>;
}

/// Sends one request per protocol through `127.0.0.1:<port>`, HTTP proxy
/// first and SOCKS5 second. The first accepted status wins.
#[derive(Debug, Clone)]
pub struct HttpProxyProbe {
    target: String,
    timeout: Duration,
    accepted: Vec<u16>,
    credentials: Option<Credentials>,
}

impl HttpProxyProbe {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            timeout: Duration::from_secs(15),
            accepted: vec![200, 301, 302],
            credentials: None,
        }
    }

    pub fn from_config(cfg: &ValidationConfig) -> Self {
        Self {
            target: cfg.target_url.clone(),
            timeout: cfg.proxy_timeout,
            accepted: cfg.accepted_statuses.clone(),
            credentials: cfg.credentials.clone(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn attempt(&self, protocol: ProxyProtocol, port: u16) -> Result<u16, ValidationError> {
        let url = proxy_url(protocol, port, self.credentials.as_ref())?;
        let proxy = reqwest::Proxy::all(url.as_str()).map_err(ValidationError::Client)?;
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .timeout(self.timeout)
            // A redirect from the target already proves the tunnel works.
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(ValidationError::Client)?;
        let response = client
            .get(&self.target)
            .send()
            .await
            .map_err(ValidationError::Client)?;
        Ok(response.status().as_u16())
    }
}

#[async_trait]
impl ProxyProbe for HttpProxyProbe {
    async fn check(&self, port: u16) -> Result<ProxyProtocol, ValidationError> {
        for protocol in ProxyProtocol::ORDER {
            let shown = redacted_url(protocol, port, self.credentials.as_ref());
            match self.attempt(protocol, port).await {
                Ok(status) if self.accepted.contains(&status) => {
                    info!(proxy = %shown, status, "proxy test passed");
                    return Ok(protocol);
                }
                Ok(status) => warn!(proxy = %shown, status, "proxy returned unexpected status"),
                Err(e) => warn!(proxy = %shown, error = %e, "proxy request failed"),
            }
        }
        Err(ValidationError::ProxyFailed)
    }
}

/// Proxy URL for the local tunnel port, with credentials percent-encoded
/// into the userinfo part when present.
pub fn proxy_url(
    protocol: ProxyProtocol,
    port: u16,
    credentials: Option<&Credentials>,
) -> Result<Url, ValidationError> {
    let raw = format!("{}://127.0.0.1:{port}", protocol.scheme());
    let mut url = Url::parse(&raw).map_err(|e| ValidationError::ProxyUrl(e.to_string()))?;
    if let Some(c) = credentials {
        url.set_username(&c.username)
            .map_err(|_| ValidationError::ProxyUrl("cannot set username".into()))?;
        url.set_password(Some(&c.password))
            .map_err(|_| ValidationError::ProxyUrl("cannot set password".into()))?;
    }
    Ok(url)
}

fn redacted_url(protocol: ProxyProtocol, port: u16, credentials: Option<&Credentials>) -> String {
    match credentials {
        Some(c) => format!("{}://{}:****@127.0.0.1:{port}", protocol.scheme(), c.username),
        None => format!("{}://127.0.0.1:{port}", protocol.scheme()),
    }
}
