//! Client settings.
//!
//! # Design
//! `Settings` is cloned into every `HttpClient` when it is constructed, so
//! later changes to a registry's defaults never reach clients that already
//! exist. Function-valued settings (proxy resolution, redirect policy) are
//! stored behind `Arc` so cloning stays cheap.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::retry::RetryPolicy;
use crate::transport::{Dialer, Transport, TransportConfig};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_READ_WRITE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_REDIRECTS: usize = 10;

/// Encoding used for parameters sent in a request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentType {
    /// `application/x-www-form-urlencoded`
    #[default]
    Form,
    /// `application/json`
    Json,
}

impl ContentType {
    pub fn mime(&self) -> &'static str {
        match self {
            ContentType::Form => "application/x-www-form-urlencoded",
            ContentType::Json => "application/json",
        }
    }
}

/// Chooses a proxy for each request URL; `None` connects directly.
#[derive(Clone)]
pub struct ProxyResolver(Arc<dyn Fn(&Url) -> Option<Url> + Send + Sync>);

impl ProxyResolver {
    pub fn new(f: impl Fn(&Url) -> Option<Url> + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Route every request through `proxy`.
    pub fn fixed(proxy: Url) -> Self {
        Self::new(move |_| Some(proxy.clone()))
    }

    /// Read `HTTP_PROXY`, `HTTPS_PROXY` and `NO_PROXY` (either case) on every
    /// request.
    pub fn from_env() -> Self {
        Self::new(|url| {
            let var = |name: &str| {
                std::env::var(name)
                    .or_else(|_| std::env::var(name.to_ascii_lowercase()))
                    .ok()
                    .filter(|v| !v.is_empty())
            };
            let host = url.host_str()?;
            if let Some(no_proxy) = var("NO_PROXY") {
                if bypasses_proxy(&no_proxy, host) {
                    return None;
                }
            }
            let proxy = match url.scheme() {
                "https" => var("HTTPS_PROXY").or_else(|| var("HTTP_PROXY")),
                _ => var("HTTP_PROXY"),
            }?;
            Url::parse(&proxy).ok()
        })
    }

    pub fn resolve(&self, url: &Url) -> Option<Url> {
        (self.0)(url)
    }
}

impl fmt::Debug for ProxyResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProxyResolver(..)")
    }
}

fn bypasses_proxy(no_proxy: &str, host: &str) -> bool {
    no_proxy.split(',').map(str::trim).any(|entry| {
        if entry == "*" {
            return true;
        }
        let entry = entry.trim_start_matches('.');
        !entry.is_empty()
            && (host.eq_ignore_ascii_case(entry)
                || host
                    .to_ascii_lowercase()
                    .ends_with(&format!(".{}", entry.to_ascii_lowercase())))
    })
}

/// What to do with a redirect response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectDecision {
    Follow,
    /// Stop and hand the redirect response itself to the caller.
    UseLastResponse,
    /// Stop and fail the dispatch.
    Abort(String),
}

/// Decides, for each redirect, given the next URL and the URLs already
/// visited (oldest first).
#[derive(Clone)]
pub struct RedirectPolicy(Arc<dyn Fn(&Url, &[Url]) -> RedirectDecision + Send + Sync>);

impl RedirectPolicy {
    pub fn new(f: impl Fn(&Url, &[Url]) -> RedirectDecision + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Follow up to `max` redirects, then abort.
    pub fn limited(max: usize) -> Self {
        Self::new(move |_, via| {
            if via.len() > max {
                RedirectDecision::Abort(format!("stopped after {max} redirects"))
            } else {
                RedirectDecision::Follow
            }
        })
    }

    /// Never follow; return the first redirect response.
    pub fn none() -> Self {
        Self::new(|_, _| RedirectDecision::UseLastResponse)
    }

    pub fn check(&self, next: &Url, via: &[Url]) -> RedirectDecision {
        (self.0)(next, via)
    }
}

impl Default for RedirectPolicy {
    fn default() -> Self {
        Self::limited(DEFAULT_MAX_REDIRECTS)
    }
}

impl fmt::Debug for RedirectPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RedirectPolicy(..)")
    }
}

/// Caller-supplied transport.
#[derive(Clone)]
pub enum TransportOverride {
    /// Transport settings whose unset fields are filled from `Settings`.
    Config(TransportConfig),
    /// A complete transport used as-is.
    Custom(Arc<dyn Transport>),
}

impl fmt::Debug for TransportOverride {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportOverride::Config(config) => f.debug_tuple("Config").field(config).finish(),
            TransportOverride::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

#[derive(Clone)]
pub struct Settings {
    pub show_debug: bool,
    pub user_agent: String,
    pub connect_timeout: Duration,
    pub read_write_timeout: Duration,
    pub tls_config: Option<ureq::tls::TlsConfig>,
    pub proxy: Option<ProxyResolver>,
    pub transport: Option<TransportOverride>,
    pub check_redirect: Option<RedirectPolicy>,
    pub enable_cookie: bool,
    pub gzip: bool,
    /// Include the request body in the debug dump.
    pub dump_body: bool,
    pub retries: RetryPolicy,
    /// Fail the upload when an attached file cannot be read instead of
    /// skipping its part.
    pub strict_uploads: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            show_debug: false,
            user_agent: String::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_write_timeout: DEFAULT_READ_WRITE_TIMEOUT,
            tls_config: None,
            proxy: None,
            transport: None,
            check_redirect: None,
            enable_cookie: false,
            gzip: true,
            dump_body: true,
            retries: RetryPolicy::once(),
            strict_uploads: false,
        }
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("show_debug", &self.show_debug)
            .field("user_agent", &self.user_agent)
            .field("connect_timeout", &self.connect_timeout)
            .field("read_write_timeout", &self.read_write_timeout)
            .field("tls_config", &self.tls_config.as_ref().map(|_| ".."))
            .field("proxy", &self.proxy)
            .field("transport", &self.transport)
            .field("check_redirect", &self.check_redirect)
            .field("enable_cookie", &self.enable_cookie)
            .field("gzip", &self.gzip)
            .field("dump_body", &self.dump_body)
            .field("retries", &self.retries)
            .field("strict_uploads", &self.strict_uploads)
            .finish()
    }
}

impl Settings {
    /// Transport fields derived from these settings, used both for the
    /// default transport and to fill gaps in a caller's `TransportConfig`.
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            tls: self.tls_config.clone(),
            proxy: self.proxy.clone(),
            dialer: Some(Dialer::new(self.connect_timeout, self.read_write_timeout)),
            max_idle_connections_per_host: None,
        }
    }

    pub fn redirect_policy(&self) -> RedirectPolicy {
        self.check_redirect.clone().unwrap_or_default()
    }
}
