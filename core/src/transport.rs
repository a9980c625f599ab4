//! Connection-level transport.
//!
//! # Design
//! A [`Transport`] performs exactly one request/response exchange. Redirects,
//! cookies and retries live above it in the dispatcher, so a test double only
//! has to answer single round trips.
//!
//! The default transport is a ureq agent configured from a
//! [`TransportConfig`]. A caller-supplied `TransportConfig` is merged with the
//! one derived from `Settings` by [`TransportConfig::merge`]: fields the
//! caller set are kept and only the unset ones are filled in.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;
use ureq::tls::TlsConfig;
use ureq::unversioned::resolver::DefaultResolver;
use ureq::unversioned::transport::{self as wire, Connector, DefaultConnector};
use ureq::{Agent, SendBody};
use url::Url;

use crate::error::{TransportError, TransportErrorKind};
use crate::http::{Headers, HttpRequest, HttpResponse, RequestBody};
use crate::settings::{ProxyResolver, Settings, TransportOverride};

pub const MAX_IDLE_CONNECTIONS_PER_HOST: usize = 100;

/// Performs one HTTP exchange.
pub trait Transport: Send + Sync {
    fn round_trip(&self, request: &mut HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// Connect timeout plus the read/write budget applied once the connection is
/// up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dialer {
    pub connect_timeout: Duration,
    pub read_write_timeout: Duration,
}

impl Dialer {
    pub fn new(connect_timeout: Duration, read_write_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            read_write_timeout,
        }
    }
}

/// Transport-level settings. `None` means "unset".
#[derive(Clone, Default)]
pub struct TransportConfig {
    pub tls: Option<TlsConfig>,
    pub proxy: Option<ProxyResolver>,
    pub dialer: Option<Dialer>,
    pub max_idle_connections_per_host: Option<usize>,
}

impl TransportConfig {
    /// Fill every field `overrides` left unset from `base`.
    pub fn merge(base: &TransportConfig, overrides: &TransportConfig) -> TransportConfig {
        TransportConfig {
            tls: overrides.tls.clone().or_else(|| base.tls.clone()),
            proxy: overrides.proxy.clone().or_else(|| base.proxy.clone()),
            dialer: overrides.dialer.or(base.dialer),
            max_idle_connections_per_host: overrides
                .max_idle_connections_per_host
                .or(base.max_idle_connections_per_host),
        }
    }

    pub fn max_idle_per_host(&self) -> usize {
        self.max_idle_connections_per_host
            .unwrap_or(MAX_IDLE_CONNECTIONS_PER_HOST)
    }
}

impl fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportConfig")
            .field("tls", &self.tls.as_ref().map(|_| ".."))
            .field("proxy", &self.proxy)
            .field("dialer", &self.dialer)
            .field("max_idle_connections_per_host", &self.max_idle_connections_per_host)
            .finish()
    }
}

/// Pick the transport for a dispatch.
pub fn resolve(settings: &Settings) -> Arc<dyn Transport> {
    let base = settings.transport_config();
    match &settings.transport {
        None => Arc::new(UreqTransport::new(base)),
        Some(TransportOverride::Config(overrides)) => {
            Arc::new(UreqTransport::new(TransportConfig::merge(&base, overrides)))
        }
        Some(TransportOverride::Custom(transport)) => Arc::clone(transport),
    }
}

/// ureq-backed transport. One agent (and connection pool) per distinct
/// proxy, created on first use.
pub struct UreqTransport {
    config: TransportConfig,
    agents: Mutex<HashMap<Option<String>, Agent>>,
}

impl UreqTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            agents: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    fn agent_for(&self, proxy: Option<&Url>) -> Result<Agent, TransportError> {
        let key = proxy.map(|p| p.to_string());
        let mut agents = self.agents.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(agent) = agents.get(&key) {
            return Ok(agent.clone());
        }

        let proxy = match &key {
            Some(uri) => Some(ureq::Proxy::new(uri).map_err(|e| {
                TransportError::new(TransportErrorKind::Proxy, format!("{uri}: {e}"))
            })?),
            None => None,
        };
        let idle = self.config.max_idle_per_host();
        let mut builder = Agent::config_builder()
            .http_status_as_error(false)
            .max_redirects(0)
            .max_redirects_will_error(false)
            .max_idle_connections(idle)
            .max_idle_connections_per_host(idle)
            .proxy(proxy);
        if let Some(dialer) = &self.config.dialer {
            builder = builder.timeout_connect(Some(dialer.connect_timeout));
        }
        if let Some(tls) = &self.config.tls {
            builder = builder.tls_config(tls.clone());
        }

        let config = builder.build();
        let agent = match self.config.dialer {
            Some(dialer) => Agent::with_parts(
                config,
                DefaultConnector::new().chain(DeadlineConnector {
                    budget: dialer.read_write_timeout,
                }),
                DefaultResolver::default(),
            ),
            None => config.new_agent(),
        };
        debug!(proxy = ?key, idle_per_host = idle, "created transport agent");
        agents.insert(key, agent.clone());
        Ok(agent)
    }
}

impl Transport for UreqTransport {
    fn round_trip(&self, request: &mut HttpRequest) -> Result<HttpResponse, TransportError> {
        let proxy = self
            .config
            .proxy
            .as_ref()
            .and_then(|resolver| resolver.resolve(&request.url));
        let agent = self.agent_for(proxy.as_ref())?;

        let mut builder = ureq::http::Request::builder()
            .method(request.method.as_str())
            .uri(request.url.as_str());
        for (name, value) in request.headers.iter() {
            builder = builder.header(name, value);
        }
        if let Some(host) = &request.host {
            builder = builder.header("Host", host.as_str());
        }

        let response = match &mut request.body {
            RequestBody::Empty => agent.run(builder.body(()).map_err(invalid_request)?),
            RequestBody::Bytes(bytes) => {
                agent.run(builder.body(bytes.as_slice()).map_err(invalid_request)?)
            }
            RequestBody::Stream(stream) => {
                agent.run(builder.body(SendBody::from_reader(stream)).map_err(invalid_request)?)
            }
        }
        .map_err(TransportError::from)?;

        let status = response.status().as_u16();
        let headers: Headers = response
            .headers()
            .iter()
            .fold(Headers::new(), |mut headers, (name, value)| {
                headers.append(name.as_str(), String::from_utf8_lossy(value.as_bytes()));
                headers
            });
        let body = response.into_body().into_reader();
        Ok(HttpResponse {
            status,
            headers,
            body: Some(Box::new(body)),
        })
    }
}

/// Wraps every connection the agent opens in a [`DeadlineTransport`].
#[derive(Debug, Clone, Copy)]
struct DeadlineConnector {
    budget: Duration,
}

impl Connector<Box<dyn wire::Transport>> for DeadlineConnector {
    type Out = DeadlineTransport;

    fn connect(
        &self,
        _: &wire::ConnectionDetails,
        chained: Option<Box<dyn wire::Transport>>,
    ) -> Result<Option<Self::Out>, ureq::Error> {
        Ok(chained.map(|inner| DeadlineTransport::new(inner, self.budget)))
    }
}

/// Connection whose reads and writes share one absolute deadline. The
/// deadline is set once the connection is up (after any TLS handshake) and
/// set again each time the pool hands the connection out for reuse.
#[derive(Debug)]
struct DeadlineTransport {
    inner: Box<dyn wire::Transport>,
    budget: Duration,
    deadline: Option<Instant>,
}

impl DeadlineTransport {
    fn new(inner: Box<dyn wire::Transport>, budget: Duration) -> Self {
        Self {
            inner,
            budget,
            deadline: Instant::now().checked_add(budget),
        }
    }

    fn clamp(&self, timeout: wire::NextTimeout) -> Result<wire::NextTimeout, ureq::Error> {
        let Some(deadline) = self.deadline else {
            return Ok(timeout);
        };
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Err(ureq::Error::Timeout(timeout.reason));
        }
        if *timeout.after <= left {
            return Ok(timeout);
        }
        Ok(wire::NextTimeout {
            after: left.into(),
            reason: timeout.reason,
        })
    }
}

impl wire::Transport for DeadlineTransport {
    fn buffers(&mut self) -> &mut dyn wire::Buffers {
        self.inner.buffers()
    }

    fn transmit_output(
        &mut self,
        amount: usize,
        timeout: wire::NextTimeout,
    ) -> Result<(), ureq::Error> {
        let timeout = self.clamp(timeout)?;
        self.inner.transmit_output(amount, timeout)
    }

    fn await_input(&mut self, timeout: wire::NextTimeout) -> Result<bool, ureq::Error> {
        let timeout = self.clamp(timeout)?;
        self.inner.await_input(timeout)
    }

    fn is_open(&mut self) -> bool {
        self.deadline = Instant::now().checked_add(self.budget);
        self.inner.is_open()
    }

    fn is_tls(&self) -> bool {
        self.inner.is_tls()
    }
}

fn invalid_request(err: ureq::http::Error) -> TransportError {
    TransportError::new(TransportErrorKind::Protocol, err.to_string())
}

impl From<ureq::Error> for TransportError {
    fn from(err: ureq::Error) -> Self {
        let kind = match &err {
            ureq::Error::Timeout(_) => TransportErrorKind::Timeout,
            ureq::Error::HostNotFound | ureq::Error::ConnectionFailed => TransportErrorKind::Connect,
            ureq::Error::InvalidProxyUrl => TransportErrorKind::Proxy,
            ureq::Error::Tls(_) => TransportErrorKind::Tls,
            ureq::Error::Io(e) => return TransportError::from(io::Error::new(e.kind(), e.to_string())),
            ureq::Error::Protocol(_) | ureq::Error::BadUri(_) => TransportErrorKind::Protocol,
            _ => TransportErrorKind::Other,
        };
        TransportError::new(kind, err.to_string())
    }
}
