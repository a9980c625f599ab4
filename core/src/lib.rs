//! Configurable blocking HTTP client.
//!
//! # Overview
//! `HttpClient` accumulates a request through a fluent API, dispatches it
//! through a pluggable [`Transport`] with redirect, cookie and retry
//! handling, and decodes the response (gzip, JSON, XML, text, file) with the
//! body read at most once.
//!
//! ```no_run
//! use httpclient::{ContentType, HttpClient};
//!
//! let mut client = HttpClient::new("http://api.test/v1")
//!     .post("/items")
//!     .content_type(ContentType::Json)
//!     .param("name", "lamp");
//! let created: serde_json::Value = client.json()?;
//! # Ok::<(), httpclient::Error>(())
//! ```
//!
//! # Design
//! - `encode` and `request` are pure: building a request never touches the
//!   network, and encoding failures surface before any attempt.
//! - `dispatch` owns the request lifecycle: URL resolution, cookie jar,
//!   debug dump, redirects and the `retry` loop. Only transport failures are
//!   retried.
//! - Multipart uploads are streamed from a background thread through a
//!   bounded pipe (`multipart`), so attached files are never held in memory.
//! - Process-wide state lives in an explicit [`Registry`]; clients copy its
//!   default settings when constructed.

pub mod client;
pub mod config;
pub mod cookies;
pub mod decode;
pub mod dispatch;
pub mod encode;
pub mod error;
pub mod http;
pub mod multipart;
pub mod registry;
pub mod request;
pub mod retry;
pub mod settings;
pub mod transport;

pub use client::{delete, get, head, patch, post, put, HttpClient};
pub use config::ClientConfig;
pub use cookies::CookieJar;
pub use decode::Format;
pub use error::{Error, Result, TransportError, TransportErrorKind};
pub use http::{Headers, HttpMethod, HttpRequest, HttpResponse, RequestBody};
pub use multipart::UploadReport;
pub use registry::Registry;
pub use retry::{Attempts, Backoff, RetryPolicy};
pub use settings::{
    ContentType, ProxyResolver, RedirectDecision, RedirectPolicy, Settings, TransportOverride,
};
pub use transport::{Dialer, Transport, TransportConfig, UreqTransport};
