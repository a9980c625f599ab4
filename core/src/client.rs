//! Fluent HTTP client.
//!
//! # Design
//! An `HttpClient` is one request/response cycle. Setters accumulate state
//! in a [`PendingRequest`] without doing any I/O; the first call that needs
//! the response dispatches it, and the response (and later its decoded body)
//! is memoized so repeated accessors never hit the network twice. Settings
//! are copied from the registry when the client is constructed.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;
use url::Url;

use crate::decode::{self, Format};
use crate::dispatch;
use crate::error::{Error, Result};
use crate::http::{HttpMethod, HttpResponse};
use crate::multipart::UploadReport;
use crate::registry::Registry;
use crate::request::PendingRequest;
use crate::settings::{ContentType, Settings};

/// Builder and response holder for a single HTTP exchange.
#[derive(Debug)]
pub struct HttpClient {
    base_url: String,
    pending: PendingRequest,
    settings: Settings,
    registry: Arc<Registry>,
    response: Option<HttpResponse>,
    body: Option<Vec<u8>>,
    // Wire bytes, kept only when they differ from `body`.
    raw: Option<Vec<u8>>,
    body_error: Option<(io::ErrorKind, String)>,
    dump: Option<Vec<u8>>,
    upload_report: Option<UploadReport>,
}

impl HttpClient {
    /// Client using the process-wide registry.
    pub fn new(base_url: &str) -> Self {
        Self::with_registry(Registry::global(), base_url)
    }

    pub fn with_registry(registry: Arc<Registry>, base_url: &str) -> Self {
        if let Err(err) = Url::parse(base_url) {
            warn!(base_url, error = %err, "base url does not parse");
        }
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            pending: PendingRequest::default(),
            settings: registry.default_settings(),
            registry,
            response: None,
            body: None,
            raw: None,
            body_error: None,
            dump: None,
            upload_report: None,
        }
    }

    /// Client using the process-wide registry with explicit settings.
    pub fn with_settings(base_url: &str, settings: Settings) -> Self {
        Self::new(base_url).configure(settings)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Replace this client's settings.
    pub fn configure(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    fn method(mut self, method: HttpMethod, relative_url: &str) -> Self {
        self.pending.method = method;
        self.pending.relative_url = relative_url.to_string();
        self
    }

    pub fn get(self, relative_url: &str) -> Self {
        self.method(HttpMethod::Get, relative_url)
    }

    pub fn post(self, relative_url: &str) -> Self {
        self.method(HttpMethod::Post, relative_url)
    }

    pub fn put(self, relative_url: &str) -> Self {
        self.method(HttpMethod::Put, relative_url)
    }

    pub fn patch(self, relative_url: &str) -> Self {
        self.method(HttpMethod::Patch, relative_url)
    }

    pub fn delete(self, relative_url: &str) -> Self {
        self.method(HttpMethod::Delete, relative_url)
    }

    pub fn head(self, relative_url: &str) -> Self {
        self.method(HttpMethod::Head, relative_url)
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.pending.headers.set(name, value);
        self
    }

    /// Override the `Host` header sent to the server.
    pub fn host(mut self, host: &str) -> Self {
        self.pending.host = Some(host.to_string());
        self
    }

    pub fn basic_auth(mut self, username: &str, password: &str) -> Self {
        self.pending.set_basic_auth(username, password);
        self
    }

    pub fn content_type(mut self, content_type: ContentType) -> Self {
        self.pending.content_type = content_type;
        self
    }

    /// Set a parameter. Setting an existing key replaces its value.
    pub fn param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.pending.set_param(key, value.into());
        self
    }

    /// Attach a file to upload as form field `field`.
    pub fn file(mut self, field: &str, path: impl Into<PathBuf>) -> Self {
        self.pending.files.insert(field.to_string(), path.into());
        self
    }

    /// Send `body` verbatim instead of encoding parameters or files.
    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.pending.body = Some(body.into());
        self
    }

    pub fn pending(&self) -> &PendingRequest {
        &self.pending
    }

    /// Dispatch the request unless it was already dispatched.
    pub fn response(&mut self) -> Result<&HttpResponse> {
        self.response_mut().map(|response| &*response)
    }

    fn response_mut(&mut self) -> Result<&mut HttpResponse> {
        let response = match self.response.take() {
            Some(response) => response,
            None => {
                let dispatched =
                    dispatch::dispatch(&self.base_url, &self.pending, &self.settings, &self.registry)?;
                self.dump = dispatched.dump;
                self.upload_report = dispatched.upload_report;
                dispatched.response
            }
        };
        Ok(self.response.insert(response))
    }

    /// The whole response body, gunzipped when the response is gzip-encoded
    /// and gzip is enabled. Read once and cached. `None` when the response
    /// has no body. A failed read is remembered and returned again by every
    /// later call.
    pub fn fetch_body(&mut self) -> Result<Option<&[u8]>> {
        if let Some(err) = self.body_failure() {
            return Err(err);
        }
        if self.body.is_none() {
            let gzip = self.settings.gzip;
            let response = self.response_mut()?;
            let gzipped = gzip && decode::is_gzip(&response.headers);
            if let Some(stream) = response.body.take() {
                let decoded = match decode::read_body(stream) {
                    Ok(raw) if gzipped => {
                        let decoded = decode::gunzip(&raw);
                        self.raw = Some(raw);
                        decoded
                    }
                    other => other,
                };
                match decoded {
                    Ok(bytes) => self.body = Some(bytes),
                    Err(err) => {
                        self.remember_failure(&err);
                        return Err(err);
                    }
                }
            }
        }
        Ok(self.body.as_deref())
    }

    fn remember_failure(&mut self, err: &Error) {
        self.body_error = Some(match err {
            Error::BodyRead(source) => (source.kind(), source.to_string()),
            other => (io::ErrorKind::Other, other.to_string()),
        });
    }

    fn body_failure(&self) -> Option<Error> {
        self.body_error
            .as_ref()
            .map(|(kind, message)| Error::BodyRead(io::Error::new(*kind, message.clone())))
    }

    /// Body as text, replacing invalid UTF-8.
    pub fn text(&mut self) -> Result<String> {
        Ok(self
            .fetch_body()?
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .unwrap_or_default())
    }

    pub fn decode<T: DeserializeOwned>(&mut self, format: Format) -> Result<T> {
        let bytes = self.fetch_body()?.unwrap_or_default();
        decode::decode_structured(bytes, format)
    }

    pub fn json<T: DeserializeOwned>(&mut self) -> Result<T> {
        self.decode(Format::Json)
    }

    pub fn xml<T: DeserializeOwned>(&mut self) -> Result<T> {
        self.decode(Format::Xml)
    }

    /// Save the response body to `path` exactly as it came off the wire,
    /// without gunzipping. Streams from the live response when it has not
    /// been read yet; afterwards the body is gone and `fetch_body` reports
    /// an error. When the body was already fetched, its cached wire bytes
    /// are written instead.
    pub fn write_to_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file_err = |source| Error::FileIo {
            path: path.to_path_buf(),
            source,
        };
        let mut file = File::create(path).map_err(file_err)?;

        let live = self.response_mut()?.body.take();
        if let Some(mut stream) = live {
            self.body_error = Some((
                io::ErrorKind::Other,
                "response body was streamed to a file".to_string(),
            ));
            let mut buf = [0u8; 8 * 1024];
            loop {
                let n = stream.read(&mut buf).map_err(Error::BodyRead)?;
                if n == 0 {
                    break;
                }
                file.write_all(&buf[..n]).map_err(file_err)?;
            }
        } else if let Some(bytes) = self.raw.as_ref().or(self.body.as_ref()) {
            file.write_all(bytes).map_err(file_err)?;
        } else if let Some(err) = self.body_failure() {
            return Err(err);
        }
        file.flush().map_err(file_err)
    }

    /// Serialized request captured when debug mode is on.
    pub fn dump(&self) -> Option<&[u8]> {
        self.dump.as_deref()
    }

    /// Outcome of the multipart producer, for requests with attached files.
    pub fn upload_report(&self) -> Option<&UploadReport> {
        self.upload_report.as_ref()
    }
}

pub fn get(url: &str) -> HttpClient {
    HttpClient::new(url).get("")
}

pub fn post(url: &str) -> HttpClient {
    HttpClient::new(url).post("")
}

pub fn put(url: &str) -> HttpClient {
    HttpClient::new(url).put("")
}

pub fn patch(url: &str) -> HttpClient {
    HttpClient::new(url).patch("")
}

pub fn delete(url: &str) -> HttpClient {
    HttpClient::new(url).delete("")
}

pub fn head(url: &str) -> HttpClient {
    HttpClient::new(url).head("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{TransportError, TransportErrorKind};
    use crate::http::{Headers, HttpRequest, RequestBody};
    use crate::retry::RetryPolicy;
    use crate::settings::TransportOverride;
    use crate::transport::Transport;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    type Reply = Box<dyn Fn(usize) -> std::result::Result<HttpResponse, TransportError> + Send + Sync>;

    #[derive(Debug, Clone)]
    struct Sent {
        method: HttpMethod,
        url: String,
        headers: Headers,
        body: Vec<u8>,
    }

    /// Counts round trips and keeps the last request it saw.
    struct Fake {
        calls: AtomicUsize,
        last: Mutex<Option<Sent>>,
        reply: Reply,
    }

    impl Fake {
        fn new(reply: impl Fn(usize) -> std::result::Result<HttpResponse, TransportError> + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                last: Mutex::new(None),
                reply: Box::new(reply),
            })
        }

        fn ok(body: &'static str) -> Arc<Self> {
            Self::new(move |_| Ok(HttpResponse::new(200).with_body(body)))
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn last(&self) -> Sent {
            self.last.lock().unwrap().clone().unwrap()
        }
    }

    impl Transport for Fake {
        fn round_trip(
            &self,
            request: &mut HttpRequest,
        ) -> std::result::Result<HttpResponse, TransportError> {
            let index = self.calls.fetch_add(1, Ordering::SeqCst);
            let mut body = Vec::new();
            match &mut request.body {
                RequestBody::Empty => {}
                RequestBody::Bytes(bytes) => body.extend_from_slice(bytes),
                RequestBody::Stream(stream) => {
                    stream.read_to_end(&mut body)?;
                }
            }
            *self.last.lock().unwrap() = Some(Sent {
                method: request.method,
                url: request.url.to_string(),
                headers: request.headers.clone(),
                body,
            });
            (self.reply)(index)
        }
    }

    fn client(base: &str, fake: &Arc<Fake>, settings: Settings) -> HttpClient {
        let settings = Settings {
            transport: Some(TransportOverride::Custom(fake.clone())),
            ..settings
        };
        HttpClient::with_registry(Registry::new(settings), base)
    }

    fn refused(index: usize) -> TransportError {
        TransportError::new(TransportErrorKind::Connect, format!("attempt {index} refused"))
    }

    #[test]
    fn get_params_land_in_the_query_string() {
        let fake = Fake::ok("");
        let mut c = client("http://api.test/v1", &fake, Settings::default())
            .get("/items")
            .param("q", "shoes");
        c.response().unwrap();
        let sent = fake.last();
        assert_eq!(sent.url, "http://api.test/v1/items?q=shoes");
        assert_eq!(sent.method, HttpMethod::Get);
        assert!(sent.body.is_empty());
    }

    #[test]
    fn json_post_body() {
        let fake = Fake::ok("");
        let mut c = client("http://api.test", &fake, Settings::default())
            .post("/items")
            .content_type(ContentType::Json)
            .param("a", 1)
            .param("b", "x");
        c.response().unwrap();
        let sent = fake.last();
        assert_eq!(sent.body, br#"{"a":1,"b":"x"}"#);
        assert_eq!(sent.headers.get("content-type"), Some("application/json"));
    }

    #[test]
    fn multipart_post_orders_files_then_fields() {
        let first = tempfile::NamedTempFile::new().unwrap();
        let second = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(first.path(), b"first contents").unwrap();
        std::fs::write(second.path(), b"second contents").unwrap();

        let fake = Fake::ok("");
        let mut c = client("http://api.test", &fake, Settings::default())
            .post("/upload")
            .file("one", first.path())
            .file("two", second.path())
            .param("title", "report");
        c.response().unwrap();

        let sent = fake.last();
        let content_type = sent.headers.get("content-type").unwrap();
        assert!(content_type.starts_with("multipart/form-data; boundary="));
        let body = String::from_utf8(sent.body).unwrap();
        let one = body.find(r#"name="one""#).unwrap();
        let two = body.find(r#"name="two""#).unwrap();
        let title = body.find(r#"name="title""#).unwrap();
        assert!(one < two && two < title);
        assert!(body.contains("first contents"));
        assert_eq!(c.upload_report().unwrap().files.len(), 2);
    }

    #[test]
    fn fetch_body_is_memoized() {
        let fake = Fake::ok("payload");
        let mut c = client("http://api.test", &fake, Settings::default()).get("/");
        assert_eq!(c.fetch_body().unwrap(), Some(&b"payload"[..]));
        assert_eq!(c.fetch_body().unwrap(), Some(&b"payload"[..]));
        assert_eq!(c.text().unwrap(), "payload");
        assert_eq!(fake.calls(), 1);
    }

    #[test]
    fn missing_body_is_none() {
        let fake = Fake::new(|_| Ok(HttpResponse::new(204)));
        let mut c = client("http://api.test", &fake, Settings::default()).delete("/x");
        assert_eq!(c.fetch_body().unwrap(), None);
        assert_eq!(c.text().unwrap(), "");
    }

    #[test]
    fn zero_retries_means_one_attempt() {
        let fake = Fake::new(|i| Err(refused(i)));
        let mut c = client("http://api.test", &fake, Settings::default()).get("/");
        assert!(matches!(c.response(), Err(Error::Transport(_))));
        assert_eq!(fake.calls(), 1);
    }

    #[test]
    fn two_retries_make_three_attempts_and_return_the_last_error() {
        let fake = Fake::new(|i| Err(refused(i)));
        let settings = Settings {
            retries: RetryPolicy::limited(2),
            ..Settings::default()
        };
        let mut c = client("http://api.test", &fake, settings).get("/");
        match c.response() {
            Err(Error::Transport(err)) => assert_eq!(err.message(), "attempt 2 refused"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(fake.calls(), 3);
    }

    #[test]
    fn retries_stop_at_first_success() {
        let fake = Fake::new(|i| if i < 1 { Err(refused(i)) } else { Ok(HttpResponse::new(200)) });
        let settings = Settings {
            retries: RetryPolicy::limited(4),
            ..Settings::default()
        };
        let mut c = client("http://api.test", &fake, settings).get("/");
        assert_eq!(c.response().unwrap().status, 200);
        assert_eq!(fake.calls(), 2);
    }

    #[test]
    fn unbounded_retries_until_kth_attempt_succeeds() {
        let k = 5;
        let fake = Fake::new(move |i| {
            if i + 1 < k {
                Err(refused(i))
            } else {
                Ok(HttpResponse::new(200))
            }
        });
        let settings = Settings {
            retries: RetryPolicy::unbounded(),
            ..Settings::default()
        };
        let mut c = client("http://api.test", &fake, settings).get("/");
        c.response().unwrap();
        assert_eq!(fake.calls(), k);
    }

    fn gzipped(text: &str) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(text.as_bytes()).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn gzip_bodies_are_inflated() {
        let fake = Fake::new(|_| {
            Ok(HttpResponse::new(200)
                .with_header("Content-Encoding", "gzip")
                .with_body(gzipped("plain text")))
        });
        let mut c = client("http://api.test", &fake, Settings::default()).get("/");
        assert_eq!(c.text().unwrap(), "plain text");
    }

    #[test]
    fn gzip_disabled_returns_raw_bytes() {
        let fake = Fake::new(|_| {
            Ok(HttpResponse::new(200)
                .with_header("Content-Encoding", "gzip")
                .with_body(gzipped("plain text")))
        });
        let settings = Settings {
            gzip: false,
            ..Settings::default()
        };
        let mut c = client("http://api.test", &fake, settings).get("/");
        assert_eq!(c.fetch_body().unwrap().unwrap(), gzipped("plain text").as_slice());
    }

    #[test]
    fn failed_body_read_is_not_reported_as_empty() {
        let fake = Fake::new(|_| {
            Ok(HttpResponse::new(200)
                .with_header("Content-Encoding", "gzip")
                .with_body("not gzip at all"))
        });
        let mut c = client("http://api.test", &fake, Settings::default()).get("/");
        assert!(matches!(c.fetch_body(), Err(Error::BodyRead(_))));
        assert!(matches!(c.fetch_body(), Err(Error::BodyRead(_))));
        assert!(matches!(c.text(), Err(Error::BodyRead(_))));
        assert!(matches!(c.json::<Value>(), Err(Error::BodyRead(_))));
        assert_eq!(fake.calls(), 1);
    }

    #[test]
    fn write_to_file_keeps_wire_bytes_whatever_the_call_order() {
        let dir = tempfile::tempdir().unwrap();
        let reply = |_: usize| -> std::result::Result<HttpResponse, TransportError> {
            Ok(HttpResponse::new(200)
                .with_header("Content-Encoding", "gzip")
                .with_body(gzipped("plain text")))
        };

        let streamed = dir.path().join("streamed.gz");
        let fake = Fake::new(reply);
        let mut c = client("http://api.test", &fake, Settings::default()).get("/");
        c.write_to_file(&streamed).unwrap();

        let cached = dir.path().join("cached.gz");
        let fake = Fake::new(reply);
        let mut c = client("http://api.test", &fake, Settings::default()).get("/");
        assert_eq!(c.text().unwrap(), "plain text");
        c.write_to_file(&cached).unwrap();

        assert_eq!(std::fs::read(&streamed).unwrap(), gzipped("plain text"));
        assert_eq!(std::fs::read(&cached).unwrap(), gzipped("plain text"));
    }

    #[test]
    fn body_streamed_to_file_cannot_be_fetched_again() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Fake::ok("once");
        let mut c = client("http://api.test", &fake, Settings::default()).get("/");
        c.write_to_file(dir.path().join("out.txt")).unwrap();
        assert!(matches!(c.fetch_body(), Err(Error::BodyRead(_))));
    }

    #[test]
    fn corrupt_gzip_can_still_be_saved_raw() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.bin");
        let fake = Fake::new(|_| {
            Ok(HttpResponse::new(200)
                .with_header("Content-Encoding", "gzip")
                .with_body("not gzip at all"))
        });
        let mut c = client("http://api.test", &fake, Settings::default()).get("/");
        assert!(c.fetch_body().is_err());
        c.write_to_file(&path).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"not gzip at all");
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Item {
        id: u32,
        name: String,
    }

    #[test]
    fn decodes_json_and_xml() {
        let fake = Fake::ok(r#"{"id":1,"name":"desk"}"#);
        let mut c = client("http://api.test", &fake, Settings::default()).get("/item");
        let item: Item = c.json().unwrap();
        assert_eq!(item, Item { id: 1, name: "desk".into() });

        let fake = Fake::ok("<item><id>2</id><name>chair</name></item>");
        let mut c = client("http://api.test", &fake, Settings::default()).get("/item");
        let item: Item = c.xml().unwrap();
        assert_eq!(item, Item { id: 2, name: "chair".into() });
    }

    #[test]
    fn decode_errors_are_not_retried() {
        let fake = Fake::ok("not json");
        let settings = Settings {
            retries: RetryPolicy::limited(3),
            ..Settings::default()
        };
        let mut c = client("http://api.test", &fake, settings).get("/");
        assert!(matches!(c.json::<Item>(), Err(Error::Decoding { .. })));
        assert_eq!(fake.calls(), 1);
    }

    #[test]
    fn write_to_file_streams_live_body() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let fake = Fake::ok("file contents");
        let mut c = client("http://api.test", &fake, Settings::default()).get("/download");
        c.write_to_file(&path).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"file contents");
    }

    #[test]
    fn write_to_file_after_fetch_uses_cached_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let fake = Fake::ok("cached");
        let mut c = client("http://api.test", &fake, Settings::default()).get("/");
        c.fetch_body().unwrap();
        c.write_to_file(&path).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"cached");
        assert_eq!(fake.calls(), 1);
    }

    #[test]
    fn write_to_file_reports_destination_errors() {
        let fake = Fake::ok("x");
        let mut c = client("http://api.test", &fake, Settings::default()).get("/");
        let err = c.write_to_file("/no/such/dir/out.txt").unwrap_err();
        assert!(matches!(err, Error::FileIo { .. }));
        assert_eq!(fake.calls(), 0);
    }

    #[test]
    fn dump_is_captured_in_debug_mode() {
        let fake = Fake::ok("");
        let settings = Settings {
            show_debug: true,
            ..Settings::default()
        };
        let mut c = client("http://api.test", &fake, settings)
            .put("/items/1")
            .header("X-Trace", "abc")
            .body("updated");
        assert!(c.dump().is_none());
        c.response().unwrap();
        let dump = String::from_utf8(c.dump().unwrap().to_vec()).unwrap();
        assert!(dump.starts_with("PUT /items/1 HTTP/1.1\r\n"));
        assert!(dump.contains("X-Trace: abc\r\n"));
        assert!(dump.ends_with("updated"));
    }

    #[test]
    fn trailing_slash_on_base_is_trimmed() {
        let fake = Fake::ok("");
        let mut c = client("http://api.test/", &fake, Settings::default()).get("/ping");
        c.response().unwrap();
        assert_eq!(fake.last().url, "http://api.test/ping");
    }

    #[test]
    fn setters_accumulate_without_io() {
        let fake = Fake::ok("");
        let c = client("http://api.test", &fake, Settings::default())
            .post("/x")
            .header("Accept", "text/plain")
            .header("accept", "application/json")
            .host("virtual.test")
            .param("k", "v1")
            .param("k", json!("v2"));
        assert_eq!(c.pending().headers.get("Accept"), Some("application/json"));
        assert_eq!(c.pending().params["k"], json!("v2"));
        assert_eq!(c.pending().host.as_deref(), Some("virtual.test"));
        assert_eq!(fake.calls(), 0);
    }
}
