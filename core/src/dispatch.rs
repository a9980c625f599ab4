//! Dispatch: turn a pending request into one response.
//!
//! # Design
//! Everything that can fail without the network is checked first: body
//! encoding, URL resolution, header validity. Only then is the multipart
//! producer started and the retry loop entered. Each attempt walks the
//! redirect chain itself so the cookie jar sees every hop, and the request
//! body is lent to each hop and handed back, which lets an unread upload
//! stream be retried while a partly sent one stops the loop.

use std::cell::Cell;
use std::io::{self, Write};
use std::sync::Arc;

use tracing::{debug, warn};
use url::{Position, Url};

use crate::cookies::CookieJar;
use crate::encode;
use crate::error::{Error, Result};
use crate::http::{Headers, HttpMethod, HttpRequest, HttpResponse, RequestBody};
use crate::multipart::UploadReport;
use crate::registry::Registry;
use crate::request::PendingRequest;
use crate::retry;
use crate::settings::{RedirectDecision, RedirectPolicy, Settings};
use crate::transport::{self, Transport};

/// Result of a successful dispatch.
#[derive(Debug)]
pub struct Dispatched {
    pub response: HttpResponse,
    /// Serialized request, when debug mode is on.
    pub dump: Option<Vec<u8>>,
    /// Producer outcome for multipart uploads.
    pub upload_report: Option<UploadReport>,
}

/// Join the base URL and the (query-extended) relative path.
pub fn resolve_url(base_url: &str, relative_url: &str) -> Result<Url> {
    let full = format!("{base_url}{relative_url}");
    Url::parse(&full).map_err(|source| Error::UrlResolution { url: full, source })
}

fn validate_headers(headers: &Headers, host: Option<&str>) -> Result<()> {
    let invalid = |name: &str| Error::InvalidHeader {
        name: name.to_string(),
    };
    for (name, value) in headers.iter() {
        ureq::http::HeaderName::from_bytes(name.as_bytes()).map_err(|_| invalid(name))?;
        ureq::http::HeaderValue::from_str(value).map_err(|_| invalid(name))?;
    }
    if let Some(host) = host {
        ureq::http::HeaderValue::from_str(host).map_err(|_| invalid("Host"))?;
    }
    Ok(())
}

pub fn dispatch(
    base_url: &str,
    pending: &PendingRequest,
    settings: &Settings,
    registry: &Registry,
) -> Result<Dispatched> {
    let plan = encode::plan(pending)?;
    let url = resolve_url(base_url, &plan.relative_url)?;

    let mut headers = pending.headers.clone();
    if !settings.user_agent.is_empty() && !headers.contains("user-agent") {
        headers.set("User-Agent", settings.user_agent.as_str());
    }
    if settings.gzip && !headers.contains("accept-encoding") {
        headers.set("Accept-Encoding", "gzip");
    }
    validate_headers(&headers, pending.host.as_deref())?;

    let transport = transport::resolve(settings);
    let jar = settings.enable_cookie.then(|| registry.cookie_jar().clone());

    let (body, content_type) = plan.payload.into_body(settings.strict_uploads)?;
    if let Some(content_type) = content_type {
        headers.set("Content-Type", content_type);
    }

    let mut request = HttpRequest {
        method: pending.method,
        url,
        headers,
        host: pending.host.clone(),
        body,
    };

    let dump = settings.show_debug.then(|| {
        let mut out = Vec::new();
        if let Err(err) = write_dump(&mut out, &request, settings.dump_body) {
            warn!(error = %err, "failed to capture request dump");
        }
        out
    });

    let hops = Hops {
        transport,
        jar,
        policy: settings.redirect_policy(),
    };
    let replayable = Cell::new(true);
    let result = retry::run(
        &settings.retries,
        |attempt| {
            debug!(attempt, method = %request.method, url = %request.url, "dispatching");
            let result = hops.follow(&mut request);
            replayable.set(request.body.is_replayable());
            result
        },
        || replayable.get(),
    );

    let upload_report = match request.body {
        RequestBody::Stream(stream) => match stream.finish() {
            Ok(report) => Some(report),
            Err(err @ (Error::FileIo { .. } | Error::UploadTask(_))) => return Err(err),
            Err(err) => {
                debug!(error = %err, "upload stream closed early");
                None
            }
        },
        _ => None,
    };

    Ok(Dispatched {
        response: result?,
        dump,
        upload_report,
    })
}

/// Serialize `request` as it would appear on the wire. Streamed bodies are
/// never captured.
fn write_dump(out: &mut impl Write, request: &HttpRequest, with_body: bool) -> io::Result<()> {
    let target = &request.url[Position::BeforePath..Position::AfterQuery];
    let host = match &request.host {
        Some(host) => host.as_str(),
        None => &request.url[Position::BeforeHost..Position::AfterPort],
    };
    write!(out, "{} {} HTTP/1.1\r\nHost: {}\r\n", request.method, target, host)?;
    for (name, value) in request.headers.iter() {
        write!(out, "{name}: {value}\r\n")?;
    }
    out.write_all(b"\r\n")?;
    if with_body {
        match &request.body {
            RequestBody::Bytes(bytes) => out.write_all(bytes)?,
            RequestBody::Stream(_) => debug!("streamed body omitted from dump"),
            RequestBody::Empty => {}
        }
    }
    Ok(())
}

/// One attempt: a round trip plus any redirects it leads to.
struct Hops {
    transport: Arc<dyn Transport>,
    jar: Option<CookieJar>,
    policy: RedirectPolicy,
}

impl Hops {
    fn follow(&self, request: &mut HttpRequest) -> Result<HttpResponse> {
        let mut method = request.method;
        let mut url = request.url.clone();
        let mut headers = request.headers.clone();
        let mut host = request.host.clone();
        let mut send_body = true;
        let mut via: Vec<Url> = Vec::new();

        loop {
            let mut hop = HttpRequest {
                method,
                url: url.clone(),
                headers: self.with_cookies(&headers, &url),
                host: host.clone(),
                body: if send_body {
                    std::mem::take(&mut request.body)
                } else {
                    RequestBody::Empty
                },
            };
            let result = self.transport.round_trip(&mut hop);
            if send_body {
                request.body = std::mem::take(&mut hop.body);
            }
            let response = result?;

            if let Some(jar) = &self.jar {
                jar.store_from(&url, &response.headers);
            }
            if !response.is_redirect() {
                return Ok(response);
            }
            let Some(next) = response
                .header("location")
                .and_then(|location| url.join(location).ok())
            else {
                debug!(status = response.status, "redirect without usable Location");
                return Ok(response);
            };

            via.push(url.clone());
            match self.policy.check(&next, &via) {
                RedirectDecision::Follow => {}
                RedirectDecision::UseLastResponse => return Ok(response),
                RedirectDecision::Abort(reason) => return Err(Error::Redirect(reason)),
            }

            match response.status {
                301 | 302 | 303 => {
                    if method != HttpMethod::Head {
                        method = HttpMethod::Get;
                    }
                    send_body = false;
                    headers.remove("content-type");
                    headers.remove("content-length");
                }
                _ => {
                    if send_body && matches!(request.body, RequestBody::Stream(_)) {
                        return Ok(response);
                    }
                }
            }
            if next.host_str() != url.host_str() || next.port_or_known_default() != url.port_or_known_default() {
                headers.remove("authorization");
                headers.remove("cookie");
                host = None;
            }

            debug!(status = response.status, from = %url, to = %next, "following redirect");
            url = next;
        }
    }

    /// Request headers for `url` with the jar's cookies merged into any
    /// caller-supplied `Cookie` header.
    fn with_cookies(&self, headers: &Headers, url: &Url) -> Headers {
        let mut headers = headers.clone();
        if let Some(stored) = self.jar.as_ref().and_then(|jar| jar.header_for(url)) {
            let value = match headers.get("cookie") {
                Some(own) => format!("{own}; {stored}"),
                None => stored,
            };
            headers.set("Cookie", value);
        }
        headers
    }
}
