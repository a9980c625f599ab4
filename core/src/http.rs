//! HTTP data types shared by the dispatcher and every transport.
//!
//! # Design
//! Requests and responses are plain data so a [`Transport`](crate::Transport)
//! can be swapped for a test double without touching the network. Header
//! names compare case-insensitively; `set` replaces every earlier value of the
//! same name (last write wins) while `append` keeps repeated response headers
//! such as `Set-Cookie`.

use std::fmt;
use std::io::{self, Read};

use url::Url;

use crate::multipart::UploadStream;

/// HTTP method for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
        }
    }

    /// Methods whose parameters are encoded into the request body.
    pub fn encodes_body(&self) -> bool {
        matches!(
            self,
            HttpMethod::Post | HttpMethod::Put | HttpMethod::Patch | HttpMethod::Delete
        )
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered header list with case-insensitive names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every value of `name` with `value`.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter().position(|(k, _)| k.eq_ignore_ascii_case(&name)) {
            Some(idx) => {
                self.0[idx] = (name.clone(), value);
                let mut i = idx + 1;
                while i < self.0.len() {
                    if self.0[i].0.eq_ignore_ascii_case(&name) {
                        self.0.remove(i);
                    } else {
                        i += 1;
                    }
                }
            }
            None => self.0.push((name, value)),
        }
    }

    /// Add a value without touching earlier values of the same name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.set(k, v);
        }
        headers
    }
}

/// Outgoing request body.
#[derive(Debug, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Bytes(Vec<u8>),
    /// Multipart payload produced concurrently by a background task.
    Stream(UploadStream),
}

impl RequestBody {
    /// Whether the body can be sent again from the start.
    pub fn is_replayable(&self) -> bool {
        match self {
            RequestBody::Empty | RequestBody::Bytes(_) => true,
            RequestBody::Stream(stream) => stream.is_fresh(),
        }
    }
}

/// A fully resolved request, handed to a transport for one round trip.
#[derive(Debug)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: Url,
    pub headers: Headers,
    /// Overrides the `Host` header derived from `url`.
    pub host: Option<String>,
    pub body: RequestBody,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: Url) -> Self {
        Self {
            method,
            url,
            headers: Headers::new(),
            host: None,
            body: RequestBody::Empty,
        }
    }
}

pub type ResponseBody = Box<dyn Read + Send>;

/// A response as returned by a transport. The body is a live stream and can
/// be consumed once.
pub struct HttpResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Option<ResponseBody>,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: None,
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(Box::new(io::Cursor::new(body.into())));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self.status, 301 | 302 | 303 | 307 | 308)
    }
}

impl fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("body", &self.body.as_ref().map(|_| "<stream>"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_replaces_case_insensitively() {
        let mut headers = Headers::new();
        headers.set("Content-Type", "text/plain");
        headers.set("content-type", "application/json");
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("CONTENT-TYPE"), Some("application/json"));
    }

    #[test]
    fn set_collapses_appended_duplicates() {
        let mut headers = Headers::new();
        headers.append("X-Tag", "a");
        headers.append("x-tag", "b");
        headers.set("X-Tag", "c");
        assert_eq!(headers.get_all("x-tag").collect::<Vec<_>>(), vec!["c"]);
    }

    #[test]
    fn append_keeps_repeated_values() {
        let response = HttpResponse::new(200)
            .with_header("Set-Cookie", "a=1")
            .with_header("Set-Cookie", "b=2");
        let cookies: Vec<_> = response.headers.get_all("set-cookie").collect();
        assert_eq!(cookies, vec!["a=1", "b=2"]);
    }

    #[test]
    fn remove_drops_every_value() {
        let mut headers: Headers = [("Authorization", "Basic x"), ("Accept", "*/*")]
            .into_iter()
            .collect();
        headers.remove("authorization");
        assert!(!headers.contains("Authorization"));
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn body_methods() {
        assert!(HttpMethod::Post.encodes_body());
        assert!(HttpMethod::Delete.encodes_body());
        assert!(!HttpMethod::Get.encodes_body());
        assert!(!HttpMethod::Head.encodes_body());
    }

    #[test]
    fn in_memory_bodies_are_replayable() {
        assert!(RequestBody::Empty.is_replayable());
        assert!(RequestBody::Bytes(b"x".to_vec()).is_replayable());
    }

    #[test]
    fn redirect_statuses() {
        for status in [301, 302, 303, 307, 308] {
            assert!(HttpResponse::new(status).is_redirect());
        }
        assert!(!HttpResponse::new(304).is_redirect());
        assert!(HttpResponse::new(204).is_success());
    }
}
