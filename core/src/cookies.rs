//! Cookie jar shared by every cookie-enabled client of a registry.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use cookie_store::{CookieStore, RawCookie};
use tracing::debug;
use url::Url;

use crate::http::Headers;

/// Cheap to clone; clones share the same store.
#[derive(Clone, Default)]
pub struct CookieJar {
    store: Arc<Mutex<CookieStore>>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CookieStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `Cookie` header value for a request to `url`, if any cookie matches.
    pub fn header_for(&self, url: &Url) -> Option<String> {
        let store = self.lock();
        let pairs: Vec<String> = store
            .get_request_values(url)
            .map(|(name, value)| format!("{name}={value}"))
            .collect();
        if pairs.is_empty() {
            None
        } else {
            Some(pairs.join("; "))
        }
    }

    /// Record every `Set-Cookie` header of a response received from `url`.
    pub fn store_from(&self, url: &Url, headers: &Headers) {
        let cookies: Vec<RawCookie<'static>> = headers
            .get_all("set-cookie")
            .filter_map(|value| match RawCookie::parse(value.to_string()) {
                Ok(cookie) => Some(cookie),
                Err(err) => {
                    debug!(error = %err, "ignoring malformed Set-Cookie");
                    None
                }
            })
            .collect();
        if !cookies.is_empty() {
            self.lock().store_response_cookies(cookies.into_iter(), url);
        }
    }

    /// Value of cookie `name` as it would be sent to `url`.
    pub fn get(&self, url: &Url, name: &str) -> Option<String> {
        self.lock()
            .get_request_values(url)
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.to_string())
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

impl fmt::Debug for CookieJar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CookieJar(..)")
    }
}
