//! Request state accumulated by the fluent builder.

use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use indexmap::IndexMap;
use serde_json::Value;
use tracing::warn;

use crate::http::{Headers, HttpMethod};
use crate::settings::ContentType;

/// Everything known about a request before dispatch. Nothing here performs
/// I/O.
#[derive(Debug, Clone, Default)]
pub struct PendingRequest {
    pub method: HttpMethod,
    /// Path and query appended verbatim to the base URL.
    pub relative_url: String,
    pub headers: Headers,
    pub host: Option<String>,
    pub content_type: ContentType,
    /// Insertion-ordered; a repeated key keeps its position and takes the
    /// new value.
    pub params: IndexMap<String, Value>,
    /// Form field name → source file path, in attachment order.
    pub files: IndexMap<String, PathBuf>,
    /// Explicit body; suppresses parameter and multipart encoding.
    pub body: Option<Vec<u8>>,
}

impl PendingRequest {
    pub fn set_param(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        if self.params.contains_key(&key) {
            warn!(key = %key, "parameter already set, overwriting");
        }
        self.params.insert(key, value);
    }

    pub fn set_basic_auth(&mut self, username: &str, password: &str) {
        let credentials = STANDARD.encode(format!("{username}:{password}"));
        self.headers.set("Authorization", format!("Basic {credentials}"));
    }

    /// String-valued parameters, in insertion order.
    pub fn string_params(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|v| (k.as_str(), v)))
    }
}
