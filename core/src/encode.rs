//! Request body and query encoding.
//!
//! # Design
//! Encoding happens in two steps. [`plan`] is pure: it decides the final
//! relative URL and what the body will be, and fails early on JSON encoding
//! errors. [`Payload::into_body`] materializes the body; for multipart uploads
//! this is where the producer thread starts, so nothing is spawned for a
//! request whose URL turns out to be invalid.

use std::path::PathBuf;

use indexmap::IndexMap;
use serde_json::Value;
use url::form_urlencoded;

use crate::error::{Error, Result};
use crate::http::{HttpMethod, RequestBody};
use crate::multipart::{self, UploadStream};
use crate::request::PendingRequest;
use crate::settings::ContentType;

/// `application/x-www-form-urlencoded` encoding of the string-valued
/// parameters. Other values are skipped.
pub fn encode_form(params: &IndexMap<String, Value>) -> String {
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (key, value) in params {
        if let Value::String(value) = value {
            serializer.append_pair(key, value);
        }
    }
    serializer.finish()
}

/// JSON object of every parameter, in insertion order.
pub fn encode_json(params: &IndexMap<String, Value>) -> Result<Vec<u8>> {
    serde_json::to_vec(params).map_err(Error::Encoding)
}

/// Append `query` to `relative`, joining with `&` when a query string is
/// already present.
pub fn append_query(relative: &str, query: &str) -> String {
    if query.is_empty() {
        relative.to_string()
    } else if relative.contains('?') {
        format!("{relative}&{query}")
    } else {
        format!("{relative}?{query}")
    }
}

/// Body to attach once the URL is known.
#[derive(Debug, PartialEq, Eq)]
pub enum Payload {
    None,
    Bytes {
        body: Vec<u8>,
        content_type: Option<&'static str>,
    },
    Multipart {
        files: Vec<(String, PathBuf)>,
        fields: Vec<(String, String)>,
    },
}

/// Resolved relative URL plus the body plan.
#[derive(Debug, PartialEq, Eq)]
pub struct Plan {
    pub relative_url: String,
    pub payload: Payload,
}

pub fn plan(pending: &PendingRequest) -> Result<Plan> {
    let mut relative_url = pending.relative_url.clone();
    let explicit = pending
        .body
        .clone()
        .map(|body| Payload::Bytes {
            body,
            content_type: None,
        });

    let payload = match pending.method {
        HttpMethod::Get => {
            if !pending.params.is_empty() {
                relative_url = append_query(&relative_url, &encode_form(&pending.params));
            }
            explicit.unwrap_or(Payload::None)
        }
        method if method.encodes_body() => match explicit {
            Some(payload) => payload,
            None if !pending.files.is_empty() => Payload::Multipart {
                files: pending
                    .files
                    .iter()
                    .map(|(field, path)| (field.clone(), path.clone()))
                    .collect(),
                fields: pending
                    .string_params()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            },
            None if !pending.params.is_empty() => match pending.content_type {
                ContentType::Form => {
                    let body = encode_form(&pending.params);
                    if body.is_empty() {
                        Payload::None
                    } else {
                        Payload::Bytes {
                            body: body.into_bytes(),
                            content_type: Some(ContentType::Form.mime()),
                        }
                    }
                }
                ContentType::Json => Payload::Bytes {
                    body: encode_json(&pending.params)?,
                    content_type: Some(ContentType::Json.mime()),
                },
            },
            None => Payload::None,
        },
        _ => explicit.unwrap_or(Payload::None),
    };

    Ok(Plan {
        relative_url,
        payload,
    })
}

impl Payload {
    /// Build the request body. Returns the `Content-Type` to set, if any.
    pub fn into_body(self, strict_uploads: bool) -> Result<(RequestBody, Option<String>)> {
        match self {
            Payload::None => Ok((RequestBody::Empty, None)),
            Payload::Bytes { body, content_type } => {
                Ok((RequestBody::Bytes(body), content_type.map(str::to_string)))
            }
            Payload::Multipart { files, fields } => {
                let (content_type, stream): (String, UploadStream) =
                    multipart::spawn(files, fields, strict_uploads)?;
                Ok((RequestBody::Stream(stream), Some(content_type)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pending(method: HttpMethod, relative: &str) -> PendingRequest {
        PendingRequest {
            method,
            relative_url: relative.to_string(),
            ..PendingRequest::default()
        }
    }

    #[test]
    fn form_roundtrip_recovers_string_keys() {
        let mut params = IndexMap::new();
        params.insert("q".to_string(), json!("red shoes & socks"));
        params.insert("n".to_string(), json!(3));
        params.insert("emoji".to_string(), json!("✓=ok"));

        let encoded = encode_form(&params);
        let decoded: Vec<(String, String)> = form_urlencoded::parse(encoded.as_bytes())
            .into_owned()
            .collect();
        assert_eq!(
            decoded,
            vec![
                ("q".to_string(), "red shoes & socks".to_string()),
                ("emoji".to_string(), "✓=ok".to_string()),
            ]
        );
    }

    #[test]
    fn append_query_picks_separator() {
        assert_eq!(append_query("/items", "q=1"), "/items?q=1");
        assert_eq!(append_query("/items?page=2", "q=1"), "/items?page=2&q=1");
        assert_eq!(append_query("/items", ""), "/items");
    }

    #[test]
    fn get_params_go_to_query_string() {
        let mut req = pending(HttpMethod::Get, "/items");
        req.set_param("q", json!("shoes"));
        let plan = plan(&req).unwrap();
        assert_eq!(plan.relative_url, "/items?q=shoes");
        assert_eq!(plan.payload, Payload::None);
    }

    #[test]
    fn get_params_are_form_encoded_even_in_json_mode() {
        let mut req = pending(HttpMethod::Get, "/items?page=2");
        req.content_type = ContentType::Json;
        req.set_param("q", json!("a b"));
        assert_eq!(plan(&req).unwrap().relative_url, "/items?page=2&q=a+b");
    }

    #[test]
    fn post_form_body() {
        let mut req = pending(HttpMethod::Post, "/login");
        req.set_param("user", json!("ann"));
        req.set_param("age", json!(30));
        let plan = plan(&req).unwrap();
        assert_eq!(plan.relative_url, "/login");
        assert_eq!(
            plan.payload,
            Payload::Bytes {
                body: b"user=ann".to_vec(),
                content_type: Some("application/x-www-form-urlencoded"),
            }
        );
    }

    #[test]
    fn form_with_only_non_string_values_has_no_body() {
        let mut req = pending(HttpMethod::Put, "/x");
        req.set_param("n", json!(1));
        assert_eq!(plan(&req).unwrap().payload, Payload::None);
    }

    #[test]
    fn post_json_body_includes_every_value() {
        let mut req = pending(HttpMethod::Post, "/items");
        req.content_type = ContentType::Json;
        req.set_param("a", json!(1));
        req.set_param("b", json!("x"));
        let plan = plan(&req).unwrap();
        assert_eq!(
            plan.payload,
            Payload::Bytes {
                body: br#"{"a":1,"b":"x"}"#.to_vec(),
                content_type: Some("application/json"),
            }
        );
    }

    #[test]
    fn files_switch_to_multipart() {
        let mut req = pending(HttpMethod::Post, "/upload");
        req.files.insert("doc".to_string(), PathBuf::from("/tmp/a.txt"));
        req.set_param("title", json!("report"));
        req.set_param("count", json!(2));
        match plan(&req).unwrap().payload {
            Payload::Multipart { files, fields } => {
                assert_eq!(files, vec![("doc".to_string(), PathBuf::from("/tmp/a.txt"))]);
                assert_eq!(fields, vec![("title".to_string(), "report".to_string())]);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn explicit_body_wins_over_params() {
        let mut req = pending(HttpMethod::Post, "/raw");
        req.body = Some(b"raw bytes".to_vec());
        req.set_param("ignored", json!("yes"));
        req.files.insert("f".to_string(), PathBuf::from("/tmp/f"));
        assert_eq!(
            plan(&req).unwrap().payload,
            Payload::Bytes {
                body: b"raw bytes".to_vec(),
                content_type: None,
            }
        );
    }

    #[test]
    fn head_ignores_params() {
        let mut req = pending(HttpMethod::Head, "/ping");
        req.set_param("q", json!("x"));
        let plan = plan(&req).unwrap();
        assert_eq!(plan.relative_url, "/ping");
        assert_eq!(plan.payload, Payload::None);
    }
}
