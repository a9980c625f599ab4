//! Response body reading and structured decoding.

use std::fmt;
use std::io::Read;

use flate2::read::GzDecoder;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};
use crate::http::{Headers, ResponseBody};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Json,
    Xml,
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Format::Json => "JSON",
            Format::Xml => "XML",
        })
    }
}

pub fn is_gzip(headers: &Headers) -> bool {
    headers
        .get("content-encoding")
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("gzip"))
}

/// Drain `body` as received on the wire.
pub fn read_body(mut body: ResponseBody) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    body.read_to_end(&mut buf).map_err(Error::BodyRead)?;
    Ok(buf)
}

/// Inflate a gzip-encoded body.
pub fn gunzip(raw: &[u8]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    GzDecoder::new(raw)
        .read_to_end(&mut buf)
        .map_err(Error::BodyRead)?;
    Ok(buf)
}

pub fn decode_structured<T: DeserializeOwned>(bytes: &[u8], format: Format) -> Result<T> {
    match format {
        Format::Json => serde_json::from_slice(bytes).map_err(|e| Error::Decoding {
            format,
            message: e.to_string(),
        }),
        Format::Xml => {
            let text = std::str::from_utf8(bytes).map_err(|e| Error::Decoding {
                format,
                message: e.to_string(),
            })?;
            quick_xml::de::from_str(text).map_err(|e| Error::Decoding {
                format,
                message: e.to_string(),
            })
        }
    }
}
