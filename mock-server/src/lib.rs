//! HTTP test server for the client's live integration tests.
//!
//! Every route is stateless and describes what it received, so tests can
//! assert on the exact request the client put on the wire.

use std::collections::BTreeMap;
use std::io::Write;

use axum::{
    body::Bytes,
    extract::{multipart::MultipartError, Multipart, Path, Query},
    http::{header, HeaderMap, HeaderName, Method, StatusCode, Uri},
    response::{AppendHeaders, IntoResponse, Response},
    routing::{any, get, post},
    Json, Router,
};
use flate2::{write::GzEncoder, Compression};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::debug;

pub const XML_ITEM: &str = "<item><id>7</id><name>lamp</name></item>";
pub const GZIP_TEXT: &str = "this body travelled gzip-compressed";
pub const DEFAULT_DOWNLOAD_SIZE: usize = 64 * 1024;

/// What `/echo` saw.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Echo {
    pub method: String,
    pub path: String,
    pub query: String,
    /// Lower-cased header names; repeated headers joined with `, `.
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

/// One part received by `/upload`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Part {
    pub name: String,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub size: usize,
    pub content: String,
}

pub fn app() -> Router {
    Router::new()
        .route("/echo", any(echo))
        .route("/echo/{*rest}", any(echo))
        .route("/gzip", get(gzip))
        .route("/cookies", get(cookies))
        .route("/cookies/set", get(set_cookies))
        .route("/redirect/{n}", any(redirect_chain))
        .route("/redirect-to", any(redirect_to))
        .route("/xml", get(xml))
        .route("/download", get(download))
        .route("/status/{code}", any(status))
        .route("/upload", post(upload))
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, app()).await
}

/// Deterministic payload served by `/download`.
pub fn download_bytes(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

fn header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut map: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        map.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    map
}

async fn echo(method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Json<Echo> {
    Json(Echo {
        method: method.to_string(),
        path: uri.path().to_string(),
        query: uri.query().unwrap_or_default().to_string(),
        headers: header_map(&headers),
        body: String::from_utf8_lossy(&body).into_owned(),
    })
}

async fn gzip() -> Response {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    let compressed = encoder
        .write_all(GZIP_TEXT.as_bytes())
        .and_then(|_| encoder.finish());
    match compressed {
        Ok(bytes) => (
            [
                (header::CONTENT_ENCODING, "gzip"),
                (header::CONTENT_TYPE, "text/plain"),
            ],
            bytes,
        )
            .into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

/// Cookies the client sent, by name.
async fn cookies(headers: HeaderMap) -> Json<BTreeMap<String, String>> {
    let cookies = headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            Some((name.to_string(), value.to_string()))
        })
        .collect();
    Json(cookies)
}

/// Set one cookie per query pair.
async fn set_cookies(
    Query(pairs): Query<BTreeMap<String, String>>,
) -> (AppendHeaders<Vec<(HeaderName, String)>>, Json<BTreeMap<String, String>>) {
    let headers = pairs
        .iter()
        .map(|(name, value)| (header::SET_COOKIE, format!("{name}={value}; Path=/")))
        .collect();
    (AppendHeaders(headers), Json(pairs))
}

/// `302` chain of `n` hops ending at `/echo`.
async fn redirect_chain(Path(n): Path<u32>) -> impl IntoResponse {
    let location = if n <= 1 {
        "/echo".to_string()
    } else {
        format!("/redirect/{}", n - 1)
    };
    (StatusCode::FOUND, [(header::LOCATION, location)])
}

#[derive(Debug, Deserialize)]
struct RedirectTo {
    url: String,
    status: Option<u16>,
}

async fn redirect_to(Query(target): Query<RedirectTo>) -> Response {
    let status = target
        .status
        .and_then(|code| StatusCode::from_u16(code).ok())
        .filter(StatusCode::is_redirection)
        .unwrap_or(StatusCode::FOUND);
    (status, [(header::LOCATION, target.url)]).into_response()
}

async fn xml() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "application/xml")], XML_ITEM)
}

#[derive(Debug, Deserialize)]
struct DownloadQuery {
    size: Option<usize>,
}

async fn download(Query(query): Query<DownloadQuery>) -> impl IntoResponse {
    let body = download_bytes(query.size.unwrap_or(DEFAULT_DOWNLOAD_SIZE));
    ([(header::CONTENT_TYPE, "application/octet-stream")], body)
}

async fn status(Path(code): Path<u16>) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_REQUEST)
}

async fn upload(mut multipart: Multipart) -> Result<Json<Vec<Part>>, MultipartError> {
    let mut parts = Vec::new();
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(str::to_string);
        let data = field.bytes().await?;
        debug!(name = %name, size = data.len(), "received part");
        parts.push(Part {
            name,
            file_name,
            content_type,
            size: data.len(),
            content: String::from_utf8_lossy(&data).into_owned(),
        });
    }
    Ok(Json(parts))
}
