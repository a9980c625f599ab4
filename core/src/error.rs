//! Error types for the HTTP client.
//!
//! # Design
//! Only `Transport` failures feed the retry loop; every other variant is
//! surfaced to the caller as soon as it happens. URL and header problems are
//! caught before the first attempt so a malformed request never reaches the
//! network. Decoding failures carry the rendered message rather than the
//! parser's error type, since the two structured formats use different error
//! types.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use crate::decode::Format;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors returned by `HttpClient` and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The base URL joined with the relative path is not a valid URL.
    #[error("cannot resolve url {url:?}: {source}")]
    UrlResolution {
        url: String,
        #[source]
        source: url::ParseError,
    },

    /// A header name or value cannot be sent on the wire.
    #[error("invalid header {name:?}")]
    InvalidHeader { name: String },

    /// A single attempt failed at the connection layer.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The retry policy's overall deadline elapsed before any attempt succeeded.
    #[error("retry deadline of {deadline:?} exceeded after {attempts} attempts: {last}")]
    DeadlineExceeded {
        deadline: Duration,
        attempts: u32,
        last: TransportError,
    },

    /// The parameter mapping could not be serialized to JSON.
    #[error("cannot encode request body: {0}")]
    Encoding(#[source] serde_json::Error),

    /// The response body could not be deserialized into the requested type.
    #[error("cannot decode response body as {format}: {message}")]
    Decoding { format: Format, message: String },

    /// An upload source or a download destination failed.
    #[error("{}: {source}", path.display())]
    FileIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Reading (or gunzipping) the response body failed.
    #[error("cannot read response body: {0}")]
    BodyRead(#[source] io::Error),

    /// The redirect policy rejected the redirect chain.
    #[error("redirect rejected: {0}")]
    Redirect(String),

    /// The background multipart producer died.
    #[error("upload task failed: {0}")]
    UploadTask(String),

    /// Settings or a configuration file hold an unusable value.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Whether the retry loop may run another attempt after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}

/// Coarse classification of connection-layer failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Connect,
    Timeout,
    Proxy,
    Tls,
    Io,
    Protocol,
    Other,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportErrorKind::Connect => "connect",
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::Proxy => "proxy",
            TransportErrorKind::Tls => "tls",
            TransportErrorKind::Io => "io",
            TransportErrorKind::Protocol => "protocol",
            TransportErrorKind::Other => "transport",
        };
        f.write_str(name)
    }
}

/// A failed round trip, as reported by a [`Transport`](crate::Transport).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} error: {message}")]
pub struct TransportError {
    kind: TransportErrorKind,
    message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TransportErrorKind::Timeout,
            io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset => {
                TransportErrorKind::Connect
            }
            _ => TransportErrorKind::Io,
        };
        Self::new(kind, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_errors_are_retryable() {
        let transport = Error::from(TransportError::new(TransportErrorKind::Connect, "refused"));
        assert!(transport.is_retryable());

        let decoding = Error::Decoding {
            format: Format::Json,
            message: "eof".to_string(),
        };
        assert!(!decoding.is_retryable());
        assert!(!Error::Config("retries".to_string()).is_retryable());
        assert!(!Error::Redirect("loop".to_string()).is_retryable());
    }

    #[test]
    fn transport_error_display_includes_kind() {
        let err = TransportError::new(TransportErrorKind::Timeout, "read deadline");
        assert_eq!(err.to_string(), "timeout error: read deadline");
    }

    #[test]
    fn io_errors_are_classified() {
        let timed_out = TransportError::from(io::Error::new(io::ErrorKind::TimedOut, "slow"));
        assert_eq!(timed_out.kind(), TransportErrorKind::Timeout);

        let refused = TransportError::from(io::Error::new(io::ErrorKind::ConnectionRefused, "no"));
        assert_eq!(refused.kind(), TransportErrorKind::Connect);

        let other = TransportError::from(io::Error::other("boom"));
        assert_eq!(other.kind(), TransportErrorKind::Io);
        assert_eq!(other.message(), "boom");
    }

    #[test]
    fn file_io_error_names_the_path() {
        let err = Error::FileIo {
            path: PathBuf::from("/tmp/missing.bin"),
            source: io::Error::new(io::ErrorKind::NotFound, "not found"),
        };
        assert_eq!(err.to_string(), "/tmp/missing.bin: not found");
    }
}
